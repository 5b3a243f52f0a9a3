use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    /// The interruption type (bits 10:8) in VM-Entry Interruption-Information
    /// Field and VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section
    /// 24.8.3, 24.9.2)
    pub enum VmxInterruptionType {
        /// External interrupt
        External = 0,
        /// Reserved
        Reserved = 1,
        /// Non-maskable interrupt (NMI)
        NMI = 2,
        /// Hardware exception (e.g,. #PF)
        HardException = 3,
        /// Software interrupt (INT n)
        SoftIntr = 4,
        /// Privileged software exception (INT1)
        PrivSoftException = 5,
        /// Software exception (INT3 or INTO)
        SoftException = 6,
        /// Other event
        Other = 7,
    }
}

impl VmxInterruptionType {
    /// Whether the exception/interrupt with `vector` has an error code:
    /// #DF (8), #TS (10), #NP (11), #SS (12), #GP (13), #PF (14), #AC (17).
    pub const fn vector_has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10..=14 | 17)
    }

    /// Whether the error code of the exception with `vector` is always zero:
    /// #DF (8) and #AC (17).
    pub const fn vector_error_code_is_zero(vector: u8) -> bool {
        matches!(vector, 8 | 17)
    }

    /// Determine interruption type by the interrupt vector.
    ///
    /// A VMM should use type hardware exception for all exceptions other than
    /// breakpoints and overflows, which should be software exceptions. (SDM
    /// Vol. 3C, Section 24.8.3)
    pub const fn from_vector(vector: u8) -> Self {
        match vector {
            2 => Self::NMI,
            3 | 4 => Self::SoftException, // #BP, #OF
            v if v < 32 => Self::HardException,
            _ => Self::External,
        }
    }

    /// For software interrupt, privileged software exception and software
    /// exception, the VM-entry instruction length must be set. (SDM Vol. 3C,
    /// Section 26.5.1.1)
    pub const fn is_soft(&self) -> bool {
        matches!(
            *self,
            Self::SoftIntr | Self::PrivSoftException | Self::SoftException
        )
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
    /// VMX basic exit reasons. (SDM Vol. 3D, Appendix C)
    pub enum VmxExitReason {
        EXCEPTION_NMI = 0,
        EXTERNAL_INTERRUPT = 1,
        TRIPLE_FAULT = 2,
        INIT = 3,
        SIPI = 4,
        SMI = 5,
        OTHER_SMI = 6,
        INTERRUPT_WINDOW = 7,
        NMI_WINDOW = 8,
        TASK_SWITCH = 9,
        CPUID = 10,
        GETSEC = 11,
        HLT = 12,
        INVD = 13,
        INVLPG = 14,
        RDPMC = 15,
        RDTSC = 16,
        RSM = 17,
        VMCALL = 18,
        VMCLEAR = 19,
        VMLAUNCH = 20,
        VMPTRLD = 21,
        VMPTRST = 22,
        VMREAD = 23,
        VMRESUME = 24,
        VMWRITE = 25,
        VMOFF = 26,
        VMON = 27,
        CR_ACCESS = 28,
        DR_ACCESS = 29,
        IO_INSTRUCTION = 30,
        MSR_READ = 31,
        MSR_WRITE = 32,
        INVALID_GUEST_STATE = 33,
        MSR_LOAD_FAIL = 34,
        MWAIT_INSTRUCTION = 36,
        MONITOR_TRAP_FLAG = 37,
        MONITOR_INSTRUCTION = 39,
        PAUSE_INSTRUCTION = 40,
        MCE_DURING_VMENTRY = 41,
        TPR_BELOW_THRESHOLD = 43,
        APIC_ACCESS = 44,
        VIRTUALIZED_EOI = 45,
        GDTR_IDTR = 46,
        LDTR_TR = 47,
        EPT_VIOLATION = 48,
        EPT_MISCONFIG = 49,
        INVEPT = 50,
        RDTSCP = 51,
        PREEMPTION_TIMER = 52,
        INVVPID = 53,
        WBINVD = 54,
        XSETBV = 55,
        APIC_WRITE = 56,
        RDRAND = 57,
        INVPCID = 58,
        VMFUNC = 59,
        ENCLS = 60,
        RDSEED = 61,
        PML_FULL = 62,
        XSAVES = 63,
        XRSTORS = 64,
    }
}

/// The error number of a failed VMX instruction, read from the
/// VM-instruction error field. (SDM Vol. 3C, Section 30.4)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct VmxInstructionError(u32);

impl VmxInstructionError {
    pub fn as_str(&self) -> &str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            6 => "VMRESUME after VMXOFF",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            15 => "VMXON executed in VMX root operation",
            16 => "VM entry with invalid executive-VMCS pointer",
            17 => "VM entry with non-launched executive VMCS",
            18 => "VM entry with executive-VMCS pointer not VMXON pointer",
            19 => "VMCALL with non-clear VMCS",
            20 => "VMCALL with invalid VM-exit control fields",
            22 => "VMCALL with incorrect MSEG revision identifier",
            23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            24 => "VMCALL with invalid SMM-monitor features",
            25 => "VM entry with invalid VM-execution control fields in executive VMCS",
            26 => "VM entry with events blocked by MOV SS",
            28 => "Invalid operand to INVEPT/INVVPID",
            _ => "[INVALID]",
        }
    }
}

impl From<u32> for VmxInstructionError {
    fn from(x: u32) -> Self {
        Self(x)
    }
}
