//! Typed access to the fields of the current virtual-machine control
//! structure, and the encode/decode routines for vectored events.
//!
//! Field encodings follow SDM Vol. 3D, Appendix B. Every accessor is a single
//! VMREAD/VMWRITE on the processor the VMCS is loaded on.

use bit_field::BitField;
use bitflags::bitflags;
use x86::bits64::vmx;

use axerrno::{ax_err, ax_err_type, AxResult};

use super::as_axerr;
use super::definitions::{VmxExitReason, VmxInstructionError};
use super::instructions::{invept, InvEptType};
use super::msr::Msr;
use super::structs::EPTPointer;
use crate::event::InterruptEvent;
use crate::HostPhysAddr;

macro_rules! vmcs_read {
    ($field_enum:ident, $ty:ty) => {
        impl $field_enum {
            /// Read the field from the current VMCS.
            #[allow(dead_code)]
            pub fn read(self) -> AxResult<$ty> {
                unsafe { vmx::vmread(self as u32) }
                    .map(|v| v as $ty)
                    .map_err(as_axerr)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum:ident, $ty:ty) => {
        impl $field_enum {
            /// Write the field of the current VMCS.
            #[allow(dead_code)]
            pub fn write(self, value: $ty) -> AxResult {
                unsafe { vmx::vmwrite(self as u32, value as u64) }.map_err(as_axerr)
            }
        }
    };
}

/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400a,
    VMEXIT_CONTROLS = 0x400c,
    VMEXIT_MSR_STORE_COUNT = 0x400e,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    VMENTRY_INSTRUCTION_LEN = 0x401a,
    TPR_THRESHOLD = 0x401c,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200a,
    EXECUTIVE_VMCS_PTR = 0x200c,
    TSC_OFFSET = 0x2010,
    EPTP = 0x201a,
}
vmcs_read!(VmcsControl64, u64);
vmcs_write!(VmcsControl64, u64);

/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsControlNW {
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
}
vmcs_read!(VmcsControlNW, usize);
vmcs_write!(VmcsControlNW, usize);

/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
}
vmcs_read!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest16, u16);

/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    IA32_SYSENTER_CS = 0x482a,
}
vmcs_read!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest32, u32);

/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsGuest64 {
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}
vmcs_read!(VmcsGuestNW, usize);
vmcs_write!(VmcsGuestNW, usize);

/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
vmcs_read!(VmcsHost16, u16);
vmcs_write!(VmcsHost16, u16);

/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
vmcs_read!(VmcsHost32, u32);
vmcs_write!(VmcsHost32, u32);

/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
}
vmcs_read!(VmcsHost64, u64);
vmcs_write!(VmcsHost64, u64);

/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
vmcs_read!(VmcsHostNW, usize);
vmcs_write!(VmcsHostNW, usize);

/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    IDT_VECTORING_INFO = 0x4408,
    IDT_VECTORING_ERR_CODE = 0x440a,
    VMEXIT_INSTRUCTION_LEN = 0x440c,
    VMEXIT_INSTRUCTION_INFO = 0x440e,
}
vmcs_read!(VmcsReadOnly32, u32);

/// 64-Bit Read-Only Data Field. (SDM Vol. 3D, Appendix B.2.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsReadOnly64 {
    GUEST_PHYSICAL_ADDR = 0x2400,
}
vmcs_read!(VmcsReadOnly64, u64);

/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types, dead_code)]
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDR = 0x640a,
}
vmcs_read!(VmcsReadOnlyNW, usize);

pub mod controls {
    use bitflags::bitflags;

    bitflags! {
        /// Pin-Based VM-Execution Controls. (SDM Vol. 3C, Section 24.6.1)
        #[derive(Debug, Clone, Copy)]
        pub struct PinbasedControls: u32 {
            /// VM-Exit on vectored external interrupts.
            const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
            /// VM-Exit on NMIs.
            const NMI_EXITING = 1 << 3;
            /// NMI virtualization.
            const VIRTUAL_NMIS = 1 << 5;
            /// VMX preemption timer.
            const VMX_PREEMPTION_TIMER = 1 << 6;
            /// Posted interrupt processing.
            const POSTED_INTERRUPTS = 1 << 7;
        }
    }

    bitflags! {
        /// Primary Processor-Based VM-Execution Controls. (SDM Vol. 3C,
        /// Section 24.6.2)
        #[derive(Debug, Clone, Copy)]
        pub struct PrimaryControls: u32 {
            /// VM-Exit at the beginning of any instruction if RFLAGS.IF = 1
            /// and there is no other blocking of interrupts.
            const INTERRUPT_WINDOW_EXITING = 1 << 2;
            /// Offset hardware TSC when read in guest.
            const USE_TSC_OFFSETTING = 1 << 3;
            /// VM-Exit on HLT.
            const HLT_EXITING = 1 << 7;
            /// VM-Exit on INVLPG.
            const INVLPG_EXITING = 1 << 9;
            /// VM-Exit on MWAIT.
            const MWAIT_EXITING = 1 << 10;
            /// VM-Exit on RDPMC.
            const RDPMC_EXITING = 1 << 11;
            /// VM-Exit on RDTSC.
            const RDTSC_EXITING = 1 << 12;
            /// VM-Exit on writes to CR3.
            const CR3_LOAD_EXITING = 1 << 15;
            /// VM-Exit on reads from CR3.
            const CR3_STORE_EXITING = 1 << 16;
            /// VM-Exit on writes to CR8.
            const CR8_LOAD_EXITING = 1 << 19;
            /// VM-Exit on reads from CR8.
            const CR8_STORE_EXITING = 1 << 20;
            /// TPR virtualization, a.k.a. TPR shadow.
            const USE_TPR_SHADOW = 1 << 21;
            /// VM-Exit if NMIs are unblocked in guest.
            const NMI_WINDOW_EXITING = 1 << 22;
            /// VM-Exit on accesses to debug registers.
            const MOV_DR_EXITING = 1 << 23;
            /// VM-Exit on all IN{S} and OUT{S}.
            const UNCOND_IO_EXITING = 1 << 24;
            /// VM-Exit based on I/O port.
            const USE_IO_BITMAPS = 1 << 25;
            /// VMX single-step VM-Exits.
            const MONITOR_TRAP_FLAG = 1 << 27;
            /// VM-Exit based on MSR index.
            const USE_MSR_BITMAPS = 1 << 28;
            /// VM-Exit on MONITOR.
            const MONITOR_EXITING = 1 << 29;
            /// VM-Exit on PAUSE.
            const PAUSE_EXITING = 1 << 30;
            /// Enable secondary VM-execution controls.
            const SECONDARY_CONTROLS = 1 << 31;
        }
    }

    bitflags! {
        /// Secondary Processor-Based VM-Execution Controls. (SDM Vol. 3C,
        /// Section 24.6.2)
        #[derive(Debug, Clone, Copy)]
        pub struct SecondaryControls: u32 {
            /// Virtualize memory-mapped APIC accesses.
            const VIRTUALIZE_APIC = 1 << 0;
            /// Extended page tables.
            const ENABLE_EPT = 1 << 1;
            /// VM-Exit on {S,L}*DT instructions.
            const DESC_TABLE_EXITING = 1 << 2;
            /// Enable RDTSCP in guest.
            const ENABLE_RDTSCP = 1 << 3;
            /// Virtualize x2APIC for the guest.
            const VIRTUALIZE_X2APIC = 1 << 4;
            /// Virtual-processor identifiers.
            const ENABLE_VPID = 1 << 5;
            /// VM-Exit on WBINVD.
            const WBINVD_EXITING = 1 << 6;
            /// Allow real mode and other "invalid" guest states.
            const UNRESTRICTED_GUEST = 1 << 7;
            /// Conditionally VM-Exit on PAUSE at CPL0.
            const PAUSE_LOOP_EXITING = 1 << 10;
            /// VM-Exit on RDRAND.
            const RDRAND_EXITING = 1 << 11;
            /// Enable INVPCID in guest.
            const ENABLE_INVPCID = 1 << 12;
            /// VM-Exit on RDSEED.
            const RDSEED_EXITING = 1 << 16;
            /// Enable XSAVES and XRSTORS in guest.
            const ENABLE_XSAVES_XRSTORS = 1 << 20;
        }
    }

    bitflags! {
        /// VM-Exit Controls. (SDM Vol. 3C, Section 24.7.1)
        #[derive(Debug, Clone, Copy)]
        pub struct ExitControls: u32 {
            const SAVE_DEBUG_CONTROLS = 1 << 2;
            /// Logical processor is in 64-bit mode after VM exit.
            const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
            const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
            /// Acknowledge external interrupt on exit.
            const ACK_INTERRUPT_ON_EXIT = 1 << 15;
            /// Save the guest IA32_PAT MSR on exit.
            const SAVE_IA32_PAT = 1 << 18;
            /// Load the host IA32_PAT MSR on exit.
            const LOAD_IA32_PAT = 1 << 19;
            /// Save the guest IA32_EFER MSR on exit.
            const SAVE_IA32_EFER = 1 << 20;
            /// Load the host IA32_EFER MSR on exit.
            const LOAD_IA32_EFER = 1 << 21;
            const SAVE_VMX_PREEMPTION_TIMER = 1 << 22;
        }
    }

    bitflags! {
        /// VM-Entry Controls. (SDM Vol. 3C, Section 24.8.1)
        #[derive(Debug, Clone, Copy)]
        pub struct EntryControls: u32 {
            const LOAD_DEBUG_CONTROLS = 1 << 2;
            /// The logical processor is in IA-32e mode after VM entry.
            const IA32E_MODE_GUEST = 1 << 9;
            const ENTRY_TO_SMM = 1 << 10;
            const DEACT_DUAL_MONITOR = 1 << 11;
            const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
            /// Load the guest IA32_PAT MSR on entry.
            const LOAD_IA32_PAT = 1 << 14;
            /// Load the guest IA32_EFER MSR on entry.
            const LOAD_IA32_EFER = 1 << 15;
        }
    }
}

bitflags! {
    /// Guest interruptibility state: events that are blocked for a period of
    /// time after certain instructions. (SDM Vol. 3C, Section 24.4.2,
    /// Table 24-3)
    #[derive(Debug, Clone, Copy)]
    pub struct InterruptibilityState: u32 {
        /// Blocking by STI: execution of STI with RFLAGS.IF = 0 blocks
        /// maskable interrupts on the following instruction boundary.
        const BLOCKING_BY_STI = 1 << 0;
        /// Blocking by MOV SS (or POP SS): blocks interrupts and certain
        /// debug exceptions on the following instruction boundary.
        const BLOCKING_BY_MOV_SS = 1 << 1;
        /// Blocking of SMIs while in system-management mode.
        const BLOCKING_BY_SMI = 1 << 2;
        /// Blocking of NMIs until the next execution of IRET.
        const BLOCKING_BY_NMI = 1 << 3;
        /// Interruption of enclave-mode execution.
        const ENCLAVE_INTERRUPTION = 1 << 4;
    }
}

/// Information about a VM exit.
#[derive(Debug)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason.
    pub exit_reason: VmxExitReason,
    /// For VM exits resulting from instruction execution, the length in bytes
    /// of the instruction whose execution led to the VM exit.
    pub exit_instruction_length: u32,
    /// Guest `RIP` where the VM exit occurs.
    pub guest_rip: usize,
}

/// Basic information about the current VM exit.
pub fn exit_info() -> AxResult<VmxExitInfo> {
    let full_reason = VmcsReadOnly32::EXIT_REASON.read()?;
    Ok(VmxExitInfo {
        exit_reason: full_reason
            .get_bits(0..16)
            .try_into()
            .map_err(|reason| {
                ax_err_type!(BadState, format_args!("unknown VM exit reason: {:#x}", reason))
            })?,
        entry_failure: full_reason.get_bit(31),
        exit_instruction_length: VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read()?,
        guest_rip: VmcsGuestNW::RIP.read()?,
    })
}

/// The guest's event-blocking flags. Note that `RFLAGS.IF` is reported
/// separately in the guest flags register, not here.
pub fn interruptibility_state() -> AxResult<InterruptibilityState> {
    Ok(InterruptibilityState::from_bits_truncate(
        VmcsGuest32::INTERRUPTIBILITY_STATE.read()?,
    ))
}

/// The error number of the most recently failed VMX instruction.
pub fn instruction_error() -> VmxInstructionError {
    VmcsReadOnly32::VM_INSTRUCTION_ERROR.read().unwrap_or(0).into()
}

/// Encode `event` into the VM-entry interruption fields so that it is
/// delivered during the next VM entry. (SDM Vol. 3C, Section 26.5.1)
pub fn inject_event(event: InterruptEvent) -> AxResult {
    use super::definitions::VmxInterruptionType;

    VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write(event.bits())?;

    // Error-code rules are fixed per vector: #TS, #NP, #SS, #GP and #PF
    // deliver the supplied code, #DF and #AC deliver zero, nothing else
    // delivers one. (SDM Vol. 3A, Section 6.3.1)
    assert_eq!(
        event.err_code.is_some(),
        event.requires_error_code(),
        "error code validity mismatch for vector {}",
        event.vector
    );
    if let Some(err_code) = event.err_code {
        if VmxInterruptionType::vector_error_code_is_zero(event.vector) {
            assert_eq!(
                err_code, 0,
                "vector {} must carry a zero error code",
                event.vector
            );
        }
        VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE.write(err_code)?;
    }

    // Software interruption types advance the saved return address past the
    // triggering instruction; every other type delivers on the unmodified
    // guest RIP. (SDM Vol. 3C, Section 26.5.1.1)
    if event.int_type.is_soft() {
        let exit_instruction_length = VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read()?;
        if let Some(len) = event.entry_instruction_length(exit_instruction_length) {
            if len > 0 {
                VmcsControl32::VMENTRY_INSTRUCTION_LEN.write(len)?;
            }
        }
    }
    Ok(())
}

fn vectored_event_info(
    info_field: VmcsReadOnly32,
    err_code_field: VmcsReadOnly32,
) -> AxResult<Option<InterruptEvent>> {
    let info = info_field.read()?;
    if !info.get_bit(31) {
        return Ok(None);
    }
    let err_code = if info.get_bit(11) {
        Some(err_code_field.read()?)
    } else {
        None
    };
    let rip_adjust = VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read()?;
    Ok(InterruptEvent::from_raw(info, err_code, Some(rip_adjust)))
}

/// The event that caused the current VM exit, if any. (SDM Vol. 3C, Section
/// 24.9.2)
pub fn exit_event() -> AxResult<Option<InterruptEvent>> {
    vectored_event_info(
        VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO,
        VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE,
    )
}

/// The event that was being delivered through the IDT when the current VM
/// exit occurred, if any. (SDM Vol. 3C, Section 24.9.3)
pub fn idt_vectoring_event() -> AxResult<Option<InterruptEvent>> {
    vectored_event_info(
        VmcsReadOnly32::IDT_VECTORING_INFO,
        VmcsReadOnly32::IDT_VECTORING_ERR_CODE,
    )
}

/// Update `control` so that `set` bits are 1 and `clear` bits are 0, keeping
/// the reserved settings reported by the capability MSR. Flexible bits not
/// mentioned in either mask default to `old_value`. (SDM Vol. 3C, Section
/// 31.5.1, Algorithm 3)
pub fn set_control(
    control: VmcsControl32,
    capability_msr: Msr,
    old_value: u32,
    set: u32,
    clear: u32,
) -> AxResult {
    let cap = capability_msr.read();
    let allowed0 = cap as u32;
    let allowed1 = (cap >> 32) as u32;
    assert_eq!(set & clear, 0);
    debug!(
        "set {:?}: {:#x} (+{:#x}, -{:#x})",
        control, old_value, set, clear
    );
    if (set & allowed1) != set {
        return ax_err!(
            Unsupported,
            format_args!("can not set bits {:#x} in {:?}", set & !allowed1, control)
        );
    }
    if (clear & !allowed0) != clear {
        return ax_err!(
            Unsupported,
            format_args!("can not clear bits {:#x} in {:?}", clear & allowed0, control)
        );
    }
    // Flexible bits that the caller does not care about keep their old value.
    let flexible = allowed0 ^ allowed1;
    let unknown = flexible & !(set | clear);
    let default = unknown & old_value;
    control.write(allowed0 | default | set)?;
    Ok(())
}

/// Write the EPT pointer and flush EPT-derived translations for it.
pub fn set_ept_pointer(pml4_paddr: HostPhysAddr) -> AxResult {
    let eptp = EPTPointer::from_table_phys(pml4_paddr).bits();
    VmcsControl64::EPTP.write(eptp)?;
    unsafe { invept(InvEptType::SingleContext, eptp).map_err(as_axerr)? };
    Ok(())
}
