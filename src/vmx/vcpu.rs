use core::fmt::{Debug, Formatter, Result};
use core::mem::size_of;

use bit_field::BitField;
use raw_cpuid::CpuId;
use x86::bits64::vmx;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr3, Cr4, Cr4Flags};
use x86_64::registers::rflags::RFlags;

use axerrno::AxResult;

use super::as_axerr;
use super::definitions::VmxExitReason;
use super::msr::Msr;
use super::structs::{IOBitmap, MsrBitmap, VmxRegion};
use super::vmcs::{
    self, VmcsControl32, VmcsControl64, VmcsControlNW, VmcsGuest16, VmcsGuest32, VmcsGuest64,
    VmcsGuestNW, VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW, VmxExitInfo,
};
use crate::event::{InterruptEvent, PendingEventQueue};
use crate::hal::VCpuHal;
use crate::regs::GeneralRegisters;
use crate::{GuestPhysAddr, HostPhysAddr};

/// A virtual CPU within a guest.
///
/// Owns the VMCS of one logical processor together with the queue of events
/// waiting to be injected into the guest. The structure is processor-local:
/// it is only ever touched between a VM-exit and the following VM-entry on
/// the processor it is bound to, so no locking is involved.
#[repr(C)]
pub struct VmxVcpu<H: VCpuHal> {
    // DO NOT modify `guest_regs` and `host_stack_top` and their order unless
    // you do know what you are doing! They are used by the entry/exit
    // trampolines below.
    guest_regs: GeneralRegisters,
    host_stack_top: u64,
    vcpu_id: usize,
    launched: bool,
    vmcs: VmxRegion<H>,
    io_bitmap: IOBitmap<H>,
    msr_bitmap: MsrBitmap<H>,
    pending_events: PendingEventQueue,
}

impl<H: VCpuHal> VmxVcpu<H> {
    /// Create a new [`VmxVcpu`] with an uninitialized VMCS.
    ///
    /// `vmcs_revision_id` is the identifier reported by
    /// [`read_vmcs_revision_id`](crate::read_vmcs_revision_id) after VMX has
    /// been enabled on the processor.
    pub fn new(vcpu_id: usize, vmcs_revision_id: u32) -> AxResult<Self> {
        let vcpu = Self {
            guest_regs: GeneralRegisters::default(),
            host_stack_top: 0,
            vcpu_id,
            launched: false,
            vmcs: VmxRegion::new(vmcs_revision_id, false)?,
            io_bitmap: IOBitmap::passthrough_all()?,
            msr_bitmap: MsrBitmap::passthrough_all()?,
            pending_events: PendingEventQueue::new(),
        };
        info!("created VmxVcpu(vmcs: {:#x})", vcpu.vmcs.phys_addr());
        Ok(vcpu)
    }

    /// Set up the VMCS of this vCPU: guest state starting at `entry` in real
    /// mode, host state returning to the exit trampoline, and execution
    /// controls with the nested page table rooted at `ept_root`.
    pub fn setup(&mut self, ept_root: HostPhysAddr, entry: GuestPhysAddr) -> AxResult {
        let paddr = self.vmcs.phys_addr().as_usize() as u64;
        unsafe {
            vmx::vmclear(paddr).map_err(as_axerr)?;
        }
        self.bind_to_current_processor()?;
        self.setup_vmcs_host()?;
        self.setup_vmcs_guest(entry)?;
        self.setup_vmcs_control(ept_root)?;
        self.unbind_from_current_processor()?;
        Ok(())
    }

    /// Get the identifier of this [`VmxVcpu`].
    pub fn vcpu_id(&self) -> usize {
        self.vcpu_id
    }

    /// Bind this [`VmxVcpu`] to the current logical processor.
    pub fn bind_to_current_processor(&self) -> AxResult {
        debug!(
            "VmxVcpu[{}] bind to current processor vmcs @ {:#x}",
            self.vcpu_id,
            self.vmcs.phys_addr()
        );
        unsafe {
            vmx::vmptrld(self.vmcs.phys_addr().as_usize() as u64).map_err(as_axerr)?;
        }
        Ok(())
    }

    /// Unbind this [`VmxVcpu`] from the current logical processor.
    pub fn unbind_from_current_processor(&self) -> AxResult {
        debug!(
            "VmxVcpu[{}] unbind from current processor vmcs @ {:#x}",
            self.vcpu_id,
            self.vmcs.phys_addr()
        );
        unsafe {
            vmx::vmclear(self.vmcs.phys_addr().as_usize() as u64).map_err(as_axerr)?;
        }
        Ok(())
    }

    /// Run the guest. Returns when a VM-exit happens, and returns the exit
    /// information if it cannot be handled by this [`VmxVcpu`] itself.
    pub fn run(&mut self) -> Option<VmxExitInfo> {
        unsafe {
            if self.launched {
                self.vmx_resume();
            } else {
                self.launched = true;
                VmcsHostNW::RSP
                    .write(&self.host_stack_top as *const _ as usize)
                    .unwrap();

                self.vmx_launch();
            }
        }

        let exit_info = self.exit_info().unwrap();
        trace!("VM exit: {:#x?}", exit_info);

        match self.builtin_vmexit_handler(&exit_info) {
            Some(result) => {
                if result.is_err() {
                    panic!(
                        "VmxVcpu failed to handle a VM-exit that should be handled by itself: {:?}, error {:?}, vcpu: {:#x?}",
                        exit_info.exit_reason,
                        result.unwrap_err(),
                        self
                    );
                }
                None
            }
            None => Some(exit_info),
        }
    }

    /// Basic information about the current VM exit.
    pub fn exit_info(&self) -> AxResult<VmxExitInfo> {
        vmcs::exit_info()
    }

    /// The event that caused the current VM exit, decoded from the exit-time
    /// interruption-information field. `None` if the exit was not caused by a
    /// vectored event.
    pub fn exit_event(&self) -> AxResult<Option<InterruptEvent>> {
        vmcs::exit_event()
    }

    /// The event whose delivery through the guest IDT was interrupted by the
    /// current VM exit, decoded from the IDT-vectoring field. Callers use
    /// this to re-inject the event so that it is not lost.
    pub fn idt_vectoring_event(&self) -> AxResult<Option<InterruptEvent>> {
        vmcs::idt_vectoring_event()
    }

    /// Guest general-purpose registers.
    pub fn regs(&self) -> &GeneralRegisters {
        &self.guest_regs
    }

    /// Mutable reference of guest general-purpose registers.
    pub fn regs_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.guest_regs
    }

    /// Guest stack pointer. (`RSP`)
    pub fn stack_pointer(&self) -> usize {
        VmcsGuestNW::RSP.read().unwrap()
    }

    /// Set guest stack pointer. (`RSP`)
    pub fn set_stack_pointer(&mut self, rsp: usize) {
        VmcsGuestNW::RSP.write(rsp).unwrap()
    }

    /// Guest instruction pointer. (`RIP`)
    pub fn rip(&self) -> usize {
        VmcsGuestNW::RIP.read().unwrap()
    }

    /// Advance guest `RIP` by `instr_len` bytes.
    pub fn advance_rip(&mut self, instr_len: u8) -> AxResult {
        VmcsGuestNW::RIP.write(VmcsGuestNW::RIP.read()? + instr_len as usize)
    }

    /// Deliver `event` into the guest, or queue it when the guest currently
    /// cannot accept it (blocked by MOV SS/STI/SMI/NMI, or `RFLAGS.IF`
    /// clear).
    ///
    /// Returns `Ok(true)` when the event was encoded for the next VM entry
    /// and the queue is untouched. `Ok(false)` is not an error: the event was
    /// enqueued and interrupt-window exiting armed, so delivery happens on a
    /// later entry as soon as the guest becomes interruptible. There is no
    /// way to cancel an event once it has been accepted.
    ///
    /// A `priority` event is delivered before everything already queued;
    /// among several priority events the most recently queued one wins.
    pub fn inject_event(&mut self, event: InterruptEvent, priority: bool) -> AxResult<bool> {
        if self.guest_is_interruptible()? {
            vmcs::inject_event(event)?;
            Ok(true)
        } else {
            if priority {
                self.pending_events.push_front(event);
            } else {
                self.pending_events.push_back(event);
            }
            debug!(
                "VmxVcpu[{}] deferring event vector {:#x} ({} queued)",
                self.vcpu_id,
                event.vector,
                self.pending_events.len()
            );
            self.set_interrupt_window(true)?;
            Ok(false)
        }
    }

    /// Deliver the front pending event.
    ///
    /// Must only be called while handling an interrupt-window VM-exit with at
    /// least one event queued: the exit itself proves the guest is
    /// interruptible, so interruptibility is deliberately not re-checked
    /// here. Calling this with an empty queue aborts.
    pub fn inject_pending_event(&mut self) -> AxResult {
        assert!(self.has_pending_event(), "no pending event to inject");
        let event = self.pending_events.pop_front();
        vmcs::inject_event(event)
    }

    /// Whether at least one event is waiting for an interrupt window.
    pub fn has_pending_event(&self) -> bool {
        !self.pending_events.is_empty()
    }

    /// If enabled, a VM exit occurs at the beginning of any instruction if
    /// `RFLAGS.IF` = 1 and there is no other blocking of interrupts.
    /// (SDM Vol. 3C, Section 24.4.2)
    pub fn set_interrupt_window(&mut self, enable: bool) -> AxResult {
        let mut ctrl = VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS.read()?;
        let bits = vmcs::controls::PrimaryControls::INTERRUPT_WINDOW_EXITING.bits();
        if enable {
            ctrl |= bits
        } else {
            ctrl &= !bits
        }
        VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS.write(ctrl)?;
        Ok(())
    }

    /// Set I/O intercept by modifying the I/O bitmap.
    pub fn set_io_intercept_of_range(&mut self, port_base: u32, count: u32, intercept: bool) {
        self.io_bitmap
            .set_intercept_of_range(port_base, count, intercept)
    }

    /// Set MSR intercept by modifying the MSR bitmap.
    pub fn set_msr_intercept_of_range(&mut self, msr: u32, intercept: bool) {
        self.msr_bitmap.set_read_intercept(msr, intercept);
        self.msr_bitmap.set_write_intercept(msr, intercept);
    }
}

// Implementation of private methods
impl<H: VCpuHal> VmxVcpu<H> {
    /// Whether the guest can accept an event right now: no blocking flags in
    /// the interruptibility state and `RFLAGS.IF` set. (SDM Vol. 3C, Section
    /// 24.4.2, Table 24-3)
    fn guest_is_interruptible(&self) -> AxResult<bool> {
        let rflags = VmcsGuestNW::RFLAGS.read()?;
        let block_state = vmcs::interruptibility_state()?;
        Ok(block_state.is_empty() && rflags as u64 & RFlags::INTERRUPT_FLAG.bits() != 0)
    }

    /// Handle VM-exits that can and should be handled by [`VmxVcpu`] itself.
    ///
    /// Returns the result, or `None` if the VM-exit was not handled.
    fn builtin_vmexit_handler(&mut self, exit_info: &VmxExitInfo) -> Option<AxResult> {
        if exit_info.entry_failure {
            panic!("VM entry failed: {:#x?}", exit_info);
        }

        match exit_info.exit_reason {
            VmxExitReason::INTERRUPT_WINDOW => Some(self.handle_interrupt_window()),
            _ => None,
        }
    }

    /// The guest has become interruptible while events were queued: deliver
    /// the front one, and stop asking for window exits once the queue is
    /// drained.
    fn handle_interrupt_window(&mut self) -> AxResult {
        self.inject_pending_event()?;
        if !self.has_pending_event() {
            self.set_interrupt_window(false)?;
        }
        Ok(())
    }

    fn setup_vmcs_host(&mut self) -> AxResult {
        VmcsHost64::IA32_PAT.write(Msr::IA32_PAT.read())?;
        VmcsHost64::IA32_EFER.write(Msr::IA32_EFER.read())?;

        VmcsHostNW::CR0.write(Cr0::read_raw() as _)?;
        VmcsHostNW::CR3.write(Cr3::read_raw().0.start_address().as_u64() as _)?;
        VmcsHostNW::CR4.write(Cr4::read_raw() as _)?;

        VmcsHost16::ES_SELECTOR.write(x86::segmentation::es().bits())?;
        VmcsHost16::CS_SELECTOR.write(x86::segmentation::cs().bits())?;
        VmcsHost16::SS_SELECTOR.write(x86::segmentation::ss().bits())?;
        VmcsHost16::DS_SELECTOR.write(x86::segmentation::ds().bits())?;
        VmcsHost16::FS_SELECTOR.write(x86::segmentation::fs().bits())?;
        VmcsHost16::GS_SELECTOR.write(x86::segmentation::gs().bits())?;
        VmcsHostNW::FS_BASE.write(Msr::IA32_FS_BASE.read() as _)?;
        VmcsHostNW::GS_BASE.write(Msr::IA32_GS_BASE.read() as _)?;

        let tr = unsafe { x86::task::tr() };
        let mut gdtp = DescriptorTablePointer::<u64>::default();
        let mut idtp = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdtp);
            dtables::sidt(&mut idtp);
        }
        VmcsHost16::TR_SELECTOR.write(tr.bits())?;
        VmcsHostNW::TR_BASE.write(get_tr_base(tr, &gdtp) as _)?;
        VmcsHostNW::GDTR_BASE.write(gdtp.base as _)?;
        VmcsHostNW::IDTR_BASE.write(idtp.base as _)?;
        VmcsHostNW::RIP.write(Self::vmx_exit as usize)?;

        VmcsHostNW::IA32_SYSENTER_ESP.write(0)?;
        VmcsHostNW::IA32_SYSENTER_EIP.write(0)?;
        VmcsHost32::IA32_SYSENTER_CS.write(0)?;

        Ok(())
    }

    fn setup_vmcs_guest(&mut self, entry: GuestPhysAddr) -> AxResult {
        let cr0_val: Cr0Flags =
            Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE;
        self.set_cr(0, cr0_val.bits());
        self.set_cr(4, 0);

        macro_rules! set_guest_segment {
            ($sel:ident, $base:ident, $limit:ident, $ar:ident, $access_rights:expr) => {{
                VmcsGuest16::$sel.write(0)?;
                VmcsGuestNW::$base.write(0)?;
                VmcsGuest32::$limit.write(0xffff)?;
                VmcsGuest32::$ar.write($access_rights)?;
            }};
        }

        // 16-bit, present, data, read/write, accessed
        set_guest_segment!(ES_SELECTOR, ES_BASE, ES_LIMIT, ES_ACCESS_RIGHTS, 0x93);
        // 16-bit, present, code, exec/read, accessed
        set_guest_segment!(CS_SELECTOR, CS_BASE, CS_LIMIT, CS_ACCESS_RIGHTS, 0x9b);
        set_guest_segment!(SS_SELECTOR, SS_BASE, SS_LIMIT, SS_ACCESS_RIGHTS, 0x93);
        set_guest_segment!(DS_SELECTOR, DS_BASE, DS_LIMIT, DS_ACCESS_RIGHTS, 0x93);
        set_guest_segment!(FS_SELECTOR, FS_BASE, FS_LIMIT, FS_ACCESS_RIGHTS, 0x93);
        set_guest_segment!(GS_SELECTOR, GS_BASE, GS_LIMIT, GS_ACCESS_RIGHTS, 0x93);
        // present, system, 32-bit TSS busy
        set_guest_segment!(TR_SELECTOR, TR_BASE, TR_LIMIT, TR_ACCESS_RIGHTS, 0x8b);
        // present, system, LDT
        set_guest_segment!(
            LDTR_SELECTOR,
            LDTR_BASE,
            LDTR_LIMIT,
            LDTR_ACCESS_RIGHTS,
            0x82
        );

        VmcsGuestNW::GDTR_BASE.write(0)?;
        VmcsGuest32::GDTR_LIMIT.write(0xffff)?;
        VmcsGuestNW::IDTR_BASE.write(0)?;
        VmcsGuest32::IDTR_LIMIT.write(0xffff)?;

        VmcsGuestNW::CR3.write(0)?;
        VmcsGuestNW::DR7.write(0x400)?;
        VmcsGuestNW::RSP.write(0)?;
        VmcsGuestNW::RIP.write(entry.as_usize())?;
        VmcsGuestNW::RFLAGS.write(0x2)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write(0)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write(0)?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write(0)?;
        VmcsGuest32::IA32_SYSENTER_CS.write(0)?;

        VmcsGuest32::INTERRUPTIBILITY_STATE.write(0)?;
        VmcsGuest32::ACTIVITY_STATE.write(0)?;

        VmcsGuest64::LINK_PTR.write(u64::MAX)?; // SDM Vol. 3C, Section 24.4.2
        VmcsGuest64::IA32_DEBUGCTL.write(0)?;
        VmcsGuest64::IA32_PAT.write(Msr::IA32_PAT.read())?;
        VmcsGuest64::IA32_EFER.write(0)?;
        Ok(())
    }

    fn setup_vmcs_control(&mut self, ept_root: HostPhysAddr) -> AxResult {
        use super::vmcs::controls::*;

        // Intercept NMIs.
        vmcs::set_control(
            VmcsControl32::PINBASED_EXEC_CONTROLS,
            Msr::IA32_VMX_TRUE_PINBASED_CTLS,
            Msr::IA32_VMX_PINBASED_CTLS.read() as u32,
            PinbasedControls::NMI_EXITING.bits(),
            0,
        )?;

        // Use I/O and MSR bitmaps, activate secondary controls, disable CR3
        // load/store interception.
        vmcs::set_control(
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            Msr::IA32_VMX_PROCBASED_CTLS.read() as u32,
            (PrimaryControls::USE_IO_BITMAPS
                | PrimaryControls::USE_MSR_BITMAPS
                | PrimaryControls::SECONDARY_CONTROLS)
                .bits(),
            (PrimaryControls::CR3_LOAD_EXITING
                | PrimaryControls::CR3_STORE_EXITING
                | PrimaryControls::CR8_LOAD_EXITING
                | PrimaryControls::CR8_STORE_EXITING)
                .bits(),
        )?;

        // Enable EPT, unrestricted guest, and RDTSCP/INVPCID if available.
        let raw_cpuid = CpuId::new();
        let mut val = SecondaryControls::ENABLE_EPT | SecondaryControls::UNRESTRICTED_GUEST;
        if let Some(features) = raw_cpuid.get_extended_processor_and_feature_identifiers() {
            if features.has_rdtscp() {
                val |= SecondaryControls::ENABLE_RDTSCP;
            }
        }
        if let Some(features) = raw_cpuid.get_extended_feature_info() {
            if features.has_invpcid() {
                val |= SecondaryControls::ENABLE_INVPCID;
            }
        }
        vmcs::set_control(
            VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
            Msr::IA32_VMX_PROCBASED_CTLS2,
            Msr::IA32_VMX_PROCBASED_CTLS2.read() as u32,
            val.bits(),
            0,
        )?;

        // Switch to 64-bit host, acknowledge interrupt info, switch
        // IA32_PAT/IA32_EFER on VM exit.
        vmcs::set_control(
            VmcsControl32::VMEXIT_CONTROLS,
            Msr::IA32_VMX_TRUE_EXIT_CTLS,
            Msr::IA32_VMX_EXIT_CTLS.read() as u32,
            (ExitControls::HOST_ADDRESS_SPACE_SIZE
                | ExitControls::ACK_INTERRUPT_ON_EXIT
                | ExitControls::SAVE_IA32_PAT
                | ExitControls::LOAD_IA32_PAT
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        // Load guest IA32_PAT/IA32_EFER on VM entry.
        vmcs::set_control(
            VmcsControl32::VMENTRY_CONTROLS,
            Msr::IA32_VMX_TRUE_ENTRY_CTLS,
            Msr::IA32_VMX_ENTRY_CTLS.read() as u32,
            (EntryControls::LOAD_IA32_PAT | EntryControls::LOAD_IA32_EFER).bits(),
            0,
        )?;

        vmcs::set_ept_pointer(ept_root)?;

        // No MSR switches if the hypervisor doesn't use them.
        VmcsControl32::VMEXIT_MSR_STORE_COUNT.write(0)?;
        VmcsControl32::VMEXIT_MSR_LOAD_COUNT.write(0)?;
        VmcsControl32::VMENTRY_MSR_LOAD_COUNT.write(0)?;

        VmcsControl32::CR3_TARGET_COUNT.write(0)?;

        // Pass-through all exceptions; entry-time events reach the guest
        // only through the injection interface.
        VmcsControl32::EXCEPTION_BITMAP.write(0)?;
        VmcsControl64::IO_BITMAP_A_ADDR.write(self.io_bitmap.phys_addr().0.as_usize() as _)?;
        VmcsControl64::IO_BITMAP_B_ADDR.write(self.io_bitmap.phys_addr().1.as_usize() as _)?;
        VmcsControl64::MSR_BITMAPS_ADDR.write(self.msr_bitmap.phys_addr().as_usize() as _)?;
        Ok(())
    }

    fn set_cr(&mut self, cr_idx: usize, val: u64) {
        (|| -> AxResult {
            match cr_idx {
                0 => {
                    // In addition to what the VMX MSRs tell us, keep NW and CD
                    // off since they are not updated on VM exit, and let the
                    // guest choose PE and PG freely since unrestricted guest
                    // mode is in use.
                    let must0 = Msr::IA32_VMX_CR0_FIXED1.read()
                        & !(Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE).bits();
                    let must1 = Msr::IA32_VMX_CR0_FIXED0.read()
                        & !(Cr0Flags::PAGING | Cr0Flags::PROTECTED_MODE_ENABLE).bits();
                    VmcsGuestNW::CR0.write(((val & must0) | must1) as _)?;
                    VmcsControlNW::CR0_READ_SHADOW.write(val as _)?;
                    VmcsControlNW::CR0_GUEST_HOST_MASK.write((must1 | !must0) as _)?;
                }
                3 => VmcsGuestNW::CR3.write(val as _)?,
                4 => {
                    let must0 = Msr::IA32_VMX_CR4_FIXED1.read();
                    let must1 = Msr::IA32_VMX_CR4_FIXED0.read();
                    let val = val | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
                    VmcsGuestNW::CR4.write(((val & must0) | must1) as _)?;
                    VmcsControlNW::CR4_READ_SHADOW.write(val as _)?;
                    VmcsControlNW::CR4_GUEST_HOST_MASK.write((must1 | !must0) as _)?;
                }
                _ => unreachable!(),
            };
            Ok(())
        })()
        .expect("Failed to write guest control register")
    }
}

/// Get ready then vmlaunch or vmresume.
macro_rules! vmx_entry_with {
    ($instr:literal) => {
        core::arch::naked_asm!(
            save_regs_to_stack!(),                  // save host status
            "mov    [rdi + {host_stack_top}], rsp", // save current RSP to Vcpu::host_stack_top
            "mov    rsp, rdi",                      // set RSP to guest regs area
            restore_regs_from_stack!(),             // restore guest status
            $instr,                                 // let's go!
            "jmp    {failed}",
            host_stack_top = const size_of::<GeneralRegisters>(),
            failed = sym Self::vmx_entry_failed,
        )
    }
}

impl<H: VCpuHal> VmxVcpu<H> {
    /// Enter the guest with vmlaunch.
    ///
    /// This function itself never returns, but [`Self::vmx_exit`] will do the
    /// return for it. The return value is a dummy value.
    #[unsafe(naked)]
    unsafe extern "C" fn vmx_launch(&mut self) -> usize {
        vmx_entry_with!("vmlaunch")
    }

    /// Enter the guest with vmresume.
    ///
    /// See [`Self::vmx_launch`] for details.
    #[unsafe(naked)]
    unsafe extern "C" fn vmx_resume(&mut self) -> usize {
        vmx_entry_with!("vmresume")
    }

    /// Return from the guest after a VM-exit.
    ///
    /// The return value is a dummy value.
    #[unsafe(naked)]
    unsafe extern "C" fn vmx_exit(&mut self) -> usize {
        core::arch::naked_asm!(
            save_regs_to_stack!(),                  // save guest status
            "mov    rsp, [rsp + {host_stack_top}]", // set RSP to Vcpu::host_stack_top
            restore_regs_from_stack!(),             // restore host status
            "ret",
            host_stack_top = const size_of::<GeneralRegisters>(),
        )
    }

    fn vmx_entry_failed() -> ! {
        panic!("{}", vmcs::instruction_error().as_str())
    }
}

fn get_tr_base(tr: SegmentSelector, gdt: &DescriptorTablePointer<u64>) -> u64 {
    let index = tr.index() as usize;
    let table_len = (gdt.limit as usize + 1) / core::mem::size_of::<u64>();
    let table = unsafe { core::slice::from_raw_parts(gdt.base, table_len) };
    let entry = table[index];
    if entry & (1 << 47) != 0 {
        // present
        let base_low = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        let base_high = table[index + 1] & 0xffff_ffff;
        base_low | base_high << 32
    } else {
        // not present
        0
    }
}

impl<H: VCpuHal> Drop for VmxVcpu<H> {
    fn drop(&mut self) {
        unsafe { vmx::vmclear(self.vmcs.phys_addr().as_usize() as u64).unwrap() };
        info!("dropped VmxVcpu(vmcs: {:#x})", self.vmcs.phys_addr());
    }
}

impl<H: VCpuHal> Debug for VmxVcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> Result {
        (|| -> AxResult<Result> {
            Ok(f.debug_struct("VmxVcpu")
                .field("guest_regs", &self.guest_regs)
                .field("rip", &VmcsGuestNW::RIP.read()?)
                .field("rsp", &VmcsGuestNW::RSP.read()?)
                .field("rflags", &VmcsGuestNW::RFLAGS.read()?)
                .field("cr0", &VmcsGuestNW::CR0.read()?)
                .field("cr3", &VmcsGuestNW::CR3.read()?)
                .field("cr4", &VmcsGuestNW::CR4.read()?)
                .field("cs", &VmcsGuest16::CS_SELECTOR.read()?)
                .field("pending_events", &self.pending_events.len())
                .finish())
        })()
        .unwrap()
    }
}
