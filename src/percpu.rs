use core::mem::MaybeUninit;

use axerrno::{ax_err, AxResult};

use crate::hal::VCpuHal;
use crate::vmx::VmxPerCpuState;

/// Host per-CPU state required to run guests on one logical processor.
///
/// One instance exists per processor index, initialized exactly once at
/// hypervisor startup and kept for the hypervisor's lifetime. Recommended
/// usage with a per-CPU variable in the embedding hypervisor:
///
/// ```ignore
/// #[percpu::def_percpu]
/// pub static VMX_PER_CPU: PerCpu<MyHal> = PerCpu::new_uninit();
///
/// let percpu = unsafe { VMX_PER_CPU.current_ref_mut_raw() };
/// percpu.init(cpu_id).expect("failed to initialize per-CPU state");
/// percpu.hardware_enable().expect("failed to enable virtualization");
/// ```
pub struct PerCpu<H: VCpuHal> {
    /// The id of the CPU. Also used to check whether the per-CPU state is
    /// initialized.
    cpu_id: Option<usize>,
    /// The VMX state of this processor.
    arch: MaybeUninit<VmxPerCpuState<H>>,
}

impl<H: VCpuHal> PerCpu<H> {
    /// Create a new, uninitialized per-CPU state.
    pub const fn new_uninit() -> Self {
        Self {
            cpu_id: None,
            arch: MaybeUninit::uninit(),
        }
    }

    /// Initialize the per-CPU state. Fails if it was already initialized;
    /// there is no re-entrant initialization path.
    pub fn init(&mut self, cpu_id: usize) -> AxResult {
        if self.cpu_id.is_some() {
            ax_err!(BadState, "per-CPU state is already initialized")
        } else {
            self.cpu_id = Some(cpu_id);
            self.arch.write(VmxPerCpuState::new());
            Ok(())
        }
    }

    /// The processor index this state was initialized for.
    pub fn cpu_id(&self) -> Option<usize> {
        self.cpu_id
    }

    /// Return the VMX per-CPU state. Panics if not initialized.
    pub fn arch_checked(&self) -> &VmxPerCpuState<H> {
        assert!(self.cpu_id.is_some(), "per-CPU state is not initialized");
        // SAFETY: `cpu_id` is `Some` here, so `arch` must be initialized.
        unsafe { self.arch.assume_init_ref() }
    }

    /// Return the mutable VMX per-CPU state. Panics if not initialized.
    pub fn arch_checked_mut(&mut self) -> &mut VmxPerCpuState<H> {
        assert!(self.cpu_id.is_some(), "per-CPU state is not initialized");
        // SAFETY: `cpu_id` is `Some` here, so `arch` must be initialized.
        unsafe { self.arch.assume_init_mut() }
    }

    /// Whether the current CPU has hardware virtualization enabled.
    pub fn is_enabled(&self) -> bool {
        self.arch_checked().is_enabled()
    }

    /// Enable hardware virtualization on the current CPU.
    pub fn hardware_enable(&mut self) -> AxResult {
        self.arch_checked_mut().hardware_enable()
    }

    /// Disable hardware virtualization on the current CPU.
    pub fn hardware_disable(&mut self) -> AxResult {
        self.arch_checked_mut().hardware_disable()
    }
}

impl<H: VCpuHal> Drop for PerCpu<H> {
    fn drop(&mut self) {
        if self.cpu_id.is_some() && self.is_enabled() {
            self.hardware_disable().unwrap();
        }
    }
}
