use crate::{HostPhysAddr, HostVirtAddr};

/// The interfaces which the underlying software (kernel or hypervisor) must
/// implement.
pub trait VCpuHal: Sized {
    /// Allocate one 4 KiB physical frame for VMX structures (VMXON/VMCS
    /// regions, I/O and MSR bitmaps). Returns `None` when out of memory.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Deallocate a frame previously returned by [`VCpuHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Convert a host physical address to a host virtual address mapping it.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}
