//! VMX instructions not covered by the `x86` crate.

use x86::bits64::rflags::{self, RFlags};
use x86::vmx::VmFail;

/// INVEPT invalidation types. (SDM Vol. 3C, Section 30.3, INVEPT)
#[derive(Debug)]
#[allow(dead_code)]
pub enum InvEptType {
    /// Invalidate mappings associated with a single EPT pointer.
    SingleContext = 1,
    /// Invalidate mappings associated with all EPT pointers.
    Global = 2,
}

/// Extract the VMX instruction result in accordance with the conventions
/// described in SDM Vol. 3C, Section 30.2.
///
/// This is inlined so that RFLAGS cannot be clobbered by a function prologue
/// between the instruction and the read.
#[inline(always)]
fn vmx_capture_status() -> Result<(), VmFail> {
    let flags = rflags::read();
    if flags.contains(RFlags::FLAGS_ZF) {
        Err(VmFail::VmFailValid)
    } else if flags.contains(RFlags::FLAGS_CF) {
        Err(VmFail::VmFailInvalid)
    } else {
        Ok(())
    }
}

/// Invalidate translations derived from EPT.
///
/// # Safety
///
/// The processor must be in VMX operation.
pub unsafe fn invept(inv_type: InvEptType, eptp: u64) -> Result<(), VmFail> {
    let descriptor = [eptp, 0];
    core::arch::asm!("invept {}, [{}]", in(reg) inv_type as u64, in(reg) descriptor.as_ptr());
    vmx_capture_status()
}
