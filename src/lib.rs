#![cfg_attr(not(test), no_std)]

//! Virtual-CPU control layer for VT-x (Intel VMX) hypervisors.
//!
//! This crate contains:
//! - [`VmxVcpu`]: one guest virtual CPU, owning its VMCS region and the
//!   pending-event queue, with a `run()` loop entering the guest via
//!   VMLAUNCH/VMRESUME.
//! - The event injection subsystem: [`InterruptEvent`] descriptors are either
//!   encoded into the VM-entry interruption fields immediately, or queued in a
//!   [`PendingEventQueue`] until the guest opens an interrupt window.
//! - [`PerCpu`]/[`VmxPerCpuState`]: per-processor VMX enablement (VMXON).
//!
//! Guest memory management, device emulation and instruction emulation are
//! left to the embedding hypervisor; it provides frame allocation through the
//! [`VCpuHal`] trait and a nested page-table root at vCPU setup time.

#[macro_use]
extern crate log;

#[macro_use]
mod regs;

mod event;
mod frame;
mod hal;
mod percpu;
mod vmx;

#[cfg(test)]
mod test;

pub use event::{InterruptEvent, PendingEventQueue};
pub use frame::PhysFrame;
pub use hal::VCpuHal;
pub use percpu::PerCpu;
pub use regs::GeneralRegisters;
pub use vmx::{has_hardware_support, read_vmcs_revision_id};
pub use vmx::{InterruptibilityState, VmxExitInfo, VmxExitReason, VmxInterruptionType};
pub use vmx::{VmxPerCpuState, VmxVcpu};

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;

memory_addr::def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}
