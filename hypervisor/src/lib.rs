//! Per-core Intel VT-x bring-up and VM-exit dispatch for a thin hypervisor.
//!
//! The crate virtualizes the context that is already running on each logical
//! CPU: bring-up probes VMX support, acquires the per-CPU VMX memory regions,
//! populates a VMCS from live processor state and issues VMLAUNCH so that the
//! previously running code continues as the guest. Every later hardware trap
//! lands in the VM-exit dispatcher, which services the exit and resumes the
//! guest, or promotes the CPU back out of VMX operation when the guest
//! executes VMXOFF.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod global_const;
pub mod intel;
pub mod logger;
pub mod platform;
