//! Intel VT-x specific parts of the hypervisor core.

pub mod capability;
pub mod context;
pub mod descriptor;
pub mod regions;
pub mod support;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
pub mod vmlaunch;
pub mod vmx;
