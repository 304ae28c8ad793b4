//! Crate-wide error type for VMX bring-up and dispatch.

use {
    crate::intel::{regions::RegionKind, vmerror::VmInstructionError},
    thiserror::Error,
};

/// Errors surfaced to the per-CPU caller.
///
/// Every failure during bring-up causes a complete resource rollback before
/// one of these is returned; there are no automatic retries.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    /// The CPU vendor is not Intel.
    #[error("CPU vendor is not Intel")]
    CpuUnsupported,

    /// CPUID reports no VMX support.
    #[error("VMX is not supported by this CPU")]
    VmxUnsupported,

    /// CR4.VMXE was already set when bring-up started.
    #[error("CR4.VMXE is already set, another hypervisor owns this core")]
    VmxAlreadyEnabled,

    /// IA32_FEATURE_CONTROL is locked with VMXON-outside-SMX disabled.
    #[error("firmware locked IA32_FEATURE_CONTROL with VMX disabled")]
    VmxDisabledByFirmware,

    /// A descriptor-table base is not canonical.
    #[error("descriptor table base {0:#x} is not canonical")]
    NonCanonicalBase(u64),

    /// A region's physical address is not page aligned.
    #[error("{0:?} region physical address {1:#x} is not page aligned")]
    RegionMisaligned(RegionKind, u64),

    /// A region's physical address exceeds the platform address width.
    #[error("{0:?} region physical address {1:#x} exceeds the physical address width")]
    RegionOutOfRange(RegionKind, u64),

    /// The platform allocator could not satisfy an acquisition step.
    #[error("platform allocator failed while acquiring the {0:?} region")]
    RegionExhausted(RegionKind),

    /// A VMX instruction failed, with the decoded VM-instruction error.
    #[error("{0} failed: {1}")]
    InstructionFailed(&'static str, VmInstructionError),

    /// The dispatcher received an exit reason with no claiming handler.
    #[error("no handler claimed VM-exit reason {0}")]
    UnhandledExit(u16),
}

/// The spec-level error taxonomy; see [`HypervisorError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unrecoverable mis-configuration of this CPU; no retry.
    Configuration,
    /// Platform allocator exhausted; full rollback performed.
    Allocation,
    /// A VMX instruction failed; fatal for this CPU.
    Instruction,
    /// A VM-exit no handler claimed.
    UnhandledExit,
}

impl HypervisorError {
    /// Classifies the error into the four-way taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CpuUnsupported
            | Self::VmxUnsupported
            | Self::VmxAlreadyEnabled
            | Self::VmxDisabledByFirmware
            | Self::NonCanonicalBase(_)
            | Self::RegionMisaligned(..)
            | Self::RegionOutOfRange(..) => ErrorKind::Configuration,
            Self::RegionExhausted(_) => ErrorKind::Allocation,
            Self::InstructionFailed(..) => ErrorKind::Instruction,
            Self::UnhandledExit(_) => ErrorKind::UnhandledExit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classification() {
        assert_eq!(HypervisorError::VmxAlreadyEnabled.kind(), ErrorKind::Configuration);
        assert_eq!(HypervisorError::NonCanonicalBase(0xdead_0000_0000).kind(), ErrorKind::Configuration);
        assert_eq!(HypervisorError::RegionExhausted(RegionKind::MsrBitmap).kind(), ErrorKind::Allocation);
        assert_eq!(
            HypervisorError::InstructionFailed("vmlaunch", VmInstructionError::NoError).kind(),
            ErrorKind::Instruction
        );
        assert_eq!(HypervisorError::UnhandledExit(54).kind(), ErrorKind::UnhandledExit);
    }
}
