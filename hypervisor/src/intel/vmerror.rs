//! Decoding of VMX instruction failures and VM-exit reasons.

use core::fmt;

/// The VM-instruction error reported by a failed VMX instruction.
///
/// Hardware distinguishes `VMfailInvalid` (no current VMCS, nowhere to store
/// an error number) from `VMfailValid` (the error number is in the current
/// VMCS). A successfully read error field of zero is kept distinct so that
/// diagnostics never claim an error number that was never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmInstructionError {
    /// The error field read back as zero.
    NoError,
    /// VMfailInvalid: there was no current VMCS to record an error in.
    InvalidWithoutCurrentVmcs,
    /// VMfailValid, but reading the error field itself failed.
    InvalidWithCurrentVmcs,
    /// VMfailValid with the architectural error number.
    Code(u64),
}

impl VmInstructionError {
    /// Interprets a `vmread` of the VM-instruction-error field.
    pub fn from_error_field(field: Result<u64, x86::vmx::VmFail>) -> Self {
        match field {
            Ok(0) => Self::NoError,
            Ok(code) => Self::Code(code),
            Err(x86::vmx::VmFail::VmFailInvalid) => Self::InvalidWithoutCurrentVmcs,
            Err(x86::vmx::VmFail::VmFailValid) => Self::InvalidWithCurrentVmcs,
        }
    }
}

impl fmt::Display for VmInstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "VM-instruction error field was zero"),
            Self::InvalidWithoutCurrentVmcs => write!(f, "VMfailInvalid, no current VMCS"),
            Self::InvalidWithCurrentVmcs => {
                write!(f, "VMfailValid, VM-instruction error field unreadable")
            }
            Self::Code(code) => write!(f, "VM-instruction error {}", code),
        }
    }
}

/// Number of architectural basic exit reasons the dispatcher routes on.
pub const EXIT_REASON_COUNT: usize = 65;

/// Basic VM-exit reasons, per the low 16 bits of the exit-reason field.
///
/// Only the reasons this hypervisor routes on are named; anything else is
/// dispatched by its raw number and rejected if no handler claims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureGuestState = 33,
    EntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    EntryFailureMachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrOrIdtrAccess = 46,
    LdtrOrTrAccess = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl ExitReason {
    /// Maps a raw basic exit reason to the named variant, if one exists.
    pub fn from_u16(raw: u16) -> Option<Self> {
        let reason = match raw {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            3 => Self::InitSignal,
            4 => Self::StartupIpi,
            7 => Self::InterruptWindow,
            8 => Self::NmiWindow,
            9 => Self::TaskSwitch,
            10 => Self::Cpuid,
            11 => Self::Getsec,
            12 => Self::Hlt,
            13 => Self::Invd,
            14 => Self::Invlpg,
            15 => Self::Rdpmc,
            16 => Self::Rdtsc,
            18 => Self::Vmcall,
            19 => Self::Vmclear,
            20 => Self::Vmlaunch,
            21 => Self::Vmptrld,
            22 => Self::Vmptrst,
            23 => Self::Vmread,
            24 => Self::Vmresume,
            25 => Self::Vmwrite,
            26 => Self::Vmxoff,
            27 => Self::Vmxon,
            28 => Self::ControlRegisterAccesses,
            29 => Self::MovDr,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            33 => Self::EntryFailureGuestState,
            34 => Self::EntryFailureMsrLoading,
            36 => Self::Mwait,
            37 => Self::MonitorTrapFlag,
            39 => Self::Monitor,
            40 => Self::Pause,
            41 => Self::EntryFailureMachineCheck,
            43 => Self::TprBelowThreshold,
            44 => Self::ApicAccess,
            45 => Self::VirtualizedEoi,
            46 => Self::GdtrOrIdtrAccess,
            47 => Self::LdtrOrTrAccess,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            50 => Self::Invept,
            51 => Self::Rdtscp,
            52 => Self::PreemptionTimerExpired,
            53 => Self::Invvpid,
            54 => Self::WbinvdOrWbnoinvd,
            55 => Self::Xsetbv,
            56 => Self::ApicWrite,
            57 => Self::Rdrand,
            58 => Self::Invpcid,
            59 => Self::Vmfunc,
            60 => Self::Encls,
            61 => Self::Rdseed,
            62 => Self::PageModificationLogFull,
            63 => Self::Xsaves,
            64 => Self::Xrstors,
            _ => return None,
        };
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_field_decode() {
        assert_eq!(VmInstructionError::from_error_field(Ok(0)), VmInstructionError::NoError);
        assert_eq!(VmInstructionError::from_error_field(Ok(7)), VmInstructionError::Code(7));
        assert_eq!(
            VmInstructionError::from_error_field(Err(x86::vmx::VmFail::VmFailInvalid)),
            VmInstructionError::InvalidWithoutCurrentVmcs
        );
        assert_eq!(
            VmInstructionError::from_error_field(Err(x86::vmx::VmFail::VmFailValid)),
            VmInstructionError::InvalidWithCurrentVmcs
        );
    }

    #[test]
    fn exit_reason_round_trip() {
        for raw in 0..EXIT_REASON_COUNT as u16 {
            if let Some(reason) = ExitReason::from_u16(raw) {
                assert_eq!(reason as u16, raw);
            }
        }
        assert_eq!(ExitReason::from_u16(10), Some(ExitReason::Cpuid));
        assert_eq!(ExitReason::from_u16(26), Some(ExitReason::Vmxoff));
        assert_eq!(ExitReason::from_u16(65), None);
        assert_eq!(ExitReason::from_u16(5), None);
    }
}
