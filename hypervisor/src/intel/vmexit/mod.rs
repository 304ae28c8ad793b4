//! VM-exit dispatch: reason-indexed handler chains with a fail-closed
//! default.
//!
//! Handlers are plain functions registered per exit reason; the newest
//! registration is consulted first and the first one to return an action
//! claims the exit. An exit nobody claims is never reflected back to the
//! guest: the dispatcher logs the recent exit history and halts the CPU.

pub mod cpuid;
pub mod invd;
pub mod vmxoff;
pub mod xsetbv;

use {
    crate::{
        error::HypervisorError,
        intel::{
            context::{ArchContext, StateSave},
            support,
            vmerror::{ExitReason, EXIT_REASON_COUNT},
            vmlaunch::{vmx_promote, vmx_resume},
        },
    },
    alloc::vec::Vec,
    x86::vmx::vmcs::{guest, ro},
};

/// What the claiming handler wants done with the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest with the (possibly modified) saved state.
    Resume,
    /// Leave VMX operation and continue the guest bare-metal.
    Promote,
}

/// Mutable view of one VM-exit handed to handlers.
pub struct ExitContext<'a> {
    /// Saved guest register file; handlers mutate it in place.
    pub state: &'a mut StateSave,
    /// Named reason, when the raw value maps to one.
    pub reason: Option<ExitReason>,
    /// Low 16 bits of the exit-reason field.
    pub raw_reason: u16,
    /// VM-exit instruction length, for handlers that skip the instruction.
    pub instruction_len: u64,
    /// Exit qualification field.
    pub qualification: u64,
}

impl ExitContext<'_> {
    /// Moves guest RIP past the instruction that caused the exit.
    pub fn advance_rip(&mut self) {
        self.state.rip = self.state.rip.wrapping_add(self.instruction_len);
    }
}

/// A claiming handler: returns `Some` to claim the exit, `None` to let the
/// next handler in the chain look at it.
pub type ExitHandler = fn(&mut ExitContext<'_>) -> Option<ExitAction>;

/// A global observer, invoked for every exit before dispatch. Observers see
/// the exit but cannot claim it.
pub type ExitObserver = fn(&ExitContext<'_>);

/// Per-reason handler chains plus global observers.
pub struct ExitHandlerRegistry {
    observers: Vec<ExitObserver>,
    chains: [Vec<ExitHandler>; EXIT_REASON_COUNT],
}

impl Default for ExitHandlerRegistry {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            chains: core::array::from_fn(|_| Vec::new()),
        }
    }
}

impl ExitHandlerRegistry {
    /// A registry with the built-in handlers installed: CPUID identity and
    /// vendor override, INVD, XSETBV, and VMXOFF-driven promotion.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(ExitReason::Cpuid, cpuid::handle_cpuid);
        registry.register(ExitReason::Invd, invd::handle_invd);
        registry.register(ExitReason::Xsetbv, xsetbv::handle_xsetbv);
        registry.register(ExitReason::Vmxoff, vmxoff::handle_vmxoff);
        registry
    }

    /// Prepends a handler to the chain for `reason`, shadowing earlier
    /// registrations until it declines an exit.
    pub fn register(&mut self, reason: ExitReason, handler: ExitHandler) {
        self.chains[reason as u16 as usize].insert(0, handler);
    }

    /// Adds a global observer. Observers run in registration order.
    pub fn observe(&mut self, observer: ExitObserver) {
        self.observers.push(observer);
    }

    /// Routes one exit: observers first, then the reason's chain front to
    /// back until a handler claims it.
    pub fn dispatch(&self, ctx: &mut ExitContext<'_>) -> Result<ExitAction, HypervisorError> {
        for observer in &self.observers {
            observer(ctx);
        }

        if let Some(chain) = self.chains.get(ctx.raw_reason as usize) {
            for handler in chain {
                if let Some(action) = handler(ctx) {
                    return Ok(action);
                }
            }
        }

        Err(HypervisorError::UnhandledExit(ctx.raw_reason))
    }
}

/// Reads a VMCS field on the exit path, where failure is unrecoverable.
fn vmread_or_halt(field: u32) -> u64 {
    match support::vmread(field) {
        Ok(value) => value,
        Err(err) => {
            log::error!("vmread on exit path failed: {err}");
            support::halt()
        }
    }
}

fn vmwrite_or_halt(field: u32, value: u64) {
    if let Err(err) = support::vmwrite(field, value) {
        log::error!("vmwrite on exit path failed: {err}");
        support::halt()
    }
}

/// Landing point from the exit entry stub. `state` is the per-CPU state-save
/// area with the guest GPRs already spilled; RIP/RSP/RFLAGS are completed
/// from the VMCS here.
///
/// Fail-closed: any exit no handler claims halts this CPU after dumping the
/// recent exit history.
#[no_mangle]
pub(crate) extern "sysv64" fn vmexit_dispatch(state: *mut StateSave) -> ! {
    // The stub hands us the state-save area; its back-pointer was installed
    // at bring-up and outlives VMX operation.
    let state = unsafe { &mut *state };
    let arch = unsafe { &mut *(state.context as *mut ArchContext) };

    state.rip = vmread_or_halt(guest::RIP);
    state.rsp = vmread_or_halt(guest::RSP);
    state.rflags = vmread_or_halt(guest::RFLAGS);

    let raw_reason = vmread_or_halt(ro::EXIT_REASON) as u16;
    let qualification = vmread_or_halt(ro::EXIT_QUALIFICATION);
    let instruction_len = vmread_or_halt(ro::VMEXIT_INSTRUCTION_LEN);

    arch.history.record(raw_reason, state.rip, qualification);

    let mut ctx = ExitContext {
        state,
        reason: ExitReason::from_u16(raw_reason),
        raw_reason,
        instruction_len,
        qualification,
    };

    match arch.registry.dispatch(&mut ctx) {
        Ok(ExitAction::Resume) => {
            vmwrite_or_halt(guest::RIP, ctx.state.rip);
            vmwrite_or_halt(guest::RSP, ctx.state.rsp);
            vmwrite_or_halt(guest::RFLAGS, ctx.state.rflags);
            unsafe { vmx_resume(ctx.state) }
        }
        Ok(ExitAction::Promote) => {
            log::info!("cpu {}: promoting guest out of VMX operation", arch.cpu);
            unsafe { vmx_promote(ctx.state) }
        }
        Err(err) => {
            log::error!("cpu {}: {err}, halting", arch.cpu);
            for record in arch.history.recent() {
                log::error!(
                    "  exit reason {} at rip {:#x}, qualification {:#x}",
                    record.reason,
                    record.rip,
                    record.qualification
                );
            }
            support::halt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context<'a>(state: &'a mut StateSave, raw_reason: u16) -> ExitContext<'a> {
        ExitContext {
            state,
            reason: ExitReason::from_u16(raw_reason),
            raw_reason,
            instruction_len: 2,
            qualification: 0,
        }
    }

    #[test]
    fn unclaimed_exit_is_an_error() {
        let registry = ExitHandlerRegistry::default();
        let mut state = StateSave::default();
        let mut ctx = test_context(&mut state, 54);
        assert_eq!(registry.dispatch(&mut ctx), Err(HypervisorError::UnhandledExit(54)));
    }

    #[test]
    fn first_claiming_handler_wins() {
        fn decline(_: &mut ExitContext<'_>) -> Option<ExitAction> {
            None
        }
        fn claim_resume(ctx: &mut ExitContext<'_>) -> Option<ExitAction> {
            ctx.state.rax = 0x11;
            Some(ExitAction::Resume)
        }
        fn claim_promote(_: &mut ExitContext<'_>) -> Option<ExitAction> {
            Some(ExitAction::Promote)
        }

        let mut registry = ExitHandlerRegistry::default();
        registry.register(ExitReason::Hlt, claim_promote);
        registry.register(ExitReason::Hlt, claim_resume);
        registry.register(ExitReason::Hlt, decline);

        let mut state = StateSave::default();
        let mut ctx = test_context(&mut state, ExitReason::Hlt as u16);
        // The declining front handler falls through to the next
        // registration; the older promote handler is shadowed.
        assert_eq!(registry.dispatch(&mut ctx), Ok(ExitAction::Resume));
        assert_eq!(state.rax, 0x11);
    }

    #[test]
    fn observers_run_but_cannot_claim() {
        fn observer(_: &ExitContext<'_>) {}

        let mut registry = ExitHandlerRegistry::default();
        registry.observe(observer);

        let mut state = StateSave::default();
        let mut ctx = test_context(&mut state, 12);
        assert_eq!(registry.dispatch(&mut ctx), Err(HypervisorError::UnhandledExit(12)));
    }

    #[test]
    fn defaults_cover_unconditional_exits() {
        let registry = ExitHandlerRegistry::with_defaults();
        for reason in [ExitReason::Cpuid, ExitReason::Invd, ExitReason::Xsetbv] {
            assert!(!registry.chains[reason as u16 as usize].is_empty());
        }

        let mut state = StateSave::default();
        let mut ctx = test_context(&mut state, ExitReason::Vmxoff as u16);
        assert_eq!(registry.dispatch(&mut ctx), Ok(ExitAction::Promote));
    }

    #[test]
    fn advance_rip_uses_instruction_len() {
        let mut state = StateSave { rip: 0x1000, ..Default::default() };
        let mut ctx = test_context(&mut state, 10);
        ctx.advance_rip();
        assert_eq!(state.rip, 0x1002);
    }
}
