//! VMXOFF exits: the guest wants this CPU back.

use crate::intel::vmexit::{ExitAction, ExitContext};

// CF and ZF in RFLAGS; VMsucceed clears both.
const RFLAGS_CF: u64 = 1 << 0;
const RFLAGS_ZF: u64 = 1 << 6;

/// Treats a guest VMXOFF as a request for promotion.
///
/// The guest resumes bare-metal at the instruction after its VMXOFF with
/// the flags showing VMsucceed, exactly as if it had owned VMX itself.
pub fn handle_vmxoff(ctx: &mut ExitContext<'_>) -> Option<ExitAction> {
    ctx.advance_rip();
    ctx.state.rflags &= !(RFLAGS_CF | RFLAGS_ZF);
    Some(ExitAction::Promote)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{context::StateSave, vmerror::ExitReason},
    };

    #[test]
    fn vmxoff_promotes_past_the_instruction() {
        let mut state = StateSave {
            rip: 0x7000,
            rflags: 0x2 | RFLAGS_CF | RFLAGS_ZF,
            ..Default::default()
        };
        let mut ctx = ExitContext {
            state: &mut state,
            reason: Some(ExitReason::Vmxoff),
            raw_reason: ExitReason::Vmxoff as u16,
            instruction_len: 3,
            qualification: 0,
        };

        assert_eq!(handle_vmxoff(&mut ctx), Some(ExitAction::Promote));
        assert_eq!(state.rip, 0x7003);
        // The trapped VMXOFF must read as VMsucceed once bare-metal again.
        assert_eq!(state.rflags & (RFLAGS_CF | RFLAGS_ZF), 0);
        assert_ne!(state.rflags & 0x2, 0);
    }
}
