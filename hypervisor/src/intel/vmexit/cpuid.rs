//! CPUID pass-through with the hypervisor's vendor signature on leaf 0.

use {
    crate::{
        global_const::{VENDOR_SIGNATURE_EBX, VENDOR_SIGNATURE_ECX, VENDOR_SIGNATURE_EDX},
        intel::vmexit::{ExitAction, ExitContext},
    },
    x86::cpuid::cpuid,
};

/// Executes CPUID on the guest's behalf.
///
/// Leaf 0 keeps the real maximum-leaf value in EAX but reports this
/// hypervisor's vendor signature; everything else passes through untouched.
pub fn handle_cpuid(ctx: &mut ExitContext<'_>) -> Option<ExitAction> {
    let leaf = ctx.state.rax as u32;
    let subleaf = ctx.state.rcx as u32;

    let mut result = cpuid!(leaf, subleaf);
    if leaf == 0 {
        result.ebx = VENDOR_SIGNATURE_EBX;
        result.edx = VENDOR_SIGNATURE_EDX;
        result.ecx = VENDOR_SIGNATURE_ECX;
    }

    // CPUID zero-extends into the full 64-bit registers.
    ctx.state.rax = result.eax as u64;
    ctx.state.rbx = result.ebx as u64;
    ctx.state.rcx = result.ecx as u64;
    ctx.state.rdx = result.edx as u64;

    ctx.advance_rip();
    Some(ExitAction::Resume)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{context::StateSave, vmerror::ExitReason},
    };

    fn run(state: &mut StateSave) -> Option<ExitAction> {
        let mut ctx = ExitContext {
            state,
            reason: Some(ExitReason::Cpuid),
            raw_reason: ExitReason::Cpuid as u16,
            instruction_len: 2,
            qualification: 0,
        };
        handle_cpuid(&mut ctx)
    }

    #[test]
    fn leaf_zero_reports_vendor_signature() {
        let mut state = StateSave { rax: 0, rcx: 0, rip: 0x4000, ..Default::default() };
        let action = run(&mut state);

        assert_eq!(action, Some(ExitAction::Resume));
        assert_eq!(state.rbx as u32, VENDOR_SIGNATURE_EBX);
        assert_eq!(state.rdx as u32, VENDOR_SIGNATURE_EDX);
        assert_eq!(state.rcx as u32, VENDOR_SIGNATURE_ECX);
        // The real maximum leaf survives.
        assert_eq!(state.rax, cpuid!(0u32, 0u32).eax as u64);
        assert_eq!(state.rip, 0x4002);
    }

    #[test]
    fn other_leaves_pass_through() {
        let mut state = StateSave { rax: 0x8000_0000, rcx: 0, ..Default::default() };
        run(&mut state);

        let expected = cpuid!(0x8000_0000u32, 0u32);
        assert_eq!(state.rax, expected.eax as u64);
        assert_eq!(state.rbx, expected.ebx as u64);
        assert_eq!(state.rdx, expected.edx as u64);
    }
}
