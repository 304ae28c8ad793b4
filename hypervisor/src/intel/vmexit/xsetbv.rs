//! XSETBV exits, which are unconditional in VMX non-root operation.

use {
    crate::intel::{
        support,
        vmexit::{ExitAction, ExitContext},
    },
    x86_64::registers::control::Cr4Flags,
};

/// Executes the guest's XSETBV on real hardware.
///
/// The host CR4.OSXSAVE bit is enabled first; the guest can only reach
/// XSETBV with its own OSXSAVE set, and the bit is not part of the VMX
/// fixed-bit requirements, so the host copy may still be clear.
pub fn handle_xsetbv(ctx: &mut ExitContext<'_>) -> Option<ExitAction> {
    let register = ctx.state.rcx as u32;
    let value = (ctx.state.rdx << 32) | (ctx.state.rax & 0xffff_ffff);

    support::write_cr4(support::cr4() | Cr4Flags::OSXSAVE.bits());
    support::xsetbv(register, value);

    ctx.advance_rip();
    Some(ExitAction::Resume)
}
