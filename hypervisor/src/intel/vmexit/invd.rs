//! INVD exits: the guest asked to invalidate caches without writeback.

use crate::intel::{
    support,
    vmexit::{ExitAction, ExitContext},
};

/// Services INVD by executing WBINVD instead.
///
/// Discarding dirty lines would also discard the hypervisor's own state, so
/// the write-back variant is the strongest the guest can be given.
pub fn handle_invd(ctx: &mut ExitContext<'_>) -> Option<ExitAction> {
    support::wbinvd();
    ctx.advance_rip();
    Some(ExitAction::Resume)
}
