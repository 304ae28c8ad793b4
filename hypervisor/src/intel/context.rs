//! Per-CPU architectural context: the guest state-save area, the VM-exit
//! history ring and the aggregate bring-up state.

use {
    crate::{
        global_const::{BASE_PAGE_SIZE, EXIT_HISTORY_DEPTH},
        intel::{
            capability::{CrFixups, VmxCapabilities},
            regions::RegionSet,
            vmexit::ExitHandlerRegistry,
        },
    },
    static_assertions::const_assert,
};

/// Guest register file spilled by the VM-exit entry stub.
///
/// The layout is consumed by hand-written assembly; field order is the spill
/// order and must not change. `rsp`, `rip` and `rflags` are filled from the
/// VMCS by the dispatcher rather than by the stub, since hardware saves them
/// in guest-state fields instead of on the host stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StateSave {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    /// Back-pointer to the owning [`ArchContext`], installed at bring-up.
    pub context: u64,
}

// The state-save area must fit in its dedicated page.
const_assert!(core::mem::size_of::<StateSave>() <= BASE_PAGE_SIZE);

/// One recorded VM-exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitRecord {
    pub reason: u16,
    pub rip: u64,
    pub qualification: u64,
}

/// Fixed-depth ring of the most recent VM-exits on this CPU.
///
/// Written on every exit before dispatch, so a wedged CPU's ring always shows
/// what it was doing last.
#[derive(Debug)]
pub struct ExitHistory {
    records: [ExitRecord; EXIT_HISTORY_DEPTH],
    next: usize,
    total: u64,
}

impl Default for ExitHistory {
    fn default() -> Self {
        Self { records: [ExitRecord::default(); EXIT_HISTORY_DEPTH], next: 0, total: 0 }
    }
}

impl ExitHistory {
    /// Appends a record, overwriting the oldest once the ring is full.
    pub fn record(&mut self, reason: u16, rip: u64, qualification: u64) {
        self.records[self.next] = ExitRecord { reason, rip, qualification };
        self.next = (self.next + 1) % EXIT_HISTORY_DEPTH;
        self.total += 1;
    }

    /// Total exits recorded since bring-up, including overwritten ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Iterates the retained records, newest first.
    pub fn recent(&self) -> impl Iterator<Item = &ExitRecord> {
        let kept = (self.total as usize).min(EXIT_HISTORY_DEPTH);
        (1..=kept).map(move |back| {
            let index = (self.next + EXIT_HISTORY_DEPTH - back) % EXIT_HISTORY_DEPTH;
            &self.records[index]
        })
    }
}

/// Everything one CPU needs across bring-up, dispatch and teardown.
///
/// Heap-allocated and pinned for the lifetime of VMX operation; the
/// state-save area carries a raw back-pointer to it so the dispatcher can
/// find it from assembly.
pub struct ArchContext {
    /// Logical CPU index, for log attribution only.
    pub cpu: usize,
    pub caps: VmxCapabilities,
    pub fixups: CrFixups,
    pub regions: RegionSet,
    pub registry: ExitHandlerRegistry,
    pub history: ExitHistory,
}

impl ArchContext {
    /// The state-save area inside the dedicated region.
    ///
    /// # Safety
    ///
    /// The regions must still be held; callers get a raw pointer because the
    /// guest mutates the area concurrently with the dispatcher reading it.
    pub unsafe fn state_save(&self) -> *mut StateSave {
        self.regions.state_save.virt() as *mut StateSave
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_save_layout_matches_spill_order() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(StateSave, rax), 0x00);
        assert_eq!(offset_of!(StateSave, rcx), 0x08);
        assert_eq!(offset_of!(StateSave, rdx), 0x10);
        assert_eq!(offset_of!(StateSave, rbx), 0x18);
        assert_eq!(offset_of!(StateSave, rsp), 0x20);
        assert_eq!(offset_of!(StateSave, rbp), 0x28);
        assert_eq!(offset_of!(StateSave, rsi), 0x30);
        assert_eq!(offset_of!(StateSave, rdi), 0x38);
        assert_eq!(offset_of!(StateSave, r8), 0x40);
        assert_eq!(offset_of!(StateSave, r15), 0x78);
        assert_eq!(offset_of!(StateSave, rip), 0x80);
        assert_eq!(offset_of!(StateSave, rflags), 0x88);
        assert_eq!(offset_of!(StateSave, context), 0x90);
    }

    #[test]
    fn history_wraps_and_iterates_newest_first() {
        let mut history = ExitHistory::default();
        for i in 0..(EXIT_HISTORY_DEPTH as u64 + 3) {
            history.record(10, 0x1000 + i, i);
        }
        assert_eq!(history.total(), EXIT_HISTORY_DEPTH as u64 + 3);

        let recent: Vec<u64> = history.recent().map(|r| r.qualification).collect();
        assert_eq!(recent.len(), EXIT_HISTORY_DEPTH);
        // Newest first, oldest retained is total - depth.
        assert_eq!(recent[0], EXIT_HISTORY_DEPTH as u64 + 2);
        assert_eq!(*recent.last().unwrap(), 3);
    }

    #[test]
    fn history_partial_fill() {
        let mut history = ExitHistory::default();
        history.record(12, 0x10, 0);
        history.record(13, 0x20, 1);
        let recent: Vec<u16> = history.recent().map(|r| r.reason).collect();
        assert_eq!(recent, vec![13, 12]);
    }
}
