//! Per-CPU VMX memory regions: acquisition, seeding, rollback and teardown.
//!
//! Bring-up needs seven physical-memory regions before VMXON can be issued.
//! They are acquired in a fixed order, and any failure unwinds every region
//! acquired so far in exact reverse order, so a failed bring-up leaves no
//! allocation behind. Teardown releases in reverse order too and tolerates
//! being called on a set that was never (or only partially) acquired.

use {
    crate::{
        error::HypervisorError,
        global_const::{BASE_PAGE_SIZE, EXIT_STACK_SIZE},
        intel::capability::VmxCapabilities,
        platform::PlatformMemory,
    },
    alloc::vec::Vec,
    core::ptr::NonNull,
};

/// The seven per-CPU regions, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Vmxon,
    Vmcs,
    IoBitmapA,
    IoBitmapB,
    MsrBitmap,
    ExitStack,
    StateSave,
}

/// Acquisition order; rollback and release both walk it backwards.
pub const REGION_ACQUISITION_ORDER: [RegionKind; 7] = [
    RegionKind::Vmxon,
    RegionKind::Vmcs,
    RegionKind::IoBitmapA,
    RegionKind::IoBitmapB,
    RegionKind::MsrBitmap,
    RegionKind::ExitStack,
    RegionKind::StateSave,
];

/// A virtual/physical pairing for one region.
///
/// Either both addresses are valid or both are null; a half-valid pair would
/// mean a region that can be programmed into the VMCS but never freed, or the
/// reverse.
#[derive(Debug, Clone, Copy)]
pub struct RegionPair {
    virt: *mut u8,
    phys: u64,
    size: usize,
}

impl RegionPair {
    const fn empty() -> Self {
        Self { virt: core::ptr::null_mut(), phys: 0, size: 0 }
    }

    fn new(virt: NonNull<u8>, phys: u64, size: usize) -> Self {
        debug_assert!(phys != 0);
        Self { virt: virt.as_ptr(), phys, size }
    }

    /// The virtual address, or null if the region is not held.
    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    /// The physical address programmed into VMX structures.
    pub fn phys(&self) -> u64 {
        debug_assert!(self.virt.is_null() == (self.phys == 0));
        self.phys
    }
}

/// The full per-CPU region set.
#[derive(Debug)]
pub struct RegionSet {
    pub vmxon: RegionPair,
    pub vmcs: RegionPair,
    pub io_bitmap_a: RegionPair,
    pub io_bitmap_b: RegionPair,
    pub msr_bitmap: RegionPair,
    pub exit_stack: RegionPair,
    pub state_save: RegionPair,
}

/// Rollback bookkeeping for one completed acquisition step.
struct Acquired {
    virt: NonNull<u8>,
    size: usize,
}

/// Size in bytes of the VMXON/VMCS regions, rounded up to whole pages.
pub fn vmx_region_bytes(caps: &VmxCapabilities) -> usize {
    let reported = caps.vmx_region_size().max(1);
    (reported + BASE_PAGE_SIZE - 1) & !(BASE_PAGE_SIZE - 1)
}

fn region_bytes(kind: RegionKind, caps: &VmxCapabilities) -> usize {
    match kind {
        RegionKind::Vmxon | RegionKind::Vmcs => vmx_region_bytes(caps),
        RegionKind::IoBitmapA
        | RegionKind::IoBitmapB
        | RegionKind::MsrBitmap
        | RegionKind::StateSave => BASE_PAGE_SIZE,
        RegionKind::ExitStack => EXIT_STACK_SIZE,
    }
}

/// Validates a translated physical address against alignment and the
/// platform's physical address width.
fn validate_phys(kind: RegionKind, phys: u64, phys_bits: u8) -> Result<(), HypervisorError> {
    if phys == 0 {
        return Err(HypervisorError::RegionExhausted(kind));
    }
    if phys & (BASE_PAGE_SIZE as u64 - 1) != 0 {
        return Err(HypervisorError::RegionMisaligned(kind, phys));
    }
    if phys_bits < 64 && phys >> phys_bits != 0 {
        return Err(HypervisorError::RegionOutOfRange(kind, phys));
    }
    Ok(())
}

impl RegionSet {
    const fn empty() -> Self {
        Self {
            vmxon: RegionPair::empty(),
            vmcs: RegionPair::empty(),
            io_bitmap_a: RegionPair::empty(),
            io_bitmap_b: RegionPair::empty(),
            msr_bitmap: RegionPair::empty(),
            exit_stack: RegionPair::empty(),
            state_save: RegionPair::empty(),
        }
    }

    fn slot_mut(&mut self, kind: RegionKind) -> &mut RegionPair {
        match kind {
            RegionKind::Vmxon => &mut self.vmxon,
            RegionKind::Vmcs => &mut self.vmcs,
            RegionKind::IoBitmapA => &mut self.io_bitmap_a,
            RegionKind::IoBitmapB => &mut self.io_bitmap_b,
            RegionKind::MsrBitmap => &mut self.msr_bitmap,
            RegionKind::ExitStack => &mut self.exit_stack,
            RegionKind::StateSave => &mut self.state_save,
        }
    }

    /// Acquires, validates and seeds all seven regions.
    ///
    /// On any failure every region acquired so far is returned to the
    /// platform in reverse acquisition order before the error propagates.
    pub fn acquire<M: PlatformMemory>(
        mem: &mut M,
        caps: &VmxCapabilities,
    ) -> Result<Self, HypervisorError> {
        let mut acquired: Vec<Acquired> = Vec::with_capacity(REGION_ACQUISITION_ORDER.len());

        match Self::acquire_inner(mem, caps, &mut acquired) {
            Ok(set) => Ok(set),
            Err(err) => {
                for entry in acquired.iter().rev() {
                    mem.free(entry.virt, entry.size);
                }
                Err(err)
            }
        }
    }

    fn acquire_inner<M: PlatformMemory>(
        mem: &mut M,
        caps: &VmxCapabilities,
        acquired: &mut Vec<Acquired>,
    ) -> Result<Self, HypervisorError> {
        let mut set = Self::empty();

        for kind in REGION_ACQUISITION_ORDER {
            let size = region_bytes(kind, caps);
            let virt = mem.alloc(size).ok_or(HypervisorError::RegionExhausted(kind))?;
            acquired.push(Acquired { virt, size });

            let phys = mem.virt_to_phys(virt);
            validate_phys(kind, phys, caps.phys_address_bits)?;

            *set.slot_mut(kind) = RegionPair::new(virt, phys, size);
        }

        set.seed(caps);
        Ok(set)
    }

    /// Writes the initial contents each region must carry before use.
    ///
    /// The VMXON and VMCS regions start with the revision identifier, the
    /// VMCS body and the bitmaps zeroed (so no I/O port or MSR access traps),
    /// the state-save area zeroed, and the exit stack's top slot pointing at
    /// the state-save area for the exit entry stub.
    fn seed(&mut self, caps: &VmxCapabilities) {
        let revision = caps.revision_id();
        let vmx_bytes = vmx_region_bytes(caps);

        unsafe {
            core::ptr::write_bytes(self.vmxon.virt, 0, vmx_bytes);
            core::ptr::write_bytes(self.vmcs.virt, 0, vmx_bytes);
            (self.vmxon.virt as *mut u32).write_volatile(revision);
            (self.vmcs.virt as *mut u32).write_volatile(revision);

            core::ptr::write_bytes(self.io_bitmap_a.virt, 0, BASE_PAGE_SIZE);
            core::ptr::write_bytes(self.io_bitmap_b.virt, 0, BASE_PAGE_SIZE);
            core::ptr::write_bytes(self.msr_bitmap.virt, 0, BASE_PAGE_SIZE);
            core::ptr::write_bytes(self.state_save.virt, 0, BASE_PAGE_SIZE);

            (self.exit_stack_top() as *mut u64).write_volatile(self.state_save.virt as u64);
        }
    }

    /// Host stack pointer for VM-exit entry: 16-byte aligned, below the top
    /// of the exit stack, with the state-save pointer stored at `[rsp]`.
    pub fn exit_stack_top(&self) -> u64 {
        (self.exit_stack.virt as u64 + EXIT_STACK_SIZE as u64 - 16) & !0xf
    }

    /// Returns every held region to the platform, in reverse acquisition
    /// order. Safe to call on a set that was already released.
    pub fn release<M: PlatformMemory>(&mut self, mem: &mut M) {
        for kind in REGION_ACQUISITION_ORDER.iter().rev() {
            let pair = self.slot_mut(*kind);
            if let Some(virt) = NonNull::new(pair.virt) {
                mem.free(virt, pair.size);
                *pair = RegionPair::empty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::global_const::BASE_PAGE_SIZE,
        std::alloc::{alloc, dealloc, Layout},
    };

    fn caps_with_basic(vmx_basic: u64, phys_bits: u8) -> VmxCapabilities {
        VmxCapabilities {
            vmx_basic,
            cr0_fixed0: 0,
            cr0_fixed1: u64::MAX,
            cr4_fixed0: 0,
            cr4_fixed1: u64::MAX,
            true_pinbased: 0,
            true_procbased: 0,
            procbased2: 0,
            true_exit: 0,
            true_entry: 0,
            vmx_misc: 0,
            phys_address_bits: phys_bits,
            virt_address_bits: 48,
        }
    }

    /// Identity-mapped allocator that can be told to fail on the nth alloc
    /// and records every free in order.
    struct FakeMemory {
        fail_on_alloc: Option<usize>,
        allocs: Vec<(usize, usize)>,
        frees: Vec<usize>,
        count: usize,
    }

    impl FakeMemory {
        fn new(fail_on_alloc: Option<usize>) -> Self {
            Self { fail_on_alloc, allocs: Vec::new(), frees: Vec::new(), count: 0 }
        }
    }

    impl PlatformMemory for FakeMemory {
        fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
            self.count += 1;
            if self.fail_on_alloc == Some(self.count) {
                return None;
            }
            let layout = Layout::from_size_align(size, BASE_PAGE_SIZE).ok()?;
            let ptr = NonNull::new(unsafe { alloc(layout) })?;
            self.allocs.push((ptr.as_ptr() as usize, size));
            Some(ptr)
        }

        fn virt_to_phys(&mut self, virt: NonNull<u8>) -> u64 {
            virt.as_ptr() as u64
        }

        fn free(&mut self, virt: NonNull<u8>, size: usize) {
            self.frees.push(virt.as_ptr() as usize);
            let layout = Layout::from_size_align(size, BASE_PAGE_SIZE).unwrap();
            unsafe { dealloc(virt.as_ptr(), layout) };
        }
    }

    #[test]
    fn vmx_region_sizing_rounds_to_pages() {
        let caps = caps_with_basic(0x400u64 << 32, 48);
        assert_eq!(vmx_region_bytes(&caps), BASE_PAGE_SIZE);
        let caps = caps_with_basic(0x1001u64 << 32, 48);
        assert_eq!(vmx_region_bytes(&caps), 2 * BASE_PAGE_SIZE);
    }

    #[test]
    fn phys_validation() {
        assert_eq!(
            validate_phys(RegionKind::Vmxon, 0x1001, 48),
            Err(HypervisorError::RegionMisaligned(RegionKind::Vmxon, 0x1001))
        );
        assert_eq!(
            validate_phys(RegionKind::Vmcs, 1u64 << 40, 39),
            Err(HypervisorError::RegionOutOfRange(RegionKind::Vmcs, 1u64 << 40))
        );
        assert_eq!(
            validate_phys(RegionKind::MsrBitmap, 0, 39),
            Err(HypervisorError::RegionExhausted(RegionKind::MsrBitmap))
        );
        assert_eq!(validate_phys(RegionKind::Vmxon, 0x5000, 39), Ok(()));
    }

    #[test]
    fn successful_acquisition_seeds_regions() {
        let caps = caps_with_basic((0x1000u64 << 32) | 0x12, 48);
        let mut mem = FakeMemory::new(None);
        let mut set = RegionSet::acquire(&mut mem, &caps).unwrap();

        assert_eq!(mem.allocs.len(), 7);
        // Revision id lands at offset 0 of VMXON and VMCS, bit 31 cleared.
        let vmxon_rev = unsafe { (set.vmxon.virt() as *const u32).read() };
        let vmcs_rev = unsafe { (set.vmcs.virt() as *const u32).read() };
        assert_eq!(vmxon_rev, 0x12);
        assert_eq!(vmcs_rev, 0x12);

        // The bitmaps start all-clear so nothing traps by default.
        let msr_bitmap = set.msr_bitmap.virt();
        assert!((0..BASE_PAGE_SIZE).all(|i| unsafe { msr_bitmap.add(i).read() } == 0));

        // The stack top is 16-byte aligned and carries the state-save pointer.
        let top = set.exit_stack_top();
        assert_eq!(top & 0xf, 0);
        let seeded = unsafe { (top as *const u64).read() };
        assert_eq!(seeded, set.state_save.virt() as u64);

        set.release(&mut mem);
        assert_eq!(mem.frees.len(), 7);
    }

    #[test]
    fn failed_acquisition_unwinds_in_reverse_order() {
        let caps = caps_with_basic(0x1000u64 << 32, 48);
        // Fail on the fifth allocation, the MSR bitmap.
        let mut mem = FakeMemory::new(Some(5));
        let err = RegionSet::acquire(&mut mem, &caps).unwrap_err();

        assert_eq!(err, HypervisorError::RegionExhausted(RegionKind::MsrBitmap));
        assert_eq!(err.kind(), crate::error::ErrorKind::Allocation);

        // io_b, io_a, vmcs, vmxon freed, newest first.
        let expected: Vec<usize> =
            mem.allocs.iter().rev().map(|(addr, _)| *addr).collect();
        assert_eq!(mem.frees, expected);
        assert_eq!(mem.frees.len(), 4);
    }

    #[test]
    fn release_is_idempotent_and_reverse_ordered() {
        let caps = caps_with_basic(0x1000u64 << 32, 48);
        let mut mem = FakeMemory::new(None);
        let mut set = RegionSet::acquire(&mut mem, &caps).unwrap();

        set.release(&mut mem);
        let first_pass = mem.frees.clone();
        set.release(&mut mem);
        assert_eq!(mem.frees, first_pass);

        // state_save, stack, msr, io_b, io_a, vmcs, vmxon.
        let expected: Vec<usize> =
            mem.allocs.iter().rev().map(|(addr, _)| *addr).collect();
        assert_eq!(first_pass, expected);
    }
}
