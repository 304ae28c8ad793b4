//! Seam between the VMX core and the page-granular platform allocator.
//!
//! The loader that invokes bring-up owns the real allocator; the core only
//! needs page-granular acquisition, release, and virtual-to-physical
//! translation, so those three operations are the entire interface. Tests
//! substitute a fake implementation to drive the acquisition/rollback state
//! machine without touching privileged state.

use core::ptr::NonNull;

/// Page-granular platform memory services consumed by bring-up and teardown.
pub trait PlatformMemory {
    /// Allocates `size` bytes of page-aligned memory, or `None` on exhaustion.
    ///
    /// The contents are not required to be zeroed; the core zero-fills the
    /// regions that need it.
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Translates a virtual address previously returned by [`Self::alloc`].
    ///
    /// Returns 0 if the translation fails.
    fn virt_to_phys(&mut self, virt: NonNull<u8>) -> u64;

    /// Returns an allocation to the platform.
    fn free(&mut self, virt: NonNull<u8>, size: usize);
}
