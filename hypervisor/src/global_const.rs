//! Compile-time configuration for the hypervisor core.

/// Architectural page size.
pub const BASE_PAGE_SIZE: usize = 0x1000;

/// Size of the dedicated VM-exit handler stack (four pages).
pub const EXIT_STACK_SIZE: usize = 4 * BASE_PAGE_SIZE;

/// Depth of the per-CPU ring of recent VM-exit records.
pub const EXIT_HISTORY_DEPTH: usize = 64;

/// CPUID leaf-0 vendor signature reported to guests: "SlimvisorVMM".
///
/// Written to EBX/EDX/ECX in that order, matching the layout of the
/// architectural vendor string.
pub const VENDOR_SIGNATURE_EBX: u32 = u32::from_le_bytes(*b"Slim");
/// Second dword of the vendor signature.
pub const VENDOR_SIGNATURE_EDX: u32 = u32::from_le_bytes(*b"viso");
/// Third dword of the vendor signature.
pub const VENDOR_SIGNATURE_ECX: u32 = u32::from_le_bytes(*b"rVMM");
