//! VMX capability discovery and control-register fixup.
//!
//! All capability MSRs are read once per CPU into a plain snapshot so that
//! every later decision (region sizing, control adjustment, address-width
//! validation) is a pure function of the snapshot.

use {
    crate::{error::HypervisorError, intel::support},
    bit_field::BitField,
    x86::cpuid::CpuId,
    x86_64::registers::control::Cr4Flags,
};

/// Snapshot of the VMX capability MSRs and address widths for one CPU.
#[derive(Debug, Clone, Copy)]
pub struct VmxCapabilities {
    /// IA32_VMX_BASIC.
    pub vmx_basic: u64,
    /// IA32_VMX_CR0_FIXED0, bits that must be 1 in CR0.
    pub cr0_fixed0: u64,
    /// IA32_VMX_CR0_FIXED1, bits that may be 1 in CR0.
    pub cr0_fixed1: u64,
    /// IA32_VMX_CR4_FIXED0, bits that must be 1 in CR4.
    pub cr4_fixed0: u64,
    /// IA32_VMX_CR4_FIXED1, bits that may be 1 in CR4.
    pub cr4_fixed1: u64,
    /// IA32_VMX_TRUE_PINBASED_CTLS.
    pub true_pinbased: u64,
    /// IA32_VMX_TRUE_PROCBASED_CTLS.
    pub true_procbased: u64,
    /// IA32_VMX_PROCBASED_CTLS2.
    pub procbased2: u64,
    /// IA32_VMX_TRUE_EXIT_CTLS.
    pub true_exit: u64,
    /// IA32_VMX_TRUE_ENTRY_CTLS.
    pub true_entry: u64,
    /// IA32_VMX_MISC.
    pub vmx_misc: u64,
    /// Physical address width from CPUID 0x8000_0008.
    pub phys_address_bits: u8,
    /// Linear address width from CPUID 0x8000_0008.
    pub virt_address_bits: u8,
}

/// Control-register values before and after the VMX fixed-bit fixup.
///
/// The old values are kept for the whole lifetime of the per-CPU context so
/// teardown can restore exactly what bring-up found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrFixups {
    pub old_cr0: u64,
    pub new_cr0: u64,
    pub old_cr4: u64,
    pub new_cr4: u64,
}

impl VmxCapabilities {
    /// Verifies Intel + VMX support and snapshots the capability MSRs.
    pub fn read() -> Result<Self, HypervisorError> {
        let cpuid = CpuId::new();

        let is_intel = cpuid
            .get_vendor_info()
            .is_some_and(|vendor| vendor.as_str() == "GenuineIntel");
        if !is_intel {
            return Err(HypervisorError::CpuUnsupported);
        }

        let has_vmx = cpuid
            .get_feature_info()
            .is_some_and(|features| features.has_vmx());
        if !has_vmx {
            return Err(HypervisorError::VmxUnsupported);
        }

        // CPUID 0x8000_0008: EAX[7:0] physical width, EAX[15:8] linear width.
        let address_widths = x86::cpuid::cpuid!(0x8000_0008u32).eax;
        let phys_address_bits = address_widths.get_bits(0..8) as u8;
        let virt_address_bits = address_widths.get_bits(8..16) as u8;

        Ok(Self {
            vmx_basic: support::rdmsr(x86::msr::IA32_VMX_BASIC),
            cr0_fixed0: support::rdmsr(x86::msr::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: support::rdmsr(x86::msr::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: support::rdmsr(x86::msr::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: support::rdmsr(x86::msr::IA32_VMX_CR4_FIXED1),
            true_pinbased: support::rdmsr(x86::msr::IA32_VMX_TRUE_PINBASED_CTLS),
            true_procbased: support::rdmsr(x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS),
            procbased2: support::rdmsr(x86::msr::IA32_VMX_PROCBASED_CTLS2),
            true_exit: support::rdmsr(x86::msr::IA32_VMX_TRUE_EXIT_CTLS),
            true_entry: support::rdmsr(x86::msr::IA32_VMX_TRUE_ENTRY_CTLS),
            vmx_misc: support::rdmsr(x86::msr::IA32_VMX_MISC),
            phys_address_bits,
            virt_address_bits,
        })
    }

    /// Size in bytes of the VMXON/VMCS region, bits 44:32 of IA32_VMX_BASIC.
    pub fn vmx_region_size(&self) -> usize {
        self.vmx_basic.get_bits(32..45) as usize
    }

    /// Revision identifier for the VMXON/VMCS regions, with bit 31 cleared.
    pub fn revision_id(&self) -> u32 {
        (self.vmx_basic as u32) & 0x7fff_ffff
    }

    /// Whether IA32_VMX_MISC reports Intel PT usable in VMX operation.
    pub fn intel_pt_in_vmx(&self) -> bool {
        self.vmx_basic != 0 && self.vmx_misc.get_bit(14)
    }
}

/// Applies the VMX fixed-bit rule to a control-register value.
///
/// Fixed0 bits are forced on, then everything outside fixed1 is forced off.
/// The transform is idempotent, so re-running bring-up math on an already
/// fixed value is harmless.
pub fn fix_control_register(old: u64, fixed0: u64, fixed1: u64) -> u64 {
    (old | fixed0) & fixed1
}

/// Computes the CR0/CR4 fixups for this CPU, without committing them.
///
/// Fails if CR4.VMXE is already set, which means another hypervisor owns the
/// core; the caller writes the new values only after every fallible
/// acquisition step has succeeded.
pub fn probe(caps: &VmxCapabilities, cr0: u64, cr4: u64) -> Result<CrFixups, HypervisorError> {
    if cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() != 0 {
        return Err(HypervisorError::VmxAlreadyEnabled);
    }

    let cr4_with_vmxe = cr4 | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
    Ok(CrFixups {
        old_cr0: cr0,
        new_cr0: fix_control_register(cr0, caps.cr0_fixed0, caps.cr0_fixed1),
        old_cr4: cr4,
        new_cr4: fix_control_register(cr4_with_vmxe, caps.cr4_fixed0, caps.cr4_fixed1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_caps() -> VmxCapabilities {
        VmxCapabilities {
            // Revision 1, region size 0x1000, bit 55 (true controls) set.
            vmx_basic: (1 << 55) | (0x1000 << 32) | 1,
            cr0_fixed0: 0x8000_0021,
            cr0_fixed1: 0xffff_ffff,
            cr4_fixed0: 0x2000,
            cr4_fixed1: 0x003f_27ff,
            true_pinbased: 0x0000_007f_0000_0016,
            true_procbased: 0xfff9_fffe_0401_e172,
            procbased2: 0x5cff_00ef_0000_0000,
            true_exit: 0x01ff_ffff_0003_6dfb,
            true_entry: 0x0003_ffff_0000_11fb,
            vmx_misc: 0,
            phys_address_bits: 39,
            virt_address_bits: 48,
        }
    }

    #[test]
    fn fixed_bit_rule() {
        let caps = test_caps();
        let fixed = fix_control_register(0x8005_0033, caps.cr0_fixed0, caps.cr0_fixed1);
        assert_eq!(fixed & caps.cr0_fixed0, caps.cr0_fixed0);
        assert_eq!(fixed & !caps.cr0_fixed1, 0);
    }

    #[test]
    fn fixup_is_idempotent() {
        let caps = test_caps();
        let once = fix_control_register(0x1234_5678_9abc_def0, caps.cr4_fixed0, caps.cr4_fixed1);
        let twice = fix_control_register(once, caps.cr4_fixed0, caps.cr4_fixed1);
        assert_eq!(once, twice);
    }

    #[test]
    fn probe_rejects_enabled_vmxe() {
        let caps = test_caps();
        let cr4 = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() | 0x6e0;
        assert_eq!(probe(&caps, 0x8005_0033, cr4), Err(HypervisorError::VmxAlreadyEnabled));
    }

    #[test]
    fn probe_keeps_old_values_and_sets_vmxe() {
        let caps = test_caps();
        let fixups = probe(&caps, 0x8005_0033, 0x6e0).unwrap();
        assert_eq!(fixups.old_cr0, 0x8005_0033);
        assert_eq!(fixups.old_cr4, 0x6e0);
        assert_ne!(fixups.new_cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);
        assert_eq!(fixups.new_cr4 & caps.cr4_fixed0, caps.cr4_fixed0);
    }

    #[test]
    fn region_size_and_revision() {
        let caps = test_caps();
        assert_eq!(caps.vmx_region_size(), 0x1000);
        assert_eq!(caps.revision_id(), 1);
        // Bit 31 of the basic MSR must never reach the region header.
        let caps = VmxCapabilities { vmx_basic: 0x8000_0004 | (0x1000 << 32), ..caps };
        assert_eq!(caps.revision_id(), 4);
    }
}
