//! Snapshots of the live descriptor tables and the segment-state walks the
//! VMCS guest area needs.
//!
//! The tables are copied into an owned buffer once, before VMX operation is
//! entered, so every later computation is a pure function of the snapshot.

use {
    crate::{error::HypervisorError, intel::support},
    alloc::vec::Vec,
    bit_field::BitField,
};

/// Access-rights value marking a segment as unusable.
pub const UNUSABLE_ACCESS_RIGHTS: u32 = 0x10000;

/// Access rights of a busy 64-bit TSS.
const TSS_BUSY_ACCESS_RIGHTS: u32 = 0x8b;

/// Owned copy of the GDT plus the raw GDTR/IDTR images.
#[derive(Debug, Clone)]
pub struct DescriptorTables {
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    gdt: Vec<u64>,
}

/// Sign-extension check: the address is canonical if bits above the linear
/// address width are copies of the top implemented bit.
pub fn is_canonical(addr: u64, virt_bits: u8) -> bool {
    if virt_bits >= 64 {
        return true;
    }
    let shift = 64 - virt_bits;
    ((addr as i64) << shift >> shift) as u64 == addr
}

impl DescriptorTables {
    /// Captures the running CPU's GDTR/IDTR and copies the GDT.
    pub fn capture(virt_bits: u8) -> Result<Self, HypervisorError> {
        let gdtr = support::sgdt();
        let idtr = support::sidt();
        let entries = (gdtr.limit as usize + 1) / 8;
        let gdt = unsafe {
            core::slice::from_raw_parts(gdtr.base as *const u64, entries).to_vec()
        };
        Self::new(gdtr.base, gdtr.limit, idtr.base, idtr.limit, gdt, virt_bits)
    }

    /// Builds a snapshot from raw values, rejecting non-canonical bases.
    ///
    /// A non-canonical GDTR or IDTR base would fault inside VMX operation
    /// where it is much harder to diagnose, so it is refused up front.
    pub fn new(
        gdtr_base: u64,
        gdtr_limit: u16,
        idtr_base: u64,
        idtr_limit: u16,
        gdt: Vec<u64>,
        virt_bits: u8,
    ) -> Result<Self, HypervisorError> {
        if !is_canonical(gdtr_base, virt_bits) {
            return Err(HypervisorError::NonCanonicalBase(gdtr_base));
        }
        if !is_canonical(idtr_base, virt_bits) {
            return Err(HypervisorError::NonCanonicalBase(idtr_base));
        }
        Ok(Self { gdtr_base, gdtr_limit, idtr_base, idtr_limit, gdt })
    }

    fn entry(&self, selector: u16) -> Option<u64> {
        // Only the GDT is snapshotted. An LDT-relative selector (TI set)
        // cannot be resolved here and must not be misread as a GDT index.
        if selector & 0x4 != 0 {
            return None;
        }
        let index = (selector >> 3) as usize;
        if index == 0 || index >= self.gdt.len() {
            return None;
        }
        Some(self.gdt[index])
    }

    /// Segment limit for a selector; 0 for the null selector.
    pub fn limit(&self, selector: u16) -> u32 {
        let Some(entry) = self.entry(selector) else { return 0 };
        let mut limit = entry.get_bits(0..16) as u32 | ((entry.get_bits(48..52) as u32) << 16);
        // Granularity bit scales the limit by 4 KiB.
        if entry.get_bit(55) {
            limit = (limit << 12) | 0xfff;
        }
        limit
    }

    /// Segment base for a selector; 0 for the null selector.
    ///
    /// System descriptors (TSS, LDT) are 16 bytes in long mode and carry the
    /// upper half of the base in the following GDT slot.
    pub fn base(&self, selector: u16) -> u64 {
        let Some(entry) = self.entry(selector) else { return 0 };
        let mut base =
            entry.get_bits(16..40) | (entry.get_bits(56..64) << 24);
        // S bit clear means a system descriptor with a 64-bit base.
        if !entry.get_bit(44) {
            let index = (selector >> 3) as usize;
            if let Some(high) = self.gdt.get(index + 1) {
                base |= high.get_bits(0..32) << 32;
            }
        }
        base
    }

    /// VMCS-format access rights for a data or code selector.
    ///
    /// The null selector and anything past the table are reported unusable,
    /// which is what the guest-state checks require for unused segments.
    pub fn access_rights(&self, selector: u16) -> u32 {
        let Some(entry) = self.entry(selector) else {
            return UNUSABLE_ACCESS_RIGHTS;
        };
        Self::raw_access_rights(entry)
    }

    /// VMCS-format access rights for the task register.
    ///
    /// TR must never be unusable: if the selector does not name a readable
    /// descriptor the architectural busy-TSS value is reported instead.
    pub fn tr_access_rights(&self, selector: u16) -> u32 {
        match self.entry(selector) {
            Some(entry) => {
                let mut rights = Self::raw_access_rights(entry);
                // VM entry requires TR to look busy.
                rights.set_bits(0..4, 0xb);
                rights
            }
            None => TSS_BUSY_ACCESS_RIGHTS,
        }
    }

    /// Packs descriptor bits 40..47 and 52..55 into the VMCS layout.
    fn raw_access_rights(entry: u64) -> u32 {
        if !entry.get_bit(47) {
            // Present bit clear: unusable.
            return UNUSABLE_ACCESS_RIGHTS;
        }
        (entry.get_bits(40..48) as u32) | ((entry.get_bits(52..56) as u32) << 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 64-bit code segment: base 0, limit 0xfffff, G|L|P|S, type 0xb.
    const CODE64: u64 = 0x00af_9b00_0000_ffff;
    // Data segment: base 0, limit 0xfffff, G|DB|P|S, type 0x3.
    const DATA: u64 = 0x00cf_9300_0000_ffff;
    // Available 64-bit TSS, low half: base 0x40_4000, limit 0x67.
    const TSS_LOW: u64 = 0x0000_8940_4000_0067;
    // TSS high half: base bits 63:32 = 0x1.
    const TSS_HIGH: u64 = 0x0000_0000_0000_0001;

    fn tables() -> DescriptorTables {
        DescriptorTables::new(
            0x1000,
            8 * 5 - 1,
            0x2000,
            0xfff,
            vec![0, CODE64, DATA, TSS_LOW, TSS_HIGH],
            48,
        )
        .unwrap()
    }

    #[test]
    fn canonical_check() {
        assert!(is_canonical(0, 48));
        assert!(is_canonical(0x0000_7fff_ffff_ffff, 48));
        assert!(is_canonical(0xffff_8000_0000_0000, 48));
        assert!(!is_canonical(0x0000_8000_0000_0000, 48));
        assert!(!is_canonical(0x0001_0000_0000_0000, 48));
    }

    #[test]
    fn non_canonical_base_rejected() {
        let err = DescriptorTables::new(0x0000_8000_0000_0000, 0xff, 0, 0, vec![0], 48);
        assert!(matches!(err, Err(HypervisorError::NonCanonicalBase(0x0000_8000_0000_0000))));
    }

    #[test]
    fn null_selector_is_unusable() {
        let tables = tables();
        assert_eq!(tables.access_rights(0), UNUSABLE_ACCESS_RIGHTS);
        assert_eq!(tables.base(0), 0);
        assert_eq!(tables.limit(0), 0);
        // Out-of-table selectors behave like null.
        assert_eq!(tables.access_rights(8 * 9), UNUSABLE_ACCESS_RIGHTS);
    }

    #[test]
    fn ldt_relative_selector_is_unusable() {
        let tables = tables();
        // Same index as the data segment, but TI set: must not resolve
        // against the GDT snapshot.
        let selector = 0x10 | 0x4;
        assert_eq!(tables.access_rights(selector), UNUSABLE_ACCESS_RIGHTS);
        assert_eq!(tables.base(selector), 0);
        assert_eq!(tables.limit(selector), 0);
    }

    #[test]
    fn code_and_data_access_rights() {
        let tables = tables();
        // Type 0xb, S, DPL 0, P, L and G in the upper nibble.
        assert_eq!(tables.access_rights(0x08), 0xa09b);
        // Type 0x3, S, DPL 0, P, G and DB in the upper nibble.
        assert_eq!(tables.access_rights(0x10), 0xc093);
        assert_eq!(tables.limit(0x10), 0xffff_ffff);
    }

    #[test]
    fn tss_base_spans_both_slots() {
        let tables = tables();
        assert_eq!(tables.base(0x18), 0x1_0040_4000);
        assert_eq!(tables.limit(0x18), 0x67);
    }

    #[test]
    fn tr_is_never_unusable() {
        let tables = tables();
        // Available TSS (type 0x9) is reported busy (type 0xb).
        assert_eq!(tables.tr_access_rights(0x18), 0x8b);
        // A null TR still yields the busy-TSS shape instead of unusable.
        assert_eq!(tables.tr_access_rights(0), 0x8b);
        assert_eq!(tables.tr_access_rights(8 * 9), 0x8b);
    }
}
