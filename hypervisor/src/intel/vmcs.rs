//! VMCS field initialization for a launch of the currently running context.
//!
//! The guest area is populated from live processor state so VMLAUNCH resumes
//! exactly what was executing, now inside a VM. The host area points every
//! future VM-exit at the dedicated exit stack and entry stub.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capability::{CrFixups, VmxCapabilities},
            descriptor::DescriptorTables,
            regions::RegionSet,
            support,
            vmlaunch::exit_handler_entry,
        },
    },
    x86::{
        msr,
        vmx::vmcs::{control, guest, host},
    },
};

// 64-bit host-state fields and the global perf MSR, absent from the field
// constants the x86 crate provides.
const HOST_IA32_PAT_FULL: u32 = 0x00002c00;
const HOST_IA32_EFER_FULL: u32 = 0x00002c02;
const HOST_IA32_PERF_GLOBAL_CTRL_FULL: u32 = 0x00002c04;
const MSR_IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;

/// Applies a capability MSR to a desired control value.
///
/// Bits the low half requires are forced on, bits the high half forbids are
/// forced off. Policy bits survive only when the CPU allows them.
pub fn adjust_controls(capability_msr: u64, policy: u32) -> u64 {
    let allowed0 = capability_msr as u32;
    let allowed1 = (capability_msr >> 32) as u32;
    ((policy | allowed0) & allowed1) as u64
}

/// Pin-based controls: nothing beyond what hardware requires.
pub const PINBASED_POLICY: u32 = 0;

/// Primary processor-based controls: route I/O and MSR accesses through the
/// (all-clear) bitmaps and activate the secondary controls.
pub const PROCBASED_POLICY: u32 = control::PrimaryControls::USE_IO_BITMAPS.bits()
    | control::PrimaryControls::USE_MSR_BITMAPS.bits()
    | control::PrimaryControls::SECONDARY_CONTROLS.bits();

/// Secondary controls: keep guest-transparent instructions working.
pub const SECONDARY_POLICY: u32 = control::SecondaryControls::ENABLE_RDTSCP.bits()
    | control::SecondaryControls::ENABLE_INVPCID.bits()
    | control::SecondaryControls::ENABLE_XSAVES_XRSTORS.bits();

/// VM-exit controls: 64-bit host, full debug/PAT/EFER/PERF state swap.
pub const EXIT_POLICY: u32 = control::ExitControls::SAVE_DEBUG_CONTROLS.bits()
    | control::ExitControls::HOST_ADDRESS_SPACE_SIZE.bits()
    | control::ExitControls::LOAD_IA32_PERF_GLOBAL_CTRL.bits()
    | control::ExitControls::SAVE_IA32_PAT.bits()
    | control::ExitControls::LOAD_IA32_PAT.bits()
    | control::ExitControls::SAVE_IA32_EFER.bits()
    | control::ExitControls::LOAD_IA32_EFER.bits();

/// VM-entry controls: re-enter a 64-bit guest with its full state.
pub const ENTRY_POLICY: u32 = control::EntryControls::LOAD_DEBUG_CONTROLS.bits()
    | control::EntryControls::IA32E_MODE_GUEST.bits()
    | control::EntryControls::LOAD_IA32_PERF_GLOBAL_CTRL.bits()
    | control::EntryControls::LOAD_IA32_PAT.bits()
    | control::EntryControls::LOAD_IA32_EFER.bits();

/// Writes the control fields: execution controls adjusted against the true
/// capability MSRs, plus the bitmap addresses and clear CR shadow masks.
pub fn setup_control_fields(
    caps: &VmxCapabilities,
    regions: &RegionSet,
) -> Result<(), HypervisorError> {
    support::vmwrite(
        control::PINBASED_EXEC_CONTROLS,
        adjust_controls(caps.true_pinbased, PINBASED_POLICY),
    )?;
    support::vmwrite(
        control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        adjust_controls(caps.true_procbased, PROCBASED_POLICY),
    )?;
    support::vmwrite(
        control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        adjust_controls(caps.procbased2, SECONDARY_POLICY),
    )?;
    support::vmwrite(control::VMEXIT_CONTROLS, adjust_controls(caps.true_exit, EXIT_POLICY))?;
    support::vmwrite(control::VMENTRY_CONTROLS, adjust_controls(caps.true_entry, ENTRY_POLICY))?;

    support::vmwrite(control::IO_BITMAP_A_ADDR_FULL, regions.io_bitmap_a.phys())?;
    support::vmwrite(control::IO_BITMAP_B_ADDR_FULL, regions.io_bitmap_b.phys())?;
    support::vmwrite(control::MSR_BITMAPS_ADDR_FULL, regions.msr_bitmap.phys())?;

    // No CR0/CR4 shadowing: the guest sees and controls its registers.
    support::vmwrite(control::CR0_GUEST_HOST_MASK, 0)?;
    support::vmwrite(control::CR4_GUEST_HOST_MASK, 0)?;
    support::vmwrite(control::CR0_READ_SHADOW, 0)?;
    support::vmwrite(control::CR4_READ_SHADOW, 0)?;

    Ok(())
}

/// Writes the host-state fields: every VM-exit lands on the dedicated exit
/// stack in [`exit_handler_entry`] with the current address space and tables.
pub fn setup_host_fields(
    tables: &DescriptorTables,
    regions: &RegionSet,
    fixups: &CrFixups,
) -> Result<(), HypervisorError> {
    support::vmwrite(host::CR0, fixups.new_cr0)?;
    support::vmwrite(host::CR3, support::cr3())?;
    support::vmwrite(host::CR4, fixups.new_cr4)?;

    // Host selectors must have RPL and TI clear.
    support::vmwrite(host::ES_SELECTOR, (support::es() & !0x7) as u64)?;
    support::vmwrite(host::CS_SELECTOR, (support::cs() & !0x7) as u64)?;
    support::vmwrite(host::SS_SELECTOR, (support::ss() & !0x7) as u64)?;
    support::vmwrite(host::DS_SELECTOR, (support::ds() & !0x7) as u64)?;
    support::vmwrite(host::FS_SELECTOR, (support::fs() & !0x7) as u64)?;
    support::vmwrite(host::GS_SELECTOR, (support::gs() & !0x7) as u64)?;
    support::vmwrite(host::TR_SELECTOR, (support::tr() & !0x7) as u64)?;

    support::vmwrite(host::FS_BASE, support::rdmsr(msr::IA32_FS_BASE))?;
    support::vmwrite(host::GS_BASE, support::rdmsr(msr::IA32_GS_BASE))?;
    support::vmwrite(host::TR_BASE, tables.base(support::tr()))?;
    support::vmwrite(host::GDTR_BASE, tables.gdtr_base)?;
    support::vmwrite(host::IDTR_BASE, tables.idtr_base)?;

    support::vmwrite(host::IA32_SYSENTER_CS, support::rdmsr(msr::IA32_SYSENTER_CS))?;
    support::vmwrite(host::IA32_SYSENTER_ESP, support::rdmsr(msr::IA32_SYSENTER_ESP))?;
    support::vmwrite(host::IA32_SYSENTER_EIP, support::rdmsr(msr::IA32_SYSENTER_EIP))?;

    support::vmwrite(HOST_IA32_PAT_FULL, support::rdmsr(msr::IA32_PAT))?;
    support::vmwrite(HOST_IA32_EFER_FULL, support::rdmsr(msr::IA32_EFER))?;
    support::vmwrite(
        HOST_IA32_PERF_GLOBAL_CTRL_FULL,
        support::rdmsr(MSR_IA32_PERF_GLOBAL_CTRL),
    )?;

    support::vmwrite(host::RSP, regions.exit_stack_top())?;
    support::vmwrite(host::RIP, exit_handler_entry as usize as u64)?;

    Ok(())
}

/// Writes the guest-state fields from the running CPU's own state.
///
/// Guest RIP and RSP are deliberately not written here; the launch stub sets
/// them immediately before VMLAUNCH so the guest continues at the
/// instruction after the launch call.
pub fn setup_guest_fields(
    tables: &DescriptorTables,
    fixups: &CrFixups,
) -> Result<(), HypervisorError> {
    support::vmwrite(guest::CR0, fixups.new_cr0)?;
    support::vmwrite(guest::CR3, support::cr3())?;
    support::vmwrite(guest::CR4, fixups.new_cr4)?;
    support::vmwrite(guest::DR7, support::dr7())?;
    support::vmwrite(guest::RFLAGS, support::read_rflags())?;

    let es = support::es();
    let cs = support::cs();
    let ss = support::ss();
    let ds = support::ds();
    let fs = support::fs();
    let gs = support::gs();
    let ldtr = support::ldtr();
    let tr = support::tr();

    support::vmwrite(guest::ES_SELECTOR, es as u64)?;
    support::vmwrite(guest::CS_SELECTOR, cs as u64)?;
    support::vmwrite(guest::SS_SELECTOR, ss as u64)?;
    support::vmwrite(guest::DS_SELECTOR, ds as u64)?;
    support::vmwrite(guest::FS_SELECTOR, fs as u64)?;
    support::vmwrite(guest::GS_SELECTOR, gs as u64)?;
    support::vmwrite(guest::LDTR_SELECTOR, ldtr as u64)?;
    support::vmwrite(guest::TR_SELECTOR, tr as u64)?;

    support::vmwrite(guest::ES_LIMIT, tables.limit(es) as u64)?;
    support::vmwrite(guest::CS_LIMIT, tables.limit(cs) as u64)?;
    support::vmwrite(guest::SS_LIMIT, tables.limit(ss) as u64)?;
    support::vmwrite(guest::DS_LIMIT, tables.limit(ds) as u64)?;
    support::vmwrite(guest::FS_LIMIT, tables.limit(fs) as u64)?;
    support::vmwrite(guest::GS_LIMIT, tables.limit(gs) as u64)?;
    support::vmwrite(guest::LDTR_LIMIT, tables.limit(ldtr) as u64)?;
    support::vmwrite(guest::TR_LIMIT, tables.limit(tr) as u64)?;

    support::vmwrite(guest::ES_ACCESS_RIGHTS, tables.access_rights(es) as u64)?;
    support::vmwrite(guest::CS_ACCESS_RIGHTS, tables.access_rights(cs) as u64)?;
    support::vmwrite(guest::SS_ACCESS_RIGHTS, tables.access_rights(ss) as u64)?;
    support::vmwrite(guest::DS_ACCESS_RIGHTS, tables.access_rights(ds) as u64)?;
    support::vmwrite(guest::FS_ACCESS_RIGHTS, tables.access_rights(fs) as u64)?;
    support::vmwrite(guest::GS_ACCESS_RIGHTS, tables.access_rights(gs) as u64)?;
    support::vmwrite(guest::LDTR_ACCESS_RIGHTS, tables.access_rights(ldtr) as u64)?;
    support::vmwrite(guest::TR_ACCESS_RIGHTS, tables.tr_access_rights(tr) as u64)?;

    support::vmwrite(guest::ES_BASE, tables.base(es))?;
    support::vmwrite(guest::CS_BASE, tables.base(cs))?;
    support::vmwrite(guest::SS_BASE, tables.base(ss))?;
    support::vmwrite(guest::DS_BASE, tables.base(ds))?;
    support::vmwrite(guest::FS_BASE, support::rdmsr(msr::IA32_FS_BASE))?;
    support::vmwrite(guest::GS_BASE, support::rdmsr(msr::IA32_GS_BASE))?;
    support::vmwrite(guest::LDTR_BASE, tables.base(ldtr))?;
    support::vmwrite(guest::TR_BASE, tables.base(tr))?;

    support::vmwrite(guest::GDTR_BASE, tables.gdtr_base)?;
    support::vmwrite(guest::GDTR_LIMIT, tables.gdtr_limit as u64)?;
    support::vmwrite(guest::IDTR_BASE, tables.idtr_base)?;
    support::vmwrite(guest::IDTR_LIMIT, tables.idtr_limit as u64)?;

    support::vmwrite(guest::IA32_SYSENTER_CS, support::rdmsr(msr::IA32_SYSENTER_CS))?;
    support::vmwrite(guest::IA32_SYSENTER_ESP, support::rdmsr(msr::IA32_SYSENTER_ESP))?;
    support::vmwrite(guest::IA32_SYSENTER_EIP, support::rdmsr(msr::IA32_SYSENTER_EIP))?;

    support::vmwrite(guest::IA32_DEBUGCTL_FULL, support::rdmsr(msr::IA32_DEBUGCTL))?;
    support::vmwrite(guest::IA32_PAT_FULL, support::rdmsr(msr::IA32_PAT))?;
    support::vmwrite(guest::IA32_EFER_FULL, support::rdmsr(msr::IA32_EFER))?;
    support::vmwrite(
        guest::IA32_PERF_GLOBAL_CTRL_FULL,
        support::rdmsr(MSR_IA32_PERF_GLOBAL_CTRL),
    )?;

    support::vmwrite(guest::LINK_PTR_FULL, u64::MAX)?;
    support::vmwrite(guest::INTERRUPTIBILITY_STATE, 0)?;
    support::vmwrite(guest::ACTIVITY_STATE, 0)?;
    support::vmwrite(guest::PENDING_DBG_EXCEPTIONS, 0)?;

    Ok(())
}
