//! Per-CPU bring-up into VMX operation and teardown back out of it.
//!
//! Bring-up virtualizes the context that called it: after a successful
//! [`start_vmm_per_cpu`] the caller keeps running, now as the guest of its
//! own CPU. Failures at any point roll back everything acquired so far and
//! leave the CPU exactly as it was found.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capability::{self, CrFixups, VmxCapabilities},
            context::{ArchContext, ExitHistory},
            descriptor::DescriptorTables,
            regions::RegionSet,
            support,
            vmexit::ExitHandlerRegistry,
            vmlaunch::vmx_launch,
        },
        platform::PlatformMemory,
    },
    alloc::boxed::Box,
    x86::msr,
};

const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// Decides what to do with IA32_FEATURE_CONTROL before VMXON.
///
/// Returns the value to write when the MSR is still unlocked, `None` when it
/// is already locked with VMX permitted, and an error when firmware locked
/// VMX off.
fn feature_control_update(value: u64) -> Result<Option<u64>, HypervisorError> {
    if value & FEATURE_CONTROL_LOCK != 0 {
        if value & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            return Err(HypervisorError::VmxDisabledByFirmware);
        }
        return Ok(None);
    }
    Ok(Some(value | FEATURE_CONTROL_VMXON_OUTSIDE_SMX | FEATURE_CONTROL_LOCK))
}

fn lock_feature_control() -> Result<(), HypervisorError> {
    let value = support::rdmsr(msr::IA32_FEATURE_CONTROL);
    if let Some(new_value) = feature_control_update(value)? {
        support::wrmsr(msr::IA32_FEATURE_CONTROL, new_value);
    }
    Ok(())
}

/// Puts this CPU into VMX operation with the running context as guest.
///
/// On success the returned context stays alive for as long as the CPU is
/// virtualized; the caller continues executing as the guest. On failure the
/// CPU's control registers, the feature-control MSR lock aside, and every
/// memory region are back in their pre-call state.
pub fn start_vmm_per_cpu<M: PlatformMemory>(
    cpu: usize,
    mem: &mut M,
) -> Result<&'static mut ArchContext, HypervisorError> {
    let caps = VmxCapabilities::read()?;

    if caps.intel_pt_in_vmx() {
        log::warn!("cpu {cpu}: Intel PT is usable in VMX operation but is not virtualized");
    }

    // Catch bad tables before VMX operation makes them fatal.
    let tables = DescriptorTables::capture(caps.virt_address_bits)?;

    lock_feature_control()?;

    let (fixups, regions) = probe_and_acquire(&caps, support::cr0(), support::cr4(), mem)?;

    let ctx = Box::leak(Box::new(ArchContext {
        cpu,
        caps,
        fixups,
        regions,
        registry: ExitHandlerRegistry::with_defaults(),
        history: ExitHistory::default(),
    }));

    // The exit stub finds its way back to this context through the
    // state-save area.
    unsafe {
        (*ctx.state_save()).context = ctx as *mut ArchContext as u64;
    }

    match enter_vmx_root(ctx, &tables) {
        Ok(()) => {
            log::info!("cpu {cpu}: now running as guest");
            Ok(ctx)
        }
        Err(err) => {
            let mut ctx = unsafe { Box::from_raw(ctx as *mut ArchContext) };
            ctx.regions.release(mem);
            Err(err)
        }
    }
}

/// The fallible prefix of bring-up: CR fixup computation and region
/// acquisition.
///
/// Takes the current CR0/CR4 values as plain data and only returns the
/// computed fixups; nothing in here writes a control register, so a failure
/// at any step leaves CR0 and CR4 exactly as the caller found them. The
/// commit happens later, in [`enter_vmx_root`].
fn probe_and_acquire<M: PlatformMemory>(
    caps: &VmxCapabilities,
    cr0: u64,
    cr4: u64,
    mem: &mut M,
) -> Result<(CrFixups, RegionSet), HypervisorError> {
    let fixups = capability::probe(caps, cr0, cr4)?;
    let regions = RegionSet::acquire(mem, caps)?;
    Ok((fixups, regions))
}

/// Commits the CR fixups, enters VMX root operation and launches.
///
/// Undone completely on failure: VMXOFF if VMXON had succeeded, then the
/// original CR values.
fn enter_vmx_root(ctx: &mut ArchContext, tables: &DescriptorTables) -> Result<(), HypervisorError> {
    if ctx.fixups.new_cr0 != ctx.fixups.old_cr0 {
        support::write_cr0(ctx.fixups.new_cr0);
    }
    support::write_cr4(ctx.fixups.new_cr4);

    if let Err(err) = support::vmxon(ctx.regions.vmxon.phys()) {
        restore_control_registers(ctx);
        return Err(err);
    }

    if let Err(err) = configure_and_launch(ctx, tables) {
        // Best effort: the CPU is wedged enough that a failing VMXOFF adds
        // nothing to the original error.
        let _ = support::vmxoff();
        restore_control_registers(ctx);
        return Err(err);
    }

    Ok(())
}

fn configure_and_launch(
    ctx: &mut ArchContext,
    tables: &DescriptorTables,
) -> Result<(), HypervisorError> {
    let vmcs_pa = ctx.regions.vmcs.phys();
    support::vmclear(vmcs_pa)?;
    support::vmptrld(vmcs_pa)?;

    crate::intel::vmcs::setup_control_fields(&ctx.caps, &ctx.regions)?;
    crate::intel::vmcs::setup_host_fields(tables, &ctx.regions, &ctx.fixups)?;
    crate::intel::vmcs::setup_guest_fields(tables, &ctx.fixups)?;

    // Returns 0 in the guest, 1 in the host on a failed launch.
    if unsafe { vmx_launch() } != 0 {
        let err = support::vm_instruction_error();
        log::error!("cpu {}: vmlaunch failed: {err}", ctx.cpu);
        return Err(HypervisorError::InstructionFailed("vmlaunch", err));
    }

    Ok(())
}

fn restore_control_registers(ctx: &ArchContext) {
    support::write_cr4(ctx.fixups.old_cr4);
    if ctx.fixups.new_cr0 != ctx.fixups.old_cr0 {
        support::write_cr0(ctx.fixups.old_cr0);
    }
}

/// Devirtualizes this CPU and releases its regions.
///
/// Called while running as the guest: the VMXOFF below traps, the dispatcher
/// promotes, and execution continues here bare-metal with VMsucceed flags.
pub fn stop_vmm_per_cpu<M: PlatformMemory>(
    mem: &mut M,
    ctx: &'static mut ArchContext,
) -> Result<(), HypervisorError> {
    let cpu = ctx.cpu;
    support::vmxoff()?;

    restore_control_registers(ctx);

    let mut ctx = unsafe { Box::from_raw(ctx as *mut ArchContext) };
    ctx.regions.release(mem);

    log::info!("cpu {cpu}: devirtualized");
    Ok(())
}
