//! Thin wrappers over the privileged instructions the core consumes.
//!
//! Everything that touches live CPU state funnels through here so the rest of
//! the crate stays testable on plain data. VMX instructions report failure
//! through RFLAGS; the wrappers translate that into [`HypervisorError`] with
//! the decoded VM-instruction error attached.

use {
    crate::{error::HypervisorError, intel::vmerror::VmInstructionError},
    core::arch::asm,
    x86::{
        bits64::{rflags, vmx},
        vmx::vmcs::ro,
    },
    x86_64::registers::control::{Cr0 as RawCr0, Cr4 as RawCr4},
};

/// A descriptor-table register image as stored by SGDT/SIDT.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TableRegister {
    /// Table limit in bytes, minus one.
    pub limit: u16,
    /// Linear base address of the table.
    pub base: u64,
}

/// Reads a model-specific register.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a model-specific register.
pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) }
}

/// Reads CR0 without masking any bits.
pub fn cr0() -> u64 {
    RawCr0::read_raw()
}

/// Writes CR0.
pub fn write_cr0(value: u64) {
    unsafe { RawCr0::write_raw(value) }
}

/// Reads CR3.
pub fn cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}

/// Reads CR4 without masking any bits.
pub fn cr4() -> u64 {
    RawCr4::read_raw()
}

/// Writes CR4.
pub fn write_cr4(value: u64) {
    unsafe { RawCr4::write_raw(value) }
}

/// Reads DR7.
pub fn dr7() -> u64 {
    unsafe { x86::debugregs::dr7().0 as u64 }
}

/// Reads RFLAGS.
pub fn read_rflags() -> u64 {
    rflags::read().bits()
}

/// Stores the GDT register.
pub fn sgdt() -> TableRegister {
    let mut table = TableRegister::default();
    unsafe {
        asm!("sgdt [{}]", in(reg) &mut table, options(nostack, preserves_flags));
    }
    table
}

/// Stores the IDT register.
pub fn sidt() -> TableRegister {
    let mut table = TableRegister::default();
    unsafe {
        asm!("sidt [{}]", in(reg) &mut table, options(nostack, preserves_flags));
    }
    table
}

/// Reads the ES selector.
pub fn es() -> u16 {
    unsafe { x86::segmentation::es().bits() }
}

/// Reads the CS selector.
pub fn cs() -> u16 {
    unsafe { x86::segmentation::cs().bits() }
}

/// Reads the SS selector.
pub fn ss() -> u16 {
    unsafe { x86::segmentation::ss().bits() }
}

/// Reads the DS selector.
pub fn ds() -> u16 {
    unsafe { x86::segmentation::ds().bits() }
}

/// Reads the FS selector.
pub fn fs() -> u16 {
    unsafe { x86::segmentation::fs().bits() }
}

/// Reads the GS selector.
pub fn gs() -> u16 {
    unsafe { x86::segmentation::gs().bits() }
}

/// Reads the LDT selector.
pub fn ldtr() -> u16 {
    let selector: u16;
    unsafe {
        asm!("sldt {:x}", out(reg) selector, options(nomem, nostack, preserves_flags));
    }
    selector
}

/// Reads the task register selector.
pub fn tr() -> u16 {
    let selector: u16;
    unsafe {
        asm!("str {:x}", out(reg) selector, options(nomem, nostack, preserves_flags));
    }
    selector
}

/// Writes back and invalidates the caches.
pub fn wbinvd() {
    unsafe {
        asm!("wbinvd", options(nostack, preserves_flags));
    }
}

/// Writes an extended control register.
pub fn xsetbv(register: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    unsafe {
        asm!(
            "xsetbv",
            in("ecx") register,
            in("eax") low,
            in("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Reads a byte from an I/O port.
pub fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

/// Writes a byte to an I/O port.
pub fn outb(port: u16, value: u8) {
    unsafe { x86::io::outb(port, value) }
}

/// Decodes the failure mode of a VMX instruction from its RFLAGS result.
///
/// On `VMfailValid` the architectural VM-instruction-error field is read back
/// from the current VMCS; on `VMfailInvalid` there is no current VMCS to
/// consult.
fn decode_failure(fail: x86::vmx::VmFail) -> VmInstructionError {
    match fail {
        x86::vmx::VmFail::VmFailInvalid => VmInstructionError::InvalidWithoutCurrentVmcs,
        x86::vmx::VmFail::VmFailValid => {
            VmInstructionError::from_error_field(unsafe { vmx::vmread(ro::VM_INSTRUCTION_ERROR) })
        }
    }
}

/// Executes VMXON with the physical address of the VMXON region.
pub fn vmxon(vmxon_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { vmx::vmxon(vmxon_region_pa) }
        .map_err(|fail| HypervisorError::InstructionFailed("vmxon", decode_failure(fail)))
}

/// Executes VMXOFF, leaving VMX root operation.
pub fn vmxoff() -> Result<(), HypervisorError> {
    unsafe { vmx::vmxoff() }
        .map_err(|fail| HypervisorError::InstructionFailed("vmxoff", decode_failure(fail)))
}

/// Executes VMCLEAR with the physical address of a VMCS region.
pub fn vmclear(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { vmx::vmclear(vmcs_region_pa) }
        .map_err(|fail| HypervisorError::InstructionFailed("vmclear", decode_failure(fail)))
}

/// Executes VMPTRLD, making a VMCS region current and active.
pub fn vmptrld(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { vmx::vmptrld(vmcs_region_pa) }
        .map_err(|fail| HypervisorError::InstructionFailed("vmptrld", decode_failure(fail)))
}

/// Reads a field from the current VMCS.
pub fn vmread(field: u32) -> Result<u64, HypervisorError> {
    unsafe { vmx::vmread(field) }
        .map_err(|fail| HypervisorError::InstructionFailed("vmread", decode_failure(fail)))
}

/// Writes a field of the current VMCS.
pub fn vmwrite(field: u32, value: u64) -> Result<(), HypervisorError> {
    unsafe { vmx::vmwrite(field, value) }
        .map_err(|fail| HypervisorError::InstructionFailed("vmwrite", decode_failure(fail)))
}

/// Reads the VM-instruction-error field after a failed VMLAUNCH.
pub fn vm_instruction_error() -> VmInstructionError {
    VmInstructionError::from_error_field(unsafe { vmx::vmread(ro::VM_INSTRUCTION_ERROR) })
}

/// Stops the CPU after an unrecoverable dispatch failure.
pub fn halt() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
