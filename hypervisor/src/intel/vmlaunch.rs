//! Assembly stubs for the four VMX control-flow transfers: the initial
//! launch, VM-exit entry, guest resumption and promotion back out of VMX.
//!
//! All of them communicate with Rust through the [`StateSave`] layout; the
//! offsets are injected as constants so the struct stays the single source
//! of truth.

use {
    crate::intel::{context::StateSave, support, vmexit},
    core::{arch::global_asm, mem::offset_of},
};

extern "sysv64" {
    /// Writes guest RIP/RSP into the current VMCS and executes VMLAUNCH.
    ///
    /// Returns 0 when execution continues as the guest, 1 when VMLAUNCH
    /// fell through (the VM-instruction error is still readable).
    pub fn vmx_launch() -> u64;

    /// VM-exit entry point programmed as HOST_RIP. Never called from Rust.
    pub fn exit_handler_entry();

    /// Reloads guest registers from the state-save area and executes
    /// VMRESUME.
    pub fn vmx_resume(state: *mut StateSave) -> !;

    /// Leaves VMX operation and continues the guest bare-metal, restoring
    /// its full register file from the state-save area.
    pub fn vmx_promote(state: *mut StateSave) -> !;
}

/// Terminal path for a VMRESUME that fell through. All registers already
/// hold guest values, so nothing is recoverable here.
#[no_mangle]
extern "sysv64" fn vmx_resume_failed() -> ! {
    log::error!("vmresume failed: {}", support::vm_instruction_error());
    support::halt()
}

global_asm!(
    r#"
    .globl vmx_launch
    .globl exit_handler_entry
    .globl vmx_resume
    .globl vmx_promote

vmx_launch:
    // Guest RIP = the instruction after VMLAUNCH, guest RSP = our RSP, so a
    // successful launch continues right here as the guest.
    lea     rax, [rip + .Lvmx_guest]
    mov     rdx, {guest_rip_field}
    vmwrite rdx, rax
    mov     rdx, {guest_rsp_field}
    vmwrite rdx, rsp
    vmlaunch

    // Fell through: VMLAUNCH failed and we are still the bare-metal host.
    mov     eax, 1
    ret

.Lvmx_guest:
    xor     eax, eax
    ret

exit_handler_entry:
    // HOST_RSP points at a slot holding the state-save pointer. Spill guest
    // RAX first to free a scratch register.
    push    rax
    mov     rax, [rsp + 8]

    mov     [rax + {off_rcx}], rcx
    mov     [rax + {off_rdx}], rdx
    mov     [rax + {off_rbx}], rbx
    mov     [rax + {off_rbp}], rbp
    mov     [rax + {off_rsi}], rsi
    mov     [rax + {off_rdi}], rdi
    mov     [rax + {off_r8}],  r8
    mov     [rax + {off_r9}],  r9
    mov     [rax + {off_r10}], r10
    mov     [rax + {off_r11}], r11
    mov     [rax + {off_r12}], r12
    mov     [rax + {off_r13}], r13
    mov     [rax + {off_r14}], r14
    mov     [rax + {off_r15}], r15

    mov     rcx, [rsp]
    mov     [rax + {off_rax}], rcx
    add     rsp, 8

    mov     rdi, rax
    call    {dispatch}

vmx_resume:
    mov     rax, [rdi + {off_rax}]
    mov     rcx, [rdi + {off_rcx}]
    mov     rdx, [rdi + {off_rdx}]
    mov     rbx, [rdi + {off_rbx}]
    mov     rbp, [rdi + {off_rbp}]
    mov     rsi, [rdi + {off_rsi}]
    mov     r8,  [rdi + {off_r8}]
    mov     r9,  [rdi + {off_r9}]
    mov     r10, [rdi + {off_r10}]
    mov     r11, [rdi + {off_r11}]
    mov     r12, [rdi + {off_r12}]
    mov     r13, [rdi + {off_r13}]
    mov     r14, [rdi + {off_r14}]
    mov     r15, [rdi + {off_r15}]
    mov     rdi, [rdi + {off_rdi}]
    vmresume

    // Fell through: nothing left to resume into.
    call    vmx_resume_failed

vmx_promote:
    vmxoff

    // Rebuild the guest's stack and flags, then return into it. The pushed
    // return address sits just below the guest RSP and is consumed by RET.
    mov     rsp, [rdi + {off_rsp}]
    push    qword ptr [rdi + {off_rip}]
    push    qword ptr [rdi + {off_rflags}]
    popfq

    mov     rax, [rdi + {off_rax}]
    mov     rcx, [rdi + {off_rcx}]
    mov     rdx, [rdi + {off_rdx}]
    mov     rbx, [rdi + {off_rbx}]
    mov     rbp, [rdi + {off_rbp}]
    mov     rsi, [rdi + {off_rsi}]
    mov     r8,  [rdi + {off_r8}]
    mov     r9,  [rdi + {off_r9}]
    mov     r10, [rdi + {off_r10}]
    mov     r11, [rdi + {off_r11}]
    mov     r12, [rdi + {off_r12}]
    mov     r13, [rdi + {off_r13}]
    mov     r14, [rdi + {off_r14}]
    mov     r15, [rdi + {off_r15}]
    mov     rdi, [rdi + {off_rdi}]
    ret
"#,
    guest_rip_field = const 0x681eu32,
    guest_rsp_field = const 0x681cu32,
    dispatch = sym vmexit::vmexit_dispatch,
    off_rax = const offset_of!(StateSave, rax),
    off_rcx = const offset_of!(StateSave, rcx),
    off_rdx = const offset_of!(StateSave, rdx),
    off_rbx = const offset_of!(StateSave, rbx),
    off_rsp = const offset_of!(StateSave, rsp),
    off_rbp = const offset_of!(StateSave, rbp),
    off_rsi = const offset_of!(StateSave, rsi),
    off_rdi = const offset_of!(StateSave, rdi),
    off_r8 = const offset_of!(StateSave, r8),
    off_r9 = const offset_of!(StateSave, r9),
    off_r10 = const offset_of!(StateSave, r10),
    off_r11 = const offset_of!(StateSave, r11),
    off_r12 = const offset_of!(StateSave, r12),
    off_r13 = const offset_of!(StateSave, r13),
    off_r14 = const offset_of!(StateSave, r14),
    off_r15 = const offset_of!(StateSave, r15),
    off_rip = const offset_of!(StateSave, rip),
    off_rflags = const offset_of!(StateSave, rflags),
);
