use std::arch::global_asm;
use std::mem::offset_of;

use static_assertions::const_assert_eq;

/// Every AAPCS64 general-purpose register, plus `sp` and `pc`. The
/// cooperative paths fill only the callee-saved slots; the preemption
/// path fills all thirty-one from the interrupted machine context.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RegisterFile {
	x: [u64; 31],
	sp: u64,
	pc: u64
}

impl Default for RegisterFile {
	fn default() -> Self {
		Self { x: [0; 31], sp: 0, pc: 0 }
	}
}

/* the asm below addresses these numerically */
const_assert_eq!(offset_of!(RegisterFile, x), 0);
const_assert_eq!(offset_of!(RegisterFile, sp), 248);
const_assert_eq!(offset_of!(RegisterFile, pc), 256);

global_asm!(
	r#"
	.text
	.p2align 2

	.globl weft_context_arm64_switch
	.globl weft_context_arm64_restore
	.globl weft_fiber_arm64_start

	// Store the caller's resume state into [x0], then fall into the
	// restore of [x1]. Only callee-saved registers are stored: the
	// resume site is a call boundary, everything else is dead there.
	weft_context_arm64_switch:
		stp x19, x20, [x0, #152]
		stp x21, x22, [x0, #168]
		stp x23, x24, [x0, #184]
		stp x25, x26, [x0, #200]
		stp x27, x28, [x0, #216]
		stp x29, x30, [x0, #232]
		mov x9, sp
		str x9, [x0, #248]
		str x30, [x0, #256]
		mov x0, x1

	// Load [x0] and branch to its saved pc. x9 and x10 carry the branch
	// target and scratch and are not reloaded; every legal target is a
	// call boundary or a fresh entry, where both are dead.
	weft_context_arm64_restore:
		ldr x9, [x0, #256]
		ldr x10, [x0, #248]
		mov sp, x10
		ldp x2, x3, [x0, #16]
		ldp x4, x5, [x0, #32]
		ldp x6, x7, [x0, #48]
		ldp x19, x20, [x0, #152]
		ldp x21, x22, [x0, #168]
		ldp x23, x24, [x0, #184]
		ldp x25, x26, [x0, #200]
		ldp x27, x28, [x0, #216]
		ldp x29, x30, [x0, #232]
		ldp x0, x1, [x0]
		br x9

	// First instruction a fiber ever runs. The entry function pointer
	// was parked at the initial sp by set_entry; argument registers
	// were loaded from the file by the restore above.
	weft_fiber_arm64_start:
		ldr x9, [sp]
		add sp, sp, #16
		blr x9
		bl weft_fiber_exit
		brk #1
	"#
);

extern "C" {
	fn weft_context_arm64_switch(from: *mut RegisterFile, to: *const RegisterFile);
	fn weft_context_arm64_restore(to: *const RegisterFile) -> !;
	fn weft_fiber_arm64_start();
}

/// Suspend the current flow of control into `from` and resume `to`.
///
/// # Safety
/// Both files must stay valid until re-entered; `to` must hold a resumable
/// state (fresh entry or previously switched out).
pub unsafe fn switch(from: *mut RegisterFile, to: *const RegisterFile) {
	/* Safety: guaranteed by caller */
	unsafe { weft_context_arm64_switch(from, to) };
}

/// Resume `to`, abandoning the current flow of control.
///
/// # Safety
/// Same as [`switch`], without the save.
pub unsafe fn restore(to: *const RegisterFile) -> ! {
	/* Safety: guaranteed by caller */
	unsafe { weft_context_arm64_restore(to) }
}

/// Argument registers in declaration order.
pub const MAX_REG_ARGS: usize = 8;

/// Bytes reserved at the initial stack pointer for the entry slot;
/// sp must stay 16-aligned, so the 8-byte pointer gets a full slot.
const ENTRY_SLOT: usize = 16;

pub fn set_arg(file: &mut RegisterFile, index: usize, value: u64) {
	assert!(index < MAX_REG_ARGS, "argument register {} out of range", index);

	file.x[index] = value;
}

#[cfg(test)]
pub(crate) fn arg(file: &RegisterFile, index: usize) -> u64 {
	file.x[index]
}

/// Where stack-mode arguments of `len` total bytes begin, given the
/// aligned stack top.
pub fn stack_args_base(top: usize, len: usize) -> usize {
	top - ((len + 15) & !15)
}

/// Point a fresh file at the entry shim: park `entry` in the reserved
/// slot, aim the stack pointer at it, program counter at the shim.
///
/// # Safety
/// `base..base + length` must be a live, writable stack mapping, and
/// `stack_args` bytes directly below the top must already be populated
/// if stack-mode arguments are in use.
pub unsafe fn set_entry(
	file: &mut RegisterFile, base: *mut u8, length: usize, stack_args: usize, entry: usize
) {
	let top = base as usize + length;
	let sp = stack_args_base(top, stack_args) - ENTRY_SLOT;

	/* Safety: in range per caller contract */
	unsafe { (sp as *mut usize).write(entry) };

	file.sp = sp as u64;
	file.pc = weft_fiber_arm64_start as usize as u64;
}

/// Copy the interrupted register state out of an OS-delivered ucontext.
///
/// # Safety
/// `uc` must be the `ucontext_t` passed to a running signal handler.
pub unsafe fn capture_mcontext(uc: *mut libc::c_void, file: &mut RegisterFile) {
	/* Safety: guaranteed by caller */
	let mcontext = unsafe { &(*uc.cast::<libc::ucontext_t>()).uc_mcontext };

	file.x = mcontext.regs;
	file.sp = mcontext.sp;
	file.pc = mcontext.pc;
}

/// Overwrite the interrupted register state so that signal return resumes
/// `file` instead. The kernel installs the whole set atomically, which is
/// what makes a full-file (preempted) resume possible at all.
///
/// # Safety
/// Same as [`capture_mcontext`]; `file` must hold a resumable state.
pub unsafe fn install_mcontext(uc: *mut libc::c_void, file: &RegisterFile) {
	/* Safety: guaranteed by caller */
	let mcontext = unsafe { &mut (*uc.cast::<libc::ucontext_t>()).uc_mcontext };

	mcontext.regs = file.x;
	mcontext.sp = file.sp;
	mcontext.pc = file.pc;
}
