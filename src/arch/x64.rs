use std::arch::global_asm;
use std::mem::offset_of;

use static_assertions::const_assert_eq;

/// Every general-purpose register of the SysV AMD64 ABI, plus `rsp` and
/// `rip`. The cooperative paths fill only the callee-saved slots; the
/// preemption path fills all of them from the interrupted machine context.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterFile {
	rax: u64,
	rbx: u64,
	rcx: u64,
	rdx: u64,
	rsi: u64,
	rdi: u64,
	rbp: u64,
	r8: u64,
	r9: u64,
	r10: u64,
	r11: u64,
	r12: u64,
	r13: u64,
	r14: u64,
	r15: u64,
	sp: u64,
	pc: u64
}

/* the asm below addresses these numerically */
const_assert_eq!(offset_of!(RegisterFile, rbx), 8);
const_assert_eq!(offset_of!(RegisterFile, rdi), 40);
const_assert_eq!(offset_of!(RegisterFile, rbp), 48);
const_assert_eq!(offset_of!(RegisterFile, r12), 88);
const_assert_eq!(offset_of!(RegisterFile, r15), 112);
const_assert_eq!(offset_of!(RegisterFile, sp), 120);
const_assert_eq!(offset_of!(RegisterFile, pc), 128);

global_asm!(
	r#"
	.text
	.p2align 4

	.globl weft_context_x64_switch
	.globl weft_context_x64_restore
	.globl weft_fiber_x64_start

	# Store the caller's resume state into [rdi], then fall into the
	# restore of [rsi]. Only callee-saved registers are stored: the
	# resume site is a call boundary, everything else is dead there.
	weft_context_x64_switch:
		mov [rdi + 8], rbx
		mov [rdi + 48], rbp
		mov [rdi + 88], r12
		mov [rdi + 96], r13
		mov [rdi + 104], r14
		mov [rdi + 112], r15
		lea rax, [rsp + 8]
		mov [rdi + 120], rax
		mov rax, [rsp]
		mov [rdi + 128], rax
		mov rdi, rsi

	# Load [rdi] and jump to its saved rip. r11 carries the branch
	# target and is not reloaded; every legal target is a call boundary
	# or a fresh entry, where r11 is dead.
	weft_context_x64_restore:
		mov r11, [rdi + 128]
		mov rsp, [rdi + 120]
		mov rax, [rdi + 0]
		mov rbx, [rdi + 8]
		mov rcx, [rdi + 16]
		mov rdx, [rdi + 24]
		mov rsi, [rdi + 32]
		mov rbp, [rdi + 48]
		mov r8, [rdi + 56]
		mov r9, [rdi + 64]
		mov r10, [rdi + 72]
		mov r12, [rdi + 88]
		mov r13, [rdi + 96]
		mov r14, [rdi + 104]
		mov r15, [rdi + 112]
		mov rdi, [rdi + 40]
		jmp r11

	# First instruction a fiber ever runs. The entry function pointer
	# was parked at the initial rsp by set_entry; argument registers
	# were loaded from the file by the restore above.
	weft_fiber_x64_start:
		pop r11
		call r11
		mov rdi, rax
		call weft_fiber_exit
		ud2
	"#
);

extern "C" {
	fn weft_context_x64_switch(from: *mut RegisterFile, to: *const RegisterFile);
	fn weft_context_x64_restore(to: *const RegisterFile) -> !;
	fn weft_fiber_x64_start();
}

/// Suspend the current flow of control into `from` and resume `to`.
///
/// # Safety
/// Both files must stay valid until re-entered; `to` must hold a resumable
/// state (fresh entry or previously switched out).
pub unsafe fn switch(from: *mut RegisterFile, to: *const RegisterFile) {
	/* Safety: guaranteed by caller */
	unsafe { weft_context_x64_switch(from, to) };
}

/// Resume `to`, abandoning the current flow of control.
///
/// # Safety
/// Same as [`switch`], without the save.
pub unsafe fn restore(to: *const RegisterFile) -> ! {
	/* Safety: guaranteed by caller */
	unsafe { weft_context_x64_restore(to) }
}

/// Argument registers in declaration order.
pub const MAX_REG_ARGS: usize = 6;

/// Bytes reserved at the initial stack pointer for the entry slot.
const ENTRY_SLOT: usize = 8;

pub fn set_arg(file: &mut RegisterFile, index: usize, value: u64) {
	match index {
		0 => file.rdi = value,
		1 => file.rsi = value,
		2 => file.rdx = value,
		3 => file.rcx = value,
		4 => file.r8 = value,
		5 => file.r9 = value,
		_ => unreachable!("argument register {} out of range", index)
	}
}

#[cfg(test)]
pub(crate) fn arg(file: &RegisterFile, index: usize) -> u64 {
	[file.rdi, file.rsi, file.rdx, file.rcx, file.r8, file.r9][index]
}

/// Where stack-mode arguments of `len` total bytes begin, given the
/// aligned stack top.
pub fn stack_args_base(top: usize, len: usize) -> usize {
	/* keep the final rsp congruent to 8 mod 16 at function entry */
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
	file.pc = weft_fiber_x64_start as usize as u64;
}

/// Copy the interrupted register state out of an OS-delivered ucontext.
///
/// # Safety
/// `uc` must be the `ucontext_t` passed to a running signal handler.
pub unsafe fn capture_mcontext(uc: *mut libc::c_void, file: &mut RegisterFile) {
	/* Safety: guaranteed by caller */
	let gregs = unsafe { &(*uc.cast::<libc::ucontext_t>()).uc_mcontext.gregs };
	let reg = |index: libc::c_int| gregs[index as usize] as u64;

	file.rax = reg(libc::REG_RAX);
	file.rbx = reg(libc::REG_RBX);
	file.rcx = reg(libc::REG_RCX);
	file.rdx = reg(libc::REG_RDX);
	file.rsi = reg(libc::REG_RSI);
	file.rdi = reg(libc::REG_RDI);
	file.rbp = reg(libc::REG_RBP);
	file.r8 = reg(libc::REG_R8);
	file.r9 = reg(libc::REG_R9);
	file.r10 = reg(libc::REG_R10);
	file.r11 = reg(libc::REG_R11);
	file.r12 = reg(libc::REG_R12);
	file.r13 = reg(libc::REG_R13);
	file.r14 = reg(libc::REG_R14);
	file.r15 = reg(libc::REG_R15);
	file.sp = reg(libc::REG_RSP);
	file.pc = reg(libc::REG_RIP);
}

/// Overwrite the interrupted register state so that signal return resumes
/// `file` instead. The kernel installs the whole set atomically, which is
/// what makes a full-file (preempted) resume possible at all.
///
/// # Safety
/// Same as [`capture_mcontext`]; `file` must hold a resumable state.
pub unsafe fn install_mcontext(uc: *mut libc::c_void, file: &RegisterFile) {
	/* Safety: guaranteed by caller */
	let gregs = unsafe { &mut (*uc.cast::<libc::ucontext_t>()).uc_mcontext.gregs };

	#[allow(clippy::cast_possible_wrap)]
	let mut set = |index: libc::c_int, value: u64| gregs[index as usize] = value as i64;

	set(libc::REG_RAX, file.rax);
	set(libc::REG_RBX, file.rbx);
	set(libc::REG_RCX, file.rcx);
	set(libc::REG_RDX, file.rdx);
	set(libc::REG_RSI, file.rsi);
	set(libc::REG_RDI, file.rdi);
	set(libc::REG_RBP, file.rbp);
	set(libc::REG_R8, file.r8);
	set(libc::REG_R9, file.r9);
	set(libc::REG_R10, file.r10);
	set(libc::REG_R11, file.r11);
	set(libc::REG_R12, file.r12);
	set(libc::REG_R13, file.r13);
	set(libc::REG_R14, file.r14);
	set(libc::REG_R15, file.r15);
	set(libc::REG_RSP, file.sp);
	set(libc::REG_RIP, file.pc);

	/* the interrupted flags travel with the old context; the one bit the
	 * ABI requires at a call boundary is a clear direction flag */
	gregs[libc::REG_EFL as usize] &= !0x400;
}
