//! # Native Stubs
//!
//! Fixed code emitted once per runtime at the start of the executable plane:
//!
//! ```text
//! +------------------------+ 0
//! | function pointer table |  (functions + 1) * 8 bytes
//! +------------------------+
//! | entry trampoline, bail |
//! | lazy / host / grow     |
//! | call_indirect, br_table|
//! +------------------------+
//! | per-function thunks    |  mov edx, index; jmp common
//! +------------------------+
//! | compiled functions ... |
//! ```
//!
//! Every table slot starts out pointing at the function's thunk. Compiling a
//! function overwrites its slot with the entry address, once. The extra slot
//! past the last function points at a trap and backs uninitialized
//! indirect-table entries.

use crate::bridge::field;
use crate::error::Result;
use crate::module::Module;

use super::x86_64::{CodeBuffer, CodeOffset};

/// Bytes per thunk: `mov edx, imm32` + `jmp rel32`.
const THUNK_SIZE: u32 = 10;

/// Offsets of the shared stubs.
#[derive(Debug, Clone)]
pub struct Stubs {
    /// `extern "C" fn(*mut ExecContext) -> u64`.
    pub trampoline: CodeOffset,
    /// Restores the host stack saved by the trampoline and returns 0.
    pub bail: CodeOffset,
    pub lazy_common: CodeOffset,
    pub host_common: CodeOffset,
    pub grow_memory: CodeOffset,
    pub call_indirect: CodeOffset,
    pub br_table: CodeOffset,
    pub trap: CodeOffset,
    thunks: CodeOffset,
    function_count: u32,
}

impl Stubs {
    /// Emit the table, the stubs and one thunk per function.
    pub fn emit(
        code: &mut CodeBuffer<'_>,
        module: &Module,
        check_indirect_signatures: bool,
    ) -> Result<Self> {
        let function_count = module.function_count();
        let table = code.reserve((function_count as usize + 1) * 8)?;
        debug_assert_eq!(table, CodeOffset(0));

        code.align(16)?;
        let (trampoline, exit) = emit_trampoline(code)?;
        let bail = emit_bail(code, exit)?;
        let trap = code.position();
        code.emit_bytes(&[0x0f, 0x0b])?;

        code.align(16)?;
        let lazy_common = emit_lazy_common(code, bail)?;
        code.align(16)?;
        let host_common = emit_host_common(code)?;
        code.align(16)?;
        let grow_memory = emit_grow_memory(code)?;
        code.align(16)?;
        let call_indirect = emit_call_indirect(code, trap, check_indirect_signatures)?;
        code.align(16)?;
        let br_table = emit_br_table(code)?;

        code.align(16)?;
        let thunks = code.position();
        for func in 0..function_count {
            let common = if module.is_import(func) {
                host_common
            } else {
                lazy_common
            };
            code.emit_u8(0xba)?; // mov edx, func
            code.emit_u32(func)?;
            code.emit_u8(0xe9)?; // jmp common
            code.emit_rel32(common)?;
        }

        let stubs = Self {
            trampoline,
            bail,
            lazy_common,
            host_common,
            grow_memory,
            call_indirect,
            br_table,
            trap,
            thunks,
            function_count,
        };
        for func in 0..function_count {
            code.write_u64_at(stubs.slot(func), code.address_of(stubs.thunk(func)));
        }
        code.write_u64_at(stubs.slot(function_count), code.address_of(trap));
        Ok(stubs)
    }

    /// Function-pointer slot of `func`.
    pub fn slot(&self, func: u32) -> CodeOffset {
        CodeOffset(func * 8)
    }

    pub fn thunk(&self, func: u32) -> CodeOffset {
        debug_assert!(func < self.function_count);
        CodeOffset(self.thunks.0 + func * THUNK_SIZE)
    }

    pub fn function_count(&self) -> u32 {
        self.function_count
    }
}

/// Emit `opcode` followed by a disp32 into the execution context.
fn ctx_op(code: &mut CodeBuffer<'_>, opcode: &[u8], disp: u32) -> Result<()> {
    code.emit_bytes(opcode)?;
    code.emit_u32(disp)
}

/// Returns the trampoline and its exit sequence.
fn emit_trampoline(code: &mut CodeBuffer<'_>) -> Result<(CodeOffset, CodeOffset)> {
    let start = code.position();
    code.emit_bytes(&[0x53, 0x55, 0x41, 0x57])?; // push rbx; push rbp; push r15
    code.emit_bytes(&[0x49, 0x89, 0xff])?; // mov r15, rdi
    ctx_op(code, &[0x49, 0x89, 0xa7], field::SAVED_RSP)?; // mov [r15 + saved_rsp], rsp
    ctx_op(code, &[0x49, 0x8b, 0xbf], field::OPERAND_STACK)?; // mov rdi, [r15 + operand_stack]
    ctx_op(code, &[0x49, 0x8b, 0x9f], field::LOCALS)?; // mov rbx, [r15 + locals]
    ctx_op(code, &[0x49, 0x8b, 0xb7], field::MEMORY_BASE)?; // mov rsi, [r15 + memory_base]
    code.emit_bytes(&[0x31, 0xc0])?; // xor eax, eax
    ctx_op(code, &[0x41, 0xff, 0x97], field::ENTRY)?; // call [r15 + entry]
    let exit = code.position();
    code.emit_bytes(&[0x41, 0x5f, 0x5d, 0x5b, 0xc3])?; // pop r15; pop rbp; pop rbx; ret
    Ok((start, exit))
}

fn emit_bail(code: &mut CodeBuffer<'_>, exit: CodeOffset) -> Result<CodeOffset> {
    let start = code.position();
    ctx_op(code, &[0x49, 0x8b, 0xa7], field::SAVED_RSP)?; // mov rsp, [r15 + saved_rsp]
    code.emit_bytes(&[0x31, 0xc0])?; // xor eax, eax
    code.emit_u8(0xe9)?; // jmp exit
    code.emit_rel32(exit)?;
    Ok(start)
}

/// Save the convention registers the C ABI may clobber and align the stack.
fn enter_host(code: &mut CodeBuffer<'_>) -> Result<()> {
    code.emit_bytes(&[
        0x57, // push rdi
        0x56, // push rsi
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x48, 0x83, 0xe4, 0xf0, // and rsp, -16
        0x4c, 0x89, 0xff, // mov rdi, r15
    ])
}

fn leave_host(code: &mut CodeBuffer<'_>) -> Result<()> {
    code.emit_bytes(&[
        0x48, 0x89, 0xec, // mov rsp, rbp
        0x5d, // pop rbp
        0x5e, // pop rsi
        0x5f, // pop rdi
    ])
}

/// Entered from a thunk with the function index in `edx`. Compiles the
/// function, then jumps to it with the caller's return address still on the
/// stack.
fn emit_lazy_common(code: &mut CodeBuffer<'_>, bail: CodeOffset) -> Result<CodeOffset> {
    let start = code.position();
    enter_host(code)?;
    code.emit_bytes(&[0x89, 0xd6])?; // mov esi, edx
    ctx_op(code, &[0x41, 0xff, 0x97], field::LAZY_COMPILE)?;
    leave_host(code)?;
    code.emit_bytes(&[0x48, 0x85, 0xc0])?; // test rax, rax
    code.emit_bytes(&[0x0f, 0x84])?; // jz bail
    code.emit_rel32(bail)?;
    code.emit_bytes(&[0xff, 0xe0])?; // jmp rax
    Ok(start)
}

/// Entered from a thunk with the import index in `edx` and the arguments in
/// the callee frame at `rbx`.
fn emit_host_common(code: &mut CodeBuffer<'_>) -> Result<CodeOffset> {
    let start = code.position();
    enter_host(code)?;
    code.emit_bytes(&[0x89, 0xd6])?; // mov esi, edx
    code.emit_bytes(&[0x48, 0x89, 0xda])?; // mov rdx, rbx
    ctx_op(code, &[0x41, 0xff, 0x97], field::HOST_CALL)?;
    leave_host(code)?;
    code.emit_u8(0xc3)?;
    Ok(start)
}

/// Called with the page delta in `eax`; returns the old page count or -1.
fn emit_grow_memory(code: &mut CodeBuffer<'_>) -> Result<CodeOffset> {
    let start = code.position();
    enter_host(code)?;
    code.emit_bytes(&[0x89, 0xc6])?; // mov esi, eax
    ctx_op(code, &[0x41, 0xff, 0x97], field::GROW_MEMORY)?;
    leave_host(code)?;
    code.emit_u8(0xc3)?;
    Ok(start)
}

/// Called with the table index in `edx` and the expected canonical type in
/// `ecx`. Tail-jumps to the function so it returns straight to the call site.
fn emit_call_indirect(
    code: &mut CodeBuffer<'_>,
    trap: CodeOffset,
    check_signatures: bool,
) -> Result<CodeOffset> {
    let start = code.position();
    ctx_op(code, &[0x49, 0x3b, 0x97], field::TABLE_LEN)?; // cmp rdx, [r15 + table_len]
    code.emit_bytes(&[0x0f, 0x83])?; // jae trap
    code.emit_rel32(trap)?;
    ctx_op(code, &[0x4d, 0x8b, 0x87], field::TABLE)?; // mov r8, [r15 + table]
    code.emit_bytes(&[0x41, 0x8b, 0x14, 0x90])?; // mov edx, [r8 + rdx * 4]
    if check_signatures {
        ctx_op(code, &[0x4d, 0x8b, 0x87], field::FUNCTION_TYPES)?; // mov r8, [r15 + function_types]
        code.emit_bytes(&[0x41, 0x3b, 0x0c, 0x90])?; // cmp ecx, [r8 + rdx * 4]
        code.emit_bytes(&[0x0f, 0x85])?; // jne trap
        code.emit_rel32(trap)?;
    }
    ctx_op(code, &[0x4d, 0x8b, 0x87], field::FUNCTION_POINTERS)?; // mov r8, [r15 + function_pointers]
    code.emit_bytes(&[0x41, 0xff, 0x24, 0xd0])?; // jmp [r8 + rdx * 8]
    Ok(start)
}

/// Jumped to with the selector in `edx` and the jump table in `rcx`.
/// Selectors at or past the entry count take the default entry.
fn emit_br_table(code: &mut CodeBuffer<'_>) -> Result<CodeOffset> {
    let start = code.position();
    code.emit_bytes(&[
        0x3b, 0x11, // cmp edx, [rcx]
        0x72, 0x02, // jb +2
        0x8b, 0x11, // mov edx, [rcx]
        0x48, 0x63, 0x54, 0x91, 0x04, // movsxd rdx, [rcx + rdx * 4 + 4]
        0x48, 0x01, 0xd1, // add rcx, rdx
        0xff, 0xe1, // jmp rcx
    ])?;
    Ok(start)
}
