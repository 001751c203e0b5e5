//! # x86_64 Code Generation
//!
//! Append-only emission into the executable plane, one method per semantic
//! operation of the stack machine.
//!
//! ## Register convention
//!
//! ```text
//! rax  top of the operand stack (accumulator)
//! rdi  evaluation stack pointer, next free 8-byte slot
//! rbx  locals frame of the running function
//! rsi  linear memory base
//! r15  execution context
//! rcx, rdx, r8  scratch
//! ```
//!
//! Everything below the top of stack lives in memory at `[rdi - 8]`,
//! `[rdi - 16]`, ... Pushing spills `rax` first, so any operation that needs
//! two operands, or crosses a block boundary, finds the stack in a canonical
//! place. i32 values are kept zero-extended in `rax`.

use crate::bridge::field;
use crate::error::{Result, WaveError};

// =============================================================================
// Offsets and Patch Sites
// =============================================================================

/// Position inside the executable plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeOffset(pub u32);

impl CodeOffset {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Position of a rel32 displacement whose target is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite(u32);

impl PatchSite {
    pub fn offset(self) -> CodeOffset {
        CodeOffset(self.0)
    }
}

// =============================================================================
// Code Buffer
// =============================================================================

/// Bounded writer over the plane's bytes.
pub struct CodeBuffer<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> CodeBuffer<'a> {
    /// Resume writing at `start`.
    pub fn new(bytes: &'a mut [u8], start: usize) -> Self {
        debug_assert!(start <= bytes.len());
        Self { bytes, pos: start }
    }

    /// Current position in the buffer.
    pub fn position(&self) -> CodeOffset {
        CodeOffset(self.pos as u32)
    }

    /// Absolute address of an offset, for values stored into slots.
    pub fn address_of(&self, offset: CodeOffset) -> u64 {
        self.bytes.as_ptr() as u64 + u64::from(offset.0)
    }

    /// Emit bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.bytes.len() {
            return Err(WaveError::CodeBufferExhausted);
        }
        self.bytes[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) -> Result<()> {
        self.emit_bytes(&[byte])
    }

    /// Emit a 32-bit value.
    pub fn emit_u32(&mut self, value: u32) -> Result<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit a 64-bit value.
    pub fn emit_u64(&mut self, value: u64) -> Result<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit a rel32 placeholder and return its patch site.
    pub fn emit_placeholder(&mut self) -> Result<PatchSite> {
        let site = PatchSite(self.pos as u32);
        self.emit_u32(0)?;
        Ok(site)
    }

    /// Emit a rel32 to `target`, measured from the end of the field.
    pub fn emit_rel32(&mut self, target: CodeOffset) -> Result<()> {
        let rel = rel32(self.pos as u32 + 4, target);
        self.emit_u32(rel as u32)
    }

    /// Point the displacement at `site` to `target`.
    pub fn patch(&mut self, site: PatchSite, target: CodeOffset) {
        let rel = rel32(site.0 + 4, target);
        self.write_u32_at(CodeOffset(site.0), rel as u32);
    }

    pub fn write_u32_at(&mut self, offset: CodeOffset, value: u32) {
        let at = offset.as_usize();
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_at(&mut self, offset: CodeOffset, value: u64) {
        let at = offset.as_usize();
        self.bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Reserve `len` zeroed bytes and return where they start.
    pub fn reserve(&mut self, len: usize) -> Result<CodeOffset> {
        let start = self.position();
        if self.pos + len > self.bytes.len() {
            return Err(WaveError::CodeBufferExhausted);
        }
        self.bytes[self.pos..self.pos + len].fill(0);
        self.pos += len;
        Ok(start)
    }

    /// Pad with `int3` up to a multiple of `align`.
    pub fn align(&mut self, align: usize) -> Result<()> {
        while self.pos % align != 0 {
            self.emit_u8(0xcc)?;
        }
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }
}

/// Displacement from `next_ip` to `target`. The plane is far smaller than
/// 2 GiB, so every displacement fits.
fn rel32(next_ip: u32, target: CodeOffset) -> i32 {
    (i64::from(target.0) - i64::from(next_ip)) as i32
}

// =============================================================================
// Operation Kinds
// =============================================================================

/// Relation for a two-operand comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

impl Cond {
    /// Second byte of `SETcc r/m8`.
    fn setcc(self) -> u8 {
        match self {
            Cond::Eq => 0x94,
            Cond::Ne => 0x95,
            Cond::LtS => 0x9c,
            Cond::LtU => 0x92,
            Cond::GtS => 0x9f,
            Cond::GtU => 0x97,
            Cond::LeS => 0x9e,
            Cond::LeU => 0x96,
            Cond::GeS => 0x9d,
            Cond::GeU => 0x93,
        }
    }
}

/// Two-operand integer operation on `rax` (lhs) and `rcx` (rhs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

impl BinaryOp {
    fn encoding(self) -> &'static [u8] {
        match self {
            BinaryOp::Add => &[0x01, 0xc8],        // add eax, ecx
            BinaryOp::Sub => &[0x29, 0xc8],        // sub eax, ecx
            BinaryOp::Mul => &[0x0f, 0xaf, 0xc1],  // imul eax, ecx
            BinaryOp::And => &[0x21, 0xc8],        // and eax, ecx
            BinaryOp::Or => &[0x09, 0xc8],         // or eax, ecx
            BinaryOp::Xor => &[0x31, 0xc8],        // xor eax, ecx
            BinaryOp::Shl => &[0xd3, 0xe0],        // shl eax, cl
            BinaryOp::ShrS => &[0xd3, 0xf8],       // sar eax, cl
            BinaryOp::ShrU => &[0xd3, 0xe8],       // shr eax, cl
            BinaryOp::Rotl => &[0xd3, 0xc0],       // rol eax, cl
            BinaryOp::Rotr => &[0xd3, 0xc8],       // ror eax, cl
        }
    }
}

/// Bit-counting operation on `rax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOp {
    Clz,
    Ctz,
    Popcnt,
}

/// Memory load shape: width and extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I64S8,
    I64S16,
    I64S32,
}

impl LoadKind {
    /// Opcode and ModRM/SIB for `dst, [rsi + rax + disp32]`.
    fn encoding(self) -> &'static [u8] {
        match self {
            LoadKind::I32 => &[0x8b, 0x84, 0x06],               // mov eax, dword
            LoadKind::I64 => &[0x48, 0x8b, 0x84, 0x06],         // mov rax, qword
            LoadKind::I32S8 => &[0x0f, 0xbe, 0x84, 0x06],       // movsx eax, byte
            LoadKind::I32U8 => &[0x0f, 0xb6, 0x84, 0x06],       // movzx eax, byte
            LoadKind::I32S16 => &[0x0f, 0xbf, 0x84, 0x06],      // movsx eax, word
            LoadKind::I32U16 => &[0x0f, 0xb7, 0x84, 0x06],      // movzx eax, word
            LoadKind::I64S8 => &[0x48, 0x0f, 0xbe, 0x84, 0x06], // movsx rax, byte
            LoadKind::I64S16 => &[0x48, 0x0f, 0xbf, 0x84, 0x06], // movsx rax, word
            LoadKind::I64S32 => &[0x48, 0x63, 0x84, 0x06],      // movsxd rax, dword
        }
    }
}

/// Memory store width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWidth {
    W8,
    W16,
    W32,
    W64,
}

impl StoreWidth {
    /// Opcode and ModRM/SIB for `[rsi + rcx + disp32], src`.
    fn encoding(self) -> &'static [u8] {
        match self {
            StoreWidth::W8 => &[0x88, 0x84, 0x0e],        // mov byte, al
            StoreWidth::W16 => &[0x66, 0x89, 0x84, 0x0e], // mov word, ax
            StoreWidth::W32 => &[0x89, 0x84, 0x0e],       // mov dword, eax
            StoreWidth::W64 => &[0x48, 0x89, 0x84, 0x0e], // mov qword, rax
        }
    }
}

const REX_W: u8 = 0x48;

// =============================================================================
// x86_64 Emitter
// =============================================================================

/// Stack-machine emitter over a [`CodeBuffer`].
pub struct X86_64Emitter<'a> {
    code: CodeBuffer<'a>,
    /// Leave-block sequences emitted so far.
    leave_sequences: u32,
}

impl<'a> X86_64Emitter<'a> {
    pub fn new(code: CodeBuffer<'a>) -> Self {
        Self {
            code,
            leave_sequences: 0,
        }
    }

    pub fn code(&mut self) -> &mut CodeBuffer<'a> {
        &mut self.code
    }

    pub fn position(&self) -> CodeOffset {
        self.code.position()
    }

    pub fn leave_sequences(&self) -> u32 {
        self.leave_sequences
    }

    pub fn finish(self) -> CodeBuffer<'a> {
        self.code
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.code.emit_bytes(bytes)
    }

    fn emit_wide(&mut self, wide: bool, bytes: &[u8]) -> Result<()> {
        if wide {
            self.code.emit_u8(REX_W)?;
        }
        self.code.emit_bytes(bytes)
    }

    // -------------------------------------------------------------------------
    // Operand stack
    // -------------------------------------------------------------------------

    /// MOV [rdi], rax; ADD rdi, 8
    pub fn push_expand(&mut self) -> Result<()> {
        self.emit(&[0x48, 0x89, 0x07, 0x48, 0x83, 0xc7, 0x08])
    }

    /// MOV rax, [rdi - 8]; LEA rdi, [rdi - 8]
    ///
    /// Leaves the flags untouched so it can sit between a test and its jump.
    pub fn pop_contract(&mut self) -> Result<()> {
        self.emit(&[0x48, 0x8b, 0x47, 0xf8, 0x48, 0x8d, 0x7f, 0xf8])
    }

    /// MOV rcx, rax; MOV rax, [rdi - 8]; SUB rdi, 8
    ///
    /// Afterwards `rax` holds the left operand and `rcx` the right one.
    pub fn pop_operands(&mut self) -> Result<()> {
        self.emit(&[0x48, 0x89, 0xc1, 0x48, 0x8b, 0x47, 0xf8, 0x48, 0x83, 0xef, 0x08])
    }

    /// MOV rcx, [rdi - 8]; SUB rdi, 8
    ///
    /// Afterwards `rcx` holds the second-from-top value and `rax` the top.
    pub fn pop_second(&mut self) -> Result<()> {
        self.emit(&[0x48, 0x8b, 0x4f, 0xf8, 0x48, 0x83, 0xef, 0x08])
    }

    /// Push a 32-bit constant, zero-extended.
    pub fn push_const32(&mut self, value: u32) -> Result<()> {
        self.push_expand()?;
        if value == 0 {
            self.emit(&[0x31, 0xc0]) // xor eax, eax
        } else {
            self.code.emit_u8(0xb8)?; // mov eax, imm32
            self.code.emit_u32(value)
        }
    }

    /// Push a 64-bit constant.
    pub fn push_const64(&mut self, value: u64) -> Result<()> {
        if let Ok(narrow) = u32::try_from(value) {
            return self.push_const32(narrow);
        }
        self.push_expand()?;
        self.emit(&[0x48, 0xb8])?; // movabs rax, imm64
        self.code.emit_u64(value)
    }

    /// Discard the top of stack.
    pub fn drop_top(&mut self) -> Result<()> {
        self.pop_contract()
    }

    /// Pop condition, then the two candidates; keep the first if the
    /// condition is nonzero, else the second.
    pub fn select(&mut self) -> Result<()> {
        self.emit(&[
            0x48, 0x83, 0xef, 0x10, // sub rdi, 16
            0x31, 0xc9, // xor ecx, ecx
            0x85, 0xc0, // test eax, eax
            0x75, 0x04, // jnz +4
            0x48, 0x83, 0xc1, 0x08, // add rcx, 8
            0x48, 0x8b, 0x04, 0x0f, // mov rax, [rdi + rcx]
        ])
    }

    // -------------------------------------------------------------------------
    // Locals and globals
    // -------------------------------------------------------------------------

    /// MOV rax, [rbx + idx * 8] after spilling.
    pub fn get_local(&mut self, idx: u32) -> Result<()> {
        self.push_expand()?;
        self.emit(&[0x48, 0x8b, 0x83])?;
        self.code.emit_u32(idx * 8)
    }

    /// MOV [rbx + idx * 8], rax, optionally popping afterwards.
    pub fn set_local(&mut self, idx: u32, pop: bool) -> Result<()> {
        self.emit(&[0x48, 0x89, 0x83])?;
        self.code.emit_u32(idx * 8)?;
        if pop {
            self.pop_contract()?;
        }
        Ok(())
    }

    /// MOV rcx, [r15 + globals]
    fn load_globals_base(&mut self) -> Result<()> {
        self.emit(&[0x49, 0x8b, 0x8f])?;
        self.code.emit_u32(field::GLOBALS)
    }

    /// Push the runtime slot of a mutable global.
    pub fn get_global(&mut self, idx: u32) -> Result<()> {
        self.push_expand()?;
        self.load_globals_base()?;
        self.emit(&[0x48, 0x8b, 0x81])?; // mov rax, [rcx + disp32]
        self.code.emit_u32(idx * 8)
    }

    /// Pop into the runtime slot of a mutable global.
    pub fn set_global(&mut self, idx: u32) -> Result<()> {
        self.load_globals_base()?;
        self.emit(&[0x48, 0x89, 0x81])?; // mov [rcx + disp32], rax
        self.code.emit_u32(idx * 8)?;
        self.pop_contract()
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    /// Replace the address on top of stack with the loaded value.
    pub fn load(&mut self, kind: LoadKind, offset: u32) -> Result<()> {
        self.emit(kind.encoding())?;
        self.code.emit_u32(offset)
    }

    /// Pop value and address, store the value's low `width` bytes.
    pub fn store(&mut self, width: StoreWidth, offset: u32) -> Result<()> {
        self.pop_second()?;
        self.emit(width.encoding())?;
        self.code.emit_u32(offset)?;
        self.pop_contract()
    }

    /// Push the current page count.
    pub fn memory_size(&mut self) -> Result<()> {
        self.push_expand()?;
        self.emit(&[0x49, 0x8b, 0x87])?; // mov rax, [r15 + disp32]
        self.code.emit_u32(field::MEMORY_PAGES)
    }

    /// CALL the shared grow stub; the delta in `eax` becomes the old size.
    pub fn grow_memory(&mut self, stub: CodeOffset) -> Result<()> {
        self.code.emit_u8(0xe8)?;
        self.code.emit_rel32(stub)
    }

    // -------------------------------------------------------------------------
    // Arithmetic and comparisons
    // -------------------------------------------------------------------------

    pub fn binary(&mut self, op: BinaryOp, wide: bool) -> Result<()> {
        self.pop_operands()?;
        self.emit_wide(wide, op.encoding())
    }

    /// Pop two operands and push 1 if `lhs cond rhs`, else 0.
    pub fn compare(&mut self, cond: Cond, wide: bool) -> Result<()> {
        self.pop_operands()?;
        self.emit_wide(wide, &[0x39, 0xc8])?; // cmp eax, ecx
        self.emit(&[0x0f, cond.setcc(), 0xc0, 0x0f, 0xb6, 0xc0]) // setcc al; movzx eax, al
    }

    /// Replace the top of stack with 1 if it is zero, else 0.
    pub fn eqz(&mut self, wide: bool) -> Result<()> {
        self.emit_wide(wide, &[0x85, 0xc0])?; // test eax, eax
        self.emit(&[0x0f, 0x94, 0xc0, 0x0f, 0xb6, 0xc0]) // sete al; movzx eax, al
    }

    pub fn count(&mut self, op: CountOp, wide: bool) -> Result<()> {
        let bits: u8 = if wide { 64 } else { 32 };
        match op {
            CountOp::Popcnt => {
                self.code.emit_u8(0xf3)?;
                self.emit_wide(wide, &[0x0f, 0xb8, 0xc0]) // popcnt eax, eax
            }
            CountOp::Ctz => {
                self.emit(&[0xb9, bits, 0, 0, 0])?; // mov ecx, bits
                self.emit_wide(wide, &[0x0f, 0xbc, 0xc0])?; // bsf eax, eax
                self.emit_wide(wide, &[0x0f, 0x44, 0xc1]) // cmovz eax, ecx
            }
            CountOp::Clz => {
                self.emit_wide(wide, &[0xc7, 0xc1, 0xff, 0xff, 0xff, 0xff])?; // mov ecx, -1
                self.emit_wide(wide, &[0x0f, 0xbd, 0xc0])?; // bsr eax, eax
                self.emit_wide(wide, &[0x0f, 0x44, 0xc1])?; // cmovz eax, ecx
                self.emit(&[0xb9, bits - 1, 0, 0, 0])?; // mov ecx, bits - 1
                self.emit_wide(wide, &[0x29, 0xc1])?; // sub ecx, eax
                self.emit_wide(wide, &[0x89, 0xc8]) // mov eax, ecx
            }
        }
    }

    /// MOV eax, eax: drop the upper half.
    pub fn wrap_i64(&mut self) -> Result<()> {
        self.emit(&[0x89, 0xc0])
    }

    /// MOVSXD rax, eax
    pub fn extend_i32_s(&mut self) -> Result<()> {
        self.emit(&[0x48, 0x63, 0xc0])
    }

    /// UD2: unimplemented operation, fatal at execution time.
    pub fn trap(&mut self) -> Result<()> {
        self.emit(&[0x0f, 0x0b])
    }

    // -------------------------------------------------------------------------
    // Blocks and branches
    // -------------------------------------------------------------------------

    /// Spill the accumulator and save the stack pointer on the native stack.
    pub fn enter_block(&mut self) -> Result<()> {
        self.push_expand()?;
        self.code.emit_u8(0x57) // push rdi
    }

    /// Restore the stack pointer saved by `enter_block`. Without a value the
    /// spilled accumulator is reloaded too.
    pub fn leave_block(&mut self, has_value: bool) -> Result<()> {
        self.leave_sequences += 1;
        self.code.emit_u8(0x5f)?; // pop rdi
        if !has_value {
            self.pop_contract()?;
        }
        Ok(())
    }

    /// ADD rsp, blocks * 8: forget the saved stack pointers of open blocks.
    pub fn unwind_blocks(&mut self, blocks: u32) -> Result<()> {
        if blocks == 0 {
            return Ok(());
        }
        self.emit(&[0x48, 0x81, 0xc4])?;
        self.code.emit_u32(blocks * 8)
    }

    /// Pop the condition; jump forward to a patch site when it is zero.
    pub fn jump_if_zero(&mut self) -> Result<PatchSite> {
        self.emit(&[0x85, 0xc0])?; // test eax, eax
        self.pop_contract()?;
        self.emit(&[0x0f, 0x84])?; // jz rel32
        self.code.emit_placeholder()
    }

    /// JMP rel32 to a target that is patched later.
    pub fn jump(&mut self) -> Result<PatchSite> {
        self.code.emit_u8(0xe9)?;
        self.code.emit_placeholder()
    }

    /// JMP rel32 to a known target.
    pub fn jump_to(&mut self, target: CodeOffset) -> Result<()> {
        self.code.emit_u8(0xe9)?;
        self.code.emit_rel32(target)
    }

    pub fn patch(&mut self, site: PatchSite, target: CodeOffset) {
        self.code.patch(site, target);
    }

    /// Move the selector aside, pop it, point `rcx` at the jump table that
    /// follows, and jump to the dispatch stub.
    ///
    /// Returns the offset of the table: a `u32` entry count followed by
    /// `count + 1` displacements relative to the table start.
    pub fn br_table_dispatch(&mut self, stub: CodeOffset, count: u32) -> Result<CodeOffset> {
        self.emit(&[0x89, 0xc2])?; // mov edx, eax
        self.pop_contract()?;
        // lea rcx, [rip + 5]: the table sits right after the 5-byte jump.
        self.emit(&[0x48, 0x8d, 0x0d])?;
        self.code.emit_u32(5)?;
        self.code.emit_u8(0xe9)?;
        self.code.emit_rel32(stub)?;
        let table = self.code.reserve(4 + 4 * (count as usize + 1))?;
        self.code.write_u32_at(table, count);
        Ok(table)
    }

    /// Point jump-table entry `index` at `target`.
    pub fn set_table_entry(&mut self, table: CodeOffset, index: u32, target: CodeOffset) {
        let slot = CodeOffset(table.0 + 4 + 4 * index);
        self.code.write_u32_at(slot, target.0.wrapping_sub(table.0));
    }

    // -------------------------------------------------------------------------
    // Functions
    // -------------------------------------------------------------------------

    /// Check the frame fits the locals buffer, then zero the declared locals.
    pub fn prologue(&mut self, params: u32, declared: u32) -> Result<()> {
        let frame = (params + declared) * 8;
        self.emit(&[0x48, 0x8d, 0x8b])?; // lea rcx, [rbx + frame]
        self.code.emit_u32(frame)?;
        self.emit(&[0x49, 0x3b, 0x8f])?; // cmp rcx, [r15 + locals_end]
        self.code.emit_u32(field::LOCALS_END)?;
        self.emit(&[0x76, 0x02])?; // jbe +2
        self.trap()?;
        if declared == 0 {
            return Ok(());
        }
        self.emit(&[0x48, 0x89, 0xfa])?; // mov rdx, rdi
        self.emit(&[0x48, 0x8d, 0xbb])?; // lea rdi, [rbx + params * 8]
        self.code.emit_u32(params * 8)?;
        self.code.emit_u8(0xb9)?; // mov ecx, declared
        self.code.emit_u32(declared)?;
        self.emit(&[0x31, 0xc0])?; // xor eax, eax
        self.emit(&[0xf3, 0x48, 0xab])?; // rep stosq
        self.emit(&[0x48, 0x89, 0xd7]) // mov rdi, rdx
    }

    /// RET
    pub fn epilogue(&mut self) -> Result<()> {
        self.code.emit_u8(0xc3)
    }

    /// Move the caller's frame past its locals and pop the arguments into
    /// the callee's frame, last parameter first.
    fn enter_frame(&mut self, caller_frame: u32, params: u32) -> Result<()> {
        if caller_frame > 0 {
            self.emit(&[0x48, 0x81, 0xc3])?; // add rbx, imm32
            self.code.emit_u32(caller_frame * 8)?;
        }
        for idx in (0..params).rev() {
            self.set_local(idx, true)?;
        }
        self.push_expand()?;
        self.code.emit_u8(0x57) // push rdi
    }

    fn leave_frame(&mut self, caller_frame: u32, has_return: bool) -> Result<()> {
        self.code.emit_u8(0x5f)?; // pop rdi
        if caller_frame > 0 {
            self.emit(&[0x48, 0x81, 0xeb])?; // sub rbx, imm32
            self.code.emit_u32(caller_frame * 8)?;
        }
        if !has_return {
            self.pop_contract()?;
        }
        Ok(())
    }

    /// Call through the function-pointer slot at `slot`.
    pub fn call(
        &mut self,
        slot: CodeOffset,
        caller_frame: u32,
        params: u32,
        has_return: bool,
    ) -> Result<()> {
        self.enter_frame(caller_frame, params)?;
        self.emit(&[0xff, 0x15])?; // call [rip + rel32]
        self.code.emit_rel32(slot)?;
        self.leave_frame(caller_frame, has_return)
    }

    /// Call through the indirect-call stub with the table index on top of
    /// the stack and the expected canonical type in `ecx`.
    pub fn call_indirect(
        &mut self,
        stub: CodeOffset,
        type_id: u32,
        caller_frame: u32,
        params: u32,
        has_return: bool,
    ) -> Result<()> {
        self.emit(&[0x89, 0xc2])?; // mov edx, eax
        self.pop_contract()?;
        self.enter_frame(caller_frame, params)?;
        self.code.emit_u8(0xb9)?; // mov ecx, type_id
        self.code.emit_u32(type_id)?;
        self.code.emit_u8(0xe8)?; // call rel32
        self.code.emit_rel32(stub)?;
        self.leave_frame(caller_frame, has_return)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut X86_64Emitter<'_>) -> Result<()>) -> Vec<u8> {
        let mut bytes = vec![0u8; 256];
        let mut emitter = X86_64Emitter::new(CodeBuffer::new(&mut bytes, 0));
        f(&mut emitter).unwrap();
        emitter.finish().bytes().to_vec()
    }

    #[test]
    fn test_push_constants() {
        assert_eq!(
            emitted(|e| e.push_const32(42)),
            [0x48, 0x89, 0x07, 0x48, 0x83, 0xc7, 0x08, 0xb8, 42, 0, 0, 0]
        );
        assert_eq!(emitted(|e| e.push_const64(0)).len(), 7 + 2);
        let wide = emitted(|e| e.push_const64(1 << 40));
        assert_eq!(&wide[7..9], &[0x48, 0xb8]);
        assert_eq!(&wide[9..], &(1u64 << 40).to_le_bytes());
    }

    #[test]
    fn test_local_displacements_are_scaled() {
        let code = emitted(|e| e.get_local(3));
        assert_eq!(&code[7..], &[0x48, 0x8b, 0x83, 24, 0, 0, 0]);
        let code = emitted(|e| e.set_local(2, false));
        assert_eq!(code, [0x48, 0x89, 0x83, 16, 0, 0, 0]);
    }

    #[test]
    fn test_store_indexes_with_rcx() {
        let code = emitted(|e| e.store(StoreWidth::W32, 4));
        assert_eq!(&code[8..15], &[0x89, 0x84, 0x0e, 4, 0, 0, 0]);
    }

    #[test]
    fn test_unsigned_greater_uses_above() {
        let code = emitted(|e| e.compare(Cond::GtU, false));
        assert_eq!(&code[11..], &[0x39, 0xc8, 0x0f, 0x97, 0xc0, 0x0f, 0xb6, 0xc0]);
        let code = emitted(|e| e.compare(Cond::LtS, true));
        assert_eq!(&code[11..14], &[0x48, 0x39, 0xc8]);
    }

    #[test]
    fn test_forward_jump_patching() {
        let mut bytes = vec![0u8; 64];
        let mut emitter = X86_64Emitter::new(CodeBuffer::new(&mut bytes, 0));
        let site = emitter.jump().unwrap();
        emitter.trap().unwrap();
        let target = emitter.position();
        emitter.patch(site, target);
        // jmp over the two-byte ud2.
        assert_eq!(emitter.finish().bytes(), &[0xe9, 2, 0, 0, 0, 0x0f, 0x0b]);
    }

    #[test]
    fn test_backward_jump() {
        let code = emitted(|e| {
            e.code().emit_bytes(&[0x90; 3])?;
            e.jump_to(CodeOffset(0))
        });
        // Target 0 from next_ip 8.
        assert_eq!(&code[3..], &[0xe9, 0xf8, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_leave_block_counts_sequences() {
        let mut bytes = vec![0u8; 64];
        let mut emitter = X86_64Emitter::new(CodeBuffer::new(&mut bytes, 0));
        emitter.leave_block(true).unwrap();
        emitter.leave_block(false).unwrap();
        assert_eq!(emitter.leave_sequences(), 2);
        assert_eq!(
            emitter.finish().bytes(),
            &[0x5f, 0x5f, 0x48, 0x8b, 0x47, 0xf8, 0x48, 0x8d, 0x7f, 0xf8]
        );
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut bytes = vec![0u8; 4];
        let mut emitter = X86_64Emitter::new(CodeBuffer::new(&mut bytes, 0));
        assert_eq!(emitter.push_const32(1), Err(WaveError::CodeBufferExhausted));
    }

    #[test]
    fn test_br_table_layout() {
        let mut bytes = vec![0u8; 128];
        let mut emitter = X86_64Emitter::new(CodeBuffer::new(&mut bytes, 0));
        let table = emitter.br_table_dispatch(CodeOffset(100), 2).unwrap();
        // mov edx, eax (2) + pop (8) + lea (7) + jmp (5)
        assert_eq!(table, CodeOffset(22));
        emitter.set_table_entry(table, 2, CodeOffset(50));
        let code = emitter.finish();
        assert_eq!(&code.bytes()[22..26], &2u32.to_le_bytes());
        assert_eq!(&code.bytes()[34..38], &28u32.to_le_bytes());
        assert_eq!(code.bytes().len(), 22 + 16);
    }
}
