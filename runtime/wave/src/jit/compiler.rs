//! # Function Compiler
//!
//! Single pass over one function body. Each opcode maps to a fixed emitter
//! sequence; structured control flow is tracked on a stack of open blocks.
//!
//! ## Blocks
//!
//! Entering a block spills the accumulator and pushes `rdi` on the native
//! stack. Leaving it pops `rdi` back, and reloads the accumulator unless the
//! block produced a value. A branch out of `d` nested blocks therefore emits
//! `d` value-preserving leave sequences plus one for the target with its real
//! arity. Forward branches are queued on the target block and patched when its
//! `end` is reached; loop headers are known, so backward branches are encoded
//! directly.

use crate::error::{Result, WaveError};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::reader::BinaryReader;
use crate::types::ValueKind;

use super::stubs::Stubs;
use super::x86_64::{
    BinaryOp, CodeBuffer, CodeOffset, Cond, CountOp, LoadKind, PatchSite, StoreWidth,
    X86_64Emitter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    If,
}

/// One open block.
#[derive(Debug)]
struct BlockContext {
    kind: BlockKind,
    result: Option<ValueKind>,
    /// Loop header, known on entry.
    header: Option<CodeOffset>,
    /// Forward jumps to the block's exit.
    fixups: Vec<PatchSite>,
    /// Conditional skip over the `then` arm, until `else` is seen.
    else_site: Option<PatchSite>,
}

impl BlockContext {
    /// Whether a branch to this label carries a value.
    fn label_carries_value(&self) -> bool {
        self.kind != BlockKind::Loop && self.result.is_some()
    }
}

/// Result of compiling one body.
#[derive(Debug)]
pub struct CompiledBody {
    pub entry: CodeOffset,
    pub end: CodeOffset,
    /// Directly called functions, in first-call order.
    pub callees: Vec<u32>,
    pub leave_sequences: u32,
}

/// Compiler for one module-defined function.
pub struct FunctionCompiler<'m, 'c> {
    module: &'m Module,
    stubs: &'m Stubs,
    func: u32,
    params: u32,
    frame_slots: u32,
    has_return: bool,
    emitter: X86_64Emitter<'c>,
    blocks: Vec<BlockContext>,
    callees: Vec<u32>,
}

impl<'m, 'c> FunctionCompiler<'m, 'c> {
    pub fn new(
        module: &'m Module,
        stubs: &'m Stubs,
        func: u32,
        code: CodeBuffer<'c>,
    ) -> Result<Self> {
        let ty = module
            .function_type(func)
            .ok_or_else(|| WaveError::OutOfBounds(format!("function {func}")))?;
        let frame_slots = module
            .frame_slots(func)
            .ok_or_else(|| WaveError::OutOfBounds(format!("function {func} has no body")))?;
        // Frame displacements are signed 32-bit.
        if frame_slots > i32::MAX as u32 / 8 {
            return Err(WaveError::OutOfBounds(format!(
                "function {func} has {frame_slots} locals"
            )));
        }
        Ok(Self {
            module,
            stubs,
            func,
            params: ty.params.len() as u32,
            frame_slots,
            has_return: ty.has_return(),
            emitter: X86_64Emitter::new(code),
            blocks: Vec::new(),
            callees: Vec::new(),
        })
    }

    /// Compile the body and return where it landed.
    pub fn compile(mut self) -> Result<CompiledBody> {
        let module = self.module;
        let body = module
            .body(self.func)
            .ok_or_else(|| WaveError::OutOfBounds(format!("function {} has no body", self.func)))?;

        self.emitter.code().align(16)?;
        let entry = self.emitter.position();
        self.emitter
            .prologue(self.params, self.frame_slots - self.params)?;

        let mut reader = BinaryReader::new(&body.code);
        loop {
            if reader.is_empty() {
                // Missing final `end`: return from wherever we are.
                self.emit_return()?;
                break;
            }
            let at = reader.position();
            let byte = reader.read_u8()?;
            let op = Opcode::from_byte(byte).ok_or(WaveError::InvalidOpcode(byte))?;
            log::trace!(
                "fn[{}] {at:#06x} -> {:#x}: {}",
                self.func,
                self.emitter.position().0,
                op.name()
            );
            if self.compile_op(op, &mut reader)? {
                if !reader.is_empty() {
                    return Err(WaveError::MalformedSection(format!(
                        "{} bytes after the final end of function {}",
                        reader.remaining(),
                        self.func
                    )));
                }
                break;
            }
        }

        Ok(CompiledBody {
            entry,
            end: self.emitter.position(),
            callees: self.callees,
            leave_sequences: self.emitter.leave_sequences(),
        })
    }

    /// Compile one instruction. Returns `true` at the function's final `end`.
    fn compile_op(&mut self, op: Opcode, reader: &mut BinaryReader<'_>) -> Result<bool> {
        let e = &mut self.emitter;
        match op {
            Opcode::Unreachable => e.trap()?,
            Opcode::Nop => {}

            Opcode::Block => {
                let result = read_block_type(reader)?;
                self.emitter.enter_block()?;
                self.open(BlockKind::Block, result, None, None);
            }
            Opcode::Loop => {
                let result = read_block_type(reader)?;
                let header = self.emitter.position();
                self.emitter.enter_block()?;
                self.open(BlockKind::Loop, result, Some(header), None);
            }
            Opcode::If => {
                let result = read_block_type(reader)?;
                let skip = self.emitter.jump_if_zero()?;
                self.emitter.enter_block()?;
                self.open(BlockKind::If, result, None, Some(skip));
            }
            Opcode::Else => self.compile_else()?,
            Opcode::End => return self.compile_end(),

            Opcode::Br => {
                let depth = reader.read_var_u32()?;
                self.branch(depth)?;
            }
            Opcode::BrIf => {
                let depth = reader.read_var_u32()?;
                let skip = self.emitter.jump_if_zero()?;
                self.branch(depth)?;
                let here = self.emitter.position();
                self.emitter.patch(skip, here);
            }
            Opcode::BrTable => self.compile_br_table(reader)?,
            Opcode::Return => self.emit_return()?,

            Opcode::Call => {
                let callee = reader.read_var_u32()?;
                self.compile_call(callee)?;
            }
            Opcode::CallIndirect => {
                let type_index = reader.read_var_u32()?;
                let reserved = reader.read_u8()?;
                if reserved != 0 {
                    return Err(WaveError::MalformedSection(format!(
                        "call_indirect reserved byte {reserved:#x}"
                    )));
                }
                self.compile_call_indirect(type_index)?;
            }

            Opcode::Drop => e.drop_top()?,
            Opcode::Select => e.select()?,

            Opcode::GetLocal => {
                let idx = self.local_index(reader)?;
                self.emitter.get_local(idx)?;
            }
            Opcode::SetLocal => {
                let idx = self.local_index(reader)?;
                self.emitter.set_local(idx, true)?;
            }
            Opcode::TeeLocal => {
                let idx = self.local_index(reader)?;
                self.emitter.set_local(idx, false)?;
            }
            Opcode::GetGlobal => self.compile_get_global(reader)?,
            Opcode::SetGlobal => {
                let idx = reader.read_var_u32()?;
                match self.module.globals.get(idx as usize) {
                    Some(global) if global.mutable => self.emitter.set_global(idx)?,
                    Some(_) => {
                        return Err(WaveError::MalformedSection(format!(
                            "set_global on immutable global {idx}"
                        )))
                    }
                    None => return Err(WaveError::OutOfBounds(format!("global {idx}"))),
                }
            }

            Opcode::I32Load => self.load(reader, LoadKind::I32)?,
            Opcode::I64Load => self.load(reader, LoadKind::I64)?,
            Opcode::I32Load8S => self.load(reader, LoadKind::I32S8)?,
            Opcode::I32Load8U | Opcode::I64Load8U => self.load(reader, LoadKind::I32U8)?,
            Opcode::I32Load16S => self.load(reader, LoadKind::I32S16)?,
            Opcode::I32Load16U | Opcode::I64Load16U => self.load(reader, LoadKind::I32U16)?,
            Opcode::I64Load8S => self.load(reader, LoadKind::I64S8)?,
            Opcode::I64Load16S => self.load(reader, LoadKind::I64S16)?,
            Opcode::I64Load32S => self.load(reader, LoadKind::I64S32)?,
            Opcode::I64Load32U => self.load(reader, LoadKind::I32)?,
            Opcode::I32Store | Opcode::I64Store32 => self.store(reader, StoreWidth::W32)?,
            Opcode::I64Store => self.store(reader, StoreWidth::W64)?,
            Opcode::I32Store8 | Opcode::I64Store8 => self.store(reader, StoreWidth::W8)?,
            Opcode::I32Store16 | Opcode::I64Store16 => self.store(reader, StoreWidth::W16)?,
            Opcode::F32Load | Opcode::F64Load | Opcode::F32Store | Opcode::F64Store => {
                read_offset(reader)?;
                self.emitter.trap()?;
            }
            Opcode::CurrentMemory => {
                read_memory_index(reader)?;
                self.emitter.memory_size()?;
            }
            Opcode::GrowMemory => {
                read_memory_index(reader)?;
                self.emitter.grow_memory(self.stubs.grow_memory)?;
            }

            Opcode::I32Const => {
                let value = reader.read_var_i32()?;
                e.push_const32(value as u32)?;
            }
            Opcode::I64Const => {
                let value = reader.read_var_i64()?;
                e.push_const64(value as u64)?;
            }
            Opcode::F32Const => {
                reader.read_u32_le()?;
                e.trap()?;
            }
            Opcode::F64Const => {
                reader.read_u64_le()?;
                e.trap()?;
            }

            Opcode::I32Eqz => e.eqz(false)?,
            Opcode::I64Eqz => e.eqz(true)?,
            Opcode::I32Eq => e.compare(Cond::Eq, false)?,
            Opcode::I32Ne => e.compare(Cond::Ne, false)?,
            Opcode::I32LtS => e.compare(Cond::LtS, false)?,
            Opcode::I32LtU => e.compare(Cond::LtU, false)?,
            Opcode::I32GtS => e.compare(Cond::GtS, false)?,
            Opcode::I32GtU => e.compare(Cond::GtU, false)?,
            Opcode::I32LeS => e.compare(Cond::LeS, false)?,
            Opcode::I32LeU => e.compare(Cond::LeU, false)?,
            Opcode::I32GeS => e.compare(Cond::GeS, false)?,
            Opcode::I32GeU => e.compare(Cond::GeU, false)?,
            Opcode::I64Eq => e.compare(Cond::Eq, true)?,
            Opcode::I64Ne => e.compare(Cond::Ne, true)?,
            Opcode::I64LtS => e.compare(Cond::LtS, true)?,
            Opcode::I64LtU => e.compare(Cond::LtU, true)?,
            Opcode::I64GtS => e.compare(Cond::GtS, true)?,
            Opcode::I64GtU => e.compare(Cond::GtU, true)?,
            Opcode::I64LeS => e.compare(Cond::LeS, true)?,
            Opcode::I64LeU => e.compare(Cond::LeU, true)?,
            Opcode::I64GeS => e.compare(Cond::GeS, true)?,
            Opcode::I64GeU => e.compare(Cond::GeU, true)?,

            Opcode::I32Clz => e.count(CountOp::Clz, false)?,
            Opcode::I32Ctz => e.count(CountOp::Ctz, false)?,
            Opcode::I32Popcnt => e.count(CountOp::Popcnt, false)?,
            Opcode::I64Clz => e.count(CountOp::Clz, true)?,
            Opcode::I64Ctz => e.count(CountOp::Ctz, true)?,
            Opcode::I64Popcnt => e.count(CountOp::Popcnt, true)?,

            Opcode::I32Add => e.binary(BinaryOp::Add, false)?,
            Opcode::I32Sub => e.binary(BinaryOp::Sub, false)?,
            Opcode::I32Mul => e.binary(BinaryOp::Mul, false)?,
            Opcode::I32And => e.binary(BinaryOp::And, false)?,
            Opcode::I32Or => e.binary(BinaryOp::Or, false)?,
            Opcode::I32Xor => e.binary(BinaryOp::Xor, false)?,
            Opcode::I32Shl => e.binary(BinaryOp::Shl, false)?,
            Opcode::I32ShrS => e.binary(BinaryOp::ShrS, false)?,
            Opcode::I32ShrU => e.binary(BinaryOp::ShrU, false)?,
            Opcode::I32Rotl => e.binary(BinaryOp::Rotl, false)?,
            Opcode::I32Rotr => e.binary(BinaryOp::Rotr, false)?,
            Opcode::I64Add => e.binary(BinaryOp::Add, true)?,
            Opcode::I64Sub => e.binary(BinaryOp::Sub, true)?,
            Opcode::I64Mul => e.binary(BinaryOp::Mul, true)?,
            Opcode::I64And => e.binary(BinaryOp::And, true)?,
            Opcode::I64Or => e.binary(BinaryOp::Or, true)?,
            Opcode::I64Xor => e.binary(BinaryOp::Xor, true)?,
            Opcode::I64Shl => e.binary(BinaryOp::Shl, true)?,
            Opcode::I64ShrS => e.binary(BinaryOp::ShrS, true)?,
            Opcode::I64ShrU => e.binary(BinaryOp::ShrU, true)?,
            Opcode::I64Rotl => e.binary(BinaryOp::Rotl, true)?,
            Opcode::I64Rotr => e.binary(BinaryOp::Rotr, true)?,

            // Division can fault on its own; it is not lowered.
            Opcode::I32DivS
            | Opcode::I32DivU
            | Opcode::I32RemS
            | Opcode::I32RemU
            | Opcode::I64DivS
            | Opcode::I64DivU
            | Opcode::I64RemS
            | Opcode::I64RemU => e.trap()?,

            Opcode::I32WrapI64 => e.wrap_i64()?,
            Opcode::I64ExtendSI32 => e.extend_i32_s()?,
            Opcode::I64ExtendUI32 => {}

            Opcode::F32Eq
            | Opcode::F32Ne
            | Opcode::F32Lt
            | Opcode::F32Gt
            | Opcode::F32Le
            | Opcode::F32Ge
            | Opcode::F64Eq
            | Opcode::F64Ne
            | Opcode::F64Lt
            | Opcode::F64Gt
            | Opcode::F64Le
            | Opcode::F64Ge
            | Opcode::F32Abs
            | Opcode::F32Neg
            | Opcode::F32Ceil
            | Opcode::F32Floor
            | Opcode::F32Trunc
            | Opcode::F32Nearest
            | Opcode::F32Sqrt
            | Opcode::F32Add
            | Opcode::F32Sub
            | Opcode::F32Mul
            | Opcode::F32Div
            | Opcode::F32Min
            | Opcode::F32Max
            | Opcode::F32Copysign
            | Opcode::F64Abs
            | Opcode::F64Neg
            | Opcode::F64Ceil
            | Opcode::F64Floor
            | Opcode::F64Trunc
            | Opcode::F64Nearest
            | Opcode::F64Sqrt
            | Opcode::F64Add
            | Opcode::F64Sub
            | Opcode::F64Mul
            | Opcode::F64Div
            | Opcode::F64Min
            | Opcode::F64Max
            | Opcode::F64Copysign
            | Opcode::I32TruncSF32
            | Opcode::I32TruncUF32
            | Opcode::I32TruncSF64
            | Opcode::I32TruncUF64
            | Opcode::I64TruncSF32
            | Opcode::I64TruncUF32
            | Opcode::I64TruncSF64
            | Opcode::I64TruncUF64
            | Opcode::F32ConvertSI32
            | Opcode::F32ConvertUI32
            | Opcode::F32ConvertSI64
            | Opcode::F32ConvertUI64
            | Opcode::F32DemoteF64
            | Opcode::F64ConvertSI32
            | Opcode::F64ConvertUI32
            | Opcode::F64ConvertSI64
            | Opcode::F64ConvertUI64
            | Opcode::F64PromoteF32
            | Opcode::I32ReinterpretF32
            | Opcode::I64ReinterpretF64
            | Opcode::F32ReinterpretI32
            | Opcode::F64ReinterpretI64 => e.trap()?,
        }
        Ok(false)
    }

    fn open(
        &mut self,
        kind: BlockKind,
        result: Option<ValueKind>,
        header: Option<CodeOffset>,
        else_site: Option<PatchSite>,
    ) {
        self.blocks.push(BlockContext {
            kind,
            result,
            header,
            fixups: Vec::new(),
            else_site,
        });
    }

    fn compile_else(&mut self) -> Result<()> {
        let func = self.func;
        let block = self
            .blocks
            .last_mut()
            .filter(|block| block.kind == BlockKind::If)
            .ok_or_else(|| WaveError::MalformedSection(format!("else outside if in function {func}")))?;
        let skip = block.else_site.take().ok_or_else(|| {
            WaveError::MalformedSection(format!("second else in function {func}"))
        })?;
        let has_value = block.result.is_some();

        self.emitter.leave_block(has_value)?;
        let exit = self.emitter.jump()?;
        let here = self.emitter.position();
        self.emitter.patch(skip, here);
        self.emitter.enter_block()?;
        if let Some(block) = self.blocks.last_mut() {
            block.fixups.push(exit);
        }
        Ok(())
    }

    fn compile_end(&mut self) -> Result<bool> {
        let Some(block) = self.blocks.pop() else {
            self.emitter.epilogue()?;
            return Ok(true);
        };
        self.emitter.leave_block(block.result.is_some())?;
        let here = self.emitter.position();
        for site in block.fixups.into_iter().chain(block.else_site) {
            self.emitter.patch(site, here);
        }
        Ok(false)
    }

    /// Whether a branch to `depth` carries a value.
    fn label_carries_value(&self, depth: u32) -> Result<bool> {
        let open = self.blocks.len() as u32;
        if depth == open {
            return Ok(self.has_return);
        }
        let idx = depth
            .checked_add(1)
            .and_then(|levels| open.checked_sub(levels))
            .ok_or_else(|| self.depth_error(depth))?;
        Ok(self.blocks[idx as usize].label_carries_value())
    }

    fn depth_error(&self, depth: u32) -> WaveError {
        WaveError::OutOfBounds(format!(
            "branch depth {depth} with {} open blocks in function {}",
            self.blocks.len(),
            self.func
        ))
    }

    fn branch(&mut self, depth: u32) -> Result<()> {
        let carries = self.label_carries_value(depth)?;
        self.branch_with_arity(depth, carries)
    }

    /// Leave `depth + 1` blocks, the last with arity `carries`, then jump to
    /// the label. The function body's label returns.
    fn branch_with_arity(&mut self, depth: u32, carries: bool) -> Result<()> {
        let open = self.blocks.len() as u32;
        if depth > open {
            return Err(self.depth_error(depth));
        }
        if depth == open {
            return self.emit_return();
        }
        for _ in 0..depth {
            self.emitter.leave_block(true)?;
        }
        self.emitter.leave_block(carries)?;

        let target = (open - 1 - depth) as usize;
        match self.blocks[target].header {
            Some(header) => self.emitter.jump_to(header),
            None => {
                let site = self.emitter.jump()?;
                self.blocks[target].fixups.push(site);
                Ok(())
            }
        }
    }

    fn compile_br_table(&mut self, reader: &mut BinaryReader<'_>) -> Result<()> {
        let count = reader.read_var_u32()?;
        let mut depths = Vec::with_capacity(count as usize + 1);
        for _ in 0..count {
            depths.push(reader.read_var_u32()?);
        }
        let default = reader.read_var_u32()?;
        depths.push(default);
        for &depth in &depths {
            if depth > self.blocks.len() as u32 {
                return Err(self.depth_error(depth));
            }
        }
        let carries = self.label_carries_value(default)?;

        let table = self
            .emitter
            .br_table_dispatch(self.stubs.br_table, count)?;
        for (index, depth) in depths.into_iter().enumerate() {
            let entry = self.emitter.position();
            self.emitter.set_table_entry(table, index as u32, entry);
            self.branch_with_arity(depth, carries)?;
        }
        Ok(())
    }

    fn emit_return(&mut self) -> Result<()> {
        self.emitter.unwind_blocks(self.blocks.len() as u32)?;
        self.emitter.epilogue()
    }

    fn compile_call(&mut self, callee: u32) -> Result<()> {
        let ty = self
            .module
            .function_type(callee)
            .ok_or_else(|| WaveError::OutOfBounds(format!("call to function {callee}")))?;
        self.emitter.call(
            self.stubs.slot(callee),
            self.frame_slots,
            ty.params.len() as u32,
            ty.has_return(),
        )?;
        if !self.module.is_import(callee) && !self.callees.contains(&callee) {
            self.callees.push(callee);
        }
        Ok(())
    }

    fn compile_call_indirect(&mut self, type_index: u32) -> Result<()> {
        let ty = self
            .module
            .types
            .get(type_index as usize)
            .ok_or_else(|| WaveError::OutOfBounds(format!("call_indirect type {type_index}")))?;
        let canonical = self.module.canonical_types[type_index as usize];
        self.emitter.call_indirect(
            self.stubs.call_indirect,
            canonical,
            self.frame_slots,
            ty.params.len() as u32,
            ty.has_return(),
        )
    }

    fn compile_get_global(&mut self, reader: &mut BinaryReader<'_>) -> Result<()> {
        let idx = reader.read_var_u32()?;
        let global = self
            .module
            .globals
            .get(idx as usize)
            .ok_or_else(|| WaveError::OutOfBounds(format!("global {idx}")))?;
        if global.mutable {
            return self.emitter.get_global(idx);
        }
        match global.kind {
            ValueKind::I64 | ValueKind::F64 => self.emitter.push_const64(global.init.to_bits()),
            _ => self.emitter.push_const32(global.init.to_bits() as u32),
        }
    }

    fn local_index(&self, reader: &mut BinaryReader<'_>) -> Result<u32> {
        let idx = reader.read_var_u32()?;
        if idx >= self.frame_slots {
            return Err(WaveError::OutOfBounds(format!(
                "local {idx} of {} in function {}",
                self.frame_slots, self.func
            )));
        }
        Ok(idx)
    }

    fn load(&mut self, reader: &mut BinaryReader<'_>, kind: LoadKind) -> Result<()> {
        let offset = read_offset(reader)?;
        self.emitter.load(kind, offset)
    }

    fn store(&mut self, reader: &mut BinaryReader<'_>, width: StoreWidth) -> Result<()> {
        let offset = read_offset(reader)?;
        self.emitter.store(width, offset)
    }
}

fn read_block_type(reader: &mut BinaryReader<'_>) -> Result<Option<ValueKind>> {
    let byte = reader.read_u8()?;
    match ValueKind::from_byte(byte) {
        Some(ValueKind::EmptyBlock) => Ok(None),
        Some(kind) if kind.is_numeric() => Ok(Some(kind)),
        _ => Err(WaveError::MalformedSection(format!("block type {byte:#x}"))),
    }
}

/// Decode a memory immediate and return its offset.
fn read_offset(reader: &mut BinaryReader<'_>) -> Result<u32> {
    let _align = reader.read_var_u32()?;
    let offset = reader.read_var_u32()?;
    if offset > i32::MAX as u32 {
        return Err(WaveError::UnsupportedFeature(format!(
            "memory offset {offset:#x}"
        )));
    }
    Ok(offset)
}

fn read_memory_index(reader: &mut BinaryReader<'_>) -> Result<()> {
    match reader.read_u8()? {
        0 => Ok(()),
        other => Err(WaveError::MalformedSection(format!(
            "memory index {other} in memory operator"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;
    use wasm_encoder::{
        BlockType, CodeSection, EntityType, Function, FunctionSection, ImportSection,
        Instruction, TypeSection, ValType,
    };

    /// Import 0 is `wasm_close_fd`; functions 1..=3 are `() -> ()`:
    /// 1 calls 3, 0, 3, 2, 1; 2 is `block br 0 end`; 3 branches too deep.
    fn module() -> Module {
        let mut types = TypeSection::new();
        types.ty().function([ValType::I32], [ValType::I32]);
        types.ty().function([], []);
        let mut imports = ImportSection::new();
        imports.import("env", "wasm_close_fd", EntityType::Function(0));
        let mut functions = FunctionSection::new();
        let mut code = CodeSection::new();
        let bodies: [&[Instruction<'_>]; 3] = [
            &[
                Instruction::Call(3),
                Instruction::I32Const(0),
                Instruction::Call(0),
                Instruction::Drop,
                Instruction::Call(3),
                Instruction::Call(2),
                Instruction::Call(1),
                Instruction::End,
            ],
            &[
                Instruction::Block(BlockType::Empty),
                Instruction::Br(0),
                Instruction::End,
                Instruction::End,
            ],
            &[
                Instruction::Block(BlockType::Empty),
                Instruction::Br(5),
                Instruction::End,
                Instruction::End,
            ],
        ];
        for instructions in bodies {
            let mut func = Function::new([]);
            for instruction in instructions {
                func.instruction(instruction);
            }
            functions.function(1);
            code.function(&func);
        }

        let mut module = wasm_encoder::Module::new();
        module
            .section(&types)
            .section(&imports)
            .section(&functions)
            .section(&code);
        loader::parse(&module.finish()).unwrap()
    }

    fn compile(bytes: &mut [u8], func: u32) -> Result<CompiledBody> {
        let module = module();
        let (stubs, used) = {
            let mut code = CodeBuffer::new(bytes, 0);
            let stubs = Stubs::emit(&mut code, &module, true).unwrap();
            (stubs, code.position().as_usize())
        };
        FunctionCompiler::new(&module, &stubs, func, CodeBuffer::new(bytes, used))?.compile()
    }

    #[test]
    fn test_callees_in_first_call_order() {
        let mut bytes = vec![0u8; 8192];
        let body = compile(&mut bytes, 1).unwrap();
        assert_eq!(body.callees, vec![3, 2, 1]);
        assert_eq!(body.entry.0 % 16, 0);
    }

    #[test]
    fn test_forward_branch_lands_after_end() {
        let mut bytes = vec![0u8; 8192];
        let body = compile(&mut bytes, 2).unwrap();
        assert_eq!(body.leave_sequences, 2);

        // Replay the expected sequence: the fixup targets the instruction
        // after the block's own leave sequence.
        let mut expected = vec![0u8; bytes.len()];
        let mut e = X86_64Emitter::new(CodeBuffer::new(&mut expected, body.entry.as_usize()));
        e.prologue(0, 0).unwrap();
        e.enter_block().unwrap();
        e.leave_block(false).unwrap();
        let site = e.jump().unwrap();
        e.leave_block(false).unwrap();
        let exit = e.position();
        e.patch(site, exit);
        e.epilogue().unwrap();
        assert_eq!(e.position(), body.end);

        let range = body.entry.as_usize()..body.end.as_usize();
        assert_eq!(bytes[range.clone()], expected[range]);
    }

    #[test]
    fn test_branch_depth_is_checked() {
        let mut bytes = vec![0u8; 8192];
        assert!(matches!(compile(&mut bytes, 3), Err(WaveError::OutOfBounds(_))));
    }

    #[test]
    fn test_imports_have_no_body() {
        let mut bytes = vec![0u8; 8192];
        assert!(matches!(compile(&mut bytes, 0), Err(WaveError::OutOfBounds(_))));
    }
}
