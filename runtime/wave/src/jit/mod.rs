//! # JIT Compiler
//!
//! Baseline compiler from WASM bytecode straight to x86_64, one function at a
//! time, on first call.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WASM Bytecode                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  compiler.rs (one pass per body)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Code Generation                           │
//! │  (x86_64.rs: fixed native sequence per stack operation)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Executable Plane                           │
//! │  (memory.rs: mmap + W^X toggling; stubs.rs: thunks, table)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Compiling a function queues its not-yet-compiled direct callees; the queue
//! is drained breadth-first before control returns to native code, so a call
//! chain usually runs without bouncing back into the compiler.

pub mod compiler;
pub mod memory;
pub mod stubs;
pub mod x86_64;

use std::collections::VecDeque;

use crate::error::{Result, WaveError};
use crate::module::Module;

use compiler::FunctionCompiler;
use memory::ExecutablePlane;
use stubs::Stubs;
use x86_64::{CodeBuffer, CodeOffset};

/// Statistics about JIT compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitStats {
    /// Total functions compiled.
    pub functions_compiled: u32,
    /// Bytes of compiled function code, stubs excluded.
    pub total_code_size: usize,
    /// Bytes used by the table, stubs and thunks.
    pub stub_size: usize,
    /// Leave-block sequences emitted across all functions.
    pub leave_sequences: u32,
}

/// Owner of the executable plane and the compiled-function table.
pub struct JitCompiler {
    plane: ExecutablePlane,
    stubs: Stubs,
    /// Entry offset of each function once compiled.
    compiled: Vec<Option<CodeOffset>>,
    /// Function indices in compilation order.
    order: Vec<u32>,
    stats: JitStats,
}

impl JitCompiler {
    /// Map the plane and emit the stubs for `module`.
    pub fn new(module: &Module, capacity: usize, check_indirect_signatures: bool) -> Result<Self> {
        let mut plane = ExecutablePlane::new(capacity)?;
        let mut code = CodeBuffer::new(plane.bytes_mut(), 0);
        let stubs = Stubs::emit(&mut code, module, check_indirect_signatures)?;
        let used = code.position().as_usize();
        plane.set_used(used);
        plane.make_executable()?;
        log::debug!(
            "executable plane: {} bytes reserved, {used} bytes of stubs for {} functions",
            plane.capacity(),
            stubs.function_count()
        );

        Ok(Self {
            plane,
            compiled: vec![None; module.function_count() as usize],
            stubs,
            order: Vec::new(),
            stats: JitStats {
                stub_size: used,
                ..JitStats::default()
            },
        })
    }

    pub fn stubs(&self) -> &Stubs {
        &self.stubs
    }

    pub fn plane(&self) -> &ExecutablePlane {
        &self.plane
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    /// Function indices in the order they were compiled.
    pub fn compile_order(&self) -> &[u32] {
        &self.order
    }

    pub fn compiled_offset(&self, func: u32) -> Option<CodeOffset> {
        self.compiled.get(func as usize).copied().flatten()
    }

    pub fn is_compiled(&self, func: u32) -> bool {
        self.compiled_offset(func).is_some()
    }

    /// Address native code should call for `func`: its entry when compiled,
    /// otherwise its thunk.
    pub fn function_address(&self, func: u32) -> *const u8 {
        let offset = self
            .compiled_offset(func)
            .unwrap_or_else(|| self.stubs.thunk(func));
        self.plane.address(offset.as_usize())
    }

    pub fn address(&self, offset: CodeOffset) -> *const u8 {
        self.plane.address(offset.as_usize())
    }

    /// Compile `func` and everything it reaches through direct calls, unless
    /// already compiled. Returns the entry address.
    pub fn ensure_compiled(&mut self, module: &Module, func: u32) -> Result<*const u8> {
        if module.is_import(func) || func >= module.function_count() {
            return Err(WaveError::OutOfBounds(format!(
                "function {func} is not a module-defined function"
            )));
        }
        if let Some(offset) = self.compiled_offset(func) {
            return Ok(self.address(offset));
        }

        self.plane.make_writable()?;
        let compiled = self.drain_work_list(module, func);
        // Leave the plane executable even when compilation failed.
        self.plane.make_executable()?;
        compiled?;

        Ok(self.function_address(func))
    }

    fn drain_work_list(&mut self, module: &Module, root: u32) -> Result<()> {
        let mut queued = vec![false; self.compiled.len()];
        let mut work = VecDeque::from([root]);
        queued[root as usize] = true;

        while let Some(func) = work.pop_front() {
            if self.is_compiled(func) {
                continue;
            }
            for callee in self.compile_function(module, func)? {
                if !self.is_compiled(callee) && !queued[callee as usize] {
                    queued[callee as usize] = true;
                    work.push_back(callee);
                }
            }
        }
        Ok(())
    }

    /// Compile one body and publish it in its function-table slot.
    fn compile_function(&mut self, module: &Module, func: u32) -> Result<Vec<u32>> {
        let start = self.plane.used();
        let code = CodeBuffer::new(self.plane.bytes_mut(), start);
        let body = FunctionCompiler::new(module, &self.stubs, func, code)?.compile()?;

        let slot = self.stubs.slot(func);
        let entry_address = self.plane.address(body.entry.as_usize()) as u64;
        CodeBuffer::new(self.plane.bytes_mut(), 0).write_u64_at(slot, entry_address);
        self.plane.set_used(body.end.as_usize());

        let size = (body.end.0 - body.entry.0) as usize;
        self.compiled[func as usize] = Some(body.entry);
        self.order.push(func);
        self.stats.functions_compiled += 1;
        self.stats.total_code_size += size;
        self.stats.leave_sequences += body.leave_sequences;
        log::debug!(
            "compiled function {func} at {:#x}: {size} bytes, {} direct callees",
            body.entry.0,
            body.callees.len()
        );
        Ok(body.callees)
    }
}
