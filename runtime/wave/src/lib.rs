//! # Wave: Baseline-JIT WebAssembly Runtime
//!
//! Wave loads a WASM MVP binary and runs its exported functions as native
//! x86_64 code. There is no interpreter: every function is translated to
//! machine code the first time it is called.
//!
//! ## Design Philosophy
//!
//! - **Single pass**: bytecode maps to fixed native sequences, no IR
//! - **Lazy**: functions compile on first call, callees breadth-first
//! - **W^X**: the code plane is never writable and executable at once
//! - **Small host surface**: imports resolve only against the `env` builtins
//!
//! ## Host Functions
//!
//! Modules import host functions from the `env` namespace by exact name:
//!
//! - `wasm_write_fd`: write a linear-memory range to a host descriptor
//! - `wasm_close_fd`: close a descriptor (no-op)
//! - `wasm_llseek_fd`: seek a descriptor (no-op)
//!
//! ## Example
//!
//! ```ignore
//! let runtime = Runtime::load(&std::fs::read("hello.wasm")?)?;
//! runtime.run_start()?;
//! let result = runtime.invoke("main", &[])?;
//! ```
//!
//! ## Platform
//!
//! Code generation targets x86_64 with the System V calling convention; the
//! OS memory service is Linux `mmap`/`mprotect`.

pub mod bridge;
pub mod builtins;
pub mod config;
pub mod const_expr;
pub mod error;
pub mod jit;
pub mod loader;
pub mod memory;
pub mod module;
pub mod opcode;
pub mod reader;
pub mod types;

use core::cell::Cell;

use spin::Mutex;

pub use config::RuntimeConfig;
pub use error::{Result, WaveError};
pub use jit::JitStats;
pub use module::Module;
pub use types::{FunctionType, Value, ValueKind};

use config::MAX_PAGES;
use jit::memory::StackPlane;
use jit::JitCompiler;
use memory::LinearMemory;
use types::ExternalKind;

/// A loaded and instantiated module.
///
/// Compiler state sits behind a [`spin::Mutex`] that is only held while
/// compiling, never across native execution, so a compile re-entered from
/// native code reports [`WaveError::RuntimeBusy`] instead of deadlocking.
pub struct Runtime {
    config: RuntimeConfig,
    module: Module,
    memory: Mutex<LinearMemory>,
    /// Stable for the runtime's lifetime; the reservation never moves.
    memory_base: *mut u8,
    /// One 64-bit slot per global, imports first.
    globals: Box<[Cell<u64>]>,
    /// Function index per table element; `function_count` marks an empty slot.
    table: Box<[u32]>,
    /// Canonical type index per function, then a sentinel matching none.
    function_types: Box<[u32]>,
    jit: Mutex<JitCompiler>,
    stacks: StackPlane,
    bridge_error: Mutex<Option<WaveError>>,
}

impl Runtime {
    /// Parse and instantiate `bytes` with the default configuration.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        Self::load_with_config(bytes, RuntimeConfig::default())
    }

    pub fn load_with_config(bytes: &[u8], config: RuntimeConfig) -> Result<Self> {
        let module = loader::parse(bytes)?;
        Self::new(module, config)
    }

    /// Instantiate a parsed module: commit memory, copy data segments,
    /// initialize globals and the table, and emit the native stubs.
    pub fn new(module: Module, config: RuntimeConfig) -> Result<Self> {
        let initial = module.memory_pages();
        let max_pages = module
            .memory
            .and_then(|limits| limits.maximum)
            .unwrap_or(config.default_max_pages)
            .min(MAX_PAGES)
            .max(initial);
        let mut memory = LinearMemory::new(initial, max_pages)?;
        for segment in &module.data {
            memory.write(segment.offset, &segment.bytes)?;
        }

        let globals = module
            .globals
            .iter()
            .map(|global| Cell::new(global.init.to_bits()))
            .collect();

        let function_count = module.function_count();
        let table_len = module.table.map_or(0, |table| table.limits.initial) as usize;
        let mut table = vec![function_count; table_len];
        for segment in &module.elements {
            let start = segment.offset as usize;
            let slots = table
                .get_mut(start..start + segment.functions.len())
                .ok_or_else(|| {
                    WaveError::OutOfBounds(format!(
                        "element segment at {start} exceeds table size {table_len}"
                    ))
                })?;
            slots.copy_from_slice(&segment.functions);
        }

        let function_types = (0..function_count)
            .map(|func| module.canonical_function_type(func).unwrap_or(u32::MAX))
            .chain([u32::MAX])
            .collect();

        let jit = JitCompiler::new(
            &module,
            config.code_capacity,
            config.check_indirect_signatures,
        )?;
        let stacks = StackPlane::new(config.operand_stack_slots, config.locals_slots)?;

        log::debug!(
            "instantiated: {function_count} functions, {} pages of memory (max {max_pages}), \
             {} globals, {table_len} table slots",
            memory.pages(),
            module.globals.len()
        );

        Ok(Self {
            memory_base: memory.base(),
            memory: Mutex::new(memory),
            globals,
            table: table.into_boxed_slice(),
            function_types,
            jit: Mutex::new(jit),
            stacks,
            bridge_error: Mutex::new(None),
            config,
            module,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current value of global `idx`.
    pub fn global(&self, idx: u32) -> Option<Value> {
        let kind = self.module.globals.get(idx as usize)?.kind;
        Value::from_bits(kind, self.globals[idx as usize].get())
    }

    /// Current size of linear memory in pages.
    pub fn memory_pages(&self) -> u32 {
        self.memory.lock().pages()
    }

    /// Copy `len` bytes out of linear memory.
    pub fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.memory.lock().read(offset, len)
    }

    /// Compile an exported function (and its direct callees) without
    /// running it.
    pub fn compile(&self, name: &str) -> Result<()> {
        let export = self
            .module
            .export(name, ExternalKind::Function)
            .ok_or_else(|| WaveError::ExportNotFound(name.to_string()))?;
        self.compile_function(export.index).map(|_| ())
    }

    pub fn is_compiled(&self, func: u32) -> bool {
        self.jit.lock().is_compiled(func)
    }

    /// Function indices in the order they were compiled.
    pub fn compile_order(&self) -> Vec<u32> {
        self.jit.lock().compile_order().to_vec()
    }

    pub fn jit_stats(&self) -> JitStats {
        self.jit.lock().stats().clone()
    }

    /// Native code of a compiled function, for inspection.
    pub fn compiled_code(&self, func: u32) -> Option<Vec<u8>> {
        let jit = self.jit.lock();
        let start = jit.compiled_offset(func)?.as_usize();
        let end = jit
            .compile_order()
            .iter()
            .filter_map(|&other| jit.compiled_offset(other))
            .map(|offset| offset.as_usize())
            .filter(|&offset| offset > start)
            .min()
            .unwrap_or(jit.plane().used());
        Some(jit.plane().bytes()[start..end].to_vec())
    }

    /// Compile `func` if needed and return its entry address.
    pub(crate) fn compile_function(&self, func: u32) -> Result<*const u8> {
        let mut jit = self.jit.try_lock().ok_or(WaveError::RuntimeBusy)?;
        jit.ensure_compiled(&self.module, func)
    }
}
