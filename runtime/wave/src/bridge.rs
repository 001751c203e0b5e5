//! # Execution Bridge
//!
//! Crossing between the host and compiled code.
//!
//! Host to native: [`Runtime::invoke`] fills an [`ExecContext`], opens the
//! stack plane and calls the entry trampoline. Native to host: thunks and
//! stubs call back through the function pointers stored in the context:
//!
//! - `host_call` dispatches an import to its builtin,
//! - `lazy_compile` compiles a function on its first call,
//! - `grow_memory` commits linear-memory pages.
//!
//! A callback that fails records the error on the runtime. The lazy path then
//! returns null, which makes its stub unwind straight back to the trampoline;
//! the invoke reports the recorded error.

use core::mem::offset_of;

use crate::builtins::BUILTINS;
use crate::error::{Result, WaveError};
use crate::types::{ExternalKind, Value, ValueKind};
use crate::Runtime;

pub type HostCallback = extern "C" fn(ctx: *mut ExecContext, import: u32, args: *const u64) -> u64;
pub type LazyCallback = extern "C" fn(ctx: *mut ExecContext, func: u32) -> *const u8;
pub type GrowCallback = extern "C" fn(ctx: *mut ExecContext, delta: u32) -> u64;

type Trampoline = unsafe extern "C" fn(ctx: *mut ExecContext) -> u64;

/// Control block for one invocation. Native code addresses it through `r15`.
#[repr(C)]
#[derive(Debug)]
pub struct ExecContext {
    pub entry: *const u8,
    pub operand_stack: *mut u64,
    pub locals: *mut u64,
    pub locals_end: *mut u64,
    pub memory_base: *mut u8,
    pub memory_pages: u64,
    pub table_len: u64,
    pub table: *const u32,
    /// Canonical type of every function, plus a sentinel that matches none.
    pub function_types: *const u32,
    pub function_pointers: *const u64,
    pub globals: *mut u64,
    pub saved_rsp: u64,
    pub host_call: HostCallback,
    pub lazy_compile: LazyCallback,
    pub grow_memory: GrowCallback,
    pub runtime: *const Runtime,
}

/// Field displacements used by emitted code.
pub(crate) mod field {
    use super::{offset_of, ExecContext};

    pub const ENTRY: u32 = offset_of!(ExecContext, entry) as u32;
    pub const OPERAND_STACK: u32 = offset_of!(ExecContext, operand_stack) as u32;
    pub const LOCALS: u32 = offset_of!(ExecContext, locals) as u32;
    pub const LOCALS_END: u32 = offset_of!(ExecContext, locals_end) as u32;
    pub const MEMORY_BASE: u32 = offset_of!(ExecContext, memory_base) as u32;
    pub const MEMORY_PAGES: u32 = offset_of!(ExecContext, memory_pages) as u32;
    pub const TABLE_LEN: u32 = offset_of!(ExecContext, table_len) as u32;
    pub const TABLE: u32 = offset_of!(ExecContext, table) as u32;
    pub const FUNCTION_TYPES: u32 = offset_of!(ExecContext, function_types) as u32;
    pub const FUNCTION_POINTERS: u32 = offset_of!(ExecContext, function_pointers) as u32;
    pub const GLOBALS: u32 = offset_of!(ExecContext, globals) as u32;
    pub const SAVED_RSP: u32 = offset_of!(ExecContext, saved_rsp) as u32;
    pub const HOST_CALL: u32 = offset_of!(ExecContext, host_call) as u32;
    pub const LAZY_COMPILE: u32 = offset_of!(ExecContext, lazy_compile) as u32;
    pub const GROW_MEMORY: u32 = offset_of!(ExecContext, grow_memory) as u32;
}

/// # Safety
/// `ctx` is the context passed to the trampoline; it outlives the call.
unsafe fn runtime<'a>(ctx: *mut ExecContext) -> &'a Runtime {
    &*(*ctx).runtime
}

extern "C" fn host_call(ctx: *mut ExecContext, import: u32, args: *const u64) -> u64 {
    let runtime = unsafe { runtime(ctx) };
    let module = runtime.module();
    let (Some(builtin), Some(ty)) = (
        module.host_function(import).and_then(|idx| BUILTINS.get(idx)),
        module.function_type(import),
    ) else {
        runtime.record_bridge_error(WaveError::OutOfBounds(format!("import {import}")));
        return 0;
    };
    let args = unsafe { core::slice::from_raw_parts(args, ty.params.len()) };
    let Some(mut memory) = runtime.memory.try_lock() else {
        runtime.record_bridge_error(WaveError::RuntimeBusy);
        return 0;
    };
    let raw = (builtin.func)(args, &mut memory.view());
    log::trace!("host call {}{:?} = {raw:#x}", builtin.name, args);
    match ty.result {
        Some(ValueKind::I32) => raw as u32 as u64,
        _ => raw,
    }
}

extern "C" fn lazy_compile(ctx: *mut ExecContext, func: u32) -> *const u8 {
    let runtime = unsafe { runtime(ctx) };
    match runtime.compile_function(func) {
        Ok(entry) => entry,
        Err(err) => {
            log::debug!("lazy compile of function {func} failed: {err}");
            runtime.record_bridge_error(err);
            core::ptr::null()
        }
    }
}

extern "C" fn grow_memory(ctx: *mut ExecContext, delta: u32) -> u64 {
    let runtime = unsafe { runtime(ctx) };
    let Some(mut memory) = runtime.memory.try_lock() else {
        runtime.record_bridge_error(WaveError::RuntimeBusy);
        return u64::from(u32::MAX);
    };
    match memory.grow(delta) {
        Some(old) => {
            unsafe { (*ctx).memory_pages = u64::from(memory.pages()) };
            log::debug!("memory.grow: {old} -> {} pages", memory.pages());
            u64::from(old)
        }
        None => u64::from(u32::MAX),
    }
}

impl Runtime {
    /// Call the exported function `name` with `args`.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Option<Value>> {
        let export = self
            .module
            .export(name, ExternalKind::Function)
            .ok_or_else(|| WaveError::ExportNotFound(name.to_string()))?;
        self.invoke_index(export.index, args)
    }

    /// Call the `main` export with no arguments.
    pub fn invoke_main(&self) -> Result<Option<Value>> {
        self.invoke("main", &[])
    }

    /// Run the start function, if the module declares one.
    pub fn run_start(&self) -> Result<()> {
        match self.module.start {
            Some(start) => self.invoke_index(start, &[]).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Call a function by index.
    pub fn invoke_index(&self, func: u32, args: &[Value]) -> Result<Option<Value>> {
        let ty = self
            .module
            .function_type(func)
            .ok_or_else(|| WaveError::OutOfBounds(format!("function {func}")))?;
        let kinds: Vec<ValueKind> = args.iter().map(Value::kind).collect();
        if kinds != ty.params {
            return Err(WaveError::SignatureMismatch(format!(
                "function {func} expects {ty}, got {} arguments {kinds:?}",
                args.len()
            )));
        }
        if args.len() > self.config.locals_slots {
            return Err(WaveError::OutOfBounds(format!(
                "{} arguments exceed the locals buffer",
                args.len()
            )));
        }

        let entry = if self.module.is_import(func) {
            self.jit.try_lock().ok_or(WaveError::RuntimeBusy)?.function_address(func)
        } else {
            self.compile_function(func)?
        };
        let (trampoline, function_pointers) = {
            let jit = self.jit.try_lock().ok_or(WaveError::RuntimeBusy)?;
            (
                jit.address(jit.stubs().trampoline),
                jit.address(jit.stubs().slot(0)),
            )
        };
        let memory_pages = {
            let memory = self.memory.try_lock().ok_or(WaveError::RuntimeBusy)?;
            u64::from(memory.pages())
        };

        let mut ctx = ExecContext {
            entry,
            operand_stack: self.stacks.operand_base(),
            locals: self.stacks.locals_base(),
            locals_end: self.stacks.locals_end(),
            memory_base: self.memory_base,
            memory_pages,
            table_len: self.table.len() as u64,
            table: self.table.as_ptr(),
            function_types: self.function_types.as_ptr(),
            function_pointers: function_pointers.cast(),
            globals: self.globals.as_ptr() as *mut u64,
            saved_rsp: 0,
            host_call,
            lazy_compile,
            grow_memory,
            runtime: self,
        };

        self.stacks.make_writable()?;
        for (slot, arg) in args.iter().enumerate() {
            unsafe { ctx.locals.add(slot).write(arg.to_bits()) };
        }
        *self.bridge_error.lock() = None;
        log::debug!("invoking function {func} {ty}");

        let raw = unsafe {
            let trampoline: Trampoline = core::mem::transmute(trampoline);
            trampoline(&mut ctx)
        };
        self.stacks.make_readonly()?;

        if let Some(err) = self.bridge_error.lock().take() {
            return Err(err);
        }
        Ok(ty.result.and_then(|kind| Value::from_bits(kind, raw)))
    }

    pub(crate) fn record_bridge_error(&self, err: WaveError) {
        let mut slot = self.bridge_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}
