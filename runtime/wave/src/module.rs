//! # Module Data Model
//!
//! Everything the loader extracts from a binary. A [`Module`] is plain data:
//! it owns no OS resources and can be inspected without instantiating it.
//!
//! ## Index spaces
//!
//! - Functions: imported functions first, then module-defined ones in file order.
//! - Globals: imported globals first, then module-defined ones.
//! - Tables and memories: at most one of each.

use crate::config::PAGE_SIZE;
use crate::types::{ExternalKind, FunctionType, Value, ValueKind};

/// The only import module name the runtime resolves.
pub const HOST_NAMESPACE: &str = "env";

/// Name of the export that designates the primary linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Initial and optional maximum size, in pages or elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizableLimits {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// The single indirect-function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub element: ValueKind,
    pub limits: ResizableLimits,
}

/// What an import provides.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportDesc {
    /// Host function; `builtin` indexes the builtin table.
    Function { type_index: u32, builtin: usize },
    /// Linear memory supplied by the host namespace.
    Memory(ResizableLimits),
    /// Immutable global resolved against the builtin globals.
    Global { kind: ValueKind, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    pub index: u32,
}

/// A global slot with its initial value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Global {
    pub kind: ValueKind,
    pub mutable: bool,
    pub init: Value,
}

/// `count` locals of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalGroup {
    pub count: u32,
    pub kind: ValueKind,
}

/// Declared locals and raw bytecode of one module-defined function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBody {
    pub locals: Vec<LocalGroup>,
    pub code: Vec<u8>,
}

impl FunctionBody {
    /// Number of non-parameter locals.
    pub fn declared_locals(&self) -> u32 {
        self.locals.iter().map(|group| group.count).sum()
    }
}

/// Function indices copied into the table at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSegment {
    pub offset: u32,
    pub functions: Vec<u32>,
}

/// Bytes copied into linear memory at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// A decoded module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Type section.
    pub types: Vec<FunctionType>,
    /// For each type, the first structurally equal type index.
    pub canonical_types: Vec<u32>,
    pub imports: Vec<Import>,
    /// Type index of every function, imports first.
    pub functions: Vec<u32>,
    /// Builtin index of every imported function.
    pub host_functions: Vec<usize>,
    pub bodies: Vec<FunctionBody>,
    pub table: Option<TableType>,
    pub memory: Option<ResizableLimits>,
    /// Bytes of linear memory committed at instantiation.
    pub memory_size: usize,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
}

impl Module {
    /// Total functions, imports included.
    pub fn function_count(&self) -> u32 {
        self.functions.len() as u32
    }

    pub fn imported_function_count(&self) -> u32 {
        self.host_functions.len() as u32
    }

    pub fn is_import(&self, func_idx: u32) -> bool {
        func_idx < self.imported_function_count()
    }

    /// Signature of a function by function index.
    pub fn function_type(&self, func_idx: u32) -> Option<&FunctionType> {
        let type_idx = *self.functions.get(func_idx as usize)?;
        self.types.get(type_idx as usize)
    }

    /// Canonical type index of a function by function index.
    pub fn canonical_function_type(&self, func_idx: u32) -> Option<u32> {
        let type_idx = *self.functions.get(func_idx as usize)?;
        self.canonical_types.get(type_idx as usize).copied()
    }

    /// Body of a module-defined function by function index.
    pub fn body(&self, func_idx: u32) -> Option<&FunctionBody> {
        let defined = func_idx.checked_sub(self.imported_function_count())?;
        self.bodies.get(defined as usize)
    }

    /// Builtin bound to an imported function.
    pub fn host_function(&self, func_idx: u32) -> Option<usize> {
        self.host_functions.get(func_idx as usize).copied()
    }

    /// Look up an export by name and kind.
    pub fn export(&self, name: &str, kind: ExternalKind) -> Option<&Export> {
        self.exports
            .iter()
            .find(|export| export.name == name && export.kind == kind)
    }

    pub fn memory_pages(&self) -> u32 {
        (self.memory_size / PAGE_SIZE) as u32
    }

    /// Total locals (parameters plus declared locals) of a defined function.
    pub fn frame_slots(&self, func_idx: u32) -> Option<u32> {
        let params = self.function_type(func_idx)?.params.len() as u32;
        Some(params + self.body(func_idx)?.declared_locals())
    }
}
