//! Test modules assembled with `wasm-encoder`.
//!
//! `TestModule` keeps one encoder section per kind, hands out function,
//! type and global indices as entries are added, and writes the non-empty
//! sections in canonical order.

#![allow(dead_code)]

use std::borrow::Cow;

pub use wasm_encoder::{BlockType, ConstExpr, Function, Instruction, MemArg, ValType};
use wasm_encoder::{
    CodeSection, DataSection, ElementSection, Elements, EntityType, ExportKind, ExportSection,
    FunctionSection, GlobalSection, GlobalType, ImportSection, MemorySection, MemoryType, Module,
    RefType, StartSection, TableSection, TableType, TypeSection,
};

/// Function body with `locals` and the given instruction sequence.
pub fn body(locals: &[(u32, ValType)], instructions: &[Instruction<'_>]) -> Function {
    let mut func = Function::new(locals.iter().copied());
    for instruction in instructions {
        func.instruction(instruction);
    }
    func
}

/// Memory immediate with no alignment hint.
pub fn mem(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 0,
        memory_index: 0,
    }
}

/// Module under construction. Function indices count imports first, so
/// imports must be added before any defined function.
#[derive(Default)]
pub struct TestModule {
    types: TypeSection,
    imports: ImportSection,
    functions: FunctionSection,
    tables: TableSection,
    memories: MemorySection,
    globals: GlobalSection,
    exports: ExportSection,
    start: Option<StartSection>,
    elements: ElementSection,
    code: CodeSection,
    data: DataSection,
}

impl TestModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function type and return its index.
    pub fn ty(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        self.types
            .ty()
            .function(params.iter().copied(), results.iter().copied());
        self.types.len() - 1
    }

    /// Import `env.<field>` as a function and return its function index.
    pub fn import_function(&mut self, field: &str, type_index: u32) -> u32 {
        self.imports
            .import("env", field, EntityType::Function(type_index));
        self.imports.len() - 1
    }

    /// Add a defined function and return its function index.
    pub fn function(&mut self, type_index: u32, body: &Function) -> u32 {
        self.functions.function(type_index);
        self.code.function(body);
        self.imports.len() + self.functions.len() - 1
    }

    pub fn export_function(&mut self, name: &str, func: u32) -> &mut Self {
        self.exports.export(name, ExportKind::Func, func);
        self
    }

    /// Define memory 0 and export it as `memory`.
    pub fn memory(&mut self, initial: u64, maximum: Option<u64>) -> &mut Self {
        self.memories.memory(MemoryType {
            minimum: initial,
            maximum,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        self.exports.export("memory", ExportKind::Memory, 0);
        self
    }

    pub fn table(&mut self, size: u64) -> &mut Self {
        self.tables.table(TableType {
            element_type: RefType::FUNCREF,
            table64: false,
            minimum: size,
            maximum: None,
            shared: false,
        });
        self
    }

    /// Add a global and return its index.
    pub fn global(&mut self, val_type: ValType, mutable: bool, init: &ConstExpr) -> u32 {
        self.globals.global(
            GlobalType {
                val_type,
                mutable,
                shared: false,
            },
            init,
        );
        self.globals.len() - 1
    }

    pub fn start(&mut self, function_index: u32) -> &mut Self {
        self.start = Some(StartSection { function_index });
        self
    }

    pub fn elements(&mut self, offset: i32, functions: &[u32]) -> &mut Self {
        self.elements.active(
            None,
            &ConstExpr::i32_const(offset),
            Elements::Functions(Cow::Borrowed(functions)),
        );
        self
    }

    pub fn data(&mut self, offset: i32, bytes: &[u8]) -> &mut Self {
        self.data
            .active(0, &ConstExpr::i32_const(offset), bytes.iter().copied());
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut module = Module::new();
        if !self.types.is_empty() {
            module.section(&self.types);
        }
        if !self.imports.is_empty() {
            module.section(&self.imports);
        }
        if !self.functions.is_empty() {
            module.section(&self.functions);
        }
        if !self.tables.is_empty() {
            module.section(&self.tables);
        }
        if !self.memories.is_empty() {
            module.section(&self.memories);
        }
        if !self.globals.is_empty() {
            module.section(&self.globals);
        }
        if !self.exports.is_empty() {
            module.section(&self.exports);
        }
        if let Some(start) = &self.start {
            module.section(start);
        }
        if !self.elements.is_empty() {
            module.section(&self.elements);
        }
        if !self.code.is_empty() {
            module.section(&self.code);
        }
        if !self.data.is_empty() {
            module.section(&self.data);
        }
        module.finish()
    }
}
