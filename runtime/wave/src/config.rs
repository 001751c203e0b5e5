//! Runtime configuration.

/// Size of one WebAssembly page.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Largest page count a 32-bit memory can address.
pub const MAX_PAGES: u32 = 65536;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bytes reserved for the executable plane (function table, stubs, code).
    pub code_capacity: usize,
    /// Slots in the evaluation (operand spill) stack.
    pub operand_stack_slots: usize,
    /// Slots in the locals buffer shared by all frames of one call chain.
    pub locals_slots: usize,
    /// Growth limit, in pages, for a memory that declares no maximum.
    pub default_max_pages: u32,
    /// Compare the expected type of `call_indirect` with the callee's type.
    pub check_indirect_signatures: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            code_capacity: 8 * 1024 * 1024,
            operand_stack_slots: 64 * 1024,
            locals_slots: 64 * 1024,
            default_max_pages: 16 * 1024,
            check_indirect_signatures: true,
        }
    }
}
