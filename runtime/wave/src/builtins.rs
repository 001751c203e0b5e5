//! # Builtin Function Table
//!
//! Host functions exposed to modules under the `env` namespace. Imports are
//! bound by exact field name; the declared prototype is compared against the
//! builtin's own and only logged when they differ.
//!
//! ## Builtins
//!
//! - `wasm_close_fd(fd: i32) -> i32`: always succeeds, returns 0
//! - `wasm_write_fd(fd: i32, ptr: i32, len: i32) -> i32`: writes linear memory
//!   `[ptr, ptr + len)` to a host descriptor
//! - `wasm_llseek_fd(fd: i32, offset: i64, whence: i32) -> i32`: returns 0

use crate::memory::MemoryView;
use crate::types::{FunctionType, Value, ValueKind};

/// Host implementation: raw argument words in, raw result word out.
pub type HostFn = fn(args: &[u64], memory: &mut MemoryView<'_>) -> u64;

/// One builtin entry.
pub struct Builtin {
    pub name: &'static str,
    pub result: ValueKind,
    pub params: &'static [ValueKind],
    pub func: HostFn,
}

impl Builtin {
    /// Whether `ty` describes the same prototype.
    pub fn matches(&self, ty: &FunctionType) -> bool {
        let result = ty.result.unwrap_or(ValueKind::None);
        result == self.result && ty.params == self.params
    }
}

/// The builtin table.
pub static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "wasm_close_fd",
        result: ValueKind::I32,
        params: &[ValueKind::I32],
        func: close_fd,
    },
    Builtin {
        name: "wasm_write_fd",
        result: ValueKind::I32,
        params: &[ValueKind::I32, ValueKind::I32, ValueKind::I32],
        func: write_fd,
    },
    Builtin {
        name: "wasm_llseek_fd",
        result: ValueKind::I32,
        params: &[ValueKind::I32, ValueKind::I64, ValueKind::I32],
        func: llseek_fd,
    },
];

/// Immutable globals importable from the host namespace.
static BUILTIN_GLOBALS: &[(&str, Value)] = &[
    ("__memory_base", Value::I32(0)),
    ("__table_base", Value::I32(0)),
];

/// Find a builtin by exact name.
pub fn lookup(name: &str) -> Option<usize> {
    BUILTINS.iter().position(|builtin| builtin.name == name)
}

/// Find a builtin global by exact name.
pub fn lookup_global(name: &str) -> Option<Value> {
    BUILTIN_GLOBALS
        .iter()
        .find(|(global, _)| *global == name)
        .map(|(_, value)| *value)
}

fn close_fd(_args: &[u64], _memory: &mut MemoryView<'_>) -> u64 {
    0
}

fn write_fd(args: &[u64], memory: &mut MemoryView<'_>) -> u64 {
    let (fd, ptr, len) = match args {
        [fd, ptr, len] => (*fd as i32, *ptr as u32, *len as u32),
        _ => return -1i64 as u64,
    };
    let Some(bytes) = memory.slice(ptr, len) else {
        log::warn!("wasm_write_fd: range {ptr:#x}+{len} is outside linear memory");
        return -1i64 as u64;
    };
    let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    written as i64 as u64
}

fn llseek_fd(_args: &[u64], _memory: &mut MemoryView<'_>) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_exact_name() {
        assert_eq!(lookup("wasm_write_fd"), Some(1));
        assert_eq!(lookup("wasm_write"), None);
        assert_eq!(lookup_global("__table_base"), Some(Value::I32(0)));
        assert_eq!(lookup_global("STACKTOP"), None);
    }

    #[test]
    fn test_prototype_comparison() {
        let close = &BUILTINS[lookup("wasm_close_fd").unwrap()];
        assert!(close.matches(&FunctionType::new(vec![ValueKind::I32], Some(ValueKind::I32))));
        assert!(!close.matches(&FunctionType::new(vec![ValueKind::I32], None)));
        assert!(!close.matches(&FunctionType::new(vec![ValueKind::I64], Some(ValueKind::I32))));
    }

    #[test]
    fn test_write_fd_rejects_bad_ranges() {
        let mut bytes = vec![0u8; 16];
        let mut memory = MemoryView::new(&mut bytes);
        let write = BUILTINS[lookup("wasm_write_fd").unwrap()].func;
        assert_eq!(write(&[1, 12, 8], &mut memory) as i64, -1);
        assert_eq!(write(&[1, 0], &mut memory) as i64, -1);
        // Closed descriptor: the host call itself fails.
        assert_eq!(write(&[u32::MAX as u64, 0, 4], &mut memory) as i64, -1);
    }

    #[test]
    fn test_write_fd_copies_memory_range() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_end, write_end] = fds;

        let mut bytes = b"..wave..".to_vec();
        let mut memory = MemoryView::new(&mut bytes);
        let write = BUILTINS[lookup("wasm_write_fd").unwrap()].func;
        // Upper halves of the argument words are ignored.
        let fd = 0xdead_0000_0000 | u64::from(write_end as u32);
        assert_eq!(write(&[fd, 2, 4], &mut memory), 4);

        let mut out = [0u8; 8];
        let read = unsafe { libc::read(read_end, out.as_mut_ptr().cast(), out.len()) };
        assert_eq!(read, 4);
        assert_eq!(&out[..4], b"wave");
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }

    #[test]
    fn test_stubs_return_zero() {
        let mut memory = MemoryView::new(&mut []);
        assert_eq!((BUILTINS[0].func)(&[3], &mut memory), 0);
        assert_eq!((BUILTINS[2].func)(&[3, 0, 0], &mut memory), 0);
    }
}
