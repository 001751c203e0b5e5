//! # Core WebAssembly Types
//!
//! Section identifiers, value kinds, function types and the tagged [`Value`]
//! used wherever a typed 64-bit slot crosses the host boundary.

use core::fmt;

/// WASM section types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

impl SectionId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Custom),
            1 => Some(Self::Type),
            2 => Some(Self::Import),
            3 => Some(Self::Function),
            4 => Some(Self::Table),
            5 => Some(Self::Memory),
            6 => Some(Self::Global),
            7 => Some(Self::Export),
            8 => Some(Self::Start),
            9 => Some(Self::Element),
            10 => Some(Self::Code),
            11 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Value kinds as encoded in the binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    F64,
    /// `anyfunc` table element kind.
    FuncRef,
    /// Block type with no result.
    EmptyBlock,
    /// Builtin with no return value.
    None,
}

impl ValueKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7f => Some(Self::I32),
            0x7e => Some(Self::I64),
            0x7d => Some(Self::F32),
            0x7c => Some(Self::F64),
            0x70 => Some(Self::FuncRef),
            0x40 => Some(Self::EmptyBlock),
            _ => None,
        }
    }

    /// Whether values of this kind can live in a local, global or stack slot.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::F32 | Self::F64)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::FuncRef => "funcref",
            Self::EmptyBlock => "empty",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    /// Parameter kinds.
    pub params: Vec<ValueKind>,
    /// Return kind, if the function produces a value.
    pub result: Option<ValueKind>,
}

impl FunctionType {
    pub fn new(params: Vec<ValueKind>, result: Option<ValueKind>) -> Self {
        Self { params, result }
    }

    pub fn has_return(&self) -> bool {
        self.result.is_some()
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        match self.result {
            Some(result) => write!(f, ") -> {result}"),
            None => f.write_str(")"),
        }
    }
}

/// External kind of an import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Function,
    Table,
    Memory,
    Global,
}

impl ExternalKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Function),
            1 => Some(Self::Table),
            2 => Some(Self::Memory),
            3 => Some(Self::Global),
            _ => None,
        }
    }
}

/// Typed WASM value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// Get the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
        }
    }

    /// Bit pattern as stored in a 64-bit slot. 32-bit kinds are
    /// zero-extended.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
        }
    }

    /// Reinterpret a 64-bit slot as `kind`. 32-bit kinds keep the low half.
    pub fn from_bits(kind: ValueKind, bits: u64) -> Option<Self> {
        match kind {
            ValueKind::I32 => Some(Value::I32(bits as u32 as i32)),
            ValueKind::I64 => Some(Value::I64(bits as i64)),
            ValueKind::F32 => Some(Value::F32(f32::from_bits(bits as u32))),
            ValueKind::F64 => Some(Value::F64(f64::from_bits(bits))),
            _ => None,
        }
    }

    /// Get as i32 if this is an I32 value.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as i64 if this is an I64 value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}:i32"),
            Value::I64(v) => write!(f, "{v}:i64"),
            Value::F32(v) => write!(f, "{v}:f32"),
            Value::F64(v) => write!(f, "{v}:f64"),
        }
    }
}
