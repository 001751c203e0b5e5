//! Constant-expression evaluator for global initializers and segment offsets.
//!
//! Only a single constant instruction followed by `end` is accepted.

use crate::error::{Result, WaveError};
use crate::opcode::Opcode;
use crate::reader::BinaryReader;
use crate::types::Value;

/// Evaluate the constant expression at the start of `bytes`.
///
/// Returns the number of bytes consumed (including `end`) and the value.
pub fn evaluate(bytes: &[u8]) -> Result<(usize, Value)> {
    let mut reader = BinaryReader::new(bytes);
    let lead = reader.read_u8()?;
    let value = match Opcode::from_byte(lead) {
        Some(Opcode::I32Const) => Value::I32(reader.read_var_i32()?),
        Some(Opcode::I64Const) => Value::I64(reader.read_var_i64()?),
        Some(Opcode::F32Const) => Value::F32(f32::from_bits(reader.read_u32_le()?)),
        Some(Opcode::F64Const) => Value::F64(f64::from_bits(reader.read_u64_le()?)),
        _ => return Err(WaveError::MalformedConstExpr(lead)),
    };
    let end = reader.read_u8()?;
    if end != Opcode::End as u8 {
        return Err(WaveError::MalformedConstExpr(end));
    }
    Ok((reader.position(), value))
}

/// Evaluate the constant expression under `reader`'s cursor and advance past it.
pub fn read(reader: &mut BinaryReader<'_>) -> Result<Value> {
    let (consumed, value) = evaluate(reader.rest())?;
    reader.skip(consumed)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i32_const() {
        assert_eq!(evaluate(&[0x41, 0x2a, 0x0b, 0xff]).unwrap(), (3, Value::I32(42)));
        assert_eq!(evaluate(&[0x41, 0x7f, 0x0b]).unwrap(), (3, Value::I32(-1)));
    }

    #[test]
    fn test_wide_constants() {
        assert_eq!(evaluate(&[0x42, 0x80, 0x01, 0x0b]).unwrap(), (4, Value::I64(128)));
        let mut f32_expr = vec![0x43];
        f32_expr.extend_from_slice(&2.5f32.to_bits().to_le_bytes());
        f32_expr.push(0x0b);
        assert_eq!(evaluate(&f32_expr).unwrap(), (6, Value::F32(2.5)));
    }

    #[test]
    fn test_rejects_other_instructions() {
        // get_global 0; end
        assert_eq!(evaluate(&[0x23, 0x00, 0x0b]), Err(WaveError::MalformedConstExpr(0x23)));
        // i32.const 1; i32.const 2; end
        assert_eq!(
            evaluate(&[0x41, 0x01, 0x41, 0x02, 0x0b]),
            Err(WaveError::MalformedConstExpr(0x41))
        );
        assert_eq!(evaluate(&[0x41, 0x01]), Err(WaveError::Truncated));
    }

    #[test]
    fn test_read_advances_reader() {
        let bytes = [0x41, 0x05, 0x0b, 0x99];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(read(&mut reader).unwrap(), Value::I32(5));
        assert_eq!(reader.read_u8().unwrap(), 0x99);
    }
}
