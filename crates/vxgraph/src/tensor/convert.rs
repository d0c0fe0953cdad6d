//! Conversions between raw tensor bytes and real `f32` values.
//!
//! Quantized types are dequantized on decode and quantized (rounded, saturated) on encode.
//! Values are little-endian.

use half::{bf16, f16};

use super::{DType, Quantization, TensorError};

fn chunks<const N: usize>(bytes: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
    bytes.chunks_exact(N).map(|chunk| {
        let mut raw = [0u8; N];
        raw.copy_from_slice(chunk);
        raw
    })
}

/// Decodes `bytes` into real values.
pub fn decode(dtype: DType, quant: &Quantization, bytes: &[u8]) -> Result<Vec<f32>, TensorError> {
    let width = dtype.size_in_bytes();
    if width == 0 || bytes.len() % width != 0 {
        return Err(TensorError::InvalidAttr(format!(
            "{} bytes do not hold whole {} elements",
            bytes.len(),
            dtype
        )));
    }
    let stored: Vec<f32> = match dtype {
        DType::None => Vec::new(),
        DType::Bool8 => bytes.iter().map(|b| f32::from(u8::from(*b != 0))).collect(),
        DType::I8 => bytes.iter().map(|b| f32::from(*b as i8)).collect(),
        DType::U8 => bytes.iter().map(|b| f32::from(*b)).collect(),
        DType::I16 => chunks::<2>(bytes).map(|c| f32::from(i16::from_le_bytes(c))).collect(),
        DType::U16 => chunks::<2>(bytes).map(|c| f32::from(u16::from_le_bytes(c))).collect(),
        DType::I32 => chunks::<4>(bytes).map(|c| i32::from_le_bytes(c) as f32).collect(),
        DType::U32 => chunks::<4>(bytes).map(|c| u32::from_le_bytes(c) as f32).collect(),
        DType::I64 => chunks::<8>(bytes).map(|c| i64::from_le_bytes(c) as f32).collect(),
        DType::F16 => chunks::<2>(bytes).map(|c| f16::from_le_bytes(c).to_f32()).collect(),
        DType::BF16 => chunks::<2>(bytes).map(|c| bf16::from_le_bytes(c).to_f32()).collect(),
        DType::F32 => chunks::<4>(bytes).map(f32::from_le_bytes).collect(),
        DType::F64 => chunks::<8>(bytes).map(|c| f64::from_le_bytes(c) as f32).collect(),
    };
    if quant.is_quantized() {
        Ok(stored.into_iter().map(|v| quant.dequantize(v)).collect())
    } else {
        Ok(stored)
    }
}

/// Encodes real values as `dtype`, quantizing and saturating integer types.
pub fn encode(dtype: DType, quant: &Quantization, values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * dtype.size_in_bytes());
    for &real in values {
        let stored = if quant.is_quantized() {
            quant.quantize(real)
        } else {
            real
        };
        let int = |lo: f64, hi: f64| (stored as f64).round().clamp(lo, hi);
        match dtype {
            DType::None => {}
            DType::Bool8 => out.push(u8::from(stored != 0.0)),
            DType::I8 => out.push(int(i8::MIN.into(), i8::MAX.into()) as i8 as u8),
            DType::U8 => out.push(int(0.0, u8::MAX.into()) as u8),
            DType::I16 => {
                out.extend_from_slice(&(int(i16::MIN.into(), i16::MAX.into()) as i16).to_le_bytes())
            }
            DType::U16 => out.extend_from_slice(&(int(0.0, u16::MAX.into()) as u16).to_le_bytes()),
            DType::I32 => {
                out.extend_from_slice(&(int(i32::MIN.into(), i32::MAX.into()) as i32).to_le_bytes())
            }
            DType::U32 => out.extend_from_slice(&(int(0.0, u32::MAX.into()) as u32).to_le_bytes()),
            DType::I64 => {
                let value = int(i64::MIN as f64, i64::MAX as f64) as i64;
                out.extend_from_slice(&value.to_le_bytes())
            }
            DType::F16 => out.extend_from_slice(&f16::from_f32(stored).to_le_bytes()),
            DType::BF16 => out.extend_from_slice(&bf16::from_f32(stored).to_le_bytes()),
            DType::F32 => out.extend_from_slice(&stored.to_le_bytes()),
            DType::F64 => out.extend_from_slice(&f64::from(stored).to_le_bytes()),
        }
    }
    out
}

/// `count` elements all holding `value`.
pub fn filled(dtype: DType, quant: &Quantization, value: f32, count: usize) -> Vec<u8> {
    let one = encode(dtype, quant, &[value]);
    one.repeat(count)
}
