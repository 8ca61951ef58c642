//! Quantized weight formats and (de)quantization routines
//!
//! The weight store supports four storage kinds:
//! - `F32`: unquantized little-endian float32
//! - `F16`: half precision, widened to f32 on read
//! - `Q4_0`: 4-bit block quantization (block size 32)
//! - `Q8_0`: 8-bit block quantization (block size 32)
//!
//! ## `Q4_0` Format
//!
//! Blocks of 32 values: 1 float32 scale + 16 bytes of packed 4-bit codes
//! (2 per byte, low nibble first). Dequantization: `value = scale * (q - 8)`.
//!
//! ## `Q8_0` Format
//!
//! Blocks of 32 values: 1 float32 scale + 32 int8 codes.
//! Dequantization: `value = scale * q`.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};

/// Number of weights per quantized block
pub const BLOCK_SIZE: usize = 32;

/// Bytes per `Q4_0` block: f32 scale + 16 packed nibbles
pub const Q4_0_BLOCK_BYTES: usize = 4 + 16;

/// Bytes per `Q8_0` block: f32 scale + 32 int8 codes
pub const Q8_0_BLOCK_BYTES: usize = 4 + 32;

/// Storage kind of a tensor in the weight file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantKind {
    /// Little-endian float32, 4 bytes per weight
    F32,
    /// Half precision, 2 bytes per weight
    F16,
    /// 4-bit block quantization, 20 bytes per 32 weights
    Q4_0,
    /// 8-bit block quantization, 36 bytes per 32 weights
    Q8_0,
}

impl QuantKind {
    /// Compute the byte length of a tensor with `num_elements` weights
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for quantized kinds when `num_elements` is not
    /// a multiple of the block size.
    pub fn byte_len(self, num_elements: usize) -> Result<usize> {
        match self {
            Self::F32 => Ok(num_elements * 4),
            Self::F16 => Ok(num_elements * 2),
            Self::Q4_0 | Self::Q8_0 => {
                if num_elements % BLOCK_SIZE != 0 {
                    return Err(InferirError::InvalidShape {
                        reason: format!(
                            "{self:?} tensor of {num_elements} elements is not a multiple of block size {BLOCK_SIZE}"
                        ),
                    });
                }
                let blocks = num_elements / BLOCK_SIZE;
                Ok(blocks
                    * match self {
                        Self::Q4_0 => Q4_0_BLOCK_BYTES,
                        Self::Q8_0 => Q8_0_BLOCK_BYTES,
                        _ => unreachable!(),
                    })
            }
        }
    }
}

/// Dequantize `Q4_0` data into float32
///
/// # Errors
///
/// Returns `InvalidShape` if `data` is not a whole number of blocks.
pub fn dequantize_q4_0(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % Q4_0_BLOCK_BYTES != 0 {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "Q4_0 data length {} is not a multiple of block size {}",
                data.len(),
                Q4_0_BLOCK_BYTES
            ),
        });
    }

    let num_blocks = data.len() / Q4_0_BLOCK_BYTES;
    let mut result = Vec::with_capacity(num_blocks * BLOCK_SIZE);

    for block_idx in 0..num_blocks {
        let block = &data[block_idx * Q4_0_BLOCK_BYTES..];
        let scale = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);

        for &byte in &block[4..Q4_0_BLOCK_BYTES] {
            // Two 4-bit codes per byte, low nibble first; codes map to [-8, 7]
            #[allow(clippy::cast_possible_wrap)]
            let low = (byte & 0x0F) as i8 - 8;
            result.push(scale * f32::from(low));

            #[allow(clippy::cast_possible_wrap)]
            let high = ((byte >> 4) & 0x0F) as i8 - 8;
            result.push(scale * f32::from(high));
        }
    }

    Ok(result)
}

/// Dequantize `Q8_0` data into float32
///
/// # Errors
///
/// Returns `InvalidShape` if `data` is not a whole number of blocks.
pub fn dequantize_q8_0(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % Q8_0_BLOCK_BYTES != 0 {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "Q8_0 data length {} is not a multiple of block size {}",
                data.len(),
                Q8_0_BLOCK_BYTES
            ),
        });
    }

    let num_blocks = data.len() / Q8_0_BLOCK_BYTES;
    let mut result = Vec::with_capacity(num_blocks * BLOCK_SIZE);

    for block_idx in 0..num_blocks {
        let block = &data[block_idx * Q8_0_BLOCK_BYTES..];
        let scale = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);

        for &byte in &block[4..Q8_0_BLOCK_BYTES] {
            let value = i8::from_le_bytes([byte]);
            result.push(scale * f32::from(value));
        }
    }

    Ok(result)
}

/// Dequantize half-precision data into float32
///
/// # Errors
///
/// Returns `InvalidShape` if `data` has an odd byte length.
pub fn dequantize_f16(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 2 != 0 {
        return Err(InferirError::InvalidShape {
            reason: format!("F16 data length {} is not a multiple of 2", data.len()),
        });
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
        .collect())
}

/// Reinterpret little-endian float32 bytes as values
///
/// # Errors
///
/// Returns `InvalidShape` if `data` is not a multiple of 4 bytes.
pub fn dequantize_f32(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(InferirError::InvalidShape {
            reason: format!("F32 data length {} is not a multiple of 4", data.len()),
        });
    }

    Ok(data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Dequantize a tensor of any supported storage kind
///
/// # Errors
///
/// Returns `InvalidShape` when the byte length does not match the kind.
pub fn dequantize(kind: QuantKind, data: &[u8]) -> Result<Vec<f32>> {
    match kind {
        QuantKind::F32 => dequantize_f32(data),
        QuantKind::F16 => dequantize_f16(data),
        QuantKind::Q4_0 => dequantize_q4_0(data),
        QuantKind::Q8_0 => dequantize_q8_0(data),
    }
}

/// Quantize float32 values into `Q4_0` blocks
///
/// Per block: scale = max(|v|) / 7, codes = round(v / scale) + 8 clamped
/// to [0, 15]. Used by the model file writer.
///
/// # Errors
///
/// Returns `InvalidShape` if `values.len()` is not a multiple of the block
/// size.
pub fn quantize_q4_0(values: &[f32]) -> Result<Vec<u8>> {
    if values.len() % BLOCK_SIZE != 0 {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "cannot quantize {} values: not a multiple of block size {}",
                values.len(),
                BLOCK_SIZE
            ),
        });
    }

    let mut out = Vec::with_capacity((values.len() / BLOCK_SIZE) * Q4_0_BLOCK_BYTES);

    for block in values.chunks_exact(BLOCK_SIZE) {
        let max_abs = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let scale = if max_abs > 0.0 { max_abs / 7.0 } else { 1.0 };
        out.extend_from_slice(&scale.to_le_bytes());

        for pair in block.chunks_exact(2) {
            let q0 = quantize_nibble(pair[0], scale);
            let q1 = quantize_nibble(pair[1], scale);
            out.push(q0 | (q1 << 4));
        }
    }

    Ok(out)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize_nibble(value: f32, scale: f32) -> u8 {
    let q = (value / scale).round() + 8.0;
    q.clamp(0.0, 15.0) as u8
}

/// Quantize float32 values into `Q8_0` blocks
///
/// Per block: scale = max(|v|) / 127, codes = round(v / scale) clamped to
/// [-127, 127].
///
/// # Errors
///
/// Returns `InvalidShape` if `values.len()` is not a multiple of the block
/// size.
pub fn quantize_q8_0(values: &[f32]) -> Result<Vec<u8>> {
    if values.len() % BLOCK_SIZE != 0 {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "cannot quantize {} values: not a multiple of block size {}",
                values.len(),
                BLOCK_SIZE
            ),
        });
    }

    let mut out = Vec::with_capacity((values.len() / BLOCK_SIZE) * Q8_0_BLOCK_BYTES);

    for block in values.chunks_exact(BLOCK_SIZE) {
        let max_abs = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
        out.extend_from_slice(&scale.to_le_bytes());

        for &v in block {
            #[allow(clippy::cast_possible_truncation)]
            let q = (v / scale).round().clamp(-127.0, 127.0) as i8;
            out.push(q.to_le_bytes()[0]);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_q4_0_roundtrip_preserves_sign_and_magnitude() {
        let values: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.25).collect();
        let quantized = quantize_q4_0(&values).unwrap();
        assert_eq!(quantized.len(), Q4_0_BLOCK_BYTES);

        let restored = dequantize_q4_0(&quantized).unwrap();
        assert_eq!(restored.len(), 32);
        for (orig, rest) in values.iter().zip(&restored) {
            // 4-bit codes: coarse, but sign and rough magnitude survive
            assert!((orig - rest).abs() < 0.6, "orig={orig} restored={rest}");
        }
    }

    #[test]
    fn test_q8_0_roundtrip_is_tight() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32).sin()).collect();
        let quantized = quantize_q8_0(&values).unwrap();
        assert_eq!(quantized.len(), 2 * Q8_0_BLOCK_BYTES);

        let restored = dequantize_q8_0(&quantized).unwrap();
        for (orig, rest) in values.iter().zip(&restored) {
            assert!((orig - rest).abs() < 0.02);
        }
    }

    #[test]
    fn test_q4_0_rejects_partial_block() {
        let err = dequantize_q4_0(&[0u8; 19]).unwrap_err();
        assert!(matches!(err, InferirError::InvalidShape { .. }));
    }

    #[test]
    fn test_q8_0_rejects_partial_block() {
        assert!(dequantize_q8_0(&[0u8; 35]).is_err());
    }

    #[test]
    fn test_quantize_rejects_non_block_multiple() {
        assert!(quantize_q4_0(&[1.0; 31]).is_err());
        assert!(quantize_q8_0(&[1.0; 33]).is_err());
    }

    #[test]
    fn test_f16_roundtrip() {
        let values = [1.0f32, -0.5, 0.25, 100.0];
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        let restored = dequantize_f16(&bytes).unwrap();
        assert_eq!(restored, values);
    }

    #[test]
    fn test_f32_passthrough() {
        let values = [3.25f32, -1.5];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(dequantize_f32(&bytes).unwrap(), values);
    }

    #[test]
    fn test_byte_len_per_kind() {
        assert_eq!(QuantKind::F32.byte_len(64).unwrap(), 256);
        assert_eq!(QuantKind::F16.byte_len(64).unwrap(), 128);
        assert_eq!(QuantKind::Q4_0.byte_len(64).unwrap(), 40);
        assert_eq!(QuantKind::Q8_0.byte_len(64).unwrap(), 72);
        assert!(QuantKind::Q4_0.byte_len(33).is_err());
    }

    #[test]
    fn test_zero_block_quantizes_to_zero() {
        let quantized = quantize_q4_0(&[0.0; 32]).unwrap();
        let restored = dequantize_q4_0(&quantized).unwrap();
        assert!(restored.iter().all(|&v| v == 0.0));
    }
}
