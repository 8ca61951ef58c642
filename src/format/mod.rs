//! Model file format: header, descriptor, tensor table, tensor data
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic            u32   "INFR"
//! version          u32   currently 1
//! declared_len     u64   total file length in bytes
//! checksum         u64   FNV-1a 64 over the descriptor JSON bytes
//! descriptor_len   u32
//! tensor_count     u32
//! descriptor       [u8; descriptor_len]   JSON ModelDescriptor
//! tensor table     tensor_count entries
//! padding          to 32-byte alignment
//! tensor data      contiguous, offsets relative to data start
//! ```
//!
//! Loading validates in a fixed order and reports the first failure:
//! existence, magic/version, declared length against actual length,
//! descriptor checksum, then per-tensor bounds. The declared-length check
//! makes truncation detection a property of the format rather than a
//! file-size heuristic.
//!
//! Tensor data is copied out of the memory mapping into owned buffers, so
//! a loaded model never holds references into the file.

pub mod factory;

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{InferirError, ModelLoadError, Result};
use crate::moe::MoeNormalization;
use crate::quantize::QuantKind;
use crate::tokenizer::Vocabulary;

/// Magic bytes at the start of every model file
pub const MAGIC: u32 = u32::from_le_bytes(*b"INFR");

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Alignment of the tensor data region
pub const DATA_ALIGNMENT: usize = 32;

/// Immutable model hyperparameters and tokenizer data
///
/// Embedded as JSON in the file header; fixed for the lifetime of a loaded
/// model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Architecture tag, e.g. "olmoe"
    pub architecture: String,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Residual stream width
    pub hidden_dim: usize,
    /// Attention heads (keys and values use the same head count)
    pub num_heads: usize,
    /// FFN intermediate width per expert
    pub intermediate_dim: usize,
    /// Experts per layer; 1 means a dense model
    pub num_experts: usize,
    /// Experts routed per token
    pub experts_per_token: usize,
    /// Router weight normalization mode
    pub moe_norm: MoeNormalization,
    /// Maximum sequence length the KV cache will hold
    pub context_window: usize,
    /// Rotary embedding base frequency
    pub rope_theta: f32,
    /// RMS normalization epsilon
    pub norm_eps: f32,
    /// Token fragments, index = id
    pub vocab: Vocabulary,
    /// BPE merge rules in priority order
    pub merges: Vec<(String, String)>,
    /// Beginning-of-sequence token id
    pub bos_token_id: u32,
    /// End-of-sequence token id
    pub eos_token_id: u32,
}

impl ModelDescriptor {
    /// Dimension of one attention head
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }

    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when dimensions do not divide or the expert
    /// configuration is impossible.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.hidden_dim % self.num_heads != 0 {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "hidden_dim {} not divisible by num_heads {}",
                    self.hidden_dim, self.num_heads
                ),
            });
        }
        if self.head_dim() % 2 != 0 {
            return Err(InferirError::InvalidShape {
                reason: format!("head_dim {} must be even for rotary pairs", self.head_dim()),
            });
        }
        if self.num_experts == 0 || self.experts_per_token == 0 {
            return Err(InferirError::InvalidShape {
                reason: "num_experts and experts_per_token must be nonzero".to_string(),
            });
        }
        if self.experts_per_token > self.num_experts {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "experts_per_token {} exceeds num_experts {}",
                    self.experts_per_token, self.num_experts
                ),
            });
        }
        if self.context_window == 0 {
            return Err(InferirError::InvalidShape {
                reason: "context_window must be nonzero".to_string(),
            });
        }
        let vocab_size = self.vocab.size();
        if self.bos_token_id as usize >= vocab_size || self.eos_token_id as usize >= vocab_size {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "special token ids (bos {}, eos {}) outside vocabulary of {}",
                    self.bos_token_id, self.eos_token_id, vocab_size
                ),
            });
        }
        Ok(())
    }
}

/// One tensor: shape, storage kind, and owned bytes
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Dimensions, row-major; `[out_dim, in_dim]` for projection matrices
    pub dims: Vec<usize>,
    /// Storage kind of `data`
    pub kind: QuantKind,
    /// Raw tensor bytes in `kind` encoding
    pub data: Vec<u8>,
}

impl Tensor {
    /// Total number of weights
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// A fully loaded and validated model file
#[derive(Debug)]
pub struct ModelFile {
    /// Hyperparameters and tokenizer data
    pub descriptor: ModelDescriptor,
    tensors: HashMap<String, Tensor>,
}

impl ModelFile {
    /// Load and validate a model file
    ///
    /// # Errors
    ///
    /// Returns [`ModelLoadError`] describing the first validation stage
    /// that failed.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|_| ModelLoadError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        // SAFETY: the mapping is read-only and dropped before load returns;
        // all tensor bytes are copied out below
        let mmap = unsafe { Mmap::map(&file)? };
        advise_sequential(&mmap);

        Self::from_bytes(&mmap)
    }

    /// Parse and validate a model image already in memory
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`ModelFile::load`], minus `FileNotFound`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let magic = reader.read_u32("magic")?;
        if magic != MAGIC {
            return Err(ModelLoadError::UnsupportedFormat {
                reason: format!("bad magic {magic:#010x}, expected {MAGIC:#010x}"),
            }
            .into());
        }
        let version = reader.read_u32("version")?;
        if version != FORMAT_VERSION {
            return Err(ModelLoadError::UnsupportedFormat {
                reason: format!("unsupported version {version}, expected {FORMAT_VERSION}"),
            }
            .into());
        }

        let declared_len = reader.read_u64("declared length")?;
        if declared_len != data.len() as u64 {
            return Err(ModelLoadError::Truncated {
                reason: format!(
                    "file is {} bytes but header declares {declared_len}",
                    data.len()
                ),
            }
            .into());
        }

        let stored_checksum = reader.read_u64("descriptor checksum")?;
        let descriptor_len = reader.read_u32("descriptor length")? as usize;
        let tensor_count = reader.read_u32("tensor count")? as usize;

        let descriptor_bytes = reader.read_bytes(descriptor_len, "descriptor")?;
        let computed_checksum = fnv1a_64(descriptor_bytes);
        if computed_checksum != stored_checksum {
            return Err(ModelLoadError::ChecksumMismatch {
                stored: stored_checksum,
                computed: computed_checksum,
            }
            .into());
        }

        let mut descriptor: ModelDescriptor = serde_json::from_slice(descriptor_bytes)?;
        descriptor.vocab.rebuild_index();
        descriptor.validate()?;

        let mut entries = Vec::with_capacity(tensor_count);
        for _ in 0..tensor_count {
            entries.push(read_table_entry(&mut reader)?);
        }

        let data_start = align_up(reader.position(), DATA_ALIGNMENT);
        let data_region = data.len() - data_start.min(data.len());

        let mut tensors = HashMap::with_capacity(tensor_count);
        for entry in entries {
            let end = entry
                .offset
                .checked_add(entry.byte_len)
                .filter(|&end| end <= data_region)
                .ok_or_else(|| ModelLoadError::Truncated {
                    reason: format!(
                        "tensor '{}' spans bytes {}..{} past data region of {data_region}",
                        entry.name,
                        entry.offset,
                        entry.offset + entry.byte_len
                    ),
                })?;

            let num_elements: usize = entry.dims.iter().product();
            let expected = entry.kind.byte_len(num_elements)?;
            if expected != entry.byte_len {
                return Err(InferirError::InvalidShape {
                    reason: format!(
                        "tensor '{}' declares {} bytes but shape {:?} in {:?} needs {expected}",
                        entry.name, entry.byte_len, entry.dims, entry.kind
                    ),
                });
            }

            let src = &data[data_start + entry.offset..data_start + end];
            let mut owned = Vec::new();
            owned.try_reserve_exact(src.len()).map_err(|_| {
                ModelLoadError::InsufficientMemory {
                    required: src.len(),
                }
            })?;
            owned.extend_from_slice(src);

            tensors.insert(
                entry.name,
                Tensor {
                    dims: entry.dims,
                    kind: entry.kind,
                    data: owned,
                },
            );
        }

        Ok(Self { descriptor, tensors })
    }

    /// Look up a tensor by name
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when the tensor is absent; a missing tensor
    /// means the file does not match its declared architecture.
    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors.get(name).ok_or_else(|| InferirError::InvalidShape {
            reason: format!("model file has no tensor '{name}'"),
        })
    }

    /// Remove and return a tensor by name
    ///
    /// Used when assembling the execution graph, which takes ownership of
    /// the weights.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when the tensor is absent.
    pub fn take_tensor(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| InferirError::InvalidShape {
                reason: format!("model file has no tensor '{name}'"),
            })
    }

    /// Number of tensors in the file
    #[must_use]
    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }
}

/// Write a model file: header, descriptor, tensor table, aligned data
///
/// Tensors are laid out in the order given. Used by the model builder and
/// by conversion tooling.
///
/// # Errors
///
/// Returns an error when serialization or the write itself fails, or when
/// a tensor's byte length disagrees with its shape.
pub fn write_model_file(
    path: &Path,
    descriptor: &ModelDescriptor,
    tensors: &[(String, Tensor)],
) -> Result<()> {
    descriptor.validate()?;

    let descriptor_bytes = serde_json::to_vec(descriptor)?;
    let checksum = fnv1a_64(&descriptor_bytes);

    let mut table = Vec::new();
    let mut offset = 0usize;
    for (name, tensor) in tensors {
        let expected = tensor.kind.byte_len(tensor.num_elements())?;
        if expected != tensor.data.len() {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "tensor '{name}' has {} bytes but shape {:?} in {:?} needs {expected}",
                    tensor.data.len(),
                    tensor.dims,
                    tensor.kind
                ),
            });
        }

        table.extend_from_slice(&u32::try_from(name.len()).unwrap_or(u32::MAX).to_le_bytes());
        table.extend_from_slice(name.as_bytes());
        table.extend_from_slice(&u32::try_from(tensor.dims.len()).unwrap_or(0).to_le_bytes());
        for &dim in &tensor.dims {
            table.extend_from_slice(&(dim as u64).to_le_bytes());
        }
        table.push(quant_kind_code(tensor.kind));
        table.extend_from_slice(&(offset as u64).to_le_bytes());
        table.extend_from_slice(&(tensor.data.len() as u64).to_le_bytes());
        offset += tensor.data.len();
    }

    // magic + version + declared_len + checksum + descriptor_len + count
    let header_len = 4 + 4 + 8 + 8 + 4 + 4;
    let pre_data = header_len + descriptor_bytes.len() + table.len();
    let data_start = align_up(pre_data, DATA_ALIGNMENT);
    let total_len = data_start + offset;

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(total_len as u64).to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(
        &u32::try_from(descriptor_bytes.len())
            .map_err(|_| InferirError::InvalidShape {
                reason: "descriptor exceeds u32 length".to_string(),
            })?
            .to_le_bytes(),
    );
    out.extend_from_slice(
        &u32::try_from(tensors.len())
            .map_err(|_| InferirError::InvalidShape {
                reason: "tensor count exceeds u32".to_string(),
            })?
            .to_le_bytes(),
    );
    out.extend_from_slice(&descriptor_bytes);
    out.extend_from_slice(&table);
    out.resize(data_start, 0);
    for (_, tensor) in tensors {
        out.extend_from_slice(&tensor.data);
    }

    let mut file = File::create(path)?;
    file.write_all(&out)?;
    file.sync_all()?;
    Ok(())
}

struct TableEntry {
    name: String,
    dims: Vec<usize>,
    kind: QuantKind,
    offset: usize,
    byte_len: usize,
}

fn read_table_entry(reader: &mut ByteReader<'_>) -> Result<TableEntry> {
    let name_len = reader.read_u32("tensor name length")? as usize;
    let name_bytes = reader.read_bytes(name_len, "tensor name")?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| ModelLoadError::UnsupportedFormat {
            reason: "tensor name is not valid UTF-8".to_string(),
        })?
        .to_string();

    let ndims = reader.read_u32("tensor rank")? as usize;
    if ndims == 0 || ndims > 4 {
        return Err(ModelLoadError::UnsupportedFormat {
            reason: format!("tensor '{name}' has unsupported rank {ndims}"),
        }
        .into());
    }
    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        dims.push(reader.read_u64("tensor dim")? as usize);
    }

    let kind = parse_quant_kind(reader.read_u8("tensor kind")?, &name)?;
    let offset = reader.read_u64("tensor offset")? as usize;
    let byte_len = reader.read_u64("tensor byte length")? as usize;

    Ok(TableEntry {
        name,
        dims,
        kind,
        offset,
        byte_len,
    })
}

fn quant_kind_code(kind: QuantKind) -> u8 {
    match kind {
        QuantKind::F32 => 0,
        QuantKind::F16 => 1,
        QuantKind::Q4_0 => 2,
        QuantKind::Q8_0 => 3,
    }
}

fn parse_quant_kind(code: u8, name: &str) -> Result<QuantKind> {
    match code {
        0 => Ok(QuantKind::F32),
        1 => Ok(QuantKind::F16),
        2 => Ok(QuantKind::Q4_0),
        3 => Ok(QuantKind::Q8_0),
        other => Err(ModelLoadError::UnsupportedFormat {
            reason: format!("tensor '{name}' has unknown quantization code {other}"),
        }
        .into()),
    }
}

/// FNV-1a 64-bit hash
#[must_use]
pub fn fnv1a_64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(unix)]
fn advise_sequential(mmap: &Mmap) {
    // Hint only; failure is harmless
    // SAFETY: pointer and length come from a live mapping
    unsafe {
        libc::madvise(
            mmap.as_ptr() as *mut libc::c_void,
            mmap.len(),
            libc::MADV_SEQUENTIAL,
        );
    }
}

#[cfg(not(unix))]
fn advise_sequential(_mmap: &Mmap) {}

/// Bounds-checked little-endian reader over the file image
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| ModelLoadError::Truncated {
                reason: format!("{what}: need {n} bytes at offset {}", self.pos),
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.read_bytes(1, what)?[0])
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let b = self.read_bytes(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self, what: &str) -> Result<u64> {
        let b = self.read_bytes(8, what)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::factory;
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_roundtrip_through_file() {
        let file = NamedTempFile::new().unwrap();
        let (descriptor, tensors) = factory::toy_model();
        write_model_file(file.path(), &descriptor, &tensors).unwrap();

        let model = ModelFile::load(file.path()).unwrap();
        assert_eq!(model.descriptor.num_layers, 2);
        assert_eq!(model.num_tensors(), tensors.len());
        let embd = model.tensor("token_embd.weight").unwrap();
        assert_eq!(embd.dims, vec![4, factory::TOY_HIDDEN_DIM]);
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let err = ModelFile::load(Path::new("/nonexistent/model.infr")).unwrap_err();
        assert!(matches!(
            err,
            InferirError::ModelLoad(ModelLoadError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_bad_magic_is_unsupported_format() {
        let err = ModelFile::from_bytes(b"GGUFxxxxxxxxxxxxxxxxxxxxxxxxxxxx").unwrap_err();
        assert!(matches!(
            err,
            InferirError::ModelLoad(ModelLoadError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_truncated() {
        let file = NamedTempFile::new().unwrap();
        let (descriptor, tensors) = factory::toy_model();
        write_model_file(file.path(), &descriptor, &tensors).unwrap();

        let bytes = std::fs::read(file.path()).unwrap();
        // Cut mid tensor table, well before the data region
        let cut = &bytes[..bytes.len() / 2];
        let err = ModelFile::from_bytes(cut).unwrap_err();
        assert!(matches!(
            err,
            InferirError::ModelLoad(ModelLoadError::Truncated { .. })
        ));
    }

    #[test]
    fn test_corrupted_descriptor_is_checksum_mismatch() {
        let file = NamedTempFile::new().unwrap();
        let (descriptor, tensors) = factory::toy_model();
        write_model_file(file.path(), &descriptor, &tensors).unwrap();

        let mut bytes = std::fs::read(file.path()).unwrap();
        // Flip a byte inside the descriptor JSON (starts after the header)
        bytes[40] ^= 0xFF;
        let err = ModelFile::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            InferirError::ModelLoad(ModelLoadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let file = NamedTempFile::new().unwrap();
        let (descriptor, tensors) = factory::toy_model();
        write_model_file(file.path(), &descriptor, &tensors).unwrap();

        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[4] = 99;
        let err = ModelFile::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            InferirError::ModelLoad(ModelLoadError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_missing_tensor_lookup_fails() {
        let file = NamedTempFile::new().unwrap();
        let (descriptor, tensors) = factory::toy_model();
        write_model_file(file.path(), &descriptor, &tensors).unwrap();

        let model = ModelFile::load(file.path()).unwrap();
        assert!(model.tensor("no.such.tensor").is_err());
    }

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a("") is the offset basis
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(fnv1a_64(b"a"), fnv1a_64(b"b"));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
    }
}
