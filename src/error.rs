//! Error types for the inferir inference engine
//!
//! All fallible operations in this crate return [`Result`], with a single
//! crate-wide error enum. Model loading failures carry their own taxonomy
//! ([`ModelLoadError`]) so callers can distinguish a missing file from a
//! corrupt one.

use std::path::PathBuf;

/// Result type for inferir operations
pub type Result<T> = std::result::Result<T, InferirError>;

/// Failures raised while opening and validating a model file
///
/// Each variant names the first validation stage that failed; later stages
/// are not attempted.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    /// Model file does not exist or cannot be opened
    #[error("model file not found: {path}")]
    FileNotFound {
        /// Path that was requested
        path: PathBuf,
    },

    /// File is shorter than its own header or tensor table declares
    #[error("model file truncated: {reason}")]
    Truncated {
        /// Which declared structure extends past end of file
        reason: String,
    },

    /// Magic bytes or format version not recognized
    #[error("unsupported model format: {reason}")]
    UnsupportedFormat {
        /// What was found instead
        reason: String,
    },

    /// Stored descriptor checksum does not match the descriptor bytes
    #[error("descriptor checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch {
        /// Checksum recorded in the file header
        stored: u64,
        /// Checksum computed over the descriptor bytes
        computed: u64,
    },

    /// Not enough memory to materialize the tensor data
    #[error("insufficient memory: need {required} bytes for tensor data")]
    InsufficientMemory {
        /// Bytes the owned tensor store would require
        required: usize,
    },
}

/// Unified error type for all inferir operations
#[derive(Debug, thiserror::Error)]
pub enum InferirError {
    /// Model file failed to open or validate
    #[error("model load failed: {0}")]
    ModelLoad(#[from] ModelLoadError),

    /// Input text could not be tokenized
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What made the input unrepresentable
        reason: String,
    },

    /// Token id outside the vocabulary; model and tokenizer disagree
    #[error("unknown token id {id} (vocab size {vocab_size})")]
    UnknownToken {
        /// The offending token id
        id: u32,
        /// Size of the loaded vocabulary
        vocab_size: usize,
    },

    /// Tensor shape does not match what an operation requires
    #[error("invalid shape: {reason}")]
    InvalidShape {
        /// Expected vs actual dimensions
        reason: String,
    },

    /// Operation not supported by the compute backend
    #[error("unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Why it cannot run
        reason: String,
    },

    /// Workspace or activation buffer allocation failed
    #[error("out of memory: {reason}")]
    OutOfMemory {
        /// Which allocation failed
        reason: String,
    },

    /// KV cache cannot hold another position
    ///
    /// Recoverable: the generation session treats this as a clean stop,
    /// not a failure.
    #[error("context overflow: position {position} exceeds capacity {capacity}")]
    ContextOverflow {
        /// Position that would have been written
        position: usize,
        /// Context window capacity
        capacity: usize,
    },

    /// Engine already has an active generation session
    #[error("model busy: {reason}")]
    ModelBusy {
        /// Which operation was rejected
        reason: String,
    },

    /// Expert routing failed inside a mixture-of-experts layer
    #[error("expert routing error: {0}")]
    MoeError(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor JSON failed to parse
    #[error("descriptor parse error: {0}")]
    DescriptorParse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_load_error_display() {
        let err = ModelLoadError::Truncated {
            reason: "tensor table extends past end of file".to_string(),
        };
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_checksum_mismatch_shows_both_values() {
        let err = ModelLoadError::ChecksumMismatch {
            stored: 0xdead_beef,
            computed: 0xcafe_babe,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x00000000deadbeef"));
        assert!(msg.contains("0x00000000cafebabe"));
    }

    #[test]
    fn test_context_overflow_is_distinct_from_load_errors() {
        let err = InferirError::ContextOverflow {
            position: 2048,
            capacity: 2048,
        };
        assert!(matches!(err, InferirError::ContextOverflow { .. }));
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: InferirError = io.into();
        assert!(matches!(err, InferirError::Io(_)));
    }

    #[test]
    fn test_model_load_wraps_via_from() {
        let err: InferirError = ModelLoadError::FileNotFound {
            path: PathBuf::from("/nonexistent/model.infr"),
        }
        .into();
        assert!(err.to_string().contains("/nonexistent/model.infr"));
    }
}
