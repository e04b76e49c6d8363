use thiserror::Error;

/// Error taxonomy for the MDM engine.
///
/// Configuration and block-explosion errors are fatal at startup; validation
/// and comparator errors are per-record/per-pair and never abort the
/// pipeline; lineage conflicts are retried before surfacing.
#[derive(Error, Debug)]
pub enum MdmError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error for record {record_id}: {reason}")]
    Validation { record_id: String, reason: String },

    #[error("Comparator '{comparator}' failed on field '{field}': {reason}")]
    Comparator {
        comparator: String,
        field: String,
        reason: String,
    },

    #[error("Block explosion: key '{block_key}' holds {size} records (limit {limit}). Suggested refinements: {suggestions:?}")]
    BlockExplosion {
        block_key: String,
        size: usize,
        limit: usize,
        suggestions: Vec<String>,
    },

    #[error("Lineage write conflict on golden {golden_id}: {reason}")]
    LineageConflict { golden_id: String, reason: String },

    #[error("Unknown golden record: {0}")]
    UnknownGolden(String),

    #[error("Unknown merge event: {0}")]
    UnknownEvent(String),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MdmError {
    /// Process exit code contract: 0 success, 1 configuration error (no
    /// state change), 2 data error (partial progress preserved), 3
    /// cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            MdmError::Configuration(_) | MdmError::BlockExplosion { .. } => 1,
            MdmError::Cancelled => 3,
            _ => 2,
        }
    }

    /// Retryable errors are re-attempted with backoff before the merge is
    /// rolled back and the cluster re-queued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MdmError::LineageConflict { .. } | MdmError::StageTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MdmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(MdmError::Configuration("bad".into()).exit_code(), 1);
        assert_eq!(
            MdmError::BlockExplosion {
                block_key: "k".into(),
                size: 10,
                limit: 5,
                suggestions: vec![]
            }
            .exit_code(),
            1
        );
        assert_eq!(MdmError::Cancelled.exit_code(), 3);
        assert_eq!(MdmError::Data("oops".into()).exit_code(), 2);
    }

    #[test]
    fn lineage_conflicts_are_retryable() {
        let err = MdmError::LineageConflict {
            golden_id: "g1".into(),
            reason: "version clash".into(),
        };
        assert!(err.is_retryable());
        assert!(!MdmError::Cancelled.is_retryable());
    }
}
