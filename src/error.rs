use thiserror::Error;

/// Error taxonomy for the pipeline, per the propagation policy: each kind
/// maps to a fixed handling strategy (terminal vs. per-month vs. per-chunk)
/// and, for terminal kinds, a process exit code.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error fetching {what}: {source}")]
    Network {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{what} not found upstream (not yet published)")]
    NotFound { what: String },

    #[error("schema bootstrap failed: {0}")]
    Schema(String),

    #[error("reference data load failed: {0}")]
    Reference(String),

    #[error("row {row} in chunk {chunk} failed type cast on column {column}: {message}")]
    ChunkType {
        chunk: u64,
        row: usize,
        column: String,
        message: String,
    },

    #[error("row {row} in chunk {chunk} violated a constraint: {message}")]
    ChunkConstraint {
        chunk: u64,
        row: usize,
        message: String,
    },

    #[error("fingerprint {fingerprint} already present (duplicate)")]
    ChunkDuplicate { fingerprint: String },

    #[error("chunk {chunk} bulk insert failed for an unclassified reason: {message}")]
    ChunkUnknown { chunk: u64, message: String },

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// Exit code for the orchestrator process, per the exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Schema(_) | PipelineError::Reference(_) | PipelineError::Fatal(_) => 1,
            // Network/NotFound are handled per-month (not terminal); chunk-level
            // kinds are handled per-chunk. Both only reach a process exit code
            // if they escape their intended handling site, which is itself a
            // fatal condition.
            _ => 1,
        }
    }

    /// Classify a `sqlx::Error` into the taxonomy above, consulting the
    /// SQLSTATE code when the driver provides one.
    pub fn from_sqlx(err: sqlx::Error, chunk: u64) -> Self {
        if let Some(db_err) = err.as_database_error() {
            match db_err.code().as_deref() {
                // unique_violation: same fingerprint already present.
                Some("23505") => {
                    return PipelineError::ChunkDuplicate {
                        fingerprint: db_err.message().to_string(),
                    }
                }
                // not_null_violation, check_violation, foreign_key_violation
                Some("23502") | Some("23514") | Some("23503") => {
                    return PipelineError::ChunkConstraint {
                        chunk,
                        row: 0,
                        message: db_err.message().to_string(),
                    }
                }
                // connection_exception / admin_shutdown / crash_shutdown class (08, 57, 58)
                Some(code) if code.starts_with("08") || code.starts_with("57") || code.starts_with("58") => {
                    return PipelineError::Fatal(db_err.message().to_string())
                }
                _ => {}
            }
        }
        PipelineError::ChunkUnknown {
            chunk,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_with_code_2() {
        let err = PipelineError::Config("bad chunk size".into());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn schema_and_reference_and_fatal_exit_with_code_1() {
        assert_eq!(PipelineError::Schema("x".into()).exit_code(), 1);
        assert_eq!(PipelineError::Reference("x".into()).exit_code(), 1);
        assert_eq!(PipelineError::Fatal("x".into()).exit_code(), 1);
    }
}
