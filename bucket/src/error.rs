//! Error types for the bucket node.
//!
//! Every error maps onto an [`ErrorClass`], which is what the two control
//! loops use to decide between retrying, discarding files, skipping a cycle
//! or reporting to the supervisor.

use thiserror::Error;

/// How a failure is handled by the owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, chain query or timeout. Retried after one block interval.
    Transient,
    /// Tag mismatch, hash mismatch or malformed input. Files are discarded.
    Validation,
    /// Disk space or quota. The cycle is skipped.
    Resource,
    /// Submission and confirmation disagree. Recorded in the ledger as pending.
    Partial,
    /// Invariant violation. Reported to the supervisor.
    Fatal,
}

/// Errors from the keyed ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Errors from tag admission checks.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("tag mismatch: {0}")]
    TagMismatch(String),

    #[error("malformed tag: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the proof-math capability.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("invalid verifier key: {0}")]
    InvalidKey(String),

    #[error("cannot split file: {0}")]
    Split(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proof service error: {0}")]
    Remote(String),
}

/// Errors from one proving round.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no eligible files at or above height {0}")]
    NoEligibleFiles(u32),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("bundle I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bundle encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("aggregation failed: {0}")]
    Proof(#[from] ProofError),
}

/// Errors from chain queries.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("not found")]
    NotFound,

    #[error("transaction {0} not yet confirmed")]
    NotYetConfirmed(String),

    #[error("chain transport error: {0}")]
    Transport(String),

    #[error("chain response decode error: {0}")]
    Decode(String),
}

/// Failed metadata submission. A transaction hash may still have been
/// produced, in which case the submission is pending rather than lost.
#[derive(Debug, Clone, Error)]
#[error("submission failed: {reason}")]
pub struct SubmitFailure {
    pub tx_hash: Option<String>,
    pub reason: String,
}

/// Errors from the peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer lookup failed: {0}")]
    Lookup(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Errors ending one idle acquisition cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("no attestation worker accepted the request")]
    NoWorker,

    #[error("fetch incomplete after {0:?} (data: {1}, tag: {2})")]
    FetchTimeout(std::time::Duration, bool, bool),

    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("content hash {actual} does not match file name {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("idle file {0} is already stored")]
    Duplicate(String),

    #[error("submission of {hash} failed: {source}")]
    Submit {
        hash: String,
        #[source]
        source: SubmitFailure,
    },

    #[error("confirmation of {hash} (tx {tx_hash}) failed: {source}")]
    Confirm {
        hash: String,
        tx_hash: String,
        #[source]
        source: ChainError,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown requested")]
    Shutdown,
}

impl CycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CycleError::Capacity(_) => ErrorClass::Resource,
            CycleError::Chain(_)
            | CycleError::NoWorker
            | CycleError::FetchTimeout(..)
            | CycleError::Shutdown => ErrorClass::Transient,
            CycleError::Verify(_)
            | CycleError::HashMismatch { .. }
            | CycleError::Duplicate(_) => ErrorClass::Validation,
            CycleError::Submit { source, .. } if source.tx_hash.is_some() => ErrorClass::Partial,
            CycleError::Submit { .. } => ErrorClass::Transient,
            CycleError::Confirm { .. } => ErrorClass::Partial,
            CycleError::Ledger(_) | CycleError::Io(_) => ErrorClass::Fatal,
        }
    }
}

impl AggregateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AggregateError::NoEligibleFiles(_) => ErrorClass::Resource,
            AggregateError::Proof(_) => ErrorClass::Transient,
            AggregateError::Ledger(_) | AggregateError::Io(_) | AggregateError::Encode(_) => {
                ErrorClass::Fatal
            }
        }
    }
}

/// Reason a control loop returned early.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("idle acquisition: {0}")]
    Cycle(#[from] CycleError),

    #[error("proving round: {0}")]
    Round(#[from] AggregateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_class_depends_on_tx_hash() {
        let pending = CycleError::Submit {
            hash: "h".into(),
            source: SubmitFailure {
                tx_hash: Some("0xabc".into()),
                reason: "dropped".into(),
            },
        };
        assert_eq!(pending.class(), ErrorClass::Partial);

        let lost = CycleError::Submit {
            hash: "h".into(),
            source: SubmitFailure {
                tx_hash: None,
                reason: "rejected".into(),
            },
        };
        assert_eq!(lost.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_validation_class() {
        let e = CycleError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(e.class(), ErrorClass::Validation);
        assert_eq!(
            CycleError::Capacity("full".into()).class(),
            ErrorClass::Resource
        );
    }
}
