//! Error types for the trustfeed node

use thiserror::Error;

/// Main error type for trustfeed operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// Object, message, seal, watch or contact is already present
    #[error("Already exists: {0}")]
    Exists(String),

    /// A save of the same object is already in flight
    #[error("Already saving: {0}")]
    AlreadySaving(String),

    /// No address book entry matched the query
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// Signature did not verify
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Object was signed by someone other than its claimed author
    #[error("Author mismatch: {0}")]
    Author(String),

    /// Version chain (prev link / permalink) does not line up
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Malformed partial-disclosure proof
    #[error("Invalid partial: {0}")]
    InvalidPartial(String),

    /// Generic key-value miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// A different identity already claims this key or fingerprint
    #[error("Identity collision: {0}")]
    Collision(String),

    /// Action failed shape or cross-field validation before append
    #[error("Validation error: {0}")]
    Validation(String),

    /// A projection invariant was violated; the fold loop halts
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Invalid lifecycle transition on a Controls state machine
    #[error("Control error: {0}")]
    Control(String),

    /// Blockchain adapter or transactor failure
    #[error("Blockchain error: {0}")]
    Blockchain(String),

    /// Retriable delivery failure
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Delivery failed permanently and must not be retried
    #[error("Delivery rejected: {0}")]
    DeliveryRejected(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Whether a background worker should give up on the item instead of
    /// scheduling another attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::DeliveryRejected(_)
                | NodeError::Exists(_)
                | NodeError::NotFound(_)
                | NodeError::Validation(_)
                | NodeError::InvalidSignature(_)
                | NodeError::Author(_)
        )
    }

    /// Whether this error rejects a single log entry (the projection moves on)
    /// rather than stopping the fold loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Invariant(_))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::Exists("seal abc".to_string());
        assert_eq!(format!("{}", err), "Already exists: seal abc");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let node_err: NodeError = io_err.into();
        assert!(matches!(node_err, NodeError::Io(_)));
    }

    #[test]
    fn test_permanent_errors() {
        assert!(NodeError::DeliveryRejected("gone".into()).is_permanent());
        assert!(!NodeError::Delivery("timeout".into()).is_permanent());
        assert!(!NodeError::Blockchain("rpc".into()).is_permanent());
    }

    #[test]
    fn test_only_invariant_is_fatal() {
        assert!(NodeError::Invariant("sent -> pending".into()).is_fatal());
        assert!(!NodeError::Exists("x".into()).is_fatal());
    }
}
