//! Wire-level types shared by the transaction proxy core and its backends.
//!
//! These types are kept in a small, dependency-light crate because they are
//! used by both the client core and the (separate) backend/transport layers.
//! Requests and responses form closed variant sets: every response site in
//! the client matches the full set and treats anything unexpected as a
//! protocol violation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique transaction identifier scoped by its local history and a
/// monotonically increasing counter. Request routing and equality are by
/// this identifier only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub history: u64,
    pub counter: u64,
}

impl TransactionId {
    pub const fn new(history: u64, counter: u64) -> Self {
        Self { history, counter }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-txn-{}", self.history, self.counter)
    }
}

/// Path addressing a node in the data tree. The empty path is the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    pub const fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Opaque payload stored at a tree node. The client does not interpret it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub bytes: Vec<u8>,
}

impl DataNode {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// Single buffered modification of the data tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeOperation {
    Write { path: TreePath, data: DataNode },
    Merge { path: TreePath, data: DataNode },
    Delete { path: TreePath },
}

impl TreeOperation {
    pub fn path(&self) -> &TreePath {
        match self {
            TreeOperation::Write { path, .. }
            | TreeOperation::Merge { path, .. }
            | TreeOperation::Delete { path } => path,
        }
    }
}

/// How a batched modification request drives the commit protocol once the
/// backend has applied its operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceProtocol {
    /// Seal only; a commit-phase request follows separately.
    Ready,
    /// Single-shard commit, no coordination.
    Simple,
    /// First phase of a coordinated commit.
    ThreePhase,
    /// Abandon the transaction.
    Abort,
}

/// A request targeted at one transaction on one backend shard. Sequence
/// numbers are allocated by the sending proxy and are strictly increasing
/// per proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub target: TransactionId,
    pub sequence: u64,
    pub payload: RequestPayload,
}

/// Closed set of request kinds the client emits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    Read {
        path: TreePath,
    },
    Exists {
        path: TreePath,
    },
    /// Batched modifications from a remote proxy.
    Modify {
        operations: Vec<TreeOperation>,
        protocol: PersistenceProtocol,
    },
    /// Whole-transaction commit from a local proxy.
    CommitLocal {
        modifications: Vec<TreeOperation>,
        coordinated: bool,
    },
    Abort,
    PreCommit,
    DoCommit,
    Purge,
}

impl RequestPayload {
    /// Read-type requests are satisfied once and are never replayed verbatim.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            RequestPayload::Read { .. } | RequestPayload::Exists { .. }
        )
    }
}

/// Closed set of response kinds a backend produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    ReadSuccess { data: Option<DataNode> },
    ExistsSuccess { present: bool },
    ModifySuccess,
    AbortSuccess,
    CanCommitSuccess,
    PreCommitSuccess,
    CommitSuccess,
    PurgeSuccess,
    Failure(RequestError),
}

/// Backend-reported failure cause attached to a `Response::Failure`.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RequestError {
    pub message: String,
}

impl RequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_orders_by_history_then_counter() {
        let a = TransactionId::new(1, 5);
        let b = TransactionId::new(1, 6);
        let c = TransactionId::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "1-txn-5");
    }

    #[test]
    fn tree_path_displays_as_slash_separated() {
        assert_eq!(TreePath::root().to_string(), "/");
        assert_eq!(TreePath::new(["a", "b"]).to_string(), "/a/b");
    }

    #[test]
    fn read_type_payloads_are_classified() {
        let path = TreePath::root();
        assert!(RequestPayload::Read { path: path.clone() }.is_read());
        assert!(RequestPayload::Exists { path }.is_read());
        assert!(!RequestPayload::PreCommit.is_read());
        assert!(!RequestPayload::Modify {
            operations: Vec::new(),
            protocol: PersistenceProtocol::Simple,
        }
        .is_read());
    }
}
