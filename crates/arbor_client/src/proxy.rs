//! Proxy module wiring.
//!
//! `transaction` contains the user-facing state machine, `reconnect` the
//! connection-thread successor protocol, `state` the atomic dual state and
//! the replay log, `adapter` the backend capability seam, and `types` the
//! shared contracts (parent seam, errors, voting).

mod adapter;
mod reconnect;
mod state;
mod transaction;
mod types;

pub use adapter::{Backend, BackendAdapter, LocalAdapter, ReadFuture, RemoteAdapter, SnapshotAdapter};
pub use transaction::ProxyTransaction;
pub use types::{ConnectionEntry, ProxyError, ProxyParent, ResponseCallback, VotingFuture};
