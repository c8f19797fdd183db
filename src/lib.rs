//! Master-side coordination core for a primary/replica graph database
//! cluster.
//!
//! Replicas never write shared storage directly: identifier allocation,
//! lock arbitration, and transaction commit are brokered through the single
//! master, and every reply piggybacks the committed transactions the
//! calling replica has not yet observed, so an ordinary call doubles as an
//! implicit replication pull.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod storage;
pub mod types;
pub mod wire;

pub use config::CoordinatorOptions;
pub use coordinator::{ChangeExtractor, MasterCoordinator, MasterRole, StagedChange};
pub use error::{HelmError, Result};
pub use types::{
  CommitProof, CommittedTransaction, Epoch, IdRange, LockGrant, LockMode, ResourceId,
  ResourceType, ResponseEnvelope, SessionContext, SessionId, TxOrdinal,
};
