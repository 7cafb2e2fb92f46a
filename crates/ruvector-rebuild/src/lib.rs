//! Generation-fenced rebuild protocol for the ruvector failover manager
//!
//! When a failover authority (re)activates it no longer trusts its own view of
//! the cluster. This crate rebuilds that view:
//! - Generation numbers fence messages so that only one coordinator's rebuild
//!   is honoured at a time
//! - Each node keeps per-role proposed, receive and send generations
//! - The coordinator proposes a generation, asks every accepting node to
//!   upload its local failover units, and merges the uploads into rebuilt
//!   failover units

pub mod config;
pub mod context;
pub mod inbuild;
pub mod manager;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub use config::RebuildConfig;
pub use context::{RebuildContext, RebuildOutcome, RebuildPhase};
pub use inbuild::{FailoverUnitReport, InBuildCache, InBuildFailoverUnit};
pub use manager::GenerationStateManager;
pub use rpc::{
    GenerationHeader, GenerationProposal, GenerationProposalReply, GenerationUpdate,
    GenerationUpdateReject, LfumUpload, LfumUploadReply, NodeUpAck, RebuildMessage,
};
pub use state::{GenerationNumber, GenerationRole, GenerationState, RoleGenerations};
pub use timer::RetryTimer;
pub use transport::{ClusterMembership, RebuildTransport, ReplyReceiver, StaticMembership};

use ruvector_failover::FailoverError;
use thiserror::Error;

/// Result type for rebuild operations
pub type RebuildResult<T> = Result<T, RebuildError>;

/// Errors that can occur during rebuild
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("Failover error: {0}")]
    Failover(#[from] FailoverError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rebuild deactivated")]
    Deactivated,

    #[error("Rebuild already running")]
    AlreadyRunning,

    #[error("No generation left above {0}")]
    GenerationExhausted(GenerationNumber),

    #[error("Serialization error: {0}")]
    SerializationEncodeError(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    SerializationDecodeError(#[from] bincode::error::DecodeError),
}
