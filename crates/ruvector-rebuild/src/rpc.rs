//! Rebuild protocol messages
//!
//! Defines the messages exchanged while rebuilding a failover authority:
//! - GenerationProposal / GenerationProposalReply (fencing a new generation)
//! - GenerationUpdate / GenerationUpdateReject (requesting uploads)
//! - LfumUpload / LfumUploadReply (local failover unit uploads)
//! - NodeUpAck (generation carried on node-up acknowledgements)

use crate::inbuild::FailoverUnitReport;
use crate::state::{GenerationNumber, GenerationRole};
use ruvector_failover::{Epoch, NodeInstance};
use serde::{Deserialize, Serialize};

/// Generation and role stamped on every fenced message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationHeader {
    pub generation: GenerationNumber,
    pub role: GenerationRole,
}

impl GenerationHeader {
    pub fn new(generation: GenerationNumber, role: GenerationRole) -> Self {
        Self { generation, role }
    }
}

/// Broadcast by a coordinator to claim a generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationProposal {
    pub header: GenerationHeader,
}

/// Reply to a [`GenerationProposal`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationProposalReply {
    /// The generation that was proposed
    pub proposed_generation: GenerationNumber,

    /// Highest generation the replier has accepted
    pub current_generation: GenerationNumber,

    /// Set when the replier could not process the proposal
    pub error: Option<String>,
}

impl GenerationProposalReply {
    /// Returns true if the replier accepted the proposed generation
    pub fn is_accepted(&self) -> bool {
        self.error.is_none() && self.proposed_generation == self.current_generation
    }
}

/// Sent by a coordinator to a node that accepted its generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationUpdate {
    pub header: GenerationHeader,

    /// Epoch of the bootstrap partition as known to the coordinator
    pub service_epoch: Option<Epoch>,
}

/// Sent instead of an upload when an update carries a stale generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationUpdateReject {
    /// The replier's proposed generation
    pub header: GenerationHeader,
}

/// A node's local failover units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LfumUpload {
    pub header: GenerationHeader,

    /// Uploading node
    pub node: NodeInstance,

    pub reports: Vec<FailoverUnitReport>,

    /// Whether the node hosts any replica at all
    pub any_replica_found: bool,
}

/// Confirms that an upload was merged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfumUploadReply {
    pub header: GenerationHeader,
}

/// Acknowledgement of a node joining, carrying the authority's generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpAck {
    pub header: GenerationHeader,
}

/// Envelope for everything the rebuild protocol sends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RebuildMessage {
    GenerationProposal(GenerationProposal),
    GenerationProposalReply(GenerationProposalReply),
    GenerationUpdate(GenerationUpdate),
    GenerationUpdateReject(GenerationUpdateReject),
    LfumUpload(LfumUpload),
    LfumUploadReply(LfumUploadReply),
    NodeUpAck(NodeUpAck),
}

impl RebuildMessage {
    /// Short name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            RebuildMessage::GenerationProposal(_) => "generation_proposal",
            RebuildMessage::GenerationProposalReply(_) => "generation_proposal_reply",
            RebuildMessage::GenerationUpdate(_) => "generation_update",
            RebuildMessage::GenerationUpdateReject(_) => "generation_update_reject",
            RebuildMessage::LfumUpload(_) => "lfum_upload",
            RebuildMessage::LfumUploadReply(_) => "lfum_upload_reply",
            RebuildMessage::NodeUpAck(_) => "node_up_ack",
        }
    }

    /// The generation header, for fenced messages
    pub fn header(&self) -> Option<&GenerationHeader> {
        match self {
            RebuildMessage::GenerationProposal(m) => Some(&m.header),
            RebuildMessage::GenerationUpdate(m) => Some(&m.header),
            RebuildMessage::GenerationUpdateReject(m) => Some(&m.header),
            RebuildMessage::LfumUpload(m) => Some(&m.header),
            RebuildMessage::LfumUploadReply(m) => Some(&m.header),
            RebuildMessage::NodeUpAck(m) => Some(&m.header),
            RebuildMessage::GenerationProposalReply(_) => None,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        use bincode::config;
        bincode::encode_to_vec(bincode::serde::Compat(self), config::standard())
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }
}
