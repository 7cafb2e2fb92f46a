//! Generation state manager
//!
//! Node-side half of the rebuild protocol. Tracks the proposed, receive and
//! send generations of both authority roles, answers proposals and updates,
//! and uploads the node's local failover units to the coordinator.
//!
//! The generation lock is never held across an `.await` or while a failover
//! unit is locked.

use crate::{
    inbuild::FailoverUnitReport,
    rpc::{
        GenerationHeader, GenerationProposal, GenerationProposalReply, GenerationUpdate,
        GenerationUpdateReject, LfumUpload, LfumUploadReply, NodeUpAck, RebuildMessage,
    },
    state::{GenerationRole, GenerationState, RoleGenerations},
    transport::RebuildTransport,
    RebuildResult,
};
use parking_lot::RwLock;
use ruvector_failover::{
    Epoch, FailoverJobQueue, MetricsRecorder, NodeInstance, BOOTSTRAP_PARTITION_ID,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct GenerationStateManager {
    /// This node
    node: NodeInstance,

    state: RwLock<GenerationState>,

    /// Jobs against the local failover units
    jobs: Arc<FailoverJobQueue>,

    transport: Arc<dyn RebuildTransport>,
}

impl GenerationStateManager {
    pub fn new(
        node: NodeInstance,
        jobs: Arc<FailoverJobQueue>,
        transport: Arc<dyn RebuildTransport>,
    ) -> Self {
        Self {
            node,
            state: RwLock::new(GenerationState::new()),
            jobs,
            transport,
        }
    }

    pub fn node(&self) -> &NodeInstance {
        &self.node
    }

    /// Snapshot of the generations of `role`
    pub fn generations(&self, role: GenerationRole) -> RoleGenerations {
        self.state.read().for_role(role).clone()
    }

    /// Header for messages this node sends on behalf of `role`
    pub fn header_for(&self, role: GenerationRole) -> GenerationHeader {
        GenerationHeader::new(self.state.read().for_role(role).send.clone(), role)
    }

    /// Returns false for messages fenced below the receive generation
    pub fn check_generation_header(&self, header: &GenerationHeader, message: &str) -> bool {
        let receive = self.state.read().for_role(header.role).receive.clone();
        if header.generation < receive {
            debug!(
                "Ignoring {} with generation {} below receive generation {} for {} role",
                message, header.generation, receive, header.role
            );
            MetricsRecorder::record_generation_reject(message);
            return false;
        }
        true
    }

    pub fn process_generation_proposal(
        &self,
        proposal: &GenerationProposal,
    ) -> GenerationProposalReply {
        let header = &proposal.header;
        let mut state = self.state.write();
        let generations = state.for_role_mut(header.role);

        if header.generation > generations.proposed {
            info!(
                "Accepting {} generation proposal {} (was {})",
                header.role, header.generation, generations.proposed
            );
            generations.proposed = header.generation.clone();
        } else if header.generation < generations.proposed {
            debug!(
                "Generation proposal {} below proposed {} for {} role",
                header.generation, generations.proposed, header.role
            );
        }

        GenerationProposalReply {
            proposed_generation: header.generation.clone(),
            current_generation: generations.proposed.clone(),
            error: None,
        }
    }

    /// Accept an update of the proposed generation and upload to `from`
    ///
    /// Any other generation is answered with a reject carrying the proposed
    /// generation.
    pub async fn process_generation_update(
        &self,
        update: &GenerationUpdate,
        from: &NodeInstance,
    ) -> RebuildResult<()> {
        let role = update.header.role;
        let generation = &update.header.generation;

        let rejected = {
            let mut state = self.state.write();
            let generations = state.for_role_mut(role);
            if *generation != generations.proposed {
                Some(generations.proposed.clone())
            } else {
                if generations.receive < *generation {
                    generations.receive = generation.clone();
                }
                None
            }
        };

        if let Some(current) = rejected {
            warn!(
                "Rejecting {} generation update {} from {}, proposed is {}",
                role, generation, from, current
            );
            MetricsRecorder::record_generation_reject("generation_update");
            let reject = GenerationUpdateReject {
                header: GenerationHeader::new(current, role),
            };
            return self
                .transport
                .send(from, RebuildMessage::GenerationUpdateReject(reject))
                .await;
        }

        if role == GenerationRole::PrimaryAuthority {
            if let Some(service_epoch) = update.service_epoch {
                self.drop_stale_bootstrap_replica(service_epoch)?;
            }
        }

        let upload = self.build_upload(update.header.clone());
        info!(
            "Uploading {} failover units to {} for {} generation {}",
            upload.reports.len(),
            from,
            role,
            generation
        );
        self.transport
            .send(from, RebuildMessage::LfumUpload(upload))
            .await
    }

    pub fn process_lfum_upload_reply(&self, reply: &LfumUploadReply) {
        let header = &reply.header;
        if !self.check_generation_header(header, "lfum_upload_reply") {
            return;
        }

        let mut state = self.state.write();
        let generations = state.for_role_mut(header.role);
        if generations.send < header.generation {
            debug!(
                "Upload for {} generation {} confirmed",
                header.role, header.generation
            );
            generations.send = header.generation.clone();
        }
    }

    pub fn process_node_up_ack(&self, ack: &NodeUpAck) {
        self.state
            .write()
            .for_role_mut(ack.header.role)
            .advance_to(&ack.header.generation);
    }

    /// Handle a message addressed to this node
    ///
    /// Returns the direct reply, if the message has one.
    pub async fn handle_message(
        &self,
        from: &NodeInstance,
        message: RebuildMessage,
    ) -> RebuildResult<Option<RebuildMessage>> {
        match message {
            RebuildMessage::GenerationProposal(proposal) => Ok(Some(
                RebuildMessage::GenerationProposalReply(
                    self.process_generation_proposal(&proposal),
                ),
            )),
            RebuildMessage::GenerationUpdate(update) => {
                self.process_generation_update(&update, from).await?;
                Ok(None)
            }
            RebuildMessage::LfumUploadReply(reply) => {
                self.process_lfum_upload_reply(&reply);
                Ok(None)
            }
            RebuildMessage::NodeUpAck(ack) => {
                self.process_node_up_ack(&ack);
                Ok(None)
            }
            other => {
                debug!("Node {} ignoring {} from {}", self.node, other.name(), from);
                Ok(None)
            }
        }
    }

    /// Local failover units in the scope of the header's role
    ///
    /// The primary authority owns only the bootstrap partition and the backup
    /// authority owns every other partition.
    fn build_upload(&self, header: GenerationHeader) -> LfumUpload {
        let map = self.jobs.map();
        let mut ids = map.partition_ids();
        ids.sort();

        let mut reports = Vec::new();
        let mut any_replica_found = false;
        for id in ids {
            let unit = match map.snapshot(&id) {
                Some(unit) => unit,
                None => continue,
            };
            let handle = match unit.find_replica(&self.node.id) {
                Some(handle) => handle,
                None => continue,
            };
            any_replica_found = true;

            let in_scope = match header.role {
                GenerationRole::PrimaryAuthority => unit.is_bootstrap(),
                GenerationRole::BackupAuthority => !unit.is_bootstrap(),
            };
            if in_scope {
                let reporter_is_primary = unit.replica(handle).is_current_primary();
                reports.push(FailoverUnitReport::new(unit, reporter_is_primary));
            }
        }

        LfumUpload {
            header,
            node: self.node.clone(),
            reports,
            any_replica_found,
        }
    }

    /// Queue dropping the local bootstrap replica if it is behind `service_epoch`
    fn drop_stale_bootstrap_replica(&self, service_epoch: Epoch) -> RebuildResult<()> {
        if !self.jobs.map().contains(&BOOTSTRAP_PARTITION_ID) {
            return Ok(());
        }

        let node_id = self.node.id.clone();
        self.jobs.enqueue(BOOTSTRAP_PARTITION_ID, move |locked| {
            let unit = locked.get();
            if unit.current_epoch() >= service_epoch {
                return;
            }
            let handle = match unit.find_replica(&node_id) {
                Some(handle) if !unit.replica(handle).is_dropped() => handle,
                _ => return,
            };

            info!(
                "Dropping local bootstrap replica at {}, authority is at {}",
                unit.current_epoch(),
                service_epoch
            );
            match locked.enable_update() {
                Ok(unit) => unit.on_replica_dropped(handle),
                Err(e) => warn!("Cannot drop local bootstrap replica: {}", e),
            }
        })?;
        Ok(())
    }
}
