//! Rebuild coordinator
//!
//! Drives one rebuild of a failover authority's view:
//! - Proposing: fence a generation and learn which nodes accepted it
//! - Updating: ask accepting nodes for their local failover units and merge
//!   the uploads until no node is outstanding
//! - Completion: wait for the expected cluster size, then hand back the
//!   rebuilt failover units
//!
//! Messages, node up/down notifications and deactivation reach the running
//! rebuild through its inbox.

use crate::{
    config::RebuildConfig,
    inbuild::InBuildCache,
    rpc::{
        GenerationHeader, GenerationProposal, GenerationUpdate, LfumUpload, LfumUploadReply,
        RebuildMessage,
    },
    state::{GenerationNumber, GenerationRole},
    timer::RetryTimer,
    transport::{ClusterMembership, RebuildTransport},
    RebuildError, RebuildResult,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use ruvector_failover::{
    Epoch, FailoverUnit, FailoverUnitMap, HealthReport, HealthReportKind, HealthReporter,
    HealthSeverity, MetricsRecorder, NodeId, NodeInstance,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Where a rebuild is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    /// Waiting for the cluster to settle
    Stabilizing,
    Proposing,
    Updating,
    /// Every accepting node uploaded; waiting for the expected cluster size
    UpdateCompleted,
    RecoverCompleted,
}

/// Result of a completed rebuild
#[derive(Debug)]
pub struct RebuildOutcome {
    pub role: GenerationRole,

    /// Generation the rebuild completed under
    pub generation: GenerationNumber,

    /// Rebuilt failover units, ordered by partition
    pub units: Vec<FailoverUnit>,

    /// No node reported any replica, so the bootstrap partition must be created
    pub create_bootstrap_partition: bool,
}

impl RebuildOutcome {
    /// Register the rebuilt failover units in `map`
    pub fn install(&self, map: &FailoverUnitMap) -> RebuildResult<()> {
        for unit in &self.units {
            map.insert(unit.clone())?;
        }
        info!(
            "Installed {} rebuilt failover units for {} generation {}",
            self.units.len(),
            self.role,
            self.generation
        );
        Ok(())
    }
}

/// Input to a running rebuild
#[derive(Debug)]
enum RebuildEvent {
    /// Encoded message from another node
    Message { from: NodeInstance, bytes: Vec<u8> },
    NodeDown(NodeInstance),
    NodeUp(NodeInstance),
    Deactivate,
}

/// Outcome of one protocol phase
enum Step<T> {
    Done(T),
    /// Start proposing again, with the adopted generation if any
    Restart {
        adopted: Option<GenerationNumber>,
        reason: &'static str,
    },
}

/// Nodes that accepted the proposal, keyed by node
type PendingNodes = HashMap<NodeId, NodeInstance>;

pub struct RebuildContext {
    node: NodeInstance,
    role: GenerationRole,
    config: RebuildConfig,

    transport: Arc<dyn RebuildTransport>,
    membership: Arc<dyn ClusterMembership>,
    health: Arc<dyn HealthReporter>,

    /// Bootstrap partition epoch sent with updates
    service_epoch: Option<Epoch>,

    /// Generation to mint above
    last_generation: GenerationNumber,

    phase: RwLock<RebuildPhase>,

    inbox_tx: mpsc::UnboundedSender<RebuildEvent>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<RebuildEvent>>>,
}

impl RebuildContext {
    pub fn new(
        node: NodeInstance,
        role: GenerationRole,
        config: RebuildConfig,
        transport: Arc<dyn RebuildTransport>,
        membership: Arc<dyn ClusterMembership>,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            node,
            role,
            config,
            transport,
            membership,
            health,
            service_epoch: None,
            last_generation: GenerationNumber::zero(),
            phase: RwLock::new(RebuildPhase::Stabilizing),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        }
    }

    /// Mint generations above `generation`
    pub fn with_last_generation(mut self, generation: GenerationNumber) -> Self {
        self.last_generation = generation;
        self
    }

    /// Send `epoch` with updates so nodes can drop stale bootstrap replicas
    pub fn with_service_epoch(mut self, epoch: Epoch) -> Self {
        self.service_epoch = Some(epoch);
        self
    }

    pub fn role(&self) -> GenerationRole {
        self.role
    }

    pub fn phase(&self) -> RebuildPhase {
        *self.phase.read()
    }

    /// Hand an encoded message from `from` to the rebuild
    pub fn deliver(&self, from: NodeInstance, bytes: Vec<u8>) {
        self.post(RebuildEvent::Message { from, bytes });
    }

    pub fn node_down(&self, node: NodeInstance) {
        self.post(RebuildEvent::NodeDown(node));
    }

    pub fn node_up(&self, node: NodeInstance) {
        self.post(RebuildEvent::NodeUp(node));
    }

    /// Stop the rebuild; `run` returns [`RebuildError::Deactivated`]
    pub fn deactivate(&self) {
        self.post(RebuildEvent::Deactivate);
    }

    fn post(&self, event: RebuildEvent) {
        if self.inbox_tx.send(event).is_err() {
            debug!("Rebuild of {} role no longer running", self.role);
        }
    }

    /// Run the rebuild to completion
    ///
    /// May be called once per context.
    pub async fn run(&self) -> RebuildResult<RebuildOutcome> {
        let mut inbox = self
            .inbox_rx
            .lock()
            .take()
            .ok_or(RebuildError::AlreadyRunning)?;
        let started = Instant::now();

        info!(
            "Starting {} rebuild on {}, waiting {:?} for the cluster to settle",
            self.role, self.node, self.config.cluster_stable_wait
        );
        self.stabilize(&mut inbox).await?;

        let mut generation = self.last_generation.clone();
        let mut adopted = None;
        loop {
            generation = match adopted.take() {
                Some(adopted) => adopted,
                None => GenerationNumber::mint(&generation, self.node.id.clone(), Utc::now())?,
            };

            self.set_phase(RebuildPhase::Proposing);
            let pending = match self.propose(&generation, &mut inbox).await? {
                Step::Done(pending) => pending,
                Step::Restart {
                    adopted: next,
                    reason,
                } => {
                    self.restart(&generation, reason);
                    adopted = next;
                    continue;
                }
            };

            self.set_phase(RebuildPhase::Updating);
            match self
                .collect_uploads(&generation, pending, started, &mut inbox)
                .await?
            {
                Step::Done(cache) => return self.complete(generation, cache, &mut inbox).await,
                Step::Restart {
                    adopted: next,
                    reason,
                } => {
                    self.restart(&generation, reason);
                    adopted = next;
                }
            }
        }
    }

    async fn stabilize(&self, inbox: &mut mpsc::UnboundedReceiver<RebuildEvent>) -> RebuildResult<()> {
        let settled = sleep(self.config.cluster_stable_wait);
        tokio::pin!(settled);
        loop {
            tokio::select! {
                _ = &mut settled => return Ok(()),
                event = inbox.recv() => match event {
                    None | Some(RebuildEvent::Deactivate) => return Err(RebuildError::Deactivated),
                    Some(_) => {}
                },
            }
        }
    }

    /// Broadcast a proposal of `generation` and collect the accepting nodes
    async fn propose(
        &self,
        generation: &GenerationNumber,
        inbox: &mut mpsc::UnboundedReceiver<RebuildEvent>,
    ) -> RebuildResult<Step<PendingNodes>> {
        info!("Proposing {} generation {}", self.role, generation);
        let proposal = RebuildMessage::GenerationProposal(GenerationProposal {
            header: GenerationHeader::new(generation.clone(), self.role),
        });
        let mut replies = self.transport.broadcast(proposal).await?;

        let mut pending = PendingNodes::new();
        let phase_started = Instant::now();
        let mut stuck_reported = false;

        loop {
            tokio::select! {
                reply = replies.recv() => {
                    let (from, bytes) = match reply {
                        Some(reply) => reply,
                        None => break,
                    };
                    let reply = match RebuildMessage::from_bytes(&bytes) {
                        Ok(RebuildMessage::GenerationProposalReply(reply)) => reply,
                        Ok(other) => {
                            debug!("Ignoring {} from {} while proposing", other.name(), from);
                            continue;
                        }
                        Err(e) => {
                            warn!("Undecodable proposal reply from {}: {}", from, e);
                            return Ok(Step::Restart { adopted: None, reason: "corrupt_reply" });
                        }
                    };

                    if reply.proposed_generation != *generation {
                        debug!("Stale proposal reply from {} for {}", from, reply.proposed_generation);
                    } else if let Some(e) = &reply.error {
                        warn!("Node {} failed to process proposal {}: {}", from, generation, e);
                    } else if reply.current_generation == *generation {
                        debug!("Node {} accepted generation {}", from, generation);
                        pending.insert(from.id.clone(), from);
                    } else if reply.current_generation > *generation {
                        info!(
                            "Node {} is at generation {}, above proposed {}",
                            from, reply.current_generation, generation
                        );
                        return Ok(Step::Restart {
                            adopted: Some(reply.current_generation),
                            reason: "outbid",
                        });
                    }
                }
                event = inbox.recv() => match event {
                    None | Some(RebuildEvent::Deactivate) => return Err(RebuildError::Deactivated),
                    Some(RebuildEvent::NodeDown(node)) => remove_if_down(&mut pending, &node),
                    Some(_) => {}
                },
                _ = sleep(self.config.proposal_receive_timeout) => {
                    if !stuck_reported && phase_started.elapsed() >= self.config.health_report_threshold {
                        self.report(
                            HealthReportKind::RebuildBroadcastStuck,
                            HealthSeverity::Warning,
                            format!("{} generation {} proposal replies outstanding", self.role, generation),
                        );
                        stuck_reported = true;
                    }
                }
            }
        }

        if stuck_reported {
            self.report(
                HealthReportKind::RebuildBroadcastStuck,
                HealthSeverity::Ok,
                format!("{} generation {} proposal completed", self.role, generation),
            );
        }
        info!(
            "{} nodes accepted {} generation {}",
            pending.len(),
            self.role,
            generation
        );
        Ok(Step::Done(pending))
    }

    /// Request uploads from `pending` until none is outstanding
    async fn collect_uploads(
        &self,
        generation: &GenerationNumber,
        mut pending: PendingNodes,
        started: Instant,
        inbox: &mut mpsc::UnboundedReceiver<RebuildEvent>,
    ) -> RebuildResult<Step<InBuildCache>> {
        let header = GenerationHeader::new(generation.clone(), self.role);
        let update = RebuildMessage::GenerationUpdate(GenerationUpdate {
            header: header.clone(),
            service_epoch: self.service_epoch,
        });

        let mut cache = InBuildCache::new();
        let mut uploaded = HashSet::new();
        let mut timer = RetryTimer::new(
            self.config.min_retry_interval,
            self.config.max_retry_interval,
        );
        let phase_started = Instant::now();
        let mut stuck_reported = false;

        self.send_updates(&update, &pending).await;
        MetricsRecorder::set_rebuild_pending_nodes(pending.len());

        while !pending.is_empty() {
            tokio::select! {
                event = inbox.recv() => {
                    let (from, bytes) = match event {
                        None | Some(RebuildEvent::Deactivate) => return Err(RebuildError::Deactivated),
                        Some(RebuildEvent::NodeDown(node)) => {
                            remove_if_down(&mut pending, &node);
                            MetricsRecorder::set_rebuild_pending_nodes(pending.len());
                            continue;
                        }
                        Some(RebuildEvent::NodeUp(_)) => continue,
                        Some(RebuildEvent::Message { from, bytes }) => (from, bytes),
                    };

                    match RebuildMessage::from_bytes(&bytes) {
                        Ok(RebuildMessage::LfumUpload(upload)) => {
                            if self.accept_upload(&header, &upload, &mut pending, &mut uploaded, &mut cache)? {
                                timer.reset();
                            }
                        }
                        Ok(RebuildMessage::GenerationUpdateReject(reject)) => {
                            if reject.header.role == self.role && reject.header.generation > *generation {
                                info!(
                                    "Node {} rejected update, it is at generation {}",
                                    from, reject.header.generation
                                );
                                return Ok(Step::Restart {
                                    adopted: Some(reject.header.generation),
                                    reason: "update_rejected",
                                });
                            }
                            debug!("Ignoring stale update reject from {}", from);
                        }
                        Ok(other) => debug!("Ignoring {} from {} while updating", other.name(), from),
                        Err(e) => {
                            warn!("Undecodable message from {} while updating: {}", from, e);
                            return Ok(Step::Restart { adopted: None, reason: "corrupt_upload" });
                        }
                    }
                }
                _ = sleep_until(timer.deadline()) => {
                    debug!("Resending {} generation {} update to {} nodes", self.role, generation, pending.len());
                    self.send_updates(&update, &pending).await;
                    timer.reset();

                    if !stuck_reported && phase_started.elapsed() >= self.config.health_report_threshold {
                        let mut outstanding: Vec<_> = pending.values().map(|n| n.to_string()).collect();
                        outstanding.sort();
                        self.report(
                            HealthReportKind::RebuildUploadStuck,
                            HealthSeverity::Warning,
                            format!("{} generation {} waiting for uploads from {}", self.role, generation, outstanding.join(", ")),
                        );
                        stuck_reported = true;
                    }
                    if started.elapsed() >= self.config.rebuild_time_limit {
                        self.report(
                            HealthReportKind::RebuildTimeLimitExceeded,
                            HealthSeverity::Error,
                            format!("{} rebuild running for {:?}", self.role, started.elapsed()),
                        );
                    }
                }
            }
        }

        if stuck_reported {
            self.report(
                HealthReportKind::RebuildUploadStuck,
                HealthSeverity::Ok,
                format!("{} generation {} uploads completed", self.role, generation),
            );
        }
        Ok(Step::Done(cache))
    }

    /// Merge and acknowledge an upload
    ///
    /// Returns true if the upload removed a pending node.
    fn accept_upload(
        &self,
        header: &GenerationHeader,
        upload: &LfumUpload,
        pending: &mut PendingNodes,
        uploaded: &mut HashSet<NodeId>,
        cache: &mut InBuildCache,
    ) -> RebuildResult<bool> {
        if upload.header != *header {
            debug!(
                "Ignoring upload from {} for {} generation {}",
                upload.node, upload.header.role, upload.header.generation
            );
            return Ok(false);
        }

        let progressed = if pending.remove(&upload.node.id).is_some() {
            cache.add_upload(upload)?;
            uploaded.insert(upload.node.id.clone());
            MetricsRecorder::set_rebuild_pending_nodes(pending.len());
            debug!(
                "Merged {} reports from {}, {} nodes outstanding",
                upload.reports.len(),
                upload.node,
                pending.len()
            );
            true
        } else if uploaded.contains(&upload.node.id) {
            debug!("Duplicate upload from {}", upload.node);
            false
        } else {
            debug!("Ignoring upload from {} which did not accept the proposal", upload.node);
            return Ok(false);
        };

        self.acknowledge(upload.node.clone(), header.clone());
        Ok(progressed)
    }

    /// Confirm an upload without blocking the rebuild on the send
    fn acknowledge(&self, node: NodeInstance, header: GenerationHeader) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let reply = RebuildMessage::LfumUploadReply(LfumUploadReply { header });
            if let Err(e) = transport.send(&node, reply).await {
                warn!("Failed to acknowledge upload from {}: {}", node, e);
            }
        });
    }

    async fn send_updates(&self, update: &RebuildMessage, pending: &PendingNodes) {
        let mut nodes: Vec<_> = pending.values().collect();
        nodes.sort();
        for node in nodes {
            if let Err(e) = self.transport.send(node, update.clone()).await {
                warn!("Failed to send generation update to {}: {}", node, e);
            }
        }
    }

    async fn complete(
        &self,
        generation: GenerationNumber,
        cache: InBuildCache,
        inbox: &mut mpsc::UnboundedReceiver<RebuildEvent>,
    ) -> RebuildResult<RebuildOutcome> {
        self.set_phase(RebuildPhase::UpdateCompleted);
        MetricsRecorder::set_rebuild_pending_nodes(0);
        info!(
            "{} rebuild collected {} failover units under generation {}",
            self.role,
            cache.len(),
            generation
        );

        while self.membership.up_node_count() < self.membership.expected_cluster_size() {
            debug!(
                "Waiting for {} of {} nodes before recovery",
                self.membership.up_node_count(),
                self.membership.expected_cluster_size()
            );
            match inbox.recv().await {
                None | Some(RebuildEvent::Deactivate) => return Err(RebuildError::Deactivated),
                Some(_) => {}
            }
        }

        self.set_phase(RebuildPhase::RecoverCompleted);
        let create_bootstrap_partition =
            self.role == GenerationRole::PrimaryAuthority && !cache.has_evidence();
        if create_bootstrap_partition {
            info!("No replica found anywhere, the bootstrap partition will be created");
        }

        Ok(RebuildOutcome {
            role: self.role,
            generation,
            units: cache.generate(),
            create_bootstrap_partition,
        })
    }

    fn restart(&self, generation: &GenerationNumber, reason: &str) {
        warn!(
            "Restarting {} rebuild from generation {}: {}",
            self.role, generation, reason
        );
        MetricsRecorder::record_rebuild_restart(self.role.as_str(), reason);
    }

    fn set_phase(&self, phase: RebuildPhase) {
        *self.phase.write() = phase;
    }

    fn report(&self, kind: HealthReportKind, severity: HealthSeverity, context: String) {
        if severity == HealthSeverity::Error {
            error!("{:?}: {}", kind, context);
        }
        self.health.report_health(
            HealthReport::new(kind, severity, context).with_ttl(self.config.health_report_ttl),
        );
    }
}

/// Drop `node` from `pending` if it is the awaited instance or newer
fn remove_if_down(pending: &mut PendingNodes, node: &NodeInstance) {
    let awaited = match pending.get(&node.id) {
        Some(awaited) => awaited.instance_id,
        None => return,
    };
    if node.instance_id >= awaited {
        info!("Node {} went down, no longer waiting for its upload", node);
        pending.remove(&node.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbuild::tests::{replica, report};
    use crate::inbuild::FailoverUnitReport;
    use crate::rpc::{GenerationProposalReply, GenerationUpdateReject};
    use crate::transport::{tests::ScriptedTransport, StaticMembership};
    use ruvector_failover::{InMemoryHealthReporter, InMemoryStore, ReplicaRole, ReplicaState};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    type Sent = mpsc::UnboundedReceiver<(NodeInstance, RebuildMessage)>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn config() -> RebuildConfig {
        RebuildConfig {
            cluster_stable_wait: Duration::ZERO,
            min_retry_interval: Duration::from_secs(30),
            max_retry_interval: Duration::from_secs(30),
            proposal_receive_timeout: Duration::from_millis(50),
            ..RebuildConfig::default()
        }
    }

    fn node(id: &str) -> NodeInstance {
        NodeInstance::new(id, 1)
    }

    fn proposed(message: &RebuildMessage) -> GenerationNumber {
        match message {
            RebuildMessage::GenerationProposal(p) => p.header.generation.clone(),
            other => panic!("expected proposal, got {}", other.name()),
        }
    }

    fn reply(
        from: &NodeInstance,
        proposed: &GenerationNumber,
        current: &GenerationNumber,
    ) -> (NodeInstance, Vec<u8>) {
        let reply = RebuildMessage::GenerationProposalReply(GenerationProposalReply {
            proposed_generation: proposed.clone(),
            current_generation: current.clone(),
            error: None,
        });
        (from.clone(), reply.to_bytes().unwrap())
    }

    /// Every node in `accepting` echoes the proposed generation
    fn accept_all(
        accepting: Vec<NodeInstance>,
    ) -> impl Fn(&RebuildMessage) -> Vec<(NodeInstance, Vec<u8>)> {
        move |message| {
            let generation = proposed(message);
            accepting.iter().map(|n| reply(n, &generation, &generation)).collect()
        }
    }

    struct Harness {
        context: Arc<RebuildContext>,
        transport: Arc<ScriptedTransport>,
        health: Arc<InMemoryHealthReporter>,
        membership: Arc<StaticMembership>,
        sent: Sent,
    }

    impl Harness {
        fn new(role: GenerationRole, config: RebuildConfig, expected_cluster_size: usize) -> Self {
            init_tracing();
            let (transport, sent) = ScriptedTransport::new();
            let health = Arc::new(InMemoryHealthReporter::new());
            let membership = Arc::new(StaticMembership::with_nodes(
                expected_cluster_size,
                [node("fm")],
            ));
            let context = Arc::new(RebuildContext::new(
                node("fm"),
                role,
                config,
                transport.clone(),
                membership.clone(),
                health.clone(),
            ));
            Self {
                context,
                transport,
                health,
                membership,
                sent,
            }
        }

        fn start(&self) -> JoinHandle<RebuildResult<RebuildOutcome>> {
            let context = self.context.clone();
            tokio::spawn(async move { context.run().await })
        }

        /// Next message sent, skipping upload acknowledgements unless asked
        async fn next_sent(&mut self, skip_acks: bool) -> (NodeInstance, RebuildMessage) {
            loop {
                let sent = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
                    .await
                    .expect("nothing sent")
                    .expect("transport closed");
                if skip_acks && matches!(sent.1, RebuildMessage::LfumUploadReply(_)) {
                    continue;
                }
                return sent;
            }
        }

        async fn expect_update(&mut self) -> (NodeInstance, GenerationNumber) {
            match self.next_sent(true).await {
                (to, RebuildMessage::GenerationUpdate(update)) => (to, update.header.generation),
                (_, other) => panic!("expected update, got {}", other.name()),
            }
        }

        fn upload(
            &self,
            from: &NodeInstance,
            generation: &GenerationNumber,
            reports: Vec<FailoverUnitReport>,
            found: bool,
        ) {
            let upload = RebuildMessage::LfumUpload(LfumUpload {
                header: GenerationHeader::new(generation.clone(), self.context.role()),
                node: from.clone(),
                reports,
                any_replica_found: found,
            });
            self.context.deliver(from.clone(), upload.to_bytes().unwrap());
        }
    }

    async fn finish(handle: JoinHandle<RebuildResult<RebuildOutcome>>) -> RebuildOutcome {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("rebuild did not finish")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rebuild_merges_uploads() {
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        let (a, b) = (node("a"), node("b"));
        harness.transport.script(accept_all(vec![a.clone(), b.clone()]));
        let handle = harness.start();

        let (first, generation) = harness.expect_update().await;
        let (second, same) = harness.expect_update().await;
        assert_eq!(generation, same);
        assert_eq!((first, second), (a.clone(), b.clone()));
        assert_eq!(harness.context.phase(), RebuildPhase::Updating);

        let id = Uuid::new_v4();
        let view = vec![
            replica("a", 1, (ReplicaRole::None, ReplicaRole::Primary), ReplicaState::Ready, true),
            replica("b", 1, (ReplicaRole::None, ReplicaRole::Secondary), ReplicaState::Ready, true),
        ];
        harness.upload(&a, &generation, vec![report(id, (0, 111), view.clone(), true)], true);
        // Duplicate is acknowledged again but merged once
        harness.upload(&a, &generation, vec![report(id, (0, 111), view.clone(), true)], true);
        harness.upload(&b, &generation, vec![report(id, (0, 111), view, false)], true);

        let outcome = finish(handle).await;
        assert_eq!(outcome.generation, generation);
        assert_eq!(outcome.units.len(), 1);
        assert_eq!(outcome.units[0].replica_count(), 2);
        assert!(!outcome.create_bootstrap_partition);
        assert_eq!(harness.context.phase(), RebuildPhase::RecoverCompleted);

        let mut acked = Vec::new();
        for _ in 0..3 {
            match harness.next_sent(false).await {
                (to, RebuildMessage::LfumUploadReply(reply)) => {
                    assert_eq!(reply.header.generation, generation);
                    acked.push(to.id);
                }
                (_, other) => panic!("expected ack, got {}", other.name()),
            }
        }
        acked.sort();
        assert_eq!(acked, vec!["a", "a", "b"]);

        let map = FailoverUnitMap::new(Arc::new(InMemoryStore::new()));
        outcome.install(&map).unwrap();
        assert!(map.contains(&id));
    }

    #[tokio::test]
    async fn test_outbid_proposal_restarts_with_adopted_generation() {
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        let (a, b) = (node("a"), node("b"));

        let (first_a, first_b) = (a.clone(), b.clone());
        harness.transport.script(move |message| {
            let generation = proposed(message);
            let higher = GenerationNumber::new(generation.value + 1, "other-fm");
            vec![
                reply(&first_a, &generation, &generation),
                reply(&first_b, &generation, &higher),
            ]
        });
        harness.transport.script(accept_all(vec![b.clone()]));
        let handle = harness.start();

        let (to, generation) = harness.expect_update().await;
        assert_eq!(to, b);
        assert_eq!(generation.owner, "other-fm");

        let broadcasts = harness.transport.broadcasts();
        assert_eq!(broadcasts.len(), 2);
        let first = proposed(&broadcasts[0]);
        assert_eq!(proposed(&broadcasts[1]), GenerationNumber::new(first.value + 1, "other-fm"));

        harness.upload(&b, &generation, vec![], true);
        let outcome = finish(handle).await;
        assert_eq!(outcome.generation, generation);

        // Node a's first acceptance was discarded
        while let Ok((to, message)) = harness.sent.try_recv() {
            if matches!(message, RebuildMessage::GenerationUpdate(_)) {
                assert_ne!(to, a);
            }
        }
    }

    #[tokio::test]
    async fn test_corrupt_reply_restarts_with_fresh_generation() {
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        let a = node("a");
        let garbage_from = a.clone();
        harness
            .transport
            .script(move |_| vec![(garbage_from.clone(), Vec::new())]);
        harness.transport.script(accept_all(vec![a.clone()]));
        let handle = harness.start();

        let (_, generation) = harness.expect_update().await;
        let broadcasts = harness.transport.broadcasts();
        assert_eq!(broadcasts.len(), 2);
        assert!(proposed(&broadcasts[1]) > proposed(&broadcasts[0]));
        assert_eq!(generation, proposed(&broadcasts[1]));

        harness.upload(&a, &generation, vec![], false);
        finish(handle).await;
    }

    #[tokio::test]
    async fn test_exhausted_generation_stops_rebuild() {
        init_tracing();
        let (transport, _sent) = ScriptedTransport::new();
        let last = GenerationNumber::new(i64::MAX, "peer");
        let context = RebuildContext::new(
            node("fm"),
            GenerationRole::BackupAuthority,
            config(),
            transport.clone(),
            Arc::new(StaticMembership::with_nodes(1, [node("fm")])),
            Arc::new(InMemoryHealthReporter::new()),
        )
        .with_last_generation(last.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), context.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(RebuildError::GenerationExhausted(g)) if g == last));
        assert!(transport.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_update_reject_restarts_with_higher_generation() {
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        let a = node("a");
        harness.transport.script(accept_all(vec![a.clone()]));
        harness.transport.script(accept_all(vec![a.clone()]));
        let handle = harness.start();

        let (_, generation) = harness.expect_update().await;
        let higher = GenerationNumber::new(generation.value + 5, "fm");
        let reject = RebuildMessage::GenerationUpdateReject(GenerationUpdateReject {
            header: GenerationHeader::new(higher.clone(), GenerationRole::BackupAuthority),
        });
        harness.context.deliver(a.clone(), reject.to_bytes().unwrap());

        let (_, restarted) = harness.expect_update().await;
        assert_eq!(restarted, higher);

        // Upload for the abandoned generation is ignored
        harness.upload(&a, &generation, vec![], false);
        harness.upload(&a, &restarted, vec![], false);
        let outcome = finish(handle).await;
        assert_eq!(outcome.generation, higher);
    }

    #[tokio::test]
    async fn test_node_down_stops_waiting() {
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        let (a, b) = (node("a"), node("b"));
        harness.transport.script(accept_all(vec![a.clone(), b.clone()]));
        let handle = harness.start();

        let (_, generation) = harness.expect_update().await;
        harness.expect_update().await;

        // An older instance going down does not count
        harness.context.node_down(NodeInstance::new("b", 0));
        harness.upload(&a, &generation, vec![], true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.context.phase(), RebuildPhase::Updating);

        harness.context.node_down(b);
        finish(handle).await;
    }

    #[tokio::test]
    async fn test_updates_resent_to_outstanding_nodes() {
        let config = RebuildConfig {
            min_retry_interval: Duration::from_millis(20),
            max_retry_interval: Duration::from_millis(40),
            health_report_threshold: Duration::ZERO,
            ..config()
        };
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config, 1);
        let (a, b) = (node("a"), node("b"));
        harness.transport.script(accept_all(vec![a.clone(), b.clone()]));
        let handle = harness.start();

        let (_, generation) = harness.expect_update().await;
        harness.expect_update().await;
        harness.upload(&a, &generation, vec![], true);

        // Retries eventually go to b only
        let mut resent_to_b = false;
        for _ in 0..10 {
            let (to, _) = harness.expect_update().await;
            if to == b {
                resent_to_b = true;
                break;
            }
        }
        assert!(resent_to_b);

        let stuck = harness
            .health
            .latest(HealthReportKind::RebuildUploadStuck)
            .unwrap();
        assert_eq!(stuck.severity, HealthSeverity::Warning);

        harness.upload(&b, &generation, vec![], true);
        finish(handle).await;
        let cleared = harness
            .health
            .latest(HealthReportKind::RebuildUploadStuck)
            .unwrap();
        assert_eq!(cleared.severity, HealthSeverity::Ok);
    }

    #[tokio::test]
    async fn test_updates_carry_service_epoch() {
        init_tracing();
        let (transport, mut sent) = ScriptedTransport::new();
        let a = node("a");
        transport.script(accept_all(vec![a.clone()]));
        let last = GenerationNumber::new(i64::MAX / 2, "old-fm");
        let context = Arc::new(
            RebuildContext::new(
                node("fm"),
                GenerationRole::PrimaryAuthority,
                config(),
                transport,
                Arc::new(StaticMembership::with_nodes(1, [node("fm")])),
                Arc::new(InMemoryHealthReporter::new()),
            )
            .with_last_generation(last.clone())
            .with_service_epoch(Epoch::from_parts(1, 3, 4)),
        );
        let runner = context.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let update = match sent.recv().await.unwrap() {
            (_, RebuildMessage::GenerationUpdate(update)) => update,
            (_, other) => panic!("expected update, got {}", other.name()),
        };
        assert_eq!(update.header.generation, GenerationNumber::new(last.value + 1, "fm"));
        assert_eq!(update.service_epoch, Some(Epoch::from_parts(1, 3, 4)));

        context.deactivate();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RebuildError::Deactivated)));
    }

    #[tokio::test]
    async fn test_deactivate_stops_rebuild() {
        let mut harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        harness.transport.script(accept_all(vec![node("a")]));
        let handle = harness.start();

        harness.expect_update().await;
        harness.context.deactivate();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RebuildError::Deactivated)));
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let harness = Harness::new(GenerationRole::BackupAuthority, config(), 1);
        let first = harness.start();
        finish(first).await;

        let second = harness.context.run().await;
        assert!(matches!(second, Err(RebuildError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_recovery_waits_for_expected_cluster_size() {
        let mut harness = Harness::new(GenerationRole::PrimaryAuthority, config(), 2);
        let a = node("a");
        harness.transport.script(accept_all(vec![a.clone()]));
        let mut handle = harness.start();

        let (_, generation) = harness.expect_update().await;
        harness.upload(&a, &generation, vec![], false);

        let early = tokio::time::timeout(Duration::from_millis(200), &mut handle).await;
        assert!(early.is_err());
        assert_eq!(harness.context.phase(), RebuildPhase::UpdateCompleted);

        harness.membership.node_up(a.clone());
        harness.context.node_up(a);
        let outcome = finish(handle).await;
        assert!(outcome.create_bootstrap_partition);
        assert!(outcome.units.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_evidence_prevents_creation() {
        let mut harness = Harness::new(GenerationRole::PrimaryAuthority, config(), 1);
        let a = node("a");
        harness.transport.script(accept_all(vec![a.clone()]));
        let handle = harness.start();

        let (_, generation) = harness.expect_update().await;
        harness.upload(&a, &generation, vec![], true);
        let outcome = finish(handle).await;
        assert!(!outcome.create_bootstrap_partition);
    }
}
