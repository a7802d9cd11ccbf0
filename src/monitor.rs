//! SWIM-style failure detector
//!
//! Every node runs the same four roles: it probes one healthy peer per
//! tick, answers probes, acts as an intermediary for indirect probes of
//! third parties, and ages suspicions into failures.
//!
//! Peer state machine (as seen from one node):
//!
//! ```text
//!                  ┌───── tick timeout ─────┐
//!       healthy ──►│                        ▼
//!         ▲        │                    degraded
//!         │ indirect majority healthy   │
//!         │                             ▼
//!         └──────── refutation ◄──── suspect ──► failed
//!                                     │            │
//!                                     └─ timeout ──┘
//! ```
//!
//! Timeouts adapt in two directions: the local-health multiplier
//! inflates probe deadlines when this node itself keeps missing acks,
//! and the suspicion window shrinks as more intermediaries confirm a
//! suspicion while growing with cluster size.

use crate::config::SimurghConfig;
use crate::controller::Controller;
use crate::models::{HealthCheck, HealthStatus, NodeAddr};
use crate::transport::TransportError;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Health update exchanged on probes and gossip.
pub const EVENT_HEALTH_UPDATE: &str = "register_health_update";
/// TCP join handshake and peer introductions.
pub const EVENT_NEW_NODE: &str = "register_new_node";
/// Ask an intermediary to probe a third party.
pub const EVENT_INDIRECT_CHECK: &str = "send_indirect_check";
/// Propagate a confirmed suspicion with its verdict shard ids.
pub const EVENT_UPDATE_SUSPECT: &str = "update_suspect";
/// Propagate a refutation.
pub const EVENT_UPDATE_ACTIVE: &str = "update_active";

/// One indirect-probe round, reconciled.
struct ProbeRound {
    /// Verdict shard ids, oldest first.
    shard_ids: Vec<u64>,
    /// Valid suspect verdicts plus unresponsive intermediaries.
    suspect_count: usize,
    /// Intermediaries that never answered.
    unresponsive: Vec<NodeAddr>,
    /// Whether the parallel direct TCP probe got through.
    direct_ok: bool,
}

struct MonitorInner {
    controller: Arc<Controller>,
    config: SimurghConfig,
    local: NodeAddr,

    status: Mutex<HealthStatus>,
    error_context: Mutex<Option<String>>,
    table: Mutex<HashMap<NodeAddr, HealthStatus>>,

    local_health_multiplier: AtomicU32,
    confirmed_suspicions: Mutex<HashMap<NodeAddr, u32>>,
    suspect_shard_ids: Mutex<HashMap<NodeAddr, Vec<u64>>>,
    suspect_tasks: Mutex<HashMap<NodeAddr, JoinHandle<()>>>,
    active_probes: Mutex<HashSet<NodeAddr>>,
    probe_tasks: Mutex<Vec<JoinHandle<()>>>,
    loop_tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(host: &str, port: u16, workers: usize, config: &SimurghConfig) -> Self {
        let controller = Arc::new(Controller::new(host, port, workers, config));

        let inner = Arc::new(MonitorInner {
            controller,
            config: config.clone(),
            local: (host.to_string(), port),
            status: Mutex::new(HealthStatus::Initializing),
            error_context: Mutex::new(None),
            table: Mutex::new(HashMap::new()),
            local_health_multiplier: AtomicU32::new(0),
            confirmed_suspicions: Mutex::new(HashMap::new()),
            suspect_shard_ids: Mutex::new(HashMap::new()),
            suspect_tasks: Mutex::new(HashMap::new()),
            active_probes: Mutex::new(HashSet::new()),
            probe_tasks: Mutex::new(Vec::new()),
            loop_tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        });

        MonitorInner::register_handlers(&inner);
        Self { inner }
    }

    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.inner.controller)
    }

    pub fn addr(&self) -> NodeAddr {
        self.inner.local.clone()
    }

    /// This node's own status.
    pub fn status(&self) -> HealthStatus {
        *self.inner.status.lock().unwrap()
    }

    /// Snapshot of the node-status table.
    pub fn node_statuses(&self) -> HashMap<NodeAddr, HealthStatus> {
        self.inner.table.lock().unwrap().clone()
    }

    pub fn status_of(&self, addr: &NodeAddr) -> Option<HealthStatus> {
        self.inner.table.lock().unwrap().get(addr).copied()
    }

    pub fn local_health_multiplier(&self) -> u32 {
        self.inner.local_health_multiplier.load(Ordering::Acquire)
    }

    /// Bind the RPC endpoints and wait out the boot delay.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.inner.controller.start_server().await?;
        tokio::time::sleep(self.inner.config.boot_wait).await;
        Ok(())
    }

    /// Join the cluster through a seed node, then start probing.
    ///
    /// Connection refusals are retried inside the transport; running out
    /// of retries or the registration window surfaces as a join failure.
    pub async fn register(&self, seed: &NodeAddr) -> Result<(), TransportError> {
        let inner = Arc::clone(&self.inner);

        let handshake = async {
            inner.controller.start_client(seed).await?;

            let check = HealthCheck::new(&inner.local, HealthStatus::Initializing);
            let (_, reply): (u64, HealthCheck) = inner
                .controller
                .send_tcp(EVENT_NEW_NODE, seed, &check)
                .await?;
            Ok::<HealthCheck, TransportError>(reply)
        };

        let reply = timeout(self.inner.config.registration_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::Io("registration handshake timed out".to_string())
            })??;

        debug!(
            "registered with seed {}:{} (seed status {})",
            seed.0, seed.1, reply.status
        );

        self.inner.set_peer_status(seed, HealthStatus::Healthy);
        *self.inner.status.lock().unwrap() = HealthStatus::Healthy;
        self.start_background_tasks();

        info!("joined cluster via {}:{}", seed.0, seed.1);
        Ok(())
    }

    /// Start as the first node of a cluster: no handshake, just the
    /// probe and cleanup loops.
    pub fn start_standalone(&self) {
        *self.inner.status.lock().unwrap() = HealthStatus::Healthy;
        self.start_background_tasks();
    }

    fn start_background_tasks(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let probe = tokio::spawn(MonitorInner::probe_loop(Arc::clone(&self.inner)));
        let cleanup = tokio::spawn(MonitorInner::cleanup_loop(Arc::clone(&self.inner)));

        let mut tasks = self.inner.loop_tasks.lock().unwrap();
        tasks.push(probe);
        tasks.push(cleanup);
    }

    /// Stop all background work and close the endpoints.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);

        let loops: Vec<_> = self.inner.loop_tasks.lock().unwrap().drain(..).collect();
        for task in loops {
            task.abort();
        }

        let probes: Vec<_> = self.inner.probe_tasks.lock().unwrap().drain(..).collect();
        for task in probes {
            task.abort();
        }

        let suspects: Vec<_> = {
            let mut tasks = self.inner.suspect_tasks.lock().unwrap();
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in suspects {
            task.abort();
        }

        self.inner.controller.close().await;
        info!("monitor {}:{} shut down", self.inner.local.0, self.inner.local.1);
    }
}

impl MonitorInner {
    fn register_handlers(inner: &Arc<Self>) {
        let controller = Arc::clone(&inner.controller);

        let me = Arc::clone(inner);
        controller.register_handler(EVENT_HEALTH_UPDATE, move |_shard, check: HealthCheck| {
            let me = Arc::clone(&me);
            async move { Ok::<_, String>(me.on_health_update(check).await) }
        });

        let me = Arc::clone(inner);
        controller.register_handler(EVENT_NEW_NODE, move |_shard, check: HealthCheck| {
            let me = Arc::clone(&me);
            async move { Ok::<_, String>(me.on_new_node(check).await) }
        });

        let me = Arc::clone(inner);
        controller.register_handler(EVENT_INDIRECT_CHECK, move |_shard, check: HealthCheck| {
            let me = Arc::clone(&me);
            async move { Ok::<_, String>(me.on_indirect_check(check).await) }
        });

        let me = Arc::clone(inner);
        controller.register_handler(EVENT_UPDATE_SUSPECT, move |_shard, check: HealthCheck| {
            let me = Arc::clone(&me);
            async move { Ok::<_, String>(me.on_update_suspect(check).await) }
        });

        let me = Arc::clone(inner);
        controller.register_handler(EVENT_UPDATE_ACTIVE, move |_shard, check: HealthCheck| {
            let me = Arc::clone(&me);
            async move { Ok::<_, String>(me.on_update_active(check).await) }
        });
    }

    fn own_check(&self) -> HealthCheck {
        let status = *self.status.lock().unwrap();
        let error = self.error_context.lock().unwrap().clone();
        HealthCheck::new(&self.local, status).with_error(error)
    }

    fn is_local(&self, addr: &NodeAddr) -> bool {
        *addr == self.local
    }

    fn healthy_peers(&self) -> Vec<NodeAddr> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, status)| **status == HealthStatus::Healthy)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    fn non_failed_count(&self) -> usize {
        self.table
            .lock()
            .unwrap()
            .values()
            .filter(|status| **status != HealthStatus::Failed)
            .count()
    }

    /// Update the table. The local node never appears in it, and a
    /// `failed` entry only leaves that state through re-registration.
    fn set_peer_status(&self, addr: &NodeAddr, status: HealthStatus) -> bool {
        if self.is_local(addr) {
            return false;
        }

        let mut table = self.table.lock().unwrap();
        let previous = table.get(addr).copied();

        if previous == Some(HealthStatus::Failed) && status != HealthStatus::Healthy {
            return false;
        }

        table.insert(addr.clone(), status);
        previous != Some(status)
    }

    fn probe_deadline(&self) -> Duration {
        let multiplier = self.local_health_multiplier.load(Ordering::Acquire) + 1;
        self.config.health_check_timeout * multiplier
    }

    fn lhm_increment(&self) {
        let max = self.config.max_suspect_multiplier;
        let _ = self
            .local_health_multiplier
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            });
    }

    fn lhm_decrement(&self) {
        let _ = self
            .local_health_multiplier
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then_some(current - 1)
            });
    }

    fn cancel_suspicion(&self, addr: &NodeAddr) {
        let task = self.suspect_tasks.lock().unwrap().remove(addr);
        if let Some(task) = task {
            task.abort();
        }
        self.suspect_shard_ids.lock().unwrap().remove(addr);
    }

    /// Spawn the suspicion monitor for a peer unless one already owns
    /// it. Every `suspect` entry has exactly one of these.
    fn ensure_suspicion_task(self: &Arc<Self>, addr: &NodeAddr) {
        let mut tasks = self.suspect_tasks.lock().unwrap();
        tasks.retain(|_, task| !task.is_finished());

        if tasks.contains_key(addr) {
            return;
        }

        let me = Arc::clone(self);
        let target = addr.clone();
        tasks.insert(
            addr.clone(),
            tokio::spawn(async move { me.suspicion_monitor(target).await }),
        );
    }

    // --- server handlers -------------------------------------------------

    /// Probe receipt and gossip ingress.
    async fn on_health_update(self: Arc<Self>, check: HealthCheck) -> HealthCheck {
        let sender = check.source();

        // Receiving anything at all is evidence our own links work.
        self.lhm_decrement();

        // A sender we were suspecting has just spoken: refute it.
        let was_suspecting = self.status_is(&sender, HealthStatus::Suspect);
        if was_suspecting {
            self.cancel_suspicion(&sender);
            self.set_peer_status(&sender, HealthStatus::Healthy);

            let me = Arc::clone(&self);
            let refuted = sender.clone();
            tokio::spawn(async move {
                me.broadcast_status(&refuted, HealthStatus::Healthy).await;
            });
        }

        // Apply a piggybacked state update about a third node.
        if let (Some(target), Some(target_status)) = (check.target(), check.target_status) {
            if !self.is_local(&target) {
                match target_status {
                    HealthStatus::Healthy => {
                        self.cancel_suspicion(&target);
                        self.set_peer_status(&target, HealthStatus::Healthy);
                        let _ = self.controller.extend_client(&target).await;
                    }
                    HealthStatus::Suspect => {
                        self.set_peer_status(&target, HealthStatus::Suspect);
                        self.ensure_suspicion_task(&target);
                    }
                    HealthStatus::Failed => {
                        self.cancel_suspicion(&target);
                        self.set_peer_status(&target, HealthStatus::Failed);
                    }
                    HealthStatus::Degraded | HealthStatus::Initializing => {
                        self.set_peer_status(&target, target_status);
                    }
                }
            }
        }

        // Sender bookkeeping: install unseen peers, revive known ones.
        let known = self.table.lock().unwrap().get(&sender).copied();
        match known {
            None => {
                if self.controller.extend_client(&sender).await.is_ok() {
                    self.set_peer_status(&sender, HealthStatus::Healthy);
                    let me = Arc::clone(&self);
                    let newcomer = sender.clone();
                    tokio::spawn(async move {
                        me.introduce_known_peers(&newcomer).await;
                    });
                }
            }
            Some(HealthStatus::Failed) => {
                if self.controller.refresh_clients(&sender).await.is_ok() {
                    self.set_peer_status(&sender, HealthStatus::Healthy);
                }
            }
            Some(_) => {
                self.set_peer_status(&sender, HealthStatus::Healthy);
            }
        }

        self.own_check()
    }

    /// TCP join handshake (status `initializing`) and peer
    /// introductions (status `healthy`).
    async fn on_new_node(self: Arc<Self>, check: HealthCheck) -> HealthCheck {
        let node = check.source();

        if !self.is_local(&node) {
            self.cancel_suspicion(&node);

            if self.controller.extend_client(&node).await.is_ok() {
                // Re-registration is the one path out of `failed`.
                self.table.lock().unwrap().remove(&node);
                self.set_peer_status(&node, HealthStatus::Healthy);
            } else {
                warn!("failed to install pool for joining node {}:{}", node.0, node.1);
            }

            if check.status == HealthStatus::Initializing {
                // A genuine join: introduce the newcomer both ways.
                let me = Arc::clone(&self);
                let newcomer = node.clone();
                tokio::spawn(async move {
                    me.introduce_known_peers(&newcomer).await;
                    me.announce_new_peer(&newcomer).await;
                });
            }
        }

        self.own_check()
    }

    /// Intermediary role: probe the named target on the prober's
    /// behalf and report a verdict.
    async fn on_indirect_check(self: Arc<Self>, check: HealthCheck) -> HealthCheck {
        let Some(target) = check.target() else {
            return self.own_check().with_error(Some("missing target".to_string()));
        };

        let deadline = self.config.health_check_timeout;
        let probe = self.probe_once(&target);

        match timeout(deadline, probe).await {
            Ok(Ok(reply)) => self
                .own_check()
                .with_target(&target)
                .with_target_status(match reply.status {
                    HealthStatus::Suspect | HealthStatus::Failed => reply.status,
                    _ => HealthStatus::Healthy,
                }),
            Ok(Err(err)) => {
                debug!(
                    "indirect probe of {}:{} failed: {err}",
                    target.0, target.1
                );
                self.own_check()
                    .with_target(&target)
                    .with_target_status(HealthStatus::Suspect)
                    .with_error(Some(err.to_string()))
            }
            Err(_) => self
                .own_check()
                .with_target(&target)
                .with_target_status(HealthStatus::Suspect)
                .with_error(Some("timeout".to_string())),
        }
    }

    /// A peer confirmed a suspicion and is sharing the verdict ids.
    async fn on_update_suspect(self: Arc<Self>, check: HealthCheck) -> HealthCheck {
        let Some(target) = check.target() else {
            return self.own_check();
        };

        if self.is_local(&target) {
            // We are the suspect: refute ourselves to everyone.
            info!("received suspicion about self, broadcasting refutation");
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                let local = me.local.clone();
                me.broadcast_status(&local, HealthStatus::Healthy).await;
            });
            return self.own_check();
        }

        if let Some(shard_ids) = check.shard_ids.clone() {
            self.suspect_shard_ids
                .lock()
                .unwrap()
                .insert(target.clone(), shard_ids);
        }

        *self
            .confirmed_suspicions
            .lock()
            .unwrap()
            .entry(target.clone())
            .or_insert(0) += 1;

        self.set_peer_status(&target, HealthStatus::Suspect);
        self.ensure_suspicion_task(&target);

        self.own_check()
    }

    /// A peer announced a refutation: the target is healthy again.
    async fn on_update_active(self: Arc<Self>, check: HealthCheck) -> HealthCheck {
        if let Some(target) = check.target() {
            if !self.is_local(&target) {
                self.cancel_suspicion(&target);
                self.confirmed_suspicions.lock().unwrap().remove(&target);
                self.set_peer_status(&target, HealthStatus::Healthy);
                let _ = self.controller.extend_client(&target).await;
            }
        }

        self.own_check()
    }

    fn status_is(&self, addr: &NodeAddr, status: HealthStatus) -> bool {
        self.table.lock().unwrap().get(addr) == Some(&status)
    }

    // --- client stubs ----------------------------------------------------

    async fn probe_once(
        &self,
        addr: &NodeAddr,
    ) -> Result<HealthCheck, TransportError> {
        let check = self.own_check();
        let (_, reply): (u64, HealthCheck) = self
            .controller
            .send(EVENT_HEALTH_UPDATE, addr, &check)
            .await?;
        Ok(reply)
    }

    async fn probe_once_tcp(
        &self,
        addr: &NodeAddr,
    ) -> Result<(u64, HealthCheck), TransportError> {
        let check = self.own_check();
        self.controller.send_tcp(EVENT_HEALTH_UPDATE, addr, &check).await
    }

    async fn request_indirect_check(
        &self,
        intermediary: &NodeAddr,
        target: &NodeAddr,
    ) -> Result<(u64, HealthCheck), TransportError> {
        let check = self.own_check().with_target(target);
        self.controller
            .send(EVENT_INDIRECT_CHECK, intermediary, &check)
            .await
    }

    async fn submit_suspect_node(
        &self,
        peer: &NodeAddr,
        target: &NodeAddr,
        shard_ids: Vec<u64>,
    ) -> Result<(u64, HealthCheck), TransportError> {
        let check = self
            .own_check()
            .with_target(target)
            .with_target_status(HealthStatus::Suspect)
            .with_shard_ids(shard_ids);
        self.controller.send(EVENT_UPDATE_SUSPECT, peer, &check).await
    }

    async fn submit_active_node(
        &self,
        peer: &NodeAddr,
        target: &NodeAddr,
    ) -> Result<(u64, HealthCheck), TransportError> {
        let check = self
            .own_check()
            .with_target(target)
            .with_target_status(HealthStatus::Healthy);
        self.controller.send(EVENT_UPDATE_ACTIVE, peer, &check).await
    }

    async fn push_new_node(
        &self,
        peer: &NodeAddr,
        about: &NodeAddr,
    ) -> Result<(u64, HealthCheck), TransportError> {
        let check = HealthCheck::new(about, HealthStatus::Healthy);
        self.controller.send(EVENT_NEW_NODE, peer, &check).await
    }

    /// Gossip a state change about `target` to every healthy peer.
    async fn broadcast_status(&self, target: &NodeAddr, status: HealthStatus) {
        let deadline = self.config.health_check_timeout;

        for peer in self.healthy_peers() {
            if peer == *target {
                continue;
            }

            let check = self
                .own_check()
                .with_target(target)
                .with_target_status(status);

            match timeout(
                deadline,
                self.controller
                    .send::<HealthCheck, HealthCheck>(EVENT_HEALTH_UPDATE, &peer, &check),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    debug!("gossip to {}:{} failed: {err}", peer.0, peer.1);
                }
                Err(_) => {
                    debug!("gossip to {}:{} timed out", peer.0, peer.1);
                }
            }
        }
    }

    /// Tell a newcomer about every healthy peer we monitor.
    async fn introduce_known_peers(&self, newcomer: &NodeAddr) {
        for peer in self.healthy_peers() {
            if peer == *newcomer {
                continue;
            }
            if let Err(err) = self.push_new_node(newcomer, &peer).await {
                debug!(
                    "introduction of {}:{} to {}:{} failed: {err}",
                    peer.0, peer.1, newcomer.0, newcomer.1
                );
            }
        }
    }

    /// Tell every healthy peer about a newcomer.
    async fn announce_new_peer(&self, newcomer: &NodeAddr) {
        for peer in self.healthy_peers() {
            if peer == *newcomer {
                continue;
            }
            if let Err(err) = self.push_new_node(&peer, newcomer).await {
                debug!(
                    "announcement of {}:{} to {}:{} failed: {err}",
                    newcomer.0, newcomer.1, peer.0, peer.1
                );
            }
        }
    }

    // --- probe cycle -----------------------------------------------------

    async fn probe_loop(self: Arc<Self>) {
        let mut round = 0usize;

        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(self.config.health_poll_interval).await;

            let peers = self.healthy_peers();
            if peers.is_empty() {
                continue;
            }

            let target = peers[round % peers.len()].clone();
            round = round.wrapping_add(1);

            let me = Arc::clone(&self);
            let task = tokio::spawn(async move { me.run_healthcheck(target).await });
            self.probe_tasks.lock().unwrap().push(task);
        }
    }

    async fn run_healthcheck(self: Arc<Self>, addr: NodeAddr) {
        let deadline = self.probe_deadline();

        match timeout(deadline, self.probe_once(&addr)).await {
            Ok(Ok(_)) => {
                self.lhm_decrement();
                if self.status_is(&addr, HealthStatus::Degraded) {
                    self.set_peer_status(&addr, HealthStatus::Healthy);
                }
            }
            Ok(Err(err)) => {
                // Transport-level noise is not a probe verdict; status
                // stays unchanged.
                debug!("probe of {}:{} errored: {err}", addr.0, addr.1);
            }
            Err(_) => {
                if !self.running.load(Ordering::Acquire) {
                    return;
                }

                debug!("probe of {}:{} timed out", addr.0, addr.1);
                self.lhm_increment();
                self.set_peer_status(&addr, HealthStatus::Degraded);

                if self.active_probes.lock().unwrap().insert(addr.clone()) {
                    let me = Arc::clone(&self);
                    let task =
                        tokio::spawn(async move { me.probe_timed_out_node(addr).await });
                    self.probe_tasks.lock().unwrap().push(task);
                }
            }
        }
    }

    /// Pick `k` random healthy intermediaries, excluding the target.
    fn confirmation_members(&self, target: &NodeAddr) -> Vec<NodeAddr> {
        let candidates: Vec<NodeAddr> = self
            .healthy_peers()
            .into_iter()
            .filter(|peer| peer != target)
            .collect();

        let count = self.config.indirect_check_nodes.min(candidates.len());
        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, count)
            .cloned()
            .collect()
    }

    /// One indirect-probe round: `k` intermediaries plus one direct TCP
    /// probe, verdicts reconciled by shard-id recency. A suspect
    /// verdict only counts if it is newer than every healthy verdict,
    /// which resolves races where the target recovered between probes.
    async fn request_indirect_probe(
        &self,
        target: &NodeAddr,
        members: &[NodeAddr],
    ) -> ProbeRound {
        let window = self.config.health_check_timeout * 2;

        let indirect = members.iter().map(|member| {
            let member = member.clone();
            async move {
                let result = timeout(window, self.request_indirect_check(&member, target)).await;
                (member, result)
            }
        });

        let direct = async { timeout(window, self.probe_once_tcp(target)).await };

        let (indirect_results, direct_result) =
            tokio::join!(futures::future::join_all(indirect), direct);

        let mut verdicts: Vec<(u64, HealthStatus)> = Vec::new();
        let mut unresponsive = Vec::new();

        for (member, result) in indirect_results {
            match result {
                Ok(Ok((shard_id, reply))) => {
                    let verdict = reply.target_status.unwrap_or(reply.status);
                    verdicts.push((shard_id, verdict));
                }
                Ok(Err(err)) => {
                    debug!(
                        "indirect check via {}:{} failed: {err}",
                        member.0, member.1
                    );
                    self.lhm_increment();
                    unresponsive.push(member);
                }
                Err(_) => {
                    // indirect_nack: no reply in the probe window.
                    self.lhm_increment();
                    unresponsive.push(member);
                }
            }
        }

        let mut pending = unresponsive.len();
        let mut direct_ok = false;

        match direct_result {
            Ok(Ok((shard_id, reply))) => {
                direct_ok = true;
                verdicts.push((shard_id, reply.status));
            }
            Ok(Err(_)) | Err(_) => pending += 1,
        }

        verdicts.sort_by_key(|(shard_id, _)| *shard_id);

        let healthy_ids: Vec<u64> = verdicts
            .iter()
            .filter(|(_, status)| {
                matches!(
                    status,
                    HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Initializing
                )
            })
            .map(|(shard_id, _)| *shard_id)
            .collect();

        let valid_suspects = verdicts
            .iter()
            .filter(|(shard_id, status)| {
                *status == HealthStatus::Suspect
                    && healthy_ids.iter().all(|healthy| shard_id > healthy)
            })
            .count();

        ProbeRound {
            shard_ids: verdicts.iter().map(|(shard_id, _)| *shard_id).collect(),
            suspect_count: valid_suspects + pending,
            unresponsive,
            direct_ok,
        }
    }

    fn round_confirms_suspicion(round: &ProbeRound, members: &[NodeAddr]) -> bool {
        if members.is_empty() {
            // No intermediaries available: the direct TCP probe decides.
            return !round.direct_ok;
        }
        round.suspect_count >= members.len()
    }

    fn probe_timed_out_node(self: Arc<Self>, addr: NodeAddr) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            let members = self.confirmation_members(&addr);
            let round = self.request_indirect_probe(&addr, &members).await;

            if Self::round_confirms_suspicion(&round, &members) {
                self.suspect_shard_ids
                    .lock()
                    .unwrap()
                    .insert(addr.clone(), round.shard_ids.clone());
                self.set_peer_status(&addr, HealthStatus::Suspect);

                info!("peer {}:{} is now suspect", addr.0, addr.1);

                for member in &members {
                    let result = timeout(
                        self.config.health_check_timeout,
                        self.submit_suspect_node(member, &addr, round.shard_ids.clone()),
                    )
                    .await;
                    if result.is_err() {
                        debug!("suspicion notice to {}:{} timed out", member.0, member.1);
                    }
                }

                self.ensure_suspicion_task(&addr);
            } else {
                if !self.status_is(&addr, HealthStatus::Failed) {
                    self.set_peer_status(&addr, HealthStatus::Healthy);
                }

                // Intermediaries that never answered earn their own probes.
                for member in round.unresponsive {
                    if self.active_probes.lock().unwrap().insert(member.clone()) {
                        self.set_peer_status(&member, HealthStatus::Degraded);
                        let me = Arc::clone(&self);
                        let task =
                            tokio::spawn(async move { me.probe_timed_out_node(member).await });
                        self.probe_tasks.lock().unwrap().push(task);
                    }
                }
            }

            self.active_probes.lock().unwrap().remove(&addr);
        })
    }

    // --- suspicion lifecycle ---------------------------------------------

    fn suspicion_timeout(&self, addr: &NodeAddr) -> Duration {
        let nodes_count = self.non_failed_count() + 1;
        let confirmed = self
            .confirmed_suspicions
            .lock()
            .unwrap()
            .get(addr)
            .copied()
            .unwrap_or(0);

        compute_suspicion_timeout(
            nodes_count,
            confirmed,
            self.config.health_poll_interval,
            self.config.min_suspect_timeout_multiplier,
            self.config.max_suspect_timeout_multiplier,
            self.config.min_suspect_nodes_threshold,
        )
    }

    /// Owns a `suspect` entry: re-probe until refuted or the adaptive
    /// window closes. The window is recomputed per round because every
    /// incoming confirmation shrinks it.
    async fn suspicion_monitor(self: Arc<Self>, addr: NodeAddr) {
        let started = Instant::now();
        self.active_probes.lock().unwrap().remove(&addr);

        let refuted = loop {
            if started.elapsed() >= self.suspicion_timeout(&addr) {
                break false;
            }

            tokio::time::sleep(self.config.health_poll_interval).await;

            if !self.running.load(Ordering::Acquire) {
                return;
            }

            if !self.status_is(&addr, HealthStatus::Suspect) {
                // Decided from the outside (gossip refutation or a
                // failure notice); never resurrect a decided state.
                self.suspect_tasks.lock().unwrap().remove(&addr);
                return;
            }

            let members = self.confirmation_members(&addr);
            let round = self.request_indirect_probe(&addr, &members).await;

            if Self::round_confirms_suspicion(&round, &members) {
                self.suspect_shard_ids
                    .lock()
                    .unwrap()
                    .insert(addr.clone(), round.shard_ids.clone());

                for member in &members {
                    let _ = timeout(
                        self.config.health_check_timeout,
                        self.submit_suspect_node(member, &addr, round.shard_ids.clone()),
                    )
                    .await;
                }
            } else {
                break true;
            }
        };

        if refuted {
            info!("suspicion of {}:{} refuted", addr.0, addr.1);

            self.confirmed_suspicions.lock().unwrap().remove(&addr);
            self.suspect_shard_ids.lock().unwrap().remove(&addr);
            self.set_peer_status(&addr, HealthStatus::Healthy);

            let _ = self.controller.refresh_clients(&addr).await;

            for peer in self.healthy_peers() {
                if peer == addr {
                    continue;
                }
                let _ = timeout(
                    self.config.health_check_timeout,
                    self.submit_active_node(&peer, &addr),
                )
                .await;
            }
        } else {
            warn!("suspicion of {}:{} expired, marking failed", addr.0, addr.1);

            self.set_peer_status(&addr, HealthStatus::Failed);
            self.broadcast_status(&addr, HealthStatus::Failed).await;
        }

        self.suspect_tasks.lock().unwrap().remove(&addr);
    }

    // --- cleanup ---------------------------------------------------------

    /// Sweep finished probe tasks and reap `failed` peers along with
    /// their connection pools. Best-effort and re-entrant safe.
    async fn cleanup_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(self.config.cleanup_interval).await;

            self.probe_tasks
                .lock()
                .unwrap()
                .retain(|task| !task.is_finished());

            self.suspect_tasks
                .lock()
                .unwrap()
                .retain(|_, task| !task.is_finished());

            let failed: Vec<NodeAddr> = {
                let table = self.table.lock().unwrap();
                table
                    .iter()
                    .filter(|(_, status)| **status == HealthStatus::Failed)
                    .map(|(addr, _)| addr.clone())
                    .collect()
            };

            for addr in failed {
                debug!("reaping failed peer {}:{}", addr.0, addr.1);
                self.cancel_suspicion(&addr);
                self.controller.remove_clients(&addr).await;
                self.table.lock().unwrap().remove(&addr);
                self.confirmed_suspicions.lock().unwrap().remove(&addr);
                self.active_probes.lock().unwrap().remove(&addr);
            }
        }
    }
}

/// Adaptive suspicion timeout.
///
/// ```text
/// t_min   = round(min_mult × log10(nodes_count) × poll_interval, 2)
/// t_max   = round(max_mult × t_min, 2)
/// modifier = log(confirmed' + 1) / log(threshold + 1)
/// timeout = max(t_min, t_max − (t_max − t_min) × modifier)
/// ```
///
/// The window grows with cluster size and shrinks as confirmations of
/// the suspicion accumulate.
pub fn compute_suspicion_timeout(
    nodes_count: usize,
    confirmed: u32,
    poll_interval: Duration,
    min_multiplier: f64,
    max_multiplier: f64,
    threshold: usize,
) -> Duration {
    let poll = poll_interval.as_secs_f64();

    let t_min = round2(min_multiplier * (nodes_count.max(2) as f64).log10() * poll);
    let t_max = round2(max_multiplier * t_min);

    let confirmed = f64::from(confirmed.saturating_sub(1));
    let modifier = (confirmed + 1.0).ln() / ((threshold + 1) as f64).ln();

    let timeout = (t_max - (t_max - t_min) * modifier).max(t_min);
    Duration::from_secs_f64(timeout.max(0.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspicion_timeout_stays_within_bounds() {
        let poll = Duration::from_secs(1);

        for nodes in [2usize, 5, 50, 500] {
            let t_min = round2(5.0 * (nodes as f64).log10());
            let t_max = round2(30.0 * t_min);

            for confirmed in 0u32..20 {
                let timeout = compute_suspicion_timeout(nodes, confirmed, poll, 5.0, 30.0, 3);
                let secs = timeout.as_secs_f64();
                assert!(secs >= t_min - 1e-9, "below t_min: {secs} < {t_min}");
                assert!(secs <= t_max + 1e-9, "above t_max: {secs} > {t_max}");
            }
        }
    }

    #[test]
    fn test_suspicion_timeout_shrinks_with_confirmations() {
        let poll = Duration::from_secs(1);

        let unconfirmed = compute_suspicion_timeout(10, 0, poll, 5.0, 30.0, 3);
        let confirmed = compute_suspicion_timeout(10, 5, poll, 5.0, 30.0, 3);
        assert!(confirmed < unconfirmed);
    }

    #[test]
    fn test_suspicion_timeout_grows_with_cluster_size() {
        let poll = Duration::from_secs(1);

        let small = compute_suspicion_timeout(3, 0, poll, 5.0, 30.0, 3);
        let large = compute_suspicion_timeout(100, 0, poll, 5.0, 30.0, 3);
        assert!(large > small);
    }

    #[tokio::test]
    async fn test_local_health_multiplier_is_clamped() {
        let config = SimurghConfig::with_secret("monitor-test");
        let monitor = Monitor::new("127.0.0.1", 17400, 1, &config);

        for _ in 0..100 {
            monitor.inner.lhm_increment();
        }
        assert_eq!(
            monitor.local_health_multiplier(),
            config.max_suspect_multiplier
        );

        for _ in 0..200 {
            monitor.inner.lhm_decrement();
        }
        assert_eq!(monitor.local_health_multiplier(), 0);
    }

    #[tokio::test]
    async fn test_failed_peer_is_not_resurrected_by_updates() {
        let config = SimurghConfig::with_secret("monitor-test");
        let monitor = Monitor::new("127.0.0.1", 17410, 1, &config);
        let peer = ("127.0.0.1".to_string(), 17420);

        monitor.inner.set_peer_status(&peer, HealthStatus::Healthy);
        monitor.inner.set_peer_status(&peer, HealthStatus::Failed);

        // Degraded and suspect transitions must not revive a failed peer.
        monitor.inner.set_peer_status(&peer, HealthStatus::Degraded);
        assert_eq!(monitor.status_of(&peer), Some(HealthStatus::Failed));

        monitor.inner.set_peer_status(&peer, HealthStatus::Suspect);
        assert_eq!(monitor.status_of(&peer), Some(HealthStatus::Failed));
    }

    #[tokio::test]
    async fn test_own_status_never_enters_table() {
        let config = SimurghConfig::with_secret("monitor-test");
        let monitor = Monitor::new("127.0.0.1", 17430, 1, &config);

        let local = monitor.addr();
        monitor.inner.set_peer_status(&local, HealthStatus::Healthy);
        assert!(monitor.node_statuses().is_empty());
    }
}
