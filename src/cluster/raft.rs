//! Replication node for sqlcluster cluster coordination.
//!
//! Every member keeps a [`DurableLog`]. The member that bootstrapped the
//! cluster leads it: it appends client commands and membership changes,
//! ships them to followers and advances the commit index once a majority
//! holds an entry. Committed entries are applied in index order on every
//! member, through the request server's [`ApplyContext`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use metrics::{counter, gauge};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::log::{self, DurableLog, EntryPayload, LogEntry, Member};
use super::rpc::{
    AppendRequest, AppendResponse, JoinRequest, JoinResponse, PeerClient, ProposeRequest,
};
use super::{BoxFuture, JoinTarget, Proposal, Proposer, RequestHandle};
use crate::command::{ApplyContext, Command, CommandOutput, CommandRegistry, DecodeError};
use crate::config::ClusterTuning;
use crate::errors::ClusterError;
use crate::lifecycle::ShutdownSignal;
use crate::metrics::{CLUSTER_MEMBERS, COMMANDS_APPLIED_TOTAL, COMMIT_INDEX, PROPOSALS_TOTAL};

/// Log file name inside the storage directory.
pub const LOG_FILE: &str = "raft.log";
/// Commit index file name inside the storage directory.
pub const COMMIT_FILE: &str = "commit";

/// Most entries shipped to one follower per round.
const MAX_BATCH: usize = 64;

type Outcome = Result<CommandOutput, String>;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    next_index: u64,
    match_index: u64,
}

struct NodeState {
    log: DurableLog,
    commit_path: PathBuf,
    commit_index: u64,
    last_applied: u64,
    members: Vec<Member>,
    leader: Option<Member>,
    /// Leader only: replication progress per follower name.
    progress: HashMap<String, Progress>,
    /// Leader only: proposals waiting for their entry to be applied.
    pending: HashMap<u64, oneshot::Sender<Outcome>>,
}

/// A single member of the replicated cluster.
pub struct RaftNode {
    me: Member,
    registry: Arc<CommandRegistry>,
    apply: Arc<dyn ApplyContext>,
    handle: Arc<dyn RequestHandle>,
    client: PeerClient,
    heartbeat: Duration,
    propose_timeout: Duration,
    state: Mutex<NodeState>,
    /// Serializes replication rounds.
    replication: tokio::sync::Mutex<()>,
    /// Wakes the replication loop ahead of the next heartbeat.
    kick: Notify,
    applied: watch::Sender<u64>,
}

impl RaftNode {
    /// Open the log and commit index stored in `directory`.
    ///
    /// Nothing is applied until [`RaftNode::recover`] runs.
    pub fn open(
        me: Member,
        directory: &Path,
        registry: Arc<CommandRegistry>,
        apply: Arc<dyn ApplyContext>,
        handle: Arc<dyn RequestHandle>,
        tuning: &ClusterTuning,
    ) -> anyhow::Result<Self> {
        let log = DurableLog::open(&directory.join(LOG_FILE))?;
        let commit_path = directory.join(COMMIT_FILE);
        let persisted = log::load_commit_index(&commit_path)?;
        let commit_index = persisted.min(log.last_index());
        if commit_index < persisted {
            warn!(
                persisted,
                last_index = log.last_index(),
                "Commit index is ahead of the log; clamping"
            );
        }

        let (applied, _) = watch::channel(0);
        Ok(Self {
            me,
            registry,
            apply,
            handle,
            client: PeerClient::new(Duration::from_millis(tuning.rpc_timeout_ms)),
            heartbeat: Duration::from_millis(tuning.heartbeat_interval_ms.max(1)),
            propose_timeout: Duration::from_millis(tuning.propose_timeout_ms),
            state: Mutex::new(NodeState {
                log,
                commit_path,
                commit_index,
                last_applied: 0,
                members: Vec::new(),
                leader: None,
                progress: HashMap::new(),
                pending: HashMap::new(),
            }),
            replication: tokio::sync::Mutex::new(()),
            kick: Notify::new(),
            applied,
        })
    }

    pub fn me(&self) -> &Member {
        &self.me
    }

    pub fn is_leader(&self) -> bool {
        let state = self.lock();
        self.leads(&state)
    }

    pub fn leader(&self) -> Option<Member> {
        self.lock().leader.clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.lock().members.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.lock().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.lock().last_applied
    }

    /// Replay committed entries into the local database.
    ///
    /// The registry must be sealed: every kind in the log has to be
    /// decodable before the first entry is applied.
    pub fn recover(&self) -> Result<(), ClusterError> {
        if !self.registry.is_sealed() {
            return Err(ClusterError::Log(anyhow!(
                "command registry must be sealed before log recovery"
            )));
        }
        let mut state = self.lock();
        let commit_index = state.commit_index;
        self.apply_committed(&mut state)?;
        if commit_index > 0 {
            info!(
                entries = state.log.last_index(),
                commit_index, "Recovered replicated log"
            );
        }
        Ok(())
    }

    /// Bootstrap or join, then drive replication until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        join: JoinTarget,
        shutdown: ShutdownSignal,
    ) -> Result<(), ClusterError> {
        self.enter(join).await?;
        self.handle.attach_proposer(self.clone());
        info!(
            node = %self.me.name,
            leader = ?self.leader().map(|l| l.name),
            "Cluster member ready"
        );

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stop = shutdown.wait();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
                _ = self.kick.notified() => {}
            }
            if self.is_leader() {
                self.replicate().await?;
            }
        }
        info!("Replication loop stopped");
        Ok(())
    }

    async fn enter(&self, join: JoinTarget) -> Result<(), ClusterError> {
        let has_log = !self.lock().log.is_empty();
        if has_log {
            if let JoinTarget::Join(target) = &join {
                info!(%target, "Log already present; ignoring join target");
            }
            return Ok(());
        }
        match join {
            JoinTarget::Bootstrap => self.bootstrap(),
            JoinTarget::Join(target) => self.join(&target).await,
        }
    }

    fn bootstrap(&self) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let index = state
            .log
            .append(EntryPayload::Bootstrap {
                member: self.me.clone(),
            })
            .map_err(ClusterError::Log)?;
        state.commit_index = index;
        self.apply_committed(&mut state)?;
        info!(node = %self.me.name, address = %self.me.address, "Bootstrapped new cluster");
        Ok(())
    }

    async fn join(&self, target: &str) -> Result<(), ClusterError> {
        let join_error = |reason: String| ClusterError::Join {
            target: target.to_string(),
            reason,
        };
        let request = JoinRequest {
            member: self.me.clone(),
        };

        info!(%target, "Joining cluster");
        let mut response = self
            .client
            .join(target, &request)
            .await
            .map_err(|e| join_error(e.to_string()))?;

        // One redirect: the contacted member may point at the leader.
        if !response.accepted {
            if let Some(leader) = response.leader.clone().filter(|l| l.address != target) {
                info!(leader = %leader.address, "Redirected to cluster leader");
                response = self
                    .client
                    .join(&leader.address, &request)
                    .await
                    .map_err(|e| join_error(e.to_string()))?;
            }
        }

        if !response.accepted {
            return Err(join_error("membership request was not accepted".into()));
        }
        let mut state = self.lock();
        if state.leader.is_none() {
            state.leader = response.leader;
        }
        Ok(())
    }

    /// Leader side of the join handshake.
    pub async fn handle_join(&self, req: JoinRequest) -> Result<JoinResponse, ClusterError> {
        let index = {
            let mut state = self.lock();
            if !self.leads(&state) {
                return Ok(JoinResponse {
                    accepted: false,
                    leader: state.leader.clone(),
                });
            }
            if state.members.contains(&req.member) {
                debug!(member = %req.member.name, "Member already present");
                return Ok(JoinResponse {
                    accepted: true,
                    leader: Some(self.me.clone()),
                });
            }
            state
                .log
                .append(EntryPayload::AddMember {
                    member: req.member.clone(),
                })
                .map_err(ClusterError::Log)?
        };

        self.wait_applied_through(index).await?;
        info!(member = %req.member.name, address = %req.member.address, "Admitted cluster member");
        self.kick.notify_one();
        Ok(JoinResponse {
            accepted: true,
            leader: Some(self.me.clone()),
        })
    }

    /// Follower side of replication.
    pub fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse, ClusterError> {
        let mut state = self.lock();
        if state.leader.as_ref() != Some(&req.leader) {
            debug!(leader = %req.leader.name, "Following leader");
            state.leader = Some(req.leader);
        }

        if req.prev_index > state.log.last_index() {
            return Ok(AppendResponse {
                success: false,
                last_index: state.log.last_index(),
            });
        }
        state
            .log
            .append_entries(&req.entries)
            .map_err(ClusterError::Log)?;

        let commit = req.leader_commit.min(state.log.last_index());
        if commit > state.commit_index {
            state.commit_index = commit;
            self.apply_committed(&mut state)?;
        }
        Ok(AppendResponse {
            success: true,
            last_index: state.log.last_index(),
        })
    }

    /// Leader side of a proposal forwarded by a follower.
    pub async fn handle_propose(&self, req: ProposeRequest) -> Result<Proposal, ClusterError> {
        self.registry
            .decode(&req.kind, &req.data)
            .map_err(decode_error)?;
        self.propose_local(req.kind, req.data).await
    }

    async fn submit(&self, kind: String, data: Vec<u8>) -> Result<Proposal, ClusterError> {
        let leader = {
            let state = self.lock();
            if self.leads(&state) {
                None
            } else {
                Some(state.leader.clone().ok_or(ClusterError::NotReady)?)
            }
        };
        let Some(leader) = leader else {
            return self.propose_local(kind, data).await;
        };

        let proposal = self
            .client
            .propose(&leader.address, &ProposeRequest { kind, data })
            .await;
        counter!(PROPOSALS_TOTAL, "outcome" => outcome_label(&proposal, "forwarded")).increment(1);
        let proposal = proposal?;

        // Let the local copy catch up so the caller can read its own write.
        if self.wait_applied_through(proposal.index).await.is_err() {
            debug!(index = proposal.index, "Local apply lagging behind the leader");
        }
        Ok(proposal)
    }

    async fn propose_local(&self, kind: String, data: Vec<u8>) -> Result<Proposal, ClusterError> {
        let (index, rx) = {
            let mut state = self.lock();
            if !self.leads(&state) {
                return Err(ClusterError::NotLeader);
            }
            let index = state
                .log
                .append(EntryPayload::Command { kind, data })
                .map_err(ClusterError::Log)?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(index, tx);
            (index, rx)
        };

        let committed = async {
            self.replicate().await?;
            rx.await.map_err(|_| ClusterError::ShuttingDown)
        };
        let result = match tokio::time::timeout(self.propose_timeout, committed).await {
            Ok(Ok(output)) => {
                self.kick.notify_one();
                Ok(Proposal { index, output })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.lock().pending.remove(&index);
                Err(ClusterError::Timeout { index })
            }
        };
        counter!(PROPOSALS_TOTAL, "outcome" => outcome_label(&result, "committed")).increment(1);
        result
    }

    /// Wait until the entry at `index` has been applied locally.
    async fn wait_applied_through(&self, index: u64) -> Result<(), ClusterError> {
        let mut rx = self.applied.subscribe();
        let caught_up = async {
            loop {
                if *rx.borrow_and_update() >= index {
                    return Ok(());
                }
                if self.is_leader() {
                    self.replicate().await?;
                    if *rx.borrow_and_update() >= index {
                        return Ok(());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(ClusterError::ShuttingDown);
                }
            }
        };
        tokio::time::timeout(self.propose_timeout, caught_up)
            .await
            .map_err(|_| ClusterError::Timeout { index })?
    }

    /// Ship pending entries to every follower, then advance the commit
    /// index to what a majority holds.
    async fn replicate(&self) -> Result<(), ClusterError> {
        let _round = self.replication.lock().await;

        let requests: Vec<(Member, AppendRequest)> = {
            let state = self.lock();
            if !self.leads(&state) {
                return Ok(());
            }
            state
                .members
                .iter()
                .filter(|m| m.name != self.me.name)
                .map(|peer| {
                    let next = state
                        .progress
                        .get(&peer.name)
                        .map_or(1, |p| p.next_index.max(1));
                    let request = AppendRequest {
                        leader: self.me.clone(),
                        prev_index: next - 1,
                        entries: state.log.entries_from(next, MAX_BATCH),
                        leader_commit: state.commit_index,
                    };
                    (peer.clone(), request)
                })
                .collect()
        };

        let mut round = JoinSet::new();
        for (peer, request) in requests {
            let client = self.client.clone();
            round.spawn(async move {
                let response = client.append(&peer.address, &request).await;
                (peer, request, response)
            });
        }

        while let Some(joined) = round.join_next().await {
            let Ok((peer, request, response)) = joined else {
                continue;
            };
            match response {
                Ok(resp) => {
                    let mut state = self.lock();
                    let progress = state.progress.entry(peer.name.clone()).or_default();
                    if resp.success {
                        progress.match_index = request.prev_index + request.entries.len() as u64;
                        progress.next_index = progress.match_index + 1;
                    } else {
                        progress.next_index = resp.last_index + 1;
                    }
                }
                Err(e) if request.entries.is_empty() => {
                    debug!(peer = %peer.name, error = %e, "Heartbeat failed");
                }
                Err(e) => {
                    warn!(peer = %peer.name, error = %e, "Replication to peer failed");
                }
            }
        }

        let mut state = self.lock();
        let majority = majority_index(&state, &self.me);
        if majority > state.commit_index {
            state.commit_index = majority;
            self.apply_committed(&mut state)?;
        }
        Ok(())
    }

    /// Apply every committed, not yet applied entry in index order.
    fn apply_committed(&self, state: &mut NodeState) -> Result<(), ClusterError> {
        if state.last_applied >= state.commit_index {
            return Ok(());
        }
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let Some(entry) = state.log.get(index).cloned() else {
                return Err(ClusterError::Log(anyhow!(
                    "committed entry {index} is missing from the log"
                )));
            };
            let outcome = self.apply_entry(state, &entry);
            state.last_applied = index;
            if let Some(tx) = state.pending.remove(&index) {
                let _ = tx.send(outcome);
            }
        }

        log::store_commit_index(&state.commit_path, state.commit_index)
            .map_err(ClusterError::Log)?;
        gauge!(COMMIT_INDEX).set(state.commit_index as f64);
        self.applied.send_replace(state.last_applied);
        Ok(())
    }

    fn apply_entry(&self, state: &mut NodeState, entry: &LogEntry) -> Outcome {
        match &entry.payload {
            EntryPayload::Bootstrap { member } => {
                state.members = vec![member.clone()];
                state.leader = Some(member.clone());
                gauge!(CLUSTER_MEMBERS).set(1.0);
                Ok(CommandOutput::new())
            }
            EntryPayload::AddMember { member } => {
                match state.members.iter_mut().find(|m| m.name == member.name) {
                    Some(existing) => existing.address = member.address.clone(),
                    None => state.members.push(member.clone()),
                }
                if self.leads(state) && member.name != self.me.name {
                    state
                        .progress
                        .insert(member.name.clone(), Progress { next_index: 1, match_index: 0 });
                }
                gauge!(CLUSTER_MEMBERS).set(state.members.len() as f64);
                debug!(index = entry.index, member = %member.name, "Applied membership change");
                Ok(CommandOutput::new())
            }
            EntryPayload::Command { kind, data } => {
                let outcome = self
                    .registry
                    .decode(kind, data)
                    .map_err(|e| e.to_string())
                    .and_then(|command| {
                        command
                            .apply(self.apply.as_ref())
                            .map_err(|e| format!("{e:#}"))
                    });
                let label = if outcome.is_ok() { "ok" } else { "error" };
                counter!(COMMANDS_APPLIED_TOTAL, "kind" => kind.clone(), "outcome" => label)
                    .increment(1);
                if let Err(message) = &outcome {
                    debug!(index = entry.index, %kind, %message, "Command failed");
                }
                outcome
            }
        }
    }

    fn leads(&self, state: &NodeState) -> bool {
        state
            .leader
            .as_ref()
            .is_some_and(|leader| leader.name == self.me.name)
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Proposer for RaftNode {
    fn propose(&self, command: Box<dyn Command>) -> BoxFuture<'_, Result<Proposal, ClusterError>> {
        Box::pin(async move {
            let data = command.encode().map_err(ClusterError::Log)?;
            self.submit(command.kind().to_string(), data).await
        })
    }
}

/// Highest index held by a majority of members.
fn majority_index(state: &NodeState, me: &Member) -> u64 {
    let mut held: Vec<u64> = state
        .members
        .iter()
        .map(|m| {
            if m.name == me.name {
                state.log.last_index()
            } else {
                state.progress.get(&m.name).map_or(0, |p| p.match_index)
            }
        })
        .collect();
    if held.is_empty() {
        return 0;
    }
    held.sort_unstable_by(|a, b| b.cmp(a));
    held[held.len() / 2]
}

fn decode_error(err: DecodeError) -> ClusterError {
    match err {
        DecodeError::Registry(e) => ClusterError::Registry(e),
        DecodeError::Payload(e) => ClusterError::Log(e),
    }
}

fn outcome_label<T>(result: &Result<T, ClusterError>, ok: &'static str) -> &'static str {
    match result {
        Ok(_) => ok,
        Err(ClusterError::Timeout { .. }) => "timeout",
        Err(_) => "failed",
    }
}
