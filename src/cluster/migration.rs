//! Slot migration driven from the client side.
//!
//! A [`MigrationTask`] walks the standard resharding procedure one
//! command per tick: mark the slot IMPORTING on the target and MIGRATING
//! on the source, pump keys across with MIGRATE until the source runs
//! dry, then assign the slot to its new owner on both ends. Requests
//! keep flowing while this runs; reads against the moving slot resolve
//! through the usual ASK redirects.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::protocol::RespValue;
use crate::reducer::StepOutcome;
use crate::stream::Connector;

use super::client::{ClusterInner, ConfigState, Payload, SharedReply};
use super::slots::SLOT_COUNT;
use super::topology::ClusterTopology;

/// Keys fetched per GETKEYSINSLOT round.
const MIGRATION_KEY_BATCH: usize = 16;

/// Per-key timeout handed to the server's MIGRATE command, in
/// milliseconds.
const MIGRATE_TIMEOUT_MS: u64 = 5000;

/// Resolves when the slot has fully changed hands.
pub type MigrationHandler = Box<dyn FnOnce(Result<()>) + Send>;

/// Which slot moves where. The source is whoever owns the slot when the
/// task starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub slot: u16,
    pub target: String,
}

impl MigrationPlan {
    pub fn new(slot: u16, target: impl Into<String>) -> Self {
        Self {
            slot,
            target: target.into(),
        }
    }

    /// Pick a random slot and a random node other than its owner.
    /// Returns `None` when the map has fewer than two nodes.
    pub fn random(topology: &ClusterTopology) -> Option<Self> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let slot = rng.gen_range(0..SLOT_COUNT);
        let source = topology.resolve(slot)?;
        let candidates: Vec<&str> = topology.addrs().filter(|addr| *addr != source).collect();
        if candidates.is_empty() {
            return None;
        }
        let target = candidates[rng.gen_range(0..candidates.len())];
        Some(Self::new(slot, target))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for a stable map to resolve the source from.
    Init,
    /// CLUSTER MYID in flight to the target.
    TargetId,
    /// CLUSTER MYID in flight to the source.
    SourceId,
    /// SETSLOT IMPORTING in flight to the target.
    MarkImporting,
    /// SETSLOT MIGRATING in flight to the source.
    MarkMigrating,
    /// GETKEYSINSLOT in flight to the source.
    FetchKeys,
    /// MIGRATE in flight for one key.
    MoveKey,
    /// SETSLOT NODE in flight to the target.
    AssignTarget,
    /// SETSLOT NODE in flight to the source.
    AssignSource,
}

/// Cooperative task executing one [`MigrationPlan`]. Any transport error
/// or server rejection aborts the migration and hands the error to the
/// completion handler; the servers are left to their own recovery.
pub(crate) struct MigrationTask {
    plan: MigrationPlan,
    source: String,
    target_host: String,
    target_port: String,
    source_id: Option<String>,
    target_id: Option<String>,
    stage: Stage,
    reply: Option<SharedReply>,
    keys: VecDeque<Bytes>,
    moved_keys: u64,
    handler: Option<MigrationHandler>,
}

impl MigrationTask {
    pub(crate) fn new(plan: MigrationPlan, handler: MigrationHandler) -> Self {
        Self {
            plan,
            source: String::new(),
            target_host: String::new(),
            target_port: String::new(),
            source_id: None,
            target_id: None,
            stage: Stage::Init,
            reply: None,
            keys: VecDeque::new(),
            moved_keys: 0,
            handler: Some(handler),
        }
    }

    /// Teardown path: resolve with an error without stepping.
    pub(crate) fn fail(mut self, err: ClientError) {
        if let Some(handler) = self.handler.take() {
            handler(Err(err));
        }
    }

    fn complete(&mut self) -> StepOutcome {
        info!(
            slot = self.plan.slot,
            keys = self.moved_keys,
            source = %self.source,
            target = %self.plan.target,
            "slot migration complete"
        );
        if let Some(handler) = self.handler.take() {
            handler(Ok(()));
        }
        StepOutcome::Remove
    }

    fn abort(&mut self, err: ClientError) -> StepOutcome {
        warn!(slot = self.plan.slot, error = %err, "slot migration aborted");
        if let Some(handler) = self.handler.take() {
            handler(Err(err));
        }
        StepOutcome::Remove
    }

    pub(crate) async fn step<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        if self.stage == Stage::Init {
            return self.start(ctx).await;
        }
        let ready = match &self.reply {
            Some(slot) => slot.lock().unwrap().take(),
            None => None,
        };
        let value = match ready {
            None => return StepOutcome::Continue,
            Some(Err(e)) => return self.abort(e),
            Some(Ok(value)) => value,
        };
        self.reply = None;
        if let Some(text) = value.as_error() {
            let stage = self.stage;
            return self.abort(ClientError::Cluster(format!(
                "migration step {stage:?} rejected: {text}"
            )));
        }
        match self.stage {
            Stage::Init => StepOutcome::Continue,
            Stage::TargetId => {
                let id = match value.as_str() {
                    Some(id) => id.to_string(),
                    None => return self.abort(ClientError::Cluster("bad MYID reply".to_string())),
                };
                self.target_id = Some(id);
                self.mark_slot(ctx).await
            }
            Stage::SourceId => {
                let id = match value.as_str() {
                    Some(id) => id.to_string(),
                    None => return self.abort(ClientError::Cluster("bad MYID reply".to_string())),
                };
                self.source_id = Some(id);
                self.mark_slot(ctx).await
            }
            Stage::MarkImporting => {
                let source = self.source.clone();
                let target_id = match &self.target_id {
                    Some(id) => id.clone(),
                    None => return self.abort(ClientError::Cluster("target id lost".to_string())),
                };
                let cmd = setslot(self.plan.slot, "MIGRATING", &target_id);
                self.send_stage(ctx, &source, cmd, Stage::MarkMigrating).await
            }
            Stage::MarkMigrating => {
                let source = self.source.clone();
                let cmd = getkeys(self.plan.slot, MIGRATION_KEY_BATCH);
                self.send_stage(ctx, &source, cmd, Stage::FetchKeys).await
            }
            Stage::FetchKeys => {
                let items = match value.as_array() {
                    Some(items) => items,
                    None => {
                        return self
                            .abort(ClientError::Cluster("bad GETKEYSINSLOT reply".to_string()))
                    }
                };
                if items.is_empty() {
                    // Source is empty for this slot: hand ownership over,
                    // new owner first.
                    let target = self.plan.target.clone();
                    let target_id = match &self.target_id {
                        Some(id) => id.clone(),
                        None => {
                            return self.abort(ClientError::Cluster("target id lost".to_string()))
                        }
                    };
                    let cmd = setslot(self.plan.slot, "NODE", &target_id);
                    return self.send_stage(ctx, &target, cmd, Stage::AssignTarget).await;
                }
                for item in items {
                    match item.as_bytes() {
                        Some(key) => self.keys.push_back(Bytes::copy_from_slice(key)),
                        None => {
                            return self
                                .abort(ClientError::Cluster("bad GETKEYSINSLOT reply".to_string()))
                        }
                    }
                }
                self.move_next_key(ctx).await
            }
            Stage::MoveKey => self.move_next_key(ctx).await,
            Stage::AssignTarget => {
                let source = self.source.clone();
                let target_id = match &self.target_id {
                    Some(id) => id.clone(),
                    None => return self.abort(ClientError::Cluster("target id lost".to_string())),
                };
                let cmd = setslot(self.plan.slot, "NODE", &target_id);
                self.send_stage(ctx, &source, cmd, Stage::AssignSource).await
            }
            Stage::AssignSource => {
                // Ownership changed; the slot map must be re-learned.
                ctx.mark_dirty();
                self.complete()
            }
        }
    }

    /// Resolve the endpoints from a stable map and kick off the id
    /// exchange.
    async fn start<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        if ctx.config != ConfigState::Stable {
            return StepOutcome::Continue;
        }
        let source = match ctx.topology.resolve(self.plan.slot) {
            Some(addr) => addr.to_string(),
            None => return self.abort(ClientError::UnroutableSlot(self.plan.slot)),
        };
        if source == self.plan.target {
            debug!(slot = self.plan.slot, "target already owns the slot");
            return self.complete();
        }
        if !ctx.topology.contains_addr(&self.plan.target) {
            return self.abort(ClientError::Cluster(format!(
                "migration target {} is not in the cluster",
                self.plan.target
            )));
        }
        let (host, port) = match self.plan.target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => {
                return self.abort(ClientError::Cluster(format!(
                    "bad migration target address {}",
                    self.plan.target
                )))
            }
        };
        debug!(
            slot = self.plan.slot,
            source = %source,
            target = %self.plan.target,
            "starting slot migration"
        );
        self.source = source;
        self.target_host = host;
        self.target_port = port;
        self.source_id = ctx.topology.node_id(&self.source).map(String::from);
        self.target_id = ctx.topology.node_id(&self.plan.target).map(String::from);
        self.mark_slot(ctx).await
    }

    /// Fill in missing node ids via CLUSTER MYID, then mark the slot
    /// IMPORTING on the target.
    async fn mark_slot<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        if self.target_id.is_none() {
            let target = self.plan.target.clone();
            return self.send_stage(ctx, &target, myid(), Stage::TargetId).await;
        }
        if self.source_id.is_none() {
            let source = self.source.clone();
            return self.send_stage(ctx, &source, myid(), Stage::SourceId).await;
        }
        let target = self.plan.target.clone();
        let source_id = match &self.source_id {
            Some(id) => id.clone(),
            None => return self.abort(ClientError::Cluster("source id lost".to_string())),
        };
        let cmd = setslot(self.plan.slot, "IMPORTING", &source_id);
        self.send_stage(ctx, &target, cmd, Stage::MarkImporting).await
    }

    /// Move the next queued key, or fetch another batch when the queue
    /// ran dry. An empty batch ends the key phase.
    async fn move_next_key<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        match self.keys.pop_front() {
            Some(key) => {
                self.moved_keys += 1;
                let source = self.source.clone();
                let cmd = migrate(&self.target_host, &self.target_port, &key);
                self.send_stage(ctx, &source, cmd, Stage::MoveKey).await
            }
            None => {
                let source = self.source.clone();
                let cmd = getkeys(self.plan.slot, MIGRATION_KEY_BATCH);
                self.send_stage(ctx, &source, cmd, Stage::FetchKeys).await
            }
        }
    }

    async fn send_stage<C: Connector>(
        &mut self,
        ctx: &mut ClusterInner<C>,
        addr: &str,
        cmd: RespValue,
        stage: Stage,
    ) -> StepOutcome {
        match ctx.dispatch(addr, &Payload::Single(cmd), false).await {
            Ok(slot) => {
                self.reply = Some(slot);
                self.stage = stage;
                StepOutcome::Continue
            }
            Err(e) => self.abort(e),
        }
    }
}

fn myid() -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string("CLUSTER"),
        RespValue::bulk_string("MYID"),
    ])
}

fn setslot(slot: u16, action: &'static str, node_id: &str) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string("CLUSTER"),
        RespValue::bulk_string("SETSLOT"),
        RespValue::bulk_string(slot.to_string()),
        RespValue::bulk_string(action),
        RespValue::bulk_string(node_id.to_string()),
    ])
}

fn getkeys(slot: u16, count: usize) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string("CLUSTER"),
        RespValue::bulk_string("GETKEYSINSLOT"),
        RespValue::bulk_string(slot.to_string()),
        RespValue::bulk_string(count.to_string()),
    ])
}

fn migrate(host: &str, port: &str, key: &Bytes) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string("MIGRATE"),
        RespValue::bulk_string(host.to_string()),
        RespValue::bulk_string(port.to_string()),
        RespValue::bulk_string(key.clone()),
        RespValue::bulk_string("0"),
        RespValue::bulk_string(MIGRATE_TIMEOUT_MS.to_string()),
    ])
}
