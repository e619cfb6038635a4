//! Cluster-aware client built on top of [`NodeClient`].
//!
//! One [`ClusterClient`] owns a connection per master plus a queue of
//! cooperative tasks driven by [`ReducerList`]. Every call to
//! [`ClusterClient::update`] first pumps each connection (parsing replies
//! into their waiting continuations), then steps the task queue once:
//! the permanent [`ConfigTask`] keeps the slot map fresh, and one
//! [`RequestTask`] per queued request routes, dispatches and follows
//! redirects until its reply can be delivered.
//!
//! Nothing here spawns or locks across await points; the engine is
//! single-task and makes progress only while the caller awaits `update`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{NodeClient, PushHandler, ReplyHandler};
use crate::error::{ClientError, Result};
use crate::protocol::{command, RespValue};
use crate::reducer::{Reduce, ReducerList, StepOutcome};
use crate::stream::Connector;

use super::migration::{MigrationHandler, MigrationPlan, MigrationTask};
use super::slots::{key_slot, SLOT_COUNT};
use super::topology::ClusterTopology;

/// Redirect budget per request. A chain longer than this means the
/// cluster is reshuffling faster than we can chase it.
const REDIRECT_BUDGET: u32 = 8;

/// Dispatch attempts per request before the connect error is handed to
/// the caller.
const DISPATCH_ATTEMPTS: u32 = 4;

/// Ticks to sit on an incomplete slot map before asking again.
const INCOMPLETE_RETRY_TICKS: u32 = 16;

/// Consecutive reconnect failures on a stable map before the whole
/// topology is re-queried.
const RECONNECT_FAILURE_LIMIT: u32 = 3;

/// Poll cadence of the blocking convenience wrappers.
const CALL_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reply slot shared between a dispatched command's continuation and the
/// task waiting on it.
pub(crate) type SharedReply = Arc<Mutex<Option<Result<RespValue>>>>;

type SharedPushHandler = Arc<Mutex<PushHandler>>;

pub(crate) fn reply_slot() -> SharedReply {
    Arc::new(Mutex::new(None))
}

/// A redirect extracted from an error reply such as
/// `MOVED 12182 127.0.0.1:7002` or `ASK 12182 127.0.0.1:7002`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot has a new owner; the local slot map is out of date.
    Moved { slot: u16, addr: String },
    /// The key is mid-migration; retry once on the named node without
    /// touching the slot map.
    Ask { slot: u16, addr: String },
}

/// Recognizes MOVED/ASK error replies. Anything else, including ordinary
/// server errors, returns `None` and flows to the caller untouched.
pub fn parse_redirect(value: &RespValue) -> Option<Redirect> {
    let text = value.as_error()?;
    let mut parts = text.split_whitespace();
    let kind = parts.next()?;
    if kind != "MOVED" && kind != "ASK" {
        return None;
    }
    let slot = parts.next()?.parse::<u16>().ok()?;
    if slot >= SLOT_COUNT {
        return None;
    }
    let addr = parts.next()?.to_string();
    match kind {
        "MOVED" => Some(Redirect::Moved { slot, addr }),
        _ => Some(Redirect::Ask { slot, addr }),
    }
}

/// Where the slot map currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    /// The map is known stale; a refresh starts on the next tick.
    Dirty,
    /// A `CLUSTER SLOTS` query is in flight.
    QueryPending,
    /// The map covers every slot; requests dispatch freely.
    Stable,
    /// The last reply left gaps. Requests hold until the countdown
    /// triggers another query.
    Incomplete { ticks_left: u32 },
}

/// What a request task carries over the wire.
pub(crate) enum Payload {
    Single(RespValue),
    /// Commands sent as one MULTI/EXEC pipeline; the caller sees only
    /// the EXEC reply.
    Transaction(Vec<RespValue>),
}

/// Shared state the tasks operate on: connections, slot map, seeds.
pub(crate) struct ClusterInner<C: Connector> {
    connector: C,
    seeds: Vec<String>,
    nodes: BTreeMap<String, NodeClient<C::Stream>>,
    pub(crate) topology: ClusterTopology,
    pub(crate) config: ConfigState,
    push_handler: Option<SharedPushHandler>,
    reconnect_failures: HashMap<String, u32>,
}

impl<C: Connector> ClusterInner<C> {
    fn new(connector: C, seeds: Vec<String>) -> Self {
        Self {
            connector,
            seeds,
            nodes: BTreeMap::new(),
            topology: ClusterTopology::new(),
            config: ConfigState::Dirty,
            push_handler: None,
            reconnect_failures: HashMap::new(),
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        if self.config != ConfigState::Dirty {
            debug!("slot map marked dirty");
            self.config = ConfigState::Dirty;
        }
    }

    /// Pump every live connection: read whatever is available without
    /// blocking and hand completed replies to their continuations. A
    /// connection fault tears that node down (failing its pending
    /// continuations) and stales the slot map.
    async fn update_connections(&mut self) {
        let mut faulted = false;
        for (addr, client) in self.nodes.iter_mut() {
            if !client.is_connected() {
                continue;
            }
            loop {
                match client.update().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "connection fault");
                        faulted = true;
                        break;
                    }
                }
            }
        }
        if faulted {
            self.mark_dirty();
        }
    }

    /// Connect `addr` if it is not already live, wiring the shared push
    /// handler into the fresh connection.
    async fn ensure_connected(&mut self, addr: &str) -> Result<()> {
        let client = self
            .nodes
            .entry(addr.to_string())
            .or_insert_with(NodeClient::new);
        if client.is_connected() {
            return Ok(());
        }
        let stream = self.connector.connect(addr).await?;
        client.attach(stream);
        if let Some(shared) = &self.push_handler {
            let shared = shared.clone();
            client.set_push_handler(move |value| (*shared.lock().unwrap())(value));
        }
        Ok(())
    }

    /// Queue a payload on `addr` and return the slot its reply will land
    /// in. `asking` prefixes the command with ASKING for redirected
    /// retries.
    pub(crate) async fn dispatch(
        &mut self,
        addr: &str,
        payload: &Payload,
        asking: bool,
    ) -> Result<SharedReply> {
        self.ensure_connected(addr).await?;
        let client = self.nodes.get_mut(addr).ok_or(ClientError::NotConnected)?;
        if asking {
            client.send(&command::asking(), Box::new(|_| {})).await?;
        }
        let slot = reply_slot();
        let tx = slot.clone();
        let handler: ReplyHandler = Box::new(move |reply| {
            *tx.lock().unwrap() = Some(reply);
        });
        match payload {
            Payload::Single(request) => client.send(request, handler).await?,
            Payload::Transaction(commands) => client.send_transaction(commands, handler).await?,
        }
        Ok(slot)
    }

    /// Find a node to ask for the slot map: any live connection, or the
    /// first reachable seed on a cold start.
    async fn pick_config_node(&mut self) -> Result<String> {
        if let Some(addr) = self
            .nodes
            .iter()
            .find(|(_, client)| client.is_connected())
            .map(|(addr, _)| addr.clone())
        {
            return Ok(addr);
        }
        let seeds = self.seeds.clone();
        let mut last_err = ClientError::NotConnected;
        for addr in seeds {
            match self.ensure_connected(&addr).await {
                Ok(()) => return Ok(addr),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "seed unreachable");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn query_topology(&mut self) -> Result<SharedReply> {
        let addr = self.pick_config_node().await?;
        debug!(addr = %addr, "querying slot map");
        let client = self.nodes.get_mut(&addr).ok_or(ClientError::NotConnected)?;
        let slot = reply_slot();
        let tx = slot.clone();
        client
            .send(
                &command::cluster_slots(),
                Box::new(move |reply| {
                    *tx.lock().unwrap() = Some(reply);
                }),
            )
            .await?;
        Ok(slot)
    }

    /// Swap in a freshly parsed slot map: drop nodes that no longer own
    /// slots, connect newly announced ones, then decide between Stable
    /// and Incomplete based on coverage.
    async fn apply_topology(&mut self, result: Result<RespValue>) {
        let reply = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "slot map query failed");
                self.config = ConfigState::Dirty;
                return;
            }
        };
        if let Some(text) = reply.as_error() {
            warn!(error = %text, "slot map query rejected");
            self.config = ConfigState::Dirty;
            return;
        }
        let topology = match ClusterTopology::from_cluster_slots(&reply) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "malformed slot map reply");
                self.config = ConfigState::Dirty;
                return;
            }
        };

        let stale: Vec<String> = self
            .nodes
            .keys()
            .filter(|addr| !topology.contains_addr(addr))
            .cloned()
            .collect();
        for addr in stale {
            if let Some(mut client) = self.nodes.remove(&addr) {
                debug!(addr = %addr, "dropping node absent from new slot map");
                client.disconnect();
            }
        }

        let fresh: Vec<String> = topology
            .addrs()
            .filter(|addr| !self.nodes.contains_key(*addr))
            .map(String::from)
            .collect();
        for addr in &fresh {
            if let Err(e) = self.ensure_connected(addr).await {
                warn!(addr = %addr, error = %e, "cannot reach discovered node");
            }
        }

        let covered = topology.full_coverage();
        self.topology = topology;
        self.reconnect_failures.clear();
        if covered {
            info!(nodes = self.topology.len(), "slot map stable");
            self.config = ConfigState::Stable;
        } else {
            debug!("slot map incomplete, holding requests");
            self.config = ConfigState::Incomplete {
                ticks_left: INCOMPLETE_RETRY_TICKS,
            };
        }
    }

    /// Housekeeping on a stable map: reconnect dropped nodes, and give
    /// up on the map entirely when one keeps refusing us.
    async fn maintain_connections(&mut self) {
        let addrs: Vec<String> = self.topology.addrs().map(String::from).collect();
        for addr in addrs {
            let connected = self
                .nodes
                .get(&addr)
                .map(|client| client.is_connected())
                .unwrap_or(false);
            if connected {
                self.reconnect_failures.remove(&addr);
                continue;
            }
            match self.ensure_connected(&addr).await {
                Ok(()) => {
                    info!(addr = %addr, "reconnected");
                    self.reconnect_failures.remove(&addr);
                }
                Err(e) => {
                    let failures = self.reconnect_failures.entry(addr.clone()).or_insert(0);
                    *failures += 1;
                    debug!(addr = %addr, failures = *failures, error = %e, "reconnect failed");
                    if *failures >= RECONNECT_FAILURE_LIMIT {
                        warn!(addr = %addr, "node unreachable, re-querying slot map");
                        self.reconnect_failures.remove(&addr);
                        self.mark_dirty();
                        return;
                    }
                }
            }
        }
    }
}

/// Permanent first entry of the task queue: owns the Dirty →
/// QueryPending → Stable/Incomplete cycle of [`ConfigState`].
pub(crate) struct ConfigTask {
    reply: Option<SharedReply>,
}

impl ConfigTask {
    pub(crate) fn new() -> Self {
        Self { reply: None }
    }

    async fn step<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        match ctx.config {
            ConfigState::Dirty => match ctx.query_topology().await {
                Ok(slot) => {
                    self.reply = Some(slot);
                    ctx.config = ConfigState::QueryPending;
                }
                Err(e) => {
                    warn!(error = %e, "no node reachable for slot map query");
                }
            },
            ConfigState::QueryPending => {
                let ready = self
                    .reply
                    .as_ref()
                    .and_then(|slot| slot.lock().unwrap().take());
                if let Some(result) = ready {
                    self.reply = None;
                    ctx.apply_topology(result).await;
                }
            }
            ConfigState::Incomplete { ticks_left } => {
                ctx.config = if ticks_left == 0 {
                    ConfigState::Dirty
                } else {
                    ConfigState::Incomplete {
                        ticks_left: ticks_left - 1,
                    }
                };
            }
            ConfigState::Stable => ctx.maintain_connections().await,
        }
        StepOutcome::Continue
    }
}

/// One queued request: routes by slot (or to a pinned node), follows
/// MOVED/ASK, and always resolves the caller's continuation exactly
/// once.
pub(crate) struct RequestTask {
    payload: Payload,
    /// Hash slot computed at submit time; `None` for node-pinned
    /// requests.
    slot: Option<u16>,
    /// Explicit destination, set by `send_to` or by a redirect.
    target: Option<String>,
    asking: bool,
    redirects_left: u32,
    attempts_left: u32,
    reply: Option<SharedReply>,
    handler: Option<ReplyHandler>,
}

impl RequestTask {
    fn routed(payload: Payload, slot: u16, handler: ReplyHandler) -> Self {
        Self {
            payload,
            slot: Some(slot),
            target: None,
            asking: false,
            redirects_left: REDIRECT_BUDGET,
            attempts_left: DISPATCH_ATTEMPTS,
            reply: None,
            handler: Some(handler),
        }
    }

    fn pinned(addr: String, payload: Payload, handler: ReplyHandler) -> Self {
        Self {
            payload,
            slot: None,
            target: Some(addr),
            asking: false,
            redirects_left: REDIRECT_BUDGET,
            attempts_left: DISPATCH_ATTEMPTS,
            reply: None,
            handler: Some(handler),
        }
    }

    /// Resolve the caller's continuation and leave the queue.
    fn deliver(&mut self, result: Result<RespValue>) -> StepOutcome {
        if let Some(handler) = self.handler.take() {
            handler(result);
        }
        StepOutcome::Remove
    }

    /// Teardown path: resolve with an error without stepping.
    pub(crate) fn fail(mut self, err: ClientError) {
        if let Some(handler) = self.handler.take() {
            handler(Err(err));
        }
    }

    async fn step<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        if let Some(slot) = &self.reply {
            let ready = slot.lock().unwrap().take();
            match ready {
                None => return StepOutcome::Continue,
                Some(Ok(value)) => {
                    self.reply = None;
                    match parse_redirect(&value) {
                        Some(Redirect::Moved { slot, addr }) => {
                            debug!(slot, addr = %addr, "MOVED");
                            ctx.mark_dirty();
                            if self.redirects_left == 0 {
                                return self.deliver(Err(ClientError::TooManyRedirects(slot)));
                            }
                            self.redirects_left -= 1;
                            self.target = Some(addr);
                            self.asking = false;
                            // fall through and re-dispatch this tick
                        }
                        Some(Redirect::Ask { slot, addr }) => {
                            debug!(slot, addr = %addr, "ASK");
                            if self.redirects_left == 0 {
                                return self.deliver(Err(ClientError::TooManyRedirects(slot)));
                            }
                            self.redirects_left -= 1;
                            self.target = Some(addr);
                            self.asking = true;
                        }
                        None => return self.deliver(Ok(value)),
                    }
                }
                Some(Err(e)) => {
                    // The connection died with our command in flight. The
                    // command may have executed, so this is not retried.
                    self.reply = None;
                    ctx.mark_dirty();
                    return self.deliver(Err(e));
                }
            }
        }
        self.try_dispatch(ctx).await
    }

    async fn try_dispatch<C: Connector>(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        let addr = if let Some(addr) = self.target.clone() {
            addr
        } else {
            // Slot-routed traffic waits for a stable map.
            if ctx.config != ConfigState::Stable {
                return StepOutcome::Continue;
            }
            let slot = match self.slot {
                Some(slot) => slot,
                None => return self.deliver(Err(ClientError::MissingKey)),
            };
            match ctx.topology.resolve(slot) {
                Some(addr) => addr.to_string(),
                None => {
                    ctx.mark_dirty();
                    return self.deliver(Err(ClientError::UnroutableSlot(slot)));
                }
            }
        };
        match ctx.dispatch(&addr, &self.payload, self.asking).await {
            Ok(slot) => {
                self.reply = Some(slot);
                StepOutcome::Continue
            }
            Err(e) => {
                ctx.mark_dirty();
                if self.attempts_left == 0 {
                    return self.deliver(Err(e));
                }
                self.attempts_left -= 1;
                debug!(addr = %addr, error = %e, attempts_left = self.attempts_left,
                       "dispatch failed, will retry");
                StepOutcome::Continue
            }
        }
    }
}

pub(crate) enum ClusterTask {
    Config(ConfigTask),
    Request(RequestTask),
    Migration(MigrationTask),
}

impl<C: Connector> Reduce<ClusterInner<C>> for ClusterTask {
    async fn step(&mut self, ctx: &mut ClusterInner<C>) -> StepOutcome {
        match self {
            ClusterTask::Config(task) => task.step(ctx).await,
            ClusterTask::Request(task) => task.step(ctx).await,
            ClusterTask::Migration(task) => task.step(ctx).await,
        }
    }
}

/// Client for a sharded deployment. Requests are queued and resolved
/// across [`update`](ClusterClient::update) ticks; continuations fire
/// exactly once, with an error if the request cannot complete.
pub struct ClusterClient<C: Connector> {
    inner: ClusterInner<C>,
    tasks: ReducerList<ClusterTask>,
}

impl<C: Connector> ClusterClient<C> {
    /// A fresh client knows only its seeds; the first `update` ticks
    /// bootstrap the slot map from them.
    pub fn new(connector: C, seeds: Vec<String>) -> Self {
        let mut tasks = ReducerList::new();
        // The config task sits first so every tick refreshes the map
        // before requests route against it.
        tasks.push(ClusterTask::Config(ConfigTask::new()));
        Self {
            inner: ClusterInner::new(connector, seeds),
            tasks,
        }
    }

    /// Queue a request routed by its key's hash slot. Fails immediately
    /// when the request carries no key; the handler is dropped unused in
    /// that case.
    pub fn send(&mut self, request: RespValue, handler: ReplyHandler) -> Result<()> {
        let key = command::request_key(&request).ok_or(ClientError::MissingKey)?;
        let slot = key_slot(key);
        self.tasks.push(ClusterTask::Request(RequestTask::routed(
            Payload::Single(request),
            slot,
            handler,
        )));
        Ok(())
    }

    /// Queue a MULTI/EXEC transaction. Every command must hash to the
    /// same slot; a mixed batch is rejected here, before any byte goes
    /// out. The handler receives the EXEC reply.
    pub fn send_transaction(
        &mut self,
        commands: Vec<RespValue>,
        handler: ReplyHandler,
    ) -> Result<()> {
        let mut slot: Option<u16> = None;
        for cmd in &commands {
            let key = command::request_key(cmd).ok_or(ClientError::MissingKey)?;
            let s = key_slot(key);
            match slot {
                None => slot = Some(s),
                Some(prev) if prev != s => return Err(ClientError::CrossSlot),
                _ => {}
            }
        }
        let slot = slot.ok_or(ClientError::MissingKey)?;
        self.tasks.push(ClusterTask::Request(RequestTask::routed(
            Payload::Transaction(commands),
            slot,
            handler,
        )));
        Ok(())
    }

    /// Queue a request pinned to one node, bypassing slot routing.
    /// Keyless and administrative commands go through here.
    pub fn send_to(&mut self, addr: &str, request: RespValue, handler: ReplyHandler) {
        self.tasks.push(ClusterTask::Request(RequestTask::pinned(
            addr.to_string(),
            Payload::Single(request),
            handler,
        )));
    }

    /// Queue a slot migration; `on_done` fires when the slot has fully
    /// changed hands (or with the error that stopped it).
    pub fn begin_migration(&mut self, plan: MigrationPlan, on_done: MigrationHandler) {
        self.tasks
            .push(ClusterTask::Migration(MigrationTask::new(plan, on_done)));
    }

    /// One cooperative tick: pump every connection, then step each task
    /// once. Never blocks beyond the I/O readiness checks.
    pub async fn update(&mut self) {
        self.inner.update_connections().await;
        self.tasks.drive(&mut self.inner).await;
    }

    /// Send one routed request and tick until its reply arrives.
    /// Documented blocking path for tools and tests.
    pub async fn call(&mut self, request: RespValue) -> Result<RespValue> {
        let slot = reply_slot();
        let tx = slot.clone();
        self.send(
            request,
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )?;
        self.wait_for(slot).await
    }

    /// Like [`call`](ClusterClient::call) but pinned to one node.
    pub async fn call_to(&mut self, addr: &str, request: RespValue) -> Result<RespValue> {
        let slot = reply_slot();
        let tx = slot.clone();
        self.send_to(
            addr,
            request,
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        );
        self.wait_for(slot).await
    }

    async fn wait_for(&mut self, slot: SharedReply) -> Result<RespValue> {
        loop {
            self.update().await;
            if let Some(result) = slot.lock().unwrap().take() {
                return result;
            }
            tokio::time::sleep(CALL_POLL_INTERVAL).await;
        }
    }

    /// Force a slot map refresh on the next tick.
    pub fn invalidate_topology(&mut self) {
        self.inner.mark_dirty();
    }

    pub fn is_stable(&self) -> bool {
        self.inner.config == ConfigState::Stable
    }

    pub fn config_state(&self) -> ConfigState {
        self.inner.config
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.inner.topology
    }

    /// Requests (including migrations) still waiting on a reply.
    pub fn pending_requests(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| !matches!(task, ClusterTask::Config(_)))
            .count()
    }

    /// Install a handler for out-of-band push messages from any node.
    /// Applies to current and future connections.
    pub fn set_push_handler(&mut self, handler: impl FnMut(RespValue) + Send + 'static) {
        let shared: SharedPushHandler = Arc::new(Mutex::new(Box::new(handler)));
        for client in self.inner.nodes.values_mut() {
            let shared = shared.clone();
            client.set_push_handler(move |value| (*shared.lock().unwrap())(value));
        }
        self.inner.push_handler = Some(shared);
    }

    /// Drop every connection and fail every queued task. The client can
    /// be reused; the next tick starts a cold bootstrap.
    pub fn disconnect(&mut self) {
        for task in self.tasks.drain() {
            match task {
                ClusterTask::Request(task) => task.fail(ClientError::NotConnected),
                ClusterTask::Migration(task) => task.fail(ClientError::NotConnected),
                ClusterTask::Config(_) => {}
            }
        }
        for client in self.inner.nodes.values_mut() {
            client.disconnect();
        }
        self.inner.nodes.clear();
        self.inner.reconnect_failures.clear();
        self.inner.config = ConfigState::Dirty;
        self.tasks.push(ClusterTask::Config(ConfigTask::new()));
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.inner.connector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryConnector;

    fn slots_reply(entries: &[(u16, u16, &str, i64)]) -> RespValue {
        RespValue::array(
            entries
                .iter()
                .map(|(start, end, host, port)| {
                    RespValue::array(vec![
                        RespValue::integer(i64::from(*start)),
                        RespValue::integer(i64::from(*end)),
                        RespValue::array(vec![
                            RespValue::bulk_string(host.to_string()),
                            RespValue::integer(*port),
                        ]),
                    ])
                })
                .collect(),
        )
    }

    #[test]
    fn parse_redirect_moved() {
        let value = RespValue::error("MOVED 12182 127.0.0.1:7002");
        assert_eq!(
            parse_redirect(&value),
            Some(Redirect::Moved {
                slot: 12182,
                addr: "127.0.0.1:7002".to_string()
            })
        );
    }

    #[test]
    fn parse_redirect_ask() {
        let value = RespValue::error("ASK 866 10.0.0.5:7001");
        assert_eq!(
            parse_redirect(&value),
            Some(Redirect::Ask {
                slot: 866,
                addr: "10.0.0.5:7001".to_string()
            })
        );
    }

    #[test]
    fn ordinary_errors_are_not_redirects() {
        assert_eq!(parse_redirect(&RespValue::error("ERR unknown command")), None);
        assert_eq!(parse_redirect(&RespValue::ok()), None);
        assert_eq!(parse_redirect(&RespValue::integer(3)), None);
    }

    #[test]
    fn malformed_redirects_are_ignored() {
        // Slot out of range, missing address, unparsable slot.
        assert_eq!(parse_redirect(&RespValue::error("MOVED 16384 a:1")), None);
        assert_eq!(parse_redirect(&RespValue::error("MOVED 12182")), None);
        assert_eq!(parse_redirect(&RespValue::error("ASK x a:1")), None);
    }

    #[test]
    fn keyless_request_is_rejected_up_front() {
        let mut client = ClusterClient::new(MemoryConnector::new(), vec!["a:1".to_string()]);
        let err = client
            .send(command::request(&["PING"]), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingKey));
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn cross_slot_transaction_is_rejected_before_io() {
        let mut client = ClusterClient::new(MemoryConnector::new(), vec!["a:1".to_string()]);
        let err = client
            .send_transaction(
                vec![
                    command::request(&["SET", "foo", "1"]),
                    command::request(&["SET", "bar", "2"]),
                ],
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::CrossSlot));
        // Nothing was queued and no connection was attempted.
        assert_eq!(client.pending_requests(), 0);
        assert!(client.connector().connects().is_empty());
    }

    #[test]
    fn same_slot_transaction_is_accepted() {
        let mut client = ClusterClient::new(MemoryConnector::new(), vec!["a:1".to_string()]);
        client
            .send_transaction(
                vec![
                    command::request(&["SET", "{user:1}:a", "1"]),
                    command::request(&["SET", "{user:1}:b", "2"]),
                ],
                Box::new(|_| {}),
            )
            .unwrap();
        assert_eq!(client.pending_requests(), 1);
    }

    #[tokio::test]
    async fn cold_start_reaches_stable_and_routes() {
        let mut connector = MemoryConnector::new();
        let node = connector.expect("127.0.0.1:7001");
        let mut client = ClusterClient::new(connector, vec!["127.0.0.1:7001".to_string()]);
        assert!(!client.is_stable());

        // Tick 1: bootstrap sends CLUSTER SLOTS to the seed.
        client.update().await;
        assert_eq!(client.config_state(), ConfigState::QueryPending);
        assert_eq!(node.take_written(), command::cluster_slots().serialize());

        // Tick 2: the reply covers everything, so the map goes stable.
        node.push_value(&slots_reply(&[(0, 16383, "127.0.0.1", 7001)]));
        client.update().await;
        assert!(client.is_stable());
        assert_eq!(client.topology().len(), 1);

        // A routed request now dispatches to the only owner.
        let slot = reply_slot();
        let tx = slot.clone();
        client
            .send(
                command::request(&["GET", "user:1"]),
                Box::new(move |reply| {
                    *tx.lock().unwrap() = Some(reply);
                }),
            )
            .unwrap();
        client.update().await;
        assert_eq!(
            node.take_written(),
            command::request(&["GET", "user:1"]).serialize()
        );

        node.push_value(&RespValue::bulk_string("42"));
        client.update().await;
        let reply = slot.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(reply, RespValue::bulk_string("42"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn incomplete_coverage_holds_requests() {
        let mut connector = MemoryConnector::new();
        let node = connector.expect("127.0.0.1:7001");
        let mut client = ClusterClient::new(connector, vec!["127.0.0.1:7001".to_string()]);

        client.update().await;
        // Coverage stops short of the last slot.
        node.push_value(&slots_reply(&[(0, 16000, "127.0.0.1", 7001)]));
        client.update().await;
        assert!(matches!(
            client.config_state(),
            ConfigState::Incomplete { .. }
        ));

        let slot = reply_slot();
        let tx = slot.clone();
        client
            .send(
                command::request(&["GET", "foo"]),
                Box::new(move |reply| {
                    *tx.lock().unwrap() = Some(reply);
                }),
            )
            .unwrap();
        client.update().await;
        // The request stays queued and nothing was written to the node.
        assert_eq!(client.pending_requests(), 1);
        node.take_written();
        assert!(node.take_written().is_empty());
        assert!(slot.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn incomplete_map_requeries_after_countdown() {
        let mut connector = MemoryConnector::new();
        let node = connector.expect("127.0.0.1:7001");
        let mut client = ClusterClient::new(connector, vec!["127.0.0.1:7001".to_string()]);

        client.update().await;
        node.push_value(&slots_reply(&[(0, 100, "127.0.0.1", 7001)]));
        client.update().await;
        assert!(matches!(
            client.config_state(),
            ConfigState::Incomplete { .. }
        ));
        node.take_written();

        // Count the hold ticks down and observe the fresh query.
        for _ in 0..=INCOMPLETE_RETRY_TICKS {
            client.update().await;
        }
        assert_eq!(client.config_state(), ConfigState::Dirty);
        client.update().await;
        assert_eq!(client.config_state(), ConfigState::QueryPending);
        assert_eq!(node.take_written(), command::cluster_slots().serialize());
    }

    #[tokio::test]
    async fn disconnect_fails_queued_requests() {
        let mut connector = MemoryConnector::new();
        let _node = connector.expect("127.0.0.1:7001");
        let mut client = ClusterClient::new(connector, vec!["127.0.0.1:7001".to_string()]);

        let slot = reply_slot();
        let tx = slot.clone();
        client
            .send(
                command::request(&["GET", "foo"]),
                Box::new(move |reply| {
                    *tx.lock().unwrap() = Some(reply);
                }),
            )
            .unwrap();
        client.disconnect();

        let result = slot.lock().unwrap().take().unwrap();
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(client.pending_requests(), 0);
        // The client stays usable: the config task was re-armed.
        assert_eq!(client.config_state(), ConfigState::Dirty);
    }
}
