//! Recursive tree cache synchronizer.
//!
//! Maintains a local, eventually-consistent mirror of a remote subtree. The
//! synchronizer is a single task multiplexing three inputs: watch
//! notifications from the service, connection-state transitions from the
//! [`ConnectionStateManager`], and handle commands. Every fetch re-arms the
//! path's single-fire watch, a reconnect triggers a full top-down refresh,
//! and structural changes surface as a linearized [`ChildEvent`] stream:
//! parents are announced before their descendants on creation, children
//! before their parents on deletion.
//!
//! [`DescendantHandlingMode::DirectDescendantsOnly`] bounds tracking at the
//! first level below the root: grandchildren are neither tracked nor
//! watched, which keeps watch counts flat over large subtrees at the cost of
//! visibility into them.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy_framework::state::ConnectionStateManager;
use canopy_framework::{RetryDecision, RetryNTimes, RetryPolicy};
use canopy_primitives::{
    child_of, last_segment, parent_of, validate_path, ChildData, ChildEvent, ChildEventKind,
    ConnectionState, CoordinationError, Stat, WatchKind, WatchNotification,
};
use canopy_service::{CoordinationService, Watch};
use eyre::{Result as EyreResult, WrapErr};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::tree::{NodeState, TreeNode};

pub mod tree;

#[cfg(test)]
mod tests;

/// How deep below the root the cache tracks and watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescendantHandlingMode {
    /// Track first-level children only; changes below them are invisible.
    DirectDescendantsOnly,
    /// Track and watch the entire descendant subtree.
    AllDescendants,
}

/// Construction-time configuration. The mode is fixed for the cache's life.
#[derive(Clone)]
pub struct TreeCacheConfig {
    pub root: String,
    pub mode: DescendantHandlingMode,
    /// Policy for fetching the root during a population pass. Exhaustion is
    /// fatal for the pass: the cache emits a root-failure event and sets its
    /// fault flag.
    pub root_retry: Arc<dyn RetryPolicy>,
}

impl std::fmt::Debug for TreeCacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCacheConfig")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl TreeCacheConfig {
    #[must_use]
    pub fn new(root: impl Into<String>, mode: DescendantHandlingMode) -> Self {
        Self {
            root: root.into(),
            mode,
            root_retry: Arc::new(RetryNTimes::new(3, Duration::from_millis(250))),
        }
    }

    #[must_use]
    pub fn with_root_retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.root_retry = policy;
        self
    }
}

enum CacheCommand {
    Subscribe {
        listener: mpsc::UnboundedSender<ChildEvent>,
        ack: oneshot::Sender<()>,
    },
    /// Internal: a parked root-retry timer elapsed.
    RetryPopulate,
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Bookkeeping for an in-progress root population, across deferred retries.
#[derive(Clone, Copy, Debug)]
struct RetryState {
    attempt: u32,
    started: Instant,
}

struct Synchronizer {
    service: Arc<dyn CoordinationService>,
    config: TreeCacheConfig,
    mirror: Arc<RwLock<Option<TreeNode>>>,
    faulted: Arc<AtomicBool>,
    listeners: Vec<mpsc::UnboundedSender<ChildEvent>>,
    /// Events produced while handling the current trigger; delivered only
    /// after the updated mirror is published, so a listener that reacts to
    /// an event by reading the cache sees a mirror at least as new.
    pending: Vec<ChildEvent>,
    /// Re-enqueues internal triggers (parked root retries) behind whatever
    /// is already queued.
    retrigger: mpsc::UnboundedSender<CacheCommand>,
    pending_retry: Option<RetryState>,
    root: Option<TreeNode>,
    initialized: bool,
}

impl Synchronizer {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CacheCommand>,
        mut states: mpsc::UnboundedReceiver<ConnectionState>,
        mut watches: mpsc::UnboundedReceiver<WatchNotification>,
    ) {
        let mut states_open = true;
        let mut watches_open = true;
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(CacheCommand::Subscribe { listener, ack }) => {
                        self.listeners.push(listener);
                        let _ = ack.send(());
                    }
                    Some(CacheCommand::RetryPopulate) => {
                        // Stale timers (a fresh population superseded this
                        // one) find no retry outstanding and are ignored.
                        if self.pending_retry.is_some() {
                            self.try_populate().await;
                            self.publish();
                            self.flush();
                        }
                    }
                    Some(CacheCommand::Close { ack }) => {
                        self.shutdown(&mut commands).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown(&mut commands).await;
                        break;
                    }
                },
                state = states.recv(), if states_open => match state {
                    Some(state) => {
                        self.on_state(state).await;
                        self.publish();
                        self.flush();
                    }
                    None => states_open = false,
                },
                note = watches.recv(), if watches_open => match note {
                    Some(note) => {
                        self.on_watch(note).await;
                        self.publish();
                        self.flush();
                    }
                    None => watches_open = false,
                },
            }
        }
        debug!(root = self.config.root, "tree cache synchronizer stopped");
    }

    async fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<CacheCommand>) {
        commands.close();
        while let Some(trailing) = commands.recv().await {
            if let CacheCommand::Close { ack } = trailing {
                let _ = ack.send(());
            }
        }
        self.listeners.clear();
        self.pending.clear();
        self.pending_retry = None;
        *self.mirror.write() = None;
        self.root = None;
    }

    /// Publish a read-only snapshot of the tree for the handle's accessors.
    fn publish(&self) {
        *self.mirror.write() = self.root.clone();
    }

    fn emit(&mut self, event: ChildEvent) {
        self.pending.push(event);
    }

    fn flush(&mut self) {
        for event in self.pending.drain(..) {
            self.listeners
                .retain(|listener| listener.send(event.clone()).is_ok());
        }
    }

    async fn on_state(&mut self, state: ConnectionState) {
        debug!(root = self.config.root, %state, "cache observed connection state");
        match state {
            ConnectionState::Connected | ConnectionState::ReadOnly => {
                if !self.initialized {
                    self.populate().await;
                }
            }
            ConnectionState::Reconnected => {
                self.emit(ChildEvent::new(ChildEventKind::ConnectionReconnected, None));
                self.populate().await;
            }
            ConnectionState::Suspended => {
                // The mirror stays as-is: not invalidated, just not fresh.
                self.emit(ChildEvent::new(ChildEventKind::ConnectionSuspended, None));
            }
            ConnectionState::Lost => {
                self.emit(ChildEvent::new(ChildEventKind::ConnectionLost, None));
            }
        }
    }

    /// Begin a full top-down pass over the watched subtree, with a fresh
    /// retry budget for the root.
    async fn populate(&mut self) {
        self.pending_retry = Some(RetryState {
            attempt: 0,
            started: Instant::now(),
        });
        self.try_populate().await;
    }

    /// One population attempt. On failure the policy's backoff runs on a
    /// detached timer that re-enqueues the attempt as a command, so the
    /// synchronizer keeps serving commands, states and watches in between.
    /// Emits the one-time initialized event on first success; exhaustion
    /// faults the cache.
    async fn try_populate(&mut self) {
        let Some(retry) = self.pending_retry else {
            return;
        };
        match self.refresh(self.config.root.clone(), 0).await {
            Ok(()) => {
                self.pending_retry = None;
                self.faulted.store(false, Ordering::Relaxed);
                if !self.initialized {
                    self.initialized = true;
                    self.emit(ChildEvent::new(ChildEventKind::Initialized, None));
                }
            }
            Err(err) => {
                warn!(
                    root = self.config.root,
                    %err,
                    attempt = retry.attempt,
                    "root refresh failed"
                );
                match self
                    .config
                    .root_retry
                    .allow_retry(retry.attempt, retry.started.elapsed())
                {
                    RetryDecision::RetryAfter(sleep) => {
                        self.pending_retry = Some(RetryState {
                            attempt: retry.attempt + 1,
                            started: retry.started,
                        });
                        let retrigger = self.retrigger.clone();
                        drop(tokio::spawn(async move {
                            tokio::time::sleep(sleep).await;
                            let _ = retrigger.send(CacheCommand::RetryPopulate);
                        }));
                    }
                    RetryDecision::GiveUp => {
                        self.pending_retry = None;
                        self.faulted.store(true, Ordering::Relaxed);
                        self.emit(ChildEvent::new(ChildEventKind::RootFailure, None));
                    }
                }
            }
        }
    }

    async fn on_watch(&mut self, note: WatchNotification) {
        debug!(path = note.path, kind = ?note.kind, "watch fired");
        match note.kind {
            WatchKind::Deleted => self.handle_deleted(&note.path).await,
            WatchKind::Created => {
                // The root's existence watch fired: the root (re)appeared and
                // a full population is due.
                if note.path == self.config.root {
                    self.populate().await;
                    return;
                }
                // Otherwise an exists-style watch on a not-yet-known node;
                // the parent's child list is what changed from our point of
                // view.
                if let Some(parent) = parent_of(&note.path).map(ToOwned::to_owned) {
                    if let Some(depth) = self.refresh_scope(&parent) {
                        if let Err(err) = self.refresh(parent, depth).await {
                            debug!(%err, "deferred refresh after created-watch");
                        }
                    }
                }
            }
            WatchKind::DataChanged | WatchKind::ChildrenChanged => {
                if let Some(depth) = self.refresh_scope(&note.path) {
                    if let Err(err) = self.refresh(note.path.clone(), depth).await {
                        debug!(path = note.path, %err, "refresh failed; retry on next trigger");
                    }
                }
            }
        }
    }

    /// Depth of `path` below the cache root, when a refresh of it is in
    /// scope: inside the subtree, within the mode's depth bound, and with a
    /// tracked parent (otherwise the parent's own refresh discovers it).
    fn refresh_scope(&self, path: &str) -> Option<usize> {
        let depth = self.depth_of(path)?;
        if depth == 0 {
            return Some(0);
        }
        if self.config.mode == DescendantHandlingMode::DirectDescendantsOnly && depth > 1 {
            return None;
        }
        let parent = parent_of(path)?;
        self.is_tracked(parent).then_some(depth)
    }

    fn depth_of(&self, path: &str) -> Option<usize> {
        if path == self.config.root {
            return Some(0);
        }
        let rest = if self.config.root == "/" {
            path.strip_prefix('/')?
        } else {
            path.strip_prefix(self.config.root.as_str())?
                .strip_prefix('/')?
        };
        Some(rest.split('/').count())
    }

    fn is_tracked(&self, path: &str) -> bool {
        self.root
            .as_ref()
            .is_some_and(|root| root.find(path).is_some())
    }

    fn mark_pending(&mut self, path: &str) {
        if let Some(node) = self
            .root
            .as_mut()
            .and_then(|root| root.find_mut(path))
        {
            node.state = NodeState::Pending;
        }
    }

    /// Arm an existence watch on the root path. The fired deletion watch is
    /// spent, and the root's parent lies outside the watched subtree, so
    /// without this the root's recreation would go unobserved until a
    /// reconnect.
    async fn arm_root_watch(&self) {
        if let Err(err) = self.service.exists(&self.config.root, Watch::Arm).await {
            debug!(root = self.config.root, %err, "could not arm root existence watch");
        }
    }

    /// Drop the subtree at `path` from the mirror, emitting one removal per
    /// tracked node, children before parents.
    async fn handle_deleted(&mut self, path: &str) {
        if path == self.config.root {
            let detached = self
                .root
                .as_mut()
                .map(|root| std::mem::take(&mut root.children));
            if let Some(children) = detached {
                for (_, child) in children {
                    self.emit_removals(child);
                }
            }
            self.root = Some(TreeNode::pending(self.config.root.clone()));
            self.arm_root_watch().await;
            return;
        }
        let detached = self.root.as_mut().and_then(|root| root.detach(path));
        if let Some(subtree) = detached {
            self.emit_removals(subtree);
        }
    }

    fn emit_removals(&mut self, subtree: TreeNode) {
        let mut nodes = Vec::new();
        subtree.drain_post_order(&mut nodes);
        for node in nodes {
            let snapshot = node.snapshot();
            self.emit(ChildEvent::new(ChildEventKind::ChildRemoved, Some(snapshot)));
        }
    }

    /// Refresh the node at `path` (depth 0 = the cache root) and, where the
    /// mode tracks them, its descendants. Watches are re-armed as part of
    /// every fetch, before the result is acted on, so no update window is
    /// left open.
    ///
    /// Child-level failures are absorbed (the child stays pending and is
    /// retried on the next trigger); only a failure to fetch `path` itself
    /// propagates.
    fn refresh<'a>(
        &'a mut self,
        path: String,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<(), CoordinationError>> + Send + 'a>> {
        Box::pin(async move {
            let want_children =
                depth == 0 || self.config.mode == DescendantHandlingMode::AllDescendants;

            let (data, stat) = match self.service.get_data(&path, Watch::Arm).await {
                Ok(fetched) => fetched,
                Err(CoordinationError::NoNode { .. }) => {
                    if depth == 0 {
                        // A missing root gets an existence watch so its
                        // creation re-triggers population.
                        self.arm_root_watch().await;
                        return Err(CoordinationError::NoNode { path });
                    }
                    self.handle_deleted(&path).await;
                    return Ok(());
                }
                Err(err) => {
                    self.mark_pending(&path);
                    return Err(err);
                }
            };

            if depth == 0 {
                match self.root.as_mut() {
                    Some(root) => {
                        root.data = data;
                        root.stat = stat;
                        root.state = NodeState::Live;
                    }
                    None => {
                        let mut root = TreeNode::pending(path.clone());
                        root.data = data;
                        root.stat = stat;
                        root.state = NodeState::Live;
                        self.root = Some(root);
                    }
                }
            } else {
                let announce = self.upsert(&path, data, stat);
                if let Some(event) = announce {
                    // Parent-before-child: this node is announced before any
                    // event for its descendants below.
                    self.emit(event);
                }
            }

            if !want_children {
                return Ok(());
            }

            let names = match self.service.get_children(&path, Watch::Arm).await {
                Ok((names, _stat)) => names,
                Err(CoordinationError::NoNode { .. }) => {
                    if depth == 0 {
                        self.arm_root_watch().await;
                        return Err(CoordinationError::NoNode { path });
                    }
                    self.handle_deleted(&path).await;
                    return Ok(());
                }
                Err(err) => {
                    self.mark_pending(&path);
                    return Err(err);
                }
            };

            // Names gone remotely: tear those subtrees down first,
            // children-before-parents per subtree.
            let remote: BTreeSet<&str> = names.iter().map(String::as_str).collect();
            let stale: Vec<String> = self
                .root
                .as_ref()
                .and_then(|root| root.find(&path))
                .map(|node| {
                    node.children
                        .keys()
                        .filter(|name| !remote.contains(name.as_str()))
                        .map(|name| child_of(&path, name))
                        .collect()
                })
                .unwrap_or_default();
            for gone in stale {
                self.handle_deleted(&gone).await;
            }

            for name in &names {
                let child_path = child_of(&path, name);
                if let Err(err) = self.refresh(child_path, depth + 1).await {
                    debug!(%err, "child refresh deferred");
                }
            }
            Ok(())
        })
    }

    /// Record a fetched non-root node, returning the event to announce:
    /// added when previously unknown, updated when its data version moved.
    fn upsert(
        &mut self,
        path: &str,
        data: Option<Vec<u8>>,
        stat: Stat,
    ) -> Option<ChildEvent> {
        let root = self.root.as_mut()?;
        if let Some(node) = root.find_mut(path) {
            let changed = node.stat.version != stat.version;
            node.data = data;
            node.stat = stat;
            node.state = NodeState::Live;
            let snapshot = node.snapshot();
            return changed
                .then(|| ChildEvent::new(ChildEventKind::ChildUpdated, Some(snapshot)));
        }
        let parent_path = parent_of(path)?;
        let parent = root.find_mut(parent_path)?;
        let mut node = TreeNode::pending(path.to_owned());
        node.data = data;
        node.stat = stat;
        node.state = NodeState::Live;
        let snapshot = node.snapshot();
        let name = last_segment(path).to_owned();
        let _ = parent.children.insert(name, node);
        Some(ChildEvent::new(ChildEventKind::ChildAdded, Some(snapshot)))
    }
}

/// Handle to a running tree cache synchronizer.
///
/// Cheap to clone. Reads are served from a published snapshot and never
/// block the synchronizer.
#[derive(Clone, Debug)]
pub struct TreeCache {
    commands: mpsc::UnboundedSender<CacheCommand>,
    mirror: Arc<RwLock<Option<TreeNode>>>,
    faulted: Arc<AtomicBool>,
}

impl TreeCache {
    /// Spawn a synchronizer for `config.root` over `service`, driven by the
    /// given state manager. Returns the handle plus the first event
    /// subscription, registered before the task observes anything, so the
    /// caller cannot miss the initialized event.
    pub async fn start(
        service: Arc<dyn CoordinationService>,
        state: &ConnectionStateManager,
        config: TreeCacheConfig,
    ) -> EyreResult<(Self, mpsc::UnboundedReceiver<ChildEvent>)> {
        validate_path(&config.root).wrap_err("invalid tree cache root")?;

        let states = state.subscribe().await;
        let watches = service.watch_notifications();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let mirror = Arc::new(RwLock::new(None));
        let faulted = Arc::new(AtomicBool::new(false));

        let synchronizer = Synchronizer {
            service,
            config,
            mirror: Arc::clone(&mirror),
            faulted: Arc::clone(&faulted),
            listeners: vec![events_tx],
            pending: Vec::new(),
            retrigger: commands.clone(),
            pending_retry: None,
            root: None,
            initialized: false,
        };
        drop(tokio::spawn(synchronizer.run(commands_rx, states, watches)));

        Ok((
            Self {
                commands,
                mirror,
                faulted,
            },
            events_rx,
        ))
    }

    /// Register an additional event listener. Each listener sees its own
    /// totally ordered stream from the moment of registration.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ChildEvent> {
        let (listener, rx) = mpsc::unbounded_channel();
        let (ack, acked) = oneshot::channel();
        if self
            .commands
            .send(CacheCommand::Subscribe { listener, ack })
            .is_ok()
        {
            let _ = acked.await;
        }
        rx
    }

    /// Snapshot of one tracked node.
    #[must_use]
    pub fn current_data(&self, path: &str) -> Option<ChildData> {
        self.mirror
            .read()
            .as_ref()
            .and_then(|root| root.find(path))
            .map(TreeNode::snapshot)
    }

    /// Snapshots of a tracked node's children, in name order.
    #[must_use]
    pub fn current_children(&self, path: &str) -> Option<Vec<ChildData>> {
        self.mirror.read().as_ref().and_then(|root| {
            root.find(path)
                .map(|node| node.children.values().map(TreeNode::snapshot).collect())
        })
    }

    /// Every tracked node below the root, keyed by path.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ChildData> {
        self.mirror
            .read()
            .as_ref()
            .map(TreeNode::flatten_descendants)
            .unwrap_or_default()
    }

    /// Whether the root could not be fetched after configured retries. A
    /// faulted cache's mirror must not be trusted until a reconnect clears
    /// the fault.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Relaxed)
    }

    /// Stop the synchronizer. Idempotent; no listener receives an event
    /// after this returns, and the mirror is released.
    pub async fn close(&self) {
        let (ack, acked) = oneshot::channel();
        if self.commands.send(CacheCommand::Close { ack }).is_ok() {
            let _ = acked.await;
        }
    }
}
