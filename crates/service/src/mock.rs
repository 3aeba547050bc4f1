//! In-memory coordination service with controllable connectivity.
//!
//! Backs the framework and cache tests: a real node table with versioned
//! stats and single-fire watches, plus [`stop`](MockService::stop) /
//! [`restart`](MockService::restart) to drive connection churn
//! deterministically.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use canopy_primitives::{
    parent_of, validate_path, CoordinationError, RawConnectionSignal, Stat, WatchKind,
    WatchNotification,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{CoordinationService, CreateMode, Watch};

#[derive(Clone, Debug)]
struct MockNode {
    data: Vec<u8>,
    stat: Stat,
    #[allow(dead_code, reason = "ephemeral cleanup is driven by tests, not sessions")]
    mode: CreateMode,
}

#[derive(Debug, Default)]
struct Inner {
    connected: bool,
    clock_ms: u64,
    nodes: BTreeMap<String, MockNode>,
    data_watches: HashSet<String>,
    child_watches: HashSet<String>,
    signal_txs: Vec<mpsc::UnboundedSender<RawConnectionSignal>>,
    watch_txs: Vec<mpsc::UnboundedSender<WatchNotification>>,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock_ms += 1;
        self.clock_ms
    }

    fn broadcast_signal(&mut self, signal: RawConnectionSignal) {
        self.signal_txs.retain(|tx| tx.send(signal).is_ok());
    }

    /// Fire the armed data watch on `path`, if any. Single-shot: the arm is
    /// consumed before delivery.
    fn fire_data_watch(&mut self, path: &str, kind: WatchKind) {
        if self.data_watches.remove(path) {
            self.deliver(path, kind);
        }
    }

    fn fire_child_watch(&mut self, path: &str, kind: WatchKind) {
        if self.child_watches.remove(path) {
            self.deliver(path, kind);
        }
    }

    fn deliver(&mut self, path: &str, kind: WatchKind) {
        let notification = WatchNotification {
            path: path.to_owned(),
            kind,
        };
        self.watch_txs
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    fn ensure_connected(&self) -> Result<(), CoordinationError> {
        if self.connected {
            Ok(())
        } else {
            Err(CoordinationError::ConnectionLoss)
        }
    }

    fn has_children(&self, path: &str) -> bool {
        self.child_names(path).next().is_some()
    }

    fn child_names<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = if path == "/" {
            String::from("/")
        } else {
            format!("{path}/")
        };
        let prefix_len = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter_map(move |(key, _)| {
                let rest = &key[prefix_len..];
                (!rest.is_empty() && !rest.contains('/')).then_some(rest)
            })
    }

    fn remove_one(&mut self, path: &str) {
        let _ = self.nodes.remove(path);
        self.fire_data_watch(path, WatchKind::Deleted);
        self.fire_child_watch(path, WatchKind::Deleted);
    }

    fn bump_parent_children(&mut self, parent: &str, delta: i64) {
        let now = self.tick();
        if let Some(node) = self.nodes.get_mut(parent) {
            node.stat.cversion += 1;
            node.stat.num_children = node.stat.num_children.saturating_add_signed(delta as i32);
            node.stat.mtime_ms = now;
        }
    }
}

/// In-memory [`CoordinationService`].
///
/// Starts disconnected and silent; call [`restart`](Self::restart) to bring
/// the "server" up. The root node `/` always exists.
#[derive(Debug)]
pub struct MockService {
    inner: Mutex<Inner>,
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockService {
    #[must_use]
    pub fn new() -> Self {
        let mut inner = Inner::default();
        let _ = inner.nodes.insert(
            "/".to_owned(),
            MockNode {
                data: Vec::new(),
                stat: Stat::default(),
                mode: CreateMode::Persistent,
            },
        );
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Bring the service up. Subscribers receive a raw `Connected` signal.
    pub fn restart(&self) {
        let mut inner = self.inner.lock();
        if inner.connected {
            return;
        }
        inner.connected = true;
        debug!("mock service up");
        inner.broadcast_signal(RawConnectionSignal::Connected);
    }

    /// Take the service down. Subscribers see `Suspended` then `Lost`, the
    /// order a session-based client observes when its server goes away.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return;
        }
        inner.connected = false;
        debug!("mock service down");
        inner.broadcast_signal(RawConnectionSignal::Suspended);
        inner.broadcast_signal(RawConnectionSignal::Lost);
    }

    /// Whether the "server" is currently up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.inner.lock().connected
    }

    /// Remove `path` and every descendant in one step, deepest-first, firing
    /// the corresponding watches. Models a server-side recursive delete.
    pub fn remove_subtree(&self, path: &str) -> Result<(), CoordinationError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        if !inner.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        }
        let prefix = format!("{path}/");
        let mut doomed: Vec<String> = inner
            .nodes
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        doomed.push(path.to_owned());
        // Deepest paths sort last under the prefix; delete in reverse.
        doomed.sort();
        for victim in doomed.iter().rev() {
            inner.remove_one(victim);
        }
        if let Some(parent) = parent_of(path).map(str::to_owned) {
            inner.bump_parent_children(&parent, -1);
            inner.fire_child_watch(&parent, WatchKind::ChildrenChanged);
        }
        Ok(())
    }

    /// All strict descendants of `path` with their data, for comparing a
    /// cache mirror against remote truth.
    #[must_use]
    pub fn subtree(&self, path: &str) -> BTreeMap<String, Vec<u8>> {
        let inner = self.inner.lock();
        let prefix = if path == "/" {
            String::from("/")
        } else {
            format!("{path}/")
        };
        inner
            .nodes
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix) && key.as_str() != path)
            .map(|(key, node)| (key.clone(), node.data.clone()))
            .collect()
    }
}

#[async_trait]
impl CoordinationService for MockService {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        validate_path(path)?;
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        if inner.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists {
                path: path.to_owned(),
            });
        }
        let parent = parent_of(path)
            .ok_or(CoordinationError::InvalidPath {
                path: path.to_owned(),
                reason: "cannot create the root",
            })?
            .to_owned();
        if !inner.nodes.contains_key(&parent) {
            return Err(CoordinationError::NoNode { path: parent });
        }
        let now = inner.tick();
        let stat = Stat {
            version: 0,
            cversion: 0,
            mtime_ms: now,
            data_length: data.len() as u32,
            num_children: 0,
        };
        let _ = inner
            .nodes
            .insert(path.to_owned(), MockNode { data, stat, mode });
        inner.bump_parent_children(&parent, 1);
        inner.fire_data_watch(path, WatchKind::Created);
        inner.fire_child_watch(&parent, WatchKind::ChildrenChanged);
        Ok(path.to_owned())
    }

    async fn delete(&self, path: &str, version: Option<u64>) -> Result<(), CoordinationError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        let Some(node) = inner.nodes.get(path) else {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        };
        if let Some(expected) = version {
            if node.stat.version != expected {
                return Err(CoordinationError::BadVersion {
                    path: path.to_owned(),
                });
            }
        }
        if inner.has_children(path) {
            return Err(CoordinationError::NotEmpty {
                path: path.to_owned(),
            });
        }
        inner.remove_one(path);
        if let Some(parent) = parent_of(path).map(str::to_owned) {
            inner.bump_parent_children(&parent, -1);
            inner.fire_child_watch(&parent, WatchKind::ChildrenChanged);
        }
        Ok(())
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<u64>,
    ) -> Result<Stat, CoordinationError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        let now = inner.tick();
        let Some(node) = inner.nodes.get_mut(path) else {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        };
        if let Some(expected) = version {
            if node.stat.version != expected {
                return Err(CoordinationError::BadVersion {
                    path: path.to_owned(),
                });
            }
        }
        node.stat.version += 1;
        node.stat.mtime_ms = now;
        node.stat.data_length = data.len() as u32;
        node.data = data;
        let stat = node.stat;
        inner.fire_data_watch(path, WatchKind::DataChanged);
        Ok(stat)
    }

    async fn get_data(
        &self,
        path: &str,
        watch: Watch,
    ) -> Result<(Option<Vec<u8>>, Stat), CoordinationError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        let Some(node) = inner.nodes.get(path) else {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        };
        let result = (Some(node.data.clone()), node.stat);
        if watch.armed() {
            let _ = inner.data_watches.insert(path.to_owned());
        }
        Ok(result)
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Watch,
    ) -> Result<(Vec<String>, Stat), CoordinationError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        let Some(node) = inner.nodes.get(path) else {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        };
        let stat = node.stat;
        let names: Vec<String> = inner.child_names(path).map(str::to_owned).collect();
        if watch.armed() {
            let _ = inner.child_watches.insert(path.to_owned());
        }
        Ok((names, stat))
    }

    async fn exists(&self, path: &str, watch: Watch) -> Result<Option<Stat>, CoordinationError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;
        // An exists watch may be armed on a path that is not there yet; it
        // fires when the node is created.
        if watch.armed() {
            let _ = inner.data_watches.insert(path.to_owned());
        }
        Ok(inner.nodes.get(path).map(|node| node.stat))
    }

    fn connection_signals(&self) -> mpsc::UnboundedReceiver<RawConnectionSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().signal_txs.push(tx);
        rx
    }

    fn watch_notifications(&self) -> mpsc::UnboundedReceiver<WatchNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watch_txs.push(tx);
        rx
    }
}
