//! Registry of connected agents.
//!
//! The map sits behind one `parking_lot` read/write lock. A sync lock cannot
//! be held across a socket write, so sends follow a fixed pattern: clone the
//! target handles under the read lock, write outside the lock, then take the
//! write lock to evict the connections that failed. Eviction is keyed on the
//! connection id, so an agent that re-registered in the meantime keeps its
//! new entry.
//!
//! Roster refreshes triggered by registration and eviction run on a
//! background task. At most one is in flight; changes made while it runs
//! queue exactly one more pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::ServerToAgent;
use crate::session::{SendError, SessionHandle};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent `{0}` is not registered")]
    NotFound(String),
    #[error("agent `{id}` is no longer connected: {source}")]
    Disconnected { id: String, source: SendError },
}

/// Public view of one registered agent. Never carries the live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of a fleet-wide send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn failures(&self) -> usize {
        self.failed.len()
    }
}

struct AgentEntry {
    hostname: String,
    address: String,
    last_seen: DateTime<Utc>,
    handle: SessionHandle,
}

#[derive(Default)]
struct RefreshState {
    running: bool,
    dirty: bool,
}

struct Inner {
    agents: HashMap<String, AgentEntry>,
    last_roster: String,
    refresh: RefreshState,
}

impl Inner {
    fn roster(&self) -> String {
        let roster: BTreeMap<&str, [&str; 2]> = self
            .agents
            .iter()
            .map(|(id, entry)| (id.as_str(), [entry.hostname.as_str(), entry.address.as_str()]))
            .collect();
        serde_json::to_string(&roster).unwrap_or_default()
    }

    fn targets(&self) -> Vec<(String, SessionHandle)> {
        self.agents
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle.clone()))
            .collect()
    }

    fn remove_if_owned(&mut self, id: &str, conn_id: Option<u64>) -> bool {
        let owned = self
            .agents
            .get(id)
            .is_some_and(|entry| conn_id.map_or(true, |conn| conn == entry.handle.conn_id()));
        if owned {
            self.agents.remove(id);
        }
        owned
    }
}

pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        let inner = Inner {
            agents: HashMap::new(),
            last_roster: String::new(),
            refresh: RefreshState::default(),
        };
        let last_roster = inner.roster();
        Self {
            inner: RwLock::new(Inner {
                last_roster,
                ..inner
            }),
        }
    }

    /// Insert or replace the entry for `id`. Returns whether an entry was
    /// replaced.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        hostname: &str,
        address: &str,
        handle: SessionHandle,
    ) -> bool {
        let replaced = self
            .inner
            .write()
            .agents
            .insert(
                id.to_string(),
                AgentEntry {
                    hostname: hostname.to_string(),
                    address: address.to_string(),
                    last_seen: Utc::now(),
                    handle,
                },
            )
            .is_some();
        self.schedule_roster_check();
        replaced
    }

    /// Remove `id`. With a `conn_id`, only removes the entry if it still
    /// belongs to that connection. Returns whether an entry was removed.
    pub fn evict(self: &Arc<Self>, id: &str, conn_id: Option<u64>) -> bool {
        let removed = self.inner.write().remove_if_owned(id, conn_id);
        if removed {
            tracing::info!(target = "fleet_control::registry", agent_id = %id, "agent evicted");
            self.schedule_roster_check();
        }
        removed
    }

    fn schedule_roster_check(self: &Arc<Self>) {
        {
            let mut inner = self.inner.write();
            if inner.refresh.running {
                inner.refresh.dirty = true;
                return;
            }
            inner.refresh.running = true;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                self.inner.write().refresh.running = false;
                tracing::warn!(target = "fleet_control::registry", error = %error, "no runtime for roster refresh");
                return;
            }
        };
        let registry = Arc::clone(self);
        runtime.spawn(async move {
            loop {
                registry.check_roster().await;
                let again = {
                    let mut inner = registry.inner.write();
                    if inner.refresh.dirty {
                        inner.refresh.dirty = false;
                        true
                    } else {
                        inner.refresh.running = false;
                        false
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn roster_settled(&self) {
        while self.inner.read().refresh.running {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    pub fn snapshot(&self) -> Vec<AgentSummary> {
        let inner = self.inner.read();
        let mut agents: Vec<AgentSummary> = inner
            .agents
            .iter()
            .map(|(id, entry)| AgentSummary {
                id: id.clone(),
                hostname: entry.hostname.clone(),
                address: entry.address.clone(),
                last_seen: entry.last_seen,
            })
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().agents.contains_key(id)
    }

    pub async fn unicast(self: &Arc<Self>, id: &str, frame: String) -> Result<(), RegistryError> {
        self.unicast_sequence(id, std::slice::from_ref(&frame)).await
    }

    /// Send `frames` to one agent in order, stopping at the first failure.
    /// A failed agent is evicted.
    pub async fn unicast_sequence(
        self: &Arc<Self>,
        id: &str,
        frames: &[String],
    ) -> Result<(), RegistryError> {
        let handle = self
            .inner
            .read()
            .agents
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Err(source) = send_all(&handle, frames).await {
            tracing::warn!(
                target = "fleet_control::registry",
                agent_id = %id,
                error = %source,
                "send failed, evicting agent"
            );
            self.evict(id, Some(handle.conn_id()));
            return Err(RegistryError::Disconnected {
                id: id.to_string(),
                source,
            });
        }
        Ok(())
    }

    pub async fn broadcast(self: &Arc<Self>, frame: String) -> BroadcastReport {
        self.broadcast_sequence(std::slice::from_ref(&frame)).await
    }

    /// Send `frames` to every agent. Each agent receives them in order and
    /// aborts at its own first failure; agents are served concurrently.
    pub async fn broadcast_sequence(self: &Arc<Self>, frames: &[String]) -> BroadcastReport {
        let targets = self.inner.read().targets();
        let report = self.deliver(targets, frames).await;
        if !report.failed.is_empty() {
            self.schedule_roster_check();
        }
        report
    }

    /// Send a refresh to every agent if the roster changed since the last
    /// check. Returns the number of refresh rounds sent.
    pub async fn check_roster(&self) -> usize {
        let refresh = match ServerToAgent::Refresh.encode() {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(target = "fleet_control::registry", error = %error, "failed to encode refresh");
                return 0;
            }
        };

        let mut rounds = 0;
        loop {
            let targets = {
                let mut inner = self.inner.write();
                let roster = inner.roster();
                if roster == inner.last_roster {
                    return rounds;
                }
                inner.last_roster = roster;
                inner.targets()
            };
            rounds += 1;
            tracing::debug!(target = "fleet_control::registry", agents = targets.len(), "roster changed, sending refresh");
            let report = self.deliver(targets, std::slice::from_ref(&refresh)).await;
            if report.failed.is_empty() {
                return rounds;
            }
        }
    }

    async fn deliver(
        &self,
        targets: Vec<(String, SessionHandle)>,
        frames: &[String],
    ) -> BroadcastReport {
        let results = join_all(targets.into_iter().map(|(id, handle)| async move {
            let result = send_all(&handle, frames).await;
            (id, handle.conn_id(), result)
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (id, conn_id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    tracing::warn!(
                        target = "fleet_control::registry",
                        agent_id = %id,
                        error = %error,
                        "broadcast send failed, evicting agent"
                    );
                    dead.push((id.clone(), conn_id));
                    report.failed.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write();
            for (id, conn_id) in &dead {
                inner.remove_if_owned(id, Some(*conn_id));
            }
        }
        report.failed.sort();
        report
    }
}

async fn send_all(handle: &SessionHandle, frames: &[String]) -> Result<(), SendError> {
    for frame in frames {
        handle.send_text(frame.clone()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{AgentRegistry, RegistryError};
    use crate::session::{OutboundFrame, SendError, SessionHandle};

    const REFRESH: &str = r#"{"action":"refresh"}"#;

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new())
    }

    fn live() -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
        let (handle, mut rx) = SessionHandle::channel(16);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let _ = seen_tx.send(frame.text);
                let _ = frame.ack.send(Ok(()));
            }
        });
        (handle, seen_rx)
    }

    fn dead() -> SessionHandle {
        let (handle, rx) = SessionHandle::channel(1);
        drop(rx);
        handle
    }

    fn insert_quietly(registry: &AgentRegistry, id: &str, handle: SessionHandle) {
        let mut inner = registry.inner.write();
        inner.agents.insert(
            id.to_string(),
            super::AgentEntry {
                hostname: id.to_string(),
                address: "10.0.0.9".into(),
                last_seen: chrono::Utc::now(),
                handle,
            },
        );
        inner.last_roster = inner.roster();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn reregistering_updates_without_duplicating() {
        let registry = registry();
        let (first, _a) = live();
        let (second, _b) = live();
        assert!(!registry.register("a1", "ws-01", "10.0.0.1", first));
        assert!(registry.register("a1", "ws-01b", "10.0.0.2", second));

        let agents = registry.snapshot();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].hostname, "ws-01b");
        assert_eq!(agents[0].address, "10.0.0.2");
    }

    #[tokio::test]
    async fn broadcast_evicts_exactly_the_dead_agents() {
        let registry = registry();
        let mut live_rx = Vec::new();
        for id in ["a", "b", "c"] {
            let (handle, rx) = live();
            registry.register(id, id, "10.0.0.1", handle);
            live_rx.push(rx);
        }
        registry.roster_settled().await;
        for rx in &mut live_rx {
            drain(rx);
        }
        insert_quietly(&registry, "x", dead());
        insert_quietly(&registry, "y", dead());
        assert_eq!(registry.snapshot().len(), 5);

        let report = registry.broadcast("hello".into()).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(registry.snapshot().len(), 3);

        registry.roster_settled().await;
        for rx in &mut live_rx {
            assert_eq!(drain(rx), vec!["hello".to_string(), REFRESH.to_string()]);
        }
    }

    #[tokio::test]
    async fn unicast_reports_unknown_and_dead_agents() {
        let registry = registry();
        assert_eq!(
            registry.unicast("ghost", "hi".into()).await,
            Err(RegistryError::NotFound("ghost".into()))
        );

        insert_quietly(&registry, "gone", dead());
        assert_eq!(
            registry.unicast("gone", "hi".into()).await,
            Err(RegistryError::Disconnected {
                id: "gone".into(),
                source: SendError::Closed
            })
        );
        assert!(!registry.contains("gone"));
    }

    #[tokio::test]
    async fn sequences_arrive_in_order() {
        let registry = registry();
        let (handle, mut rx) = live();
        registry.register("a", "h", "ip", handle);
        registry.roster_settled().await;
        assert_eq!(drain(&mut rx), vec![REFRESH.to_string()]);

        let frames: Vec<String> = (0..5).map(|i| format!("chunk-{i}")).collect();
        registry.unicast_sequence("a", &frames).await.unwrap();
        assert_eq!(drain(&mut rx), frames);
    }

    #[tokio::test]
    async fn roster_refresh_only_on_change() {
        let registry = registry();
        let (a, mut a_rx) = live();
        registry.register("a", "h", "ip", a.clone());
        registry.roster_settled().await;
        assert_eq!(drain(&mut a_rx), vec![REFRESH.to_string()]);

        // Same identity again: nothing to announce.
        registry.register("a", "h", "ip", a);
        registry.roster_settled().await;
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(registry.check_roster().await, 0);

        let (b, _b_rx) = live();
        registry.register("b", "h2", "ip2", b);
        registry.roster_settled().await;
        assert_eq!(drain(&mut a_rx), vec![REFRESH.to_string()]);

        assert!(registry.evict("b", None));
        registry.roster_settled().await;
        assert_eq!(drain(&mut a_rx), vec![REFRESH.to_string()]);
        assert!(!registry.evict("b", None));
    }

    #[tokio::test]
    async fn back_to_back_registrations_settle_to_a_stable_roster() {
        let registry = registry();
        let (a, mut a_rx) = live();
        registry.register("a", "h", "ip", a);
        let (b, _b_rx) = live();
        registry.register("b", "h", "ip", b);
        let (c, _c_rx) = live();
        registry.register("c", "h", "ip", c);
        registry.roster_settled().await;

        let frames = drain(&mut a_rx);
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|frame| frame == REFRESH));
        assert_eq!(registry.check_roster().await, 0);
    }

    #[tokio::test]
    async fn stuck_agent_does_not_hold_up_other_agents() {
        let registry = registry();
        let (stuck, mut stuck_rx) = SessionHandle::channel(4);
        // Accepts frames but never reports a write result.
        let _held = tokio::spawn(async move {
            let mut held: Vec<OutboundFrame> = Vec::new();
            while let Some(frame) = stuck_rx.recv().await {
                held.push(frame);
            }
        });
        registry.register("stuck", "h", "1", stuck);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let (b, mut b_rx) = live();
        assert!(!registry.register("b", "h", "2", b));
        assert!(registry.contains("b"));

        tokio::time::timeout(Duration::from_secs(2), registry.unicast("b", "hi".into()))
            .await
            .expect("unicast to a healthy agent is not blocked")
            .unwrap();
        assert!(drain(&mut b_rx).contains(&"hi".to_string()));

        assert!(registry.evict("b", None));
        assert!(!registry.contains("b"));
    }

    #[tokio::test]
    async fn stale_eviction_spares_a_newer_connection() {
        let registry = registry();
        let (old, _old_rx) = live();
        let old_conn = old.conn_id();
        registry.register("a", "h", "ip", old);
        let (new, _new_rx) = live();
        registry.register("a", "h", "ip", new);

        assert!(!registry.evict("a", Some(old_conn)));
        assert!(registry.contains("a"));
    }
}
