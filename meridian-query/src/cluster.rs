//! The agency-fed cluster view and reboot tracking.
//!
//! The view holds the last observed reboot id per DB-server, sourced from
//! `Current/ServersRegistered` in the agency. A query registers one
//! callback per participating server; when a later feed shows a larger
//! reboot id, the callback fires exactly once (a reused id cannot
//! double-fire) and is retired. Dropping the returned guard deregisters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use serde_json::Value;

use meridian_agency::comm::AgencyTransport;
use meridian_agency::comm::AsyncAgencyComm;
use meridian_agency::error::AgencyResult;
use meridian_agency::ROOT_PATH;

use crate::RebootId;
use crate::ServerId;

type Callback = Box<dyn FnOnce() + Send>;

struct CallbackEntry {
    server: ServerId,
    wanted: RebootId,
    callback: Callback,
}

#[derive(Default)]
struct ViewInner {
    reboot_ids: BTreeMap<ServerId, RebootId>,
    callbacks: BTreeMap<u64, CallbackEntry>,
    next_callback_id: u64,
}

/// The shared cluster view.
#[derive(Clone, Default)]
pub struct ClusterView {
    inner: Arc<Mutex<ViewInner>>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last observed reboot id of a server.
    pub fn reboot_id(&self, server: &str) -> Option<RebootId> {
        let inner = self.inner.lock().expect("cluster view lock poisoned");
        inner.reboot_ids.get(server).copied()
    }

    /// Feed one observation. Fires (and retires) every callback waiting on
    /// an older incarnation of this server.
    pub fn observe_reboot_id(&self, server: &str, reboot_id: RebootId) {
        let fired = {
            let mut inner = self.inner.lock().expect("cluster view lock poisoned");
            inner.reboot_ids.insert(server.to_string(), reboot_id);
            let due: Vec<u64> = inner
                .callbacks
                .iter()
                .filter(|(_, e)| e.server == server && reboot_id > e.wanted)
                .map(|(id, _)| *id)
                .collect();
            due.into_iter()
                .filter_map(|id| inner.callbacks.remove(&id))
                .collect::<Vec<_>>()
        };
        // Callbacks run outside the lock; they may re-enter the view.
        for entry in fired {
            tracing::info!(server = %entry.server, wanted = entry.wanted, observed = reboot_id, "reboot tracker fires");
            (entry.callback)();
        }
    }

    /// Register a callback for a server at the given incarnation. Fires
    /// immediately when the server is already past it.
    pub fn register_callback(
        &self,
        server: impl Into<ServerId>,
        wanted: RebootId,
        callback: impl FnOnce() + Send + 'static,
    ) -> RebootGuard {
        let server = server.into();
        let mut inner = self.inner.lock().expect("cluster view lock poisoned");
        let current = inner.reboot_ids.get(&server).copied().unwrap_or(0);
        if current > wanted {
            drop(inner);
            tracing::info!(server = %server, wanted, current, "reboot tracker fires at registration");
            callback();
            return RebootGuard {
                id: 0,
                view: Weak::new(),
            };
        }
        let id = inner.next_callback_id + 1;
        inner.next_callback_id = id;
        inner.callbacks.insert(id, CallbackEntry {
            server,
            wanted,
            callback: Box::new(callback),
        });
        RebootGuard {
            id,
            view: Arc::downgrade(&self.inner),
        }
    }

    /// Apply the subtree under `Current/ServersRegistered`:
    /// `{ "<server>": { "rebootId": n, ... }, ... }`.
    pub fn apply_servers_registered(&self, v: &Value) {
        let Some(servers) = v.as_object() else { return };
        for (server, doc) in servers {
            if let Some(reboot_id) = doc.get("rebootId").and_then(Value::as_u64) {
                self.observe_reboot_id(server, reboot_id);
            }
        }
    }

    /// Refresh the view from the agency.
    pub async fn refresh<T: AgencyTransport>(
        &self,
        comm: &AsyncAgencyComm<T>,
        timeout: Duration,
    ) -> AgencyResult<()> {
        let path = format!("{}/Current/ServersRegistered", ROOT_PATH);
        let res = comm.read(vec![vec![path]], timeout).await?;
        let registered = res
            .get(0)
            .and_then(|r| r.get("value"))
            .and_then(|v| v.pointer("/meridian/Current/ServersRegistered"))
            .cloned()
            .unwrap_or(Value::Null);
        self.apply_servers_registered(&registered);
        Ok(())
    }

    #[cfg(test)]
    fn callback_count(&self) -> usize {
        self.inner.lock().expect("cluster view lock poisoned").callbacks.len()
    }
}

/// Deregisters its callback on drop.
pub struct RebootGuard {
    id: u64,
    view: Weak<Mutex<ViewInner>>,
}

impl Drop for RebootGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.view.upgrade() {
            let mut inner = inner.lock().expect("cluster view lock poisoned");
            inner.callbacks.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for RebootGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebootGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;

    #[test]
    fn fires_once_on_larger_reboot_id() {
        let view = ClusterView::new();
        view.observe_reboot_id("DB1", 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _guard = view.register_callback("DB1", 1, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        // Same incarnation: nothing happens.
        view.observe_reboot_id("DB1", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        view.observe_reboot_id("DB1", 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The callback is retired; later observations cannot double-fire.
        view.observe_reboot_id("DB1", 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_immediately_when_already_past() {
        let view = ClusterView::new();
        view.observe_reboot_id("DB1", 5);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _guard = view.register_callback("DB1", 3, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(view.callback_count(), 0);
    }

    #[test]
    fn dropping_the_guard_deregisters() {
        let view = ClusterView::new();
        view.observe_reboot_id("DB1", 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let guard = view.register_callback("DB1", 1, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(view.callback_count(), 1);

        drop(guard);
        assert_eq!(view.callback_count(), 0);
        view.observe_reboot_id("DB1", 9);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn applies_servers_registered_subtree() {
        let view = ClusterView::new();
        view.apply_servers_registered(&json!({
            "DB1": {"rebootId": 4, "endpoint": "tcp://db1"},
            "DB2": {"rebootId": 2},
        }));
        assert_eq!(view.reboot_id("DB1"), Some(4));
        assert_eq!(view.reboot_id("DB2"), Some(2));
    }
}
