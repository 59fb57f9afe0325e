//! Transient registry of who is connected right now. Owned by the gateway
//! process, rebuilt from nothing on restart; absence means offline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use atrium_types::identity::Identity;
use atrium_types::models::PresenceEntry;

#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, conn_id: Uuid, identity: Identity, display_name: String) {
        self.inner.write().await.insert(
            conn_id,
            PresenceEntry {
                identity,
                display_name,
                last_seen: Utc::now(),
            },
        );
    }

    /// Remove the entry for a connection. Returns the entry the first time
    /// only; concurrent or repeated teardown paths get `None`, which is the
    /// exactly-once guard for the offline broadcast.
    pub async fn unregister(&self, conn_id: Uuid) -> Option<PresenceEntry> {
        self.inner.write().await.remove(&conn_id)
    }

    /// Equivalence-aware: any connection registered under any form of the
    /// identity counts.
    pub async fn is_online(&self, identity: &Identity) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|entry| entry.identity.same_as(identity))
    }

    /// Connection handles registered for an identity (any form).
    pub async fn conns_for(&self, identity: &Identity) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.identity.same_as(identity))
            .map(|(conn_id, _)| *conn_id)
            .collect()
    }

    /// Currently-online identities, one entry per human (variants collapse
    /// on the canonical form).
    pub async fn snapshot(&self) -> Vec<PresenceEntry> {
        let map = self.inner.read().await;
        let mut seen: Vec<String> = Vec::new();
        let mut out = Vec::new();
        for entry in map.values() {
            let canonical = entry.identity.canonical().to_string();
            if seen.contains(&canonical) {
                continue;
            }
            seen.push(canonical);
            out.push(entry.clone());
        }
        out
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn online_status_is_equivalence_aware() {
        let registry = PresenceRegistry::new();
        registry
            .register(Uuid::new_v4(), Identity::new("sso_42"), "Olena".into())
            .await;

        assert!(registry.is_online(&Identity::new("42")).await);
        assert!(registry.is_online(&Identity::new("sso_42")).await);
        assert!(!registry.is_online(&Identity::new("43")).await);
    }

    #[tokio::test]
    async fn unregister_yields_the_entry_exactly_once() {
        let registry = PresenceRegistry::new();
        let conn = Uuid::new_v4();
        registry
            .register(conn, Identity::new("42"), "Olena".into())
            .await;

        assert!(registry.unregister(conn).await.is_some());
        assert!(registry.unregister(conn).await.is_none());
        assert!(!registry.is_online(&Identity::new("42")).await);
    }

    #[tokio::test]
    async fn snapshot_collapses_identity_variants() {
        let registry = PresenceRegistry::new();
        registry
            .register(Uuid::new_v4(), Identity::new("42"), "Olena".into())
            .await;
        registry
            .register(Uuid::new_v4(), Identity::new("sso_42"), "Olena".into())
            .await;
        registry
            .register(Uuid::new_v4(), Identity::new("7"), "Petro".into())
            .await;

        assert_eq!(registry.snapshot().await.len(), 2);
    }
}
