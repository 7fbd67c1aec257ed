//! Session registry for routing by agent name
//!
//! Maps each agent's self-reported name to its live [`Session`]. A later
//! registration under the same name replaces the earlier one; the replaced
//! session keeps running until its own heartbeat or connection fails, and
//! when it does it must not evict its replacement (see
//! [`SessionRegistry::remove_if_current`]).

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::session::Session;

/// Registry for managing connected agent sessions
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session under its name
    ///
    /// Returns the session it replaced, if any.
    pub fn put(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let name = session.name().to_string();
        let replaced = self.write().insert(name.clone(), session.clone());

        if let Some(ref old) = replaced {
            tracing::info!(
                name = %name,
                session_id = %session.id(),
                old_session_id = %old.id(),
                old_connected_at = %old.connected_at(),
                "Re-registered agent (replaced earlier session)"
            );
        } else {
            tracing::info!(
                name = %name,
                session_id = %session.id(),
                hostname = %session.metadata().hostname,
                "Registered new agent"
            );
        }

        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.read().get(name).cloned()
    }

    /// Remove whatever session is registered under `name`
    pub fn delete(&self, name: &str) -> Option<Arc<Session>> {
        let removed = self.write().remove(name);

        if removed.is_some() {
            tracing::info!(name = %name, "Unregistered agent");
        } else {
            tracing::debug!(name = %name, "Attempted to unregister unknown agent");
        }

        removed
    }

    /// Remove `session` only if it is still the one registered under its name
    pub fn remove_if_current(&self, session: &Session) -> bool {
        let mut sessions = self.write();
        match sessions.get(session.name()) {
            Some(current) if current.id() == session.id() => {
                sessions.remove(session.name());
                tracing::info!(
                    name = %session.name(),
                    session_id = %session.id(),
                    "Unregistered agent"
                );
                true
            }
            Some(current) => {
                tracing::debug!(
                    name = %session.name(),
                    session_id = %session.id(),
                    current_session_id = %current.id(),
                    "Superseded session ended; keeping its replacement"
                );
                false
            }
            None => false,
        }
    }

    /// Point-in-time copy of every registered session
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.read().values().cloned().collect()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use tether_proto::AgentMetadata;
    use tether_transport::{CallTransport, TransportConfig};
    use uuid::Uuid;

    fn create_test_session(name: &str) -> Arc<Session> {
        Session::new(
            Uuid::new_v4(),
            AgentMetadata::local(name),
            CallTransport::new(TransportConfig::default()),
            SessionConfig::default(),
        )
    }

    #[test]
    fn test_put_and_get() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        let session = create_test_session("node-a");
        assert!(registry.put(session.clone()).is_none());

        let found = registry.get("node-a").unwrap();
        assert_eq!(found.id(), session.id());
        assert!(registry.get("node-b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_put_replaces() {
        let registry = SessionRegistry::new();
        let first = create_test_session("node-a");
        let second = create_test_session("node-a");

        registry.put(first.clone());
        let replaced = registry.put(second.clone()).unwrap();

        assert_eq!(replaced.id(), first.id());
        assert_eq!(registry.get("node-a").unwrap().id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_delete() {
        let registry = SessionRegistry::new();
        registry.put(create_test_session("node-a"));

        assert!(registry.delete("node-a").is_some());
        assert!(registry.delete("node-a").is_none());
        assert!(registry.get("node-a").is_none());
    }

    #[test]
    fn test_remove_if_current_keeps_replacement() {
        let registry = SessionRegistry::new();
        let stale = create_test_session("node-a");
        let fresh = create_test_session("node-a");

        registry.put(stale.clone());
        registry.put(fresh.clone());

        // The stale session dying must not evict the fresh one
        assert!(!registry.remove_if_current(&stale));
        assert_eq!(registry.get("node-a").unwrap().id(), fresh.id());

        assert!(registry.remove_if_current(&fresh));
        assert!(registry.get("node-a").is_none());
        assert!(!registry.remove_if_current(&fresh));
    }

    #[test]
    fn test_all_is_a_snapshot() {
        let registry = SessionRegistry::new();
        registry.put(create_test_session("node-a"));
        registry.put(create_test_session("node-b"));

        let snapshot = registry.all();
        registry.delete("node-a");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_names_sorted() {
        let registry = SessionRegistry::new();
        for name in ["node-c", "node-a", "node-b"] {
            registry.put(create_test_session(name));
        }
        assert_eq!(registry.names(), vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn test_concurrent_mutation_and_enumeration() {
        let registry = SessionRegistry::new();
        let mut threads = Vec::new();

        for t in 0..4 {
            let registry = registry.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let name = format!("node-{}-{}", t, i % 10);
                    registry.put(create_test_session(&name));
                    for session in registry.all() {
                        // Every enumerated session is fully formed
                        assert!(session.name().starts_with("node-"));
                    }
                    if i % 3 == 0 {
                        registry.delete(&name);
                    }
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.len() <= 40);
    }
}
