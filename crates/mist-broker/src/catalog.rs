//! Live registry of connected agents.
//!
//! Entries are keyed by `agent_id`, with a reverse map from connection to
//! agent so disconnect cleanup is one lookup. Every mutation happens under a
//! single write lock and never across an await point.

use mist_protocol::{AgentManifest, AgentRegistration};
use mist_transport::{Connection, ConnectionId};
use parking_lot::RwLock;
use std::collections::HashMap;

struct Entry {
    registration: AgentRegistration,
    conn: Connection,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, Entry>,
    /// Reverse map from connection -> agent id (for cleanup)
    by_conn: HashMap<ConnectionId, String>,
    /// Registrations seen per agent name, used for id assignment
    name_counts: HashMap<String, u64>,
    next_seq: u64,
}

#[derive(Default)]
pub struct Catalog {
    inner: RwLock<Inner>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent behind `conn`.
    ///
    /// The first registration on a connection gets a fresh `<name>-<n>` id.
    /// A repeat registration on the same connection updates the entry in
    /// place, keeping its id and catalog position.
    pub fn register(&self, manifest: AgentManifest, conn: &Connection) -> AgentRegistration {
        let mut inner = self.inner.write();

        if let Some(agent_id) = inner.by_conn.get(&conn.id()).cloned() {
            if let Some(entry) = inner.agents.get_mut(&agent_id) {
                entry.registration = AgentRegistration::from_manifest(agent_id, manifest);
                return entry.registration.clone();
            }
        }

        let count = inner.name_counts.entry(manifest.name.clone()).or_insert(0);
        let agent_id = format!("{}-{}", manifest.name, count);
        *count += 1;

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let registration = AgentRegistration::from_manifest(agent_id.clone(), manifest);
        inner.by_conn.insert(conn.id(), agent_id.clone());
        inner.agents.insert(
            agent_id,
            Entry {
                registration: registration.clone(),
                conn: conn.clone(),
                seq,
            },
        );
        registration
    }

    pub fn unregister(&self, agent_id: &str) -> Option<AgentRegistration> {
        let mut inner = self.inner.write();
        let entry = inner.agents.remove(agent_id)?;
        inner.by_conn.remove(&entry.conn.id());
        Some(entry.registration)
    }

    /// Remove whatever agent registered on `conn`.
    pub fn unregister_by_conn(&self, conn: &Connection) -> Option<AgentRegistration> {
        let mut inner = self.inner.write();
        let agent_id = inner.by_conn.remove(&conn.id())?;
        inner.agents.remove(&agent_id).map(|e| e.registration)
    }

    /// The live connection of `agent_id`.
    pub fn connection(&self, agent_id: &str) -> Option<Connection> {
        self.inner.read().agents.get(agent_id).map(|e| e.conn.clone())
    }

    /// Every live `(agent_id, connection)` pair, in registration order.
    pub fn connections(&self) -> Vec<(String, Connection)> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.agents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| (e.registration.agent_id.clone(), e.conn.clone()))
            .collect()
    }

    /// Agent id registered on `conn`, if any.
    pub fn agent_for(&self, conn: &Connection) -> Option<String> {
        self.inner.read().by_conn.get(&conn.id()).cloned()
    }

    /// Current registrations in registration order, ties broken by id.
    pub fn snapshot(&self) -> Vec<AgentRegistration> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.agents.values().collect();
        entries.sort_by(|a, b| {
            a.seq
                .cmp(&b.seq)
                .then_with(|| a.registration.agent_id.cmp(&b.registration.agent_id))
        });
        entries.into_iter().map(|e| e.registration.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
