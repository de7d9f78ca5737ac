//! Commands forwarded to agents and still awaiting their final reply.
//!
//! Message ids are only unique per sender, so entries are keyed by the
//! target agent and the command id together. The agent's reply arrives on
//! its own connection, which names the target.

use mist_protocol::{Message, MessageId};
use mist_transport::Connection;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Where the reply goes.
    pub origin: Connection,
    /// `sender` of the forwarded command.
    pub sender: String,
    pub target: String,
}

#[derive(Default)]
pub struct PendingCommands {
    /// target agent -> command id -> entry
    entries: Mutex<HashMap<String, HashMap<MessageId, PendingCommand>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `command`, forwarded on behalf of `origin`.
    ///
    /// Returns `false` and leaves the table untouched when a command with
    /// the same id is already pending on the same target.
    pub fn insert(&self, command: &Message, origin: Connection) -> bool {
        let mut entries = self.entries.lock();
        let for_target = entries.entry(command.to.clone()).or_default();
        if for_target.contains_key(&command.id) {
            return false;
        }
        for_target.insert(
            command.id.clone(),
            PendingCommand {
                origin,
                sender: command.sender.clone(),
                target: command.to.clone(),
            },
        );
        true
    }

    pub fn get(&self, target: &str, id: &MessageId) -> Option<PendingCommand> {
        self.entries.lock().get(target)?.get(id).cloned()
    }

    pub fn take(&self, target: &str, id: &MessageId) -> Option<PendingCommand> {
        let mut entries = self.entries.lock();
        let for_target = entries.get_mut(target)?;
        let entry = for_target.remove(id);
        if for_target.is_empty() {
            entries.remove(target);
        }
        entry
    }

    /// Remove and return every command addressed to `target`.
    pub fn remove_for_target(&self, target: &str) -> Vec<(MessageId, PendingCommand)> {
        self.entries
            .lock()
            .remove(target)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop every command sent by `origin`; returns how many were dropped.
    pub fn remove_for_origin(&self, origin: &Connection) -> usize {
        let mut entries = self.entries.lock();
        let mut dropped = 0;
        for for_target in entries.values_mut() {
            let before = for_target.len();
            for_target.retain(|_, p| p.origin != *origin);
            dropped += before - for_target.len();
        }
        entries.retain(|_, m| !m.is_empty());
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
