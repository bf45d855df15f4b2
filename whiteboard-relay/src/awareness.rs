//! Awareness table: ephemeral per-client presence with monotonic clocks.
//!
//! Updates travel as [`AwarenessUpdate`]s (see `protocol` for the blob
//! layout). The JSON text `null` is a tombstone: the client is
//! intentionally gone.
//!
//! Clocks are `u32`. A live state never holds `u32::MAX`, so there is
//! always room for one more tick and a removal can outrank whatever a
//! peer last saw.
//!
//! The table is plain data. Every mutating call returns what changed and
//! the caller decides who hears about it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::{AwarenessUpdate, AwarenessUpdateEntry};

/// Awareness client identifier, chosen by the client.
pub type ClientId = u64;

/// JSON text marking a removed client.
pub const TOMBSTONE: &str = "null";

/// Highest clock a live state may carry.
pub const MAX_LIVE_CLOCK: u32 = u32::MAX - 1;

#[derive(Debug, Clone)]
struct Entry {
    clock: u32,
    /// JSON text; `None` once tombstoned.
    state: Option<Arc<str>>,
    last_updated: Instant,
}

/// Client ids touched by one operation, split by transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id that changed, in added/updated/removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Per-room presence state.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    entries: HashMap<ClientId, Entry>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of `(client_id, clock, state)` entries.
    ///
    /// An entry wins only with a strictly greater clock than the stored one;
    /// anything else is stale and dropped silently. A live state at
    /// `u32::MAX` could never be removed again, so it is dropped too.
    /// Entries are applied in client id order.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut incoming: Vec<(&ClientId, &AwarenessUpdateEntry)> = update.clients.iter().collect();
        incoming.sort_unstable_by_key(|(id, _)| **id);

        let mut change = AwarenessChange::default();
        for (&client_id, entry) in incoming {
            let previous = self.entries.get(&client_id);
            if previous.is_some_and(|e| entry.clock <= e.clock) {
                continue;
            }
            let state = (&*entry.json != TOMBSTONE).then(|| entry.json.clone());
            if state.is_some() && entry.clock > MAX_LIVE_CLOCK {
                log::warn!("Dropping awareness state of {client_id} at exhausted clock {}", entry.clock);
                continue;
            }
            let was_live = previous.is_some_and(|e| e.state.is_some());

            match (&state, was_live) {
                (Some(_), false) => change.added.push(client_id),
                (Some(_), true) => change.updated.push(client_id),
                (None, _) => change.removed.push(client_id),
            }
            self.entries.insert(client_id, Entry { clock: entry.clock, state, last_updated: now });
        }

        change
    }

    /// Set a client's state directly, bumping its clock. Returns the new clock.
    ///
    /// Used by the owning side of a client id; `None` tombstones it. Returns
    /// `None` and leaves the entry alone when the clock is exhausted.
    pub fn set_state(&mut self, client_id: ClientId, state: Option<&str>, now: Instant) -> Option<u32> {
        let clock = match self.entries.get(&client_id) {
            Some(e) => e.clock.checked_add(1)?,
            None => 0,
        };
        if state.is_some() && clock > MAX_LIVE_CLOCK {
            return None;
        }
        self.entries.insert(
            client_id,
            Entry { clock, state: state.map(Arc::from), last_updated: now },
        );
        Some(clock)
    }

    /// Tombstone the given clients. Returns the ids that were live.
    ///
    /// The stored clock is bumped so the tombstone outranks the last state
    /// any peer may still hold.
    pub fn remove_clients(&mut self, client_ids: &[ClientId], now: Instant) -> Vec<ClientId> {
        let mut removed = Vec::new();
        for id in client_ids {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if entry.state.is_none() {
                continue;
            }
            match entry.clock.checked_add(1) {
                Some(clock) => {
                    entry.clock = clock;
                    entry.state = None;
                    entry.last_updated = now;
                    removed.push(*id);
                }
                None => log::warn!("Awareness clock of {id} exhausted, cannot tombstone"),
            }
        }
        removed
    }

    /// Tombstone live entries that were not renewed within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some() && now.saturating_duration_since(e.last_updated) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        self.remove_clients(&stale, now)
    }

    /// Forget tombstones older than `horizon`. Returns how many were dropped.
    ///
    /// After this a replayed state for a forgotten id is accepted again, so
    /// the horizon should be well past the presence timeout.
    pub fn purge_tombstones(&mut self, now: Instant, horizon: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.state.is_some() || now.saturating_duration_since(e.last_updated) < horizon);
        before - self.entries.len()
    }

    /// Collect the requested entries (live or tombstoned) into one update.
    ///
    /// Unknown ids are skipped.
    pub fn encode_update(&self, client_ids: &[ClientId]) -> AwarenessUpdate {
        let clients = client_ids
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|e| {
                    let json = e.state.clone().unwrap_or_else(|| Arc::from(TOMBSTONE));
                    (*id, AwarenessUpdateEntry { clock: e.clock, json })
                })
            })
            .collect();
        AwarenessUpdate { clients }
    }

    /// Every live entry; `None` when nobody is present.
    pub fn encode_full_state(&self) -> Option<AwarenessUpdate> {
        let live = self.live_ids();
        if live.is_empty() {
            None
        } else {
            Some(self.encode_update(&live))
        }
    }

    /// Live states keyed by client id.
    pub fn current_states(&self) -> HashMap<ClientId, Arc<str>> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Live state of one client; `None` when unknown or tombstoned.
    pub fn state(&self, client_id: ClientId) -> Option<Arc<str>> {
        self.entries.get(&client_id).and_then(|e| e.state.clone())
    }

    /// Last clock seen for a client, tombstones included.
    pub fn clock(&self, client_id: ClientId) -> Option<u32> {
        self.entries.get(&client_id).map(|e| e.clock)
    }

    /// Live client ids, sorted.
    pub fn live_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Entries held, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nobody is present. Tombstones do not count.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.state.is_none())
    }
}

/// Build an update from `(client_id, clock, json)` entries.
pub fn awareness_update<'a, I>(entries: I) -> AwarenessUpdate
where
    I: IntoIterator<Item = (ClientId, u32, &'a str)>,
{
    AwarenessUpdate {
        clients: entries
            .into_iter()
            .map(|(id, clock, json)| (id, AwarenessUpdateEntry { clock, json: Arc::from(json) }))
            .collect(),
    }
}
