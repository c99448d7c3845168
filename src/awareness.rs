//! Ephemeral per-client presence with clock-based last-writer-wins.
//!
//! Awareness tracks "who is here and what are they doing" (cursor, name,
//! status) without persisting anything to the document. Every client owns
//! exactly one entry, disambiguated by a per-client monotonic clock:
//!
//! ```text
//! Local assignment                    Remote blob
//!       │                                 │
//!       ▼                                 ▼
//! set_local_state()  ──────────▶  apply_update()
//!   clock += 1                      accept iff clock newer
//!       │                           (or equal-clock tombstone)
//!       └────────────┬──────────────────┘
//!                    ▼
//!        change / update events ──▶ wire re-broadcast
//! ```
//!
//! Entries that stop refreshing are evicted after [`OUTDATED_TIMEOUT`]; the
//! local entry keeps itself alive by periodic re-assertion, which doubles as
//! a keep-alive for peers.
//!
//! Reference: Kleppmann, Chapter 8 — The Truth Is Defined by the Majority

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::codec::{Decoder, Encoder};
use crate::protocol::ProtocolError;

/// Client identifier assigned by the document engine.
pub type ClientId = u64;

/// A peer whose entry has not been refreshed for this long is evicted.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the awareness event channel.
const EVENT_CAPACITY: usize = 64;

/// Book-keeping for every client ever observed. An entry may outlive its
/// state (tombstone after a remote null).
#[derive(Debug, Clone, Copy)]
pub struct ClientMeta {
    /// Monotonic counter disambiguating concurrent writes for one client.
    pub clock: u32,
    /// Local receive/assignment time; used for liveness, never transmitted.
    pub last_updated: Instant,
}

/// Where an awareness mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessOrigin {
    /// A local assignment or removal.
    Local,
    /// A blob received from a peer (socket or local bus).
    Remote,
    /// The liveness sweeper evicted a stale entry.
    Timeout,
    /// The transport connection closed and took its peers with it.
    Connection,
}

/// Clients affected by one mutation, grouped by what happened to them.
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

    /// All affected clients, in added/updated/removed order. This is the set
    /// a provider re-broadcasts on the wire.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        let mut all =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        all.extend_from_slice(&self.added);
        all.extend_from_slice(&self.updated);
        all.extend_from_slice(&self.removed);
        all
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum AwarenessEvent {
    /// Something materially changed: an entry appeared, disappeared, or its
    /// state is deeply unequal to the previous value. `updated` carries only
    /// the deeply-unequal subset.
    Change {
        change: AwarenessChange,
        origin: AwarenessOrigin,
    },
    /// Any accepted record, including same-value refreshes (keep-alives).
    /// Drives wire re-broadcast.
    Update {
        change: AwarenessChange,
        origin: AwarenessOrigin,
    },
}

/// The awareness engine: per-client ephemeral state with clocks.
///
/// Invariants:
/// - every key in `states` has a matching key in `meta`;
/// - the local clock strictly increases on every (re-)assignment and on
///   every deflected remote removal;
/// - records older than the known clock are dropped on apply.
pub struct Awareness {
    client_id: ClientId,
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
    outdated_timeout: Duration,
    events: broadcast::Sender<AwarenessEvent>,
}

impl Awareness {
    /// Create an engine for the given client. The local state starts as an
    /// empty object (present and broadcastable) at clock 0.
    pub fn new(client_id: ClientId) -> Self {
        Self::with_timeout(client_id, OUTDATED_TIMEOUT)
    }

    /// Create with a custom eviction timeout (for testing).
    pub fn with_timeout(client_id: ClientId, outdated_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut awareness = Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
            outdated_timeout,
            events,
        };
        awareness.set_local_state(Some(Value::Object(Default::default())));
        awareness
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The local client's state, or `None` after removal.
    pub fn local_state(&self) -> Option<Value> {
        self.states.get(&self.client_id).cloned()
    }

    /// All known non-null states, including the local one.
    pub fn states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    /// Clock and liveness book-keeping, including tombstones.
    pub fn meta(&self) -> &HashMap<ClientId, ClientMeta> {
        &self.meta
    }

    /// Interval at which [`Awareness::check_timeouts`] should be driven.
    pub fn sweep_interval(&self) -> Duration {
        self.outdated_timeout / 10
    }

    /// Subscribe to change/update events.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.events.subscribe()
    }

    /// Assign (or clear, with `None`) the local state. Every call advances
    /// the local clock and refreshes the liveness timestamp, so periodic
    /// self-assignment doubles as a keep-alive.
    pub fn set_local_state(&mut self, state: Option<Value>) {
        let client_id = self.client_id;
        let state = state.filter(|v| !v.is_null());
        let clock = self.meta.get(&client_id).map(|m| m.clock + 1).unwrap_or(0);
        let prev = self.states.get(&client_id).cloned();

        match &state {
            Some(s) => {
                self.states.insert(client_id, s.clone());
            }
            None => {
                self.states.remove(&client_id);
            }
        }
        self.meta.insert(
            client_id,
            ClientMeta {
                clock,
                last_updated: Instant::now(),
            },
        );

        let mut change = AwarenessChange::default();
        let mut filtered_updated = Vec::new();
        match (&prev, &state) {
            (_, None) => change.removed.push(client_id),
            (None, Some(_)) => change.added.push(client_id),
            (Some(p), Some(s)) => {
                change.updated.push(client_id);
                if p != s {
                    filtered_updated.push(client_id);
                }
            }
        }
        self.emit(change, filtered_updated, AwarenessOrigin::Local);
    }

    /// Read-modify-write of a single field of the local state object.
    pub fn set_local_state_field(&mut self, field: &str, value: Value) {
        let mut state = self
            .local_state()
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(map) = &mut state {
            map.insert(field.to_string(), value);
        }
        self.set_local_state(Some(state));
    }

    /// Serialize any `Serialize` type into the local state.
    pub fn set_local_state_from<T: serde::Serialize>(
        &mut self,
        state: &T,
    ) -> Result<(), serde_json::Error> {
        self.set_local_state(Some(serde_json::to_value(state)?));
        Ok(())
    }

    /// Remove the given clients' states. Removing the local client bumps its
    /// clock so the removal wins over any in-flight older record.
    pub fn remove_states(&mut self, clients: &[ClientId], origin: AwarenessOrigin) {
        let mut removed = Vec::new();
        for &client in clients {
            if self.states.remove(&client).is_some() {
                if client == self.client_id {
                    if let Some(meta) = self.meta.get_mut(&client) {
                        meta.clock += 1;
                        meta.last_updated = Instant::now();
                    }
                }
                removed.push(client);
            }
        }
        if !removed.is_empty() {
            let change = AwarenessChange {
                removed,
                ..Default::default()
            };
            self.emit(change, Vec::new(), origin);
        }
    }

    /// Apply an incoming awareness blob.
    ///
    /// A record is accepted when its clock is newer than the known one, or
    /// equal while nulling an existing entry. A remote attempt to null the
    /// local entry is deflected: the local state is kept and its clock is
    /// bumped past the attacker's, so the subsequent re-broadcast reasserts
    /// this client everywhere.
    pub fn apply_update(
        &mut self,
        update: &[u8],
        origin: AwarenessOrigin,
    ) -> Result<AwarenessChange, ProtocolError> {
        let mut decoder = Decoder::new(update);
        let now = Instant::now();
        let mut change = AwarenessChange::default();
        let mut filtered_updated = Vec::new();

        let len = decoder.read_var_uint()?;
        for _ in 0..len {
            let client = decoder.read_var_uint()?;
            let mut clock = decoder.read_var_uint()? as u32;
            let json = decoder.read_var_string()?;
            let state: Value = serde_json::from_str(json)
                .map_err(|e| ProtocolError::BadAwarenessState(e.to_string()))?;
            let state = if state.is_null() { None } else { Some(state) };

            let known = self.meta.get(&client).map(|m| m.clock);
            let prev = self.states.get(&client).cloned();
            let current_clock = known.unwrap_or(0);
            let accept = clock > current_clock
                || (clock == current_clock
                    && state.is_none()
                    && self.states.contains_key(&client));
            if !accept {
                continue;
            }

            match &state {
                None => {
                    if client == self.client_id && self.local_state().is_some() {
                        // never let a remote peer null the local entry
                        clock += 1;
                    } else {
                        self.states.remove(&client);
                    }
                }
                Some(s) => {
                    self.states.insert(client, s.clone());
                }
            }
            self.meta.insert(
                client,
                ClientMeta {
                    clock,
                    last_updated: now,
                },
            );

            if known.is_none() && state.is_some() {
                change.added.push(client);
            } else if known.is_some() && state.is_none() {
                change.removed.push(client);
            } else if state.is_some() {
                if state != prev {
                    filtered_updated.push(client);
                }
                change.updated.push(client);
            }
        }

        self.emit(change.clone(), filtered_updated, origin);
        Ok(change)
    }

    /// Encode the given clients' current records into an update blob.
    ///
    /// Returns `None` when any requested client has no meta entry: a blob
    /// with an unknown clock could shadow the real one on receivers.
    pub fn encode_update(&self, clients: &[ClientId]) -> Option<Vec<u8>> {
        self.encode_update_with_states(clients, &self.states)
    }

    /// Encode against an override state map. Used for disconnect broadcasts,
    /// which advertise an all-null snapshot of the local entry.
    pub fn encode_update_with_states(
        &self,
        clients: &[ClientId],
        states: &HashMap<ClientId, Value>,
    ) -> Option<Vec<u8>> {
        let mut encoder = Encoder::new();
        encoder.write_var_uint(clients.len() as u64);
        for &client in clients {
            let meta = self.meta.get(&client)?;
            let json = match states.get(&client) {
                Some(state) => serde_json::to_string(state).ok()?,
                None => "null".to_string(),
            };
            encoder.write_var_uint(client);
            encoder.write_var_uint(u64::from(meta.clock));
            encoder.write_var_string(&json);
        }
        Some(encoder.into_vec())
    }

    /// Liveness sweep. Drive this every [`Awareness::sweep_interval`]:
    /// re-asserts the local entry after half the timeout of silence and
    /// evicts remote entries older than the full timeout.
    pub fn check_timeouts(&mut self) {
        let now = Instant::now();
        if self.states.contains_key(&self.client_id) {
            if let Some(meta) = self.meta.get(&self.client_id) {
                if now.duration_since(meta.last_updated) >= self.outdated_timeout / 2 {
                    let state = self.local_state();
                    self.set_local_state(state);
                }
            }
        }
        let stale: Vec<ClientId> = self
            .meta
            .iter()
            .filter(|(&client, meta)| {
                client != self.client_id
                    && now.duration_since(meta.last_updated) >= self.outdated_timeout
                    && self.states.contains_key(&client)
            })
            .map(|(&client, _)| client)
            .collect();
        if !stale.is_empty() {
            self.remove_states(&stale, AwarenessOrigin::Timeout);
        }
    }

    fn emit(
        &self,
        change: AwarenessChange,
        filtered_updated: Vec<ClientId>,
        origin: AwarenessOrigin,
    ) {
        let material = AwarenessChange {
            added: change.added.clone(),
            updated: filtered_updated,
            removed: change.removed.clone(),
        };
        if !material.is_empty() {
            let _ = self.events.send(AwarenessEvent::Change {
                change: material,
                origin,
            });
        }
        if !change.is_empty() {
            let _ = self.events.send(AwarenessEvent::Update { change, origin });
        }
    }
}

/// Rewrite the states inside an update blob, keeping ids and clocks intact.
/// Relays use this to overwrite identity fields they do not trust.
pub fn modify_awareness_update(
    update: &[u8],
    mut modify: impl FnMut(Value) -> Value,
) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = Decoder::new(update);
    let mut encoder = Encoder::new();
    let len = decoder.read_var_uint()?;
    encoder.write_var_uint(len);
    for _ in 0..len {
        let client = decoder.read_var_uint()?;
        let clock = decoder.read_var_uint()?;
        let state: Value = serde_json::from_str(decoder.read_var_string()?)
            .map_err(|e| ProtocolError::BadAwarenessState(e.to_string()))?;
        let modified = modify(state);
        let json = serde_json::to_string(&modified)
            .map_err(|e| ProtocolError::BadAwarenessState(e.to_string()))?;
        encoder.write_var_uint(client);
        encoder.write_var_uint(clock);
        encoder.write_var_string(&json);
    }
    Ok(encoder.into_vec())
}
