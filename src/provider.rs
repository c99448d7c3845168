//! The provider: one document, one room, one endpoint.
//!
//! Glues the other modules together and owns the lifecycle:
//!
//! ```text
//! local edit ──▶ doc listener ──┐
//! local presence ─▶ awareness ──┤            ┌──▶ WebSocket (server relay)
//!                               ├─ fan-out ──┤
//!                               │            └──▶ LocalBus (same-process peers)
//! incoming frame ──▶ route ─────┘
//!    │ sync      → apply / reply step2 (reply goes back on the origin channel)
//!    │ awareness → awareness engine
//!    │ auth      → permission-denied callback
//!    └ query     → reply with full awareness state
//! ```
//!
//! The connection loop reconnects with exponential backoff, a watchdog
//! closes silent sockets, and an optional resync timer periodically replays
//! the sync handshake to repair silent divergence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use yrs::{Doc, Origin, StateVector};

use crate::awareness::{Awareness, AwarenessEvent, AwarenessOrigin};
use crate::broadcast::{BusFrame, LocalBus};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{self, ProtocolError};
use crate::transport::{
    reconnect_delay, Socket, SocketFactory, WsSocketFactory, MESSAGE_RECONNECT_TIMEOUT,
};

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the provider.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Transport state changed.
    Status(ConnectionStatus),
    /// Sync state changed (both edges).
    Sync(bool),
    /// Initial handshake completed (false→true edge only).
    Synced(bool),
    /// Transient transport failure; the reconnect loop handles recovery.
    ConnectionError(String),
    /// The socket closed, with the close reason when one was given.
    ConnectionClose(Option<String>),
}

pub type PermissionDeniedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Provider configuration. All fields have working defaults.
#[derive(Clone)]
pub struct ProviderOptions {
    /// Open the transport immediately on construction.
    pub connect: bool,
    /// Extra query parameters appended to the endpoint URL.
    pub params: Vec<(String, String)>,
    /// Period of proactive sync-step-1 sends over the transport only.
    pub resync_interval: Option<Duration>,
    /// Upper bound of the reconnect backoff.
    pub max_backoff: Duration,
    /// Whether the same-process fan-out bus is used at all.
    pub enable_bus: bool,
    /// Transport implementation; defaults to WebSocket.
    pub socket_factory: Arc<dyn SocketFactory>,
    /// Called when the server denies access to the room.
    pub on_permission_denied: Option<PermissionDeniedHandler>,
    /// Bus instance; defaults to the process-wide bus.
    pub bus: LocalBus,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            connect: true,
            params: Vec::new(),
            resync_interval: None,
            max_backoff: Duration::from_millis(2500),
            enable_bus: true,
            socket_factory: Arc::new(WsSocketFactory),
            on_permission_denied: None,
            bus: LocalBus::global(),
        }
    }
}

/// State shared between the provider handle and its background tasks.
struct Core {
    doc: Doc,
    awareness: Arc<Mutex<Awareness>>,
    /// Transaction origin for updates this provider applies; used to
    /// recognize (and drop) its own echo in the document listener.
    origin: Origin,
    url: String,
    bus: LocalBus,
    bus_channel: String,
    /// Opaque publisher token on the bus.
    bus_origin: u64,
    bus_connected: AtomicBool,
    status: Mutex<ConnectionStatus>,
    synced: AtomicBool,
    should_connect: AtomicBool,
    unsuccessful_reconnects: AtomicU32,
    last_message_received: Mutex<Instant>,
    /// Writer handle of the live socket; `None` while disconnected.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events: broadcast::Sender<ProviderEvent>,
    on_permission_denied: Option<PermissionDeniedHandler>,
}

impl Core {
    fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.lock().unwrap();
        if *current != status {
            *current = status;
            self.emit(ProviderEvent::Status(status));
        }
    }

    fn set_synced(&self, synced: bool) {
        if self.synced.swap(synced, Ordering::SeqCst) != synced {
            self.emit(ProviderEvent::Sync(synced));
            if synced {
                self.emit(ProviderEvent::Synced(true));
            }
        }
    }

    /// Send a frame on the live socket, if any. Returns whether a socket
    /// accepted it.
    fn send_socket(&self, frame: Vec<u8>) -> bool {
        match self.outgoing.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn publish_bus(&self, frame: Vec<u8>) {
        if self.bus_connected.load(Ordering::SeqCst) {
            self.bus.publish(&self.bus_channel, frame, self.bus_origin);
        }
    }

    /// Deliver one logical frame to every interested participant: the
    /// server over the socket and local peers over the bus.
    fn broadcast_both(&self, frame: Vec<u8>) {
        self.send_socket(frame.clone());
        self.publish_bus(frame);
    }

    /// Decode one frame and route it. Returns the reply frame, if the
    /// handler produced one beyond its bare message tag. `emit_synced`
    /// distinguishes the socket path (a step2 completes the handshake)
    /// from the bus path (which must not touch sync state).
    fn handle_frame(
        &self,
        data: &[u8],
        emit_synced: bool,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut decoder = Decoder::new(data);
        let mut encoder = Encoder::new();
        match decoder.read_var_uint()? {
            protocol::MSG_SYNC => {
                encoder.write_var_uint(protocol::MSG_SYNC);
                let sub = protocol::read_sync_message(
                    &mut decoder,
                    &mut encoder,
                    &self.doc,
                    &self.origin,
                )?;
                if emit_synced && sub == protocol::SYNC_STEP_2 {
                    self.set_synced(true);
                }
            }
            protocol::MSG_AWARENESS => {
                let blob = decoder.read_var_bytes()?;
                let mut awareness = self.awareness.lock().unwrap();
                awareness.apply_update(blob, AwarenessOrigin::Remote)?;
            }
            protocol::MSG_AUTH => {
                protocol::read_auth_message(&mut decoder, |reason| {
                    match &self.on_permission_denied {
                        Some(handler) => handler(reason),
                        None => {
                            log::warn!("permission denied to access {}: {reason}", self.url)
                        }
                    }
                })?;
            }
            protocol::MSG_QUERY_AWARENESS => {
                let awareness = self.awareness.lock().unwrap();
                let mut clients: Vec<_> = awareness.states().keys().copied().collect();
                clients.sort_unstable();
                if let Some(blob) = awareness.encode_update(&clients) {
                    encoder.write_var_uint(protocol::MSG_AWARENESS);
                    encoder.write_var_bytes(&blob);
                }
            }
            other => {
                log::warn!("unknown message type {other}, dropping frame");
                return Ok(None);
            }
        }
        if encoder.len() > 1 {
            Ok(Some(encoder.into_vec()))
        } else {
            Ok(None)
        }
    }
}

/// A synchronized document bound to one room on one server.
///
/// Dropping the provider (or calling [`Provider::destroy`]) tears down
/// timers, socket, bus subscription, and document listener.
pub struct Provider {
    room: String,
    core: Arc<Core>,
    factory: Arc<dyn SocketFactory>,
    max_backoff: Duration,
    resync_interval: Option<Duration>,
    enable_bus: bool,
    conn_task: Option<JoinHandle<()>>,
    bus_task: Option<JoinHandle<()>>,
    fanout_task: Option<JoinHandle<()>>,
    sweeper_task: Option<JoinHandle<()>>,
    _doc_sub: Option<yrs::Subscription>,
    destroyed: bool,
}

impl Provider {
    /// Create a provider for `<server_url>/<room>`. Must be called from
    /// within a tokio runtime; background tasks are spawned immediately.
    pub fn new(server_url: &str, room: &str, doc: Doc, options: ProviderOptions) -> Provider {
        let url = build_url(server_url, room, &options.params);
        let bus_channel = build_url(server_url, room, &[]);

        static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);
        let bus_origin = NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed);
        let origin = Origin::from(format!("driftsync-{bus_origin}").as_str());

        let awareness = Arc::new(Mutex::new(Awareness::new(doc.client_id())));
        let (events, _) = broadcast::channel(64);

        let core = Arc::new(Core {
            doc: doc.clone(),
            awareness: awareness.clone(),
            origin: origin.clone(),
            url,
            bus: options.bus.clone(),
            bus_channel,
            bus_origin,
            bus_connected: AtomicBool::new(false),
            status: Mutex::new(ConnectionStatus::Disconnected),
            synced: AtomicBool::new(false),
            should_connect: AtomicBool::new(false),
            unsuccessful_reconnects: AtomicU32::new(0),
            last_message_received: Mutex::new(Instant::now()),
            outgoing: Mutex::new(None),
            events,
            on_permission_denied: options.on_permission_denied.clone(),
        });

        // Local edits (any transaction not originated by this provider)
        // are forwarded to the fan-out task.
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let observer_origin = origin.clone();
        let doc_sub = doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() != Some(&observer_origin) {
                    let _ = update_tx.send(event.update.clone());
                }
            })
            .expect("failed to attach document update observer");

        let awareness_events = awareness.lock().unwrap().subscribe();
        let fanout_task = tokio::spawn(fanout_loop(core.clone(), update_rx, awareness_events));
        let sweep_interval = awareness.lock().unwrap().sweep_interval();
        let sweeper_task = tokio::spawn(sweeper_loop(core.clone(), sweep_interval));

        let mut provider = Provider {
            room: room.to_string(),
            core,
            factory: options.socket_factory.clone(),
            max_backoff: options.max_backoff,
            resync_interval: options.resync_interval,
            enable_bus: options.enable_bus,
            conn_task: None,
            bus_task: None,
            fanout_task: Some(fanout_task),
            sweeper_task: Some(sweeper_task),
            _doc_sub: Some(doc_sub),
            destroyed: false,
        };
        if options.connect {
            provider.connect();
        }
        provider
    }

    /// Open (or re-open) the transport and the bus subscription.
    pub fn connect(&mut self) {
        if self.destroyed {
            return;
        }
        self.core.should_connect.store(true, Ordering::SeqCst);
        if self.enable_bus {
            self.connect_bus();
        }
        let running = self.conn_task.as_ref().map_or(false, |t| !t.is_finished());
        if !running {
            self.conn_task = Some(tokio::spawn(connection_loop(
                self.core.clone(),
                self.factory.clone(),
                self.max_backoff,
                self.resync_interval,
            )));
        }
    }

    /// Close the transport and the bus subscription. No reconnects are
    /// scheduled until [`Provider::connect`] is called again.
    pub fn disconnect(&mut self) {
        self.core.should_connect.store(false, Ordering::SeqCst);
        // The local entry leaves with us; the bumped clock makes the
        // removal win over any in-flight older record.
        let client_id = self.core.doc.client_id();
        self.core
            .awareness
            .lock()
            .unwrap()
            .remove_states(&[client_id], AwarenessOrigin::Connection);
        self.disconnect_bus();
        self.close_socket();
    }

    /// Tear everything down. Idempotent; also runs on drop.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(task) = self.sweeper_task.take() {
            task.abort();
        }
        self.disconnect();
        if let Some(task) = self.fanout_task.take() {
            task.abort();
        }
        // detaching the listener last: in-flight callbacks stay safe no-ops
        self._doc_sub = None;
    }

    pub fn url(&self) -> &str {
        &self.core.url
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Channel name used on the local bus.
    pub fn bus_channel(&self) -> &str {
        &self.core.bus_channel
    }

    pub fn doc(&self) -> &Doc {
        &self.core.doc
    }

    pub fn awareness(&self) -> Arc<Mutex<Awareness>> {
        self.core.awareness.clone()
    }

    /// Whether the initial handshake of the current connection completed.
    pub fn synced(&self) -> bool {
        self.core.synced.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.core.status.lock().unwrap()
    }

    pub fn should_connect(&self) -> bool {
        self.core.should_connect.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.core.events.subscribe()
    }

    fn connect_bus(&mut self) {
        let core = self.core.clone();
        if !core.bus_connected.swap(true, Ordering::SeqCst) {
            let rx = core.bus.subscribe(&core.bus_channel);
            self.bus_task = Some(tokio::spawn(bus_loop(core.clone(), rx)));
        }

        // Join dance: a late-joining peer converges on document and
        // awareness from a single subscribe.
        let mut enc = Encoder::new();
        enc.write_var_uint(protocol::MSG_SYNC);
        protocol::write_sync_step1(&mut enc, &core.doc);
        core.publish_bus(enc.into_vec());

        let mut enc = Encoder::new();
        enc.write_var_uint(protocol::MSG_SYNC);
        protocol::write_sync_step2(&mut enc, &core.doc, &StateVector::default());
        core.publish_bus(enc.into_vec());

        let mut enc = Encoder::new();
        enc.write_var_uint(protocol::MSG_QUERY_AWARENESS);
        core.publish_bus(enc.into_vec());

        let frame = {
            let awareness = core.awareness.lock().unwrap();
            awareness
                .encode_update(&[awareness.client_id()])
                .map(awareness_frame)
        };
        if let Some(frame) = frame {
            core.publish_bus(frame);
        }
    }

    fn disconnect_bus(&mut self) {
        let core = self.core.clone();
        // Leave marker first, to both channels, so peers see the
        // disconnect immediately rather than after the timeout sweep.
        let marker = {
            let awareness = core.awareness.lock().unwrap();
            awareness.encode_update_with_states(&[awareness.client_id()], &HashMap::new())
        };
        match marker {
            Some(blob) => core.broadcast_both(awareness_frame(blob)),
            None => log::warn!("could not encode awareness disconnect marker, unsubscribing anyway"),
        }
        if core.bus_connected.swap(false, Ordering::SeqCst) {
            if let Some(task) = self.bus_task.take() {
                task.abort();
            }
            core.bus.remove_if_idle(&core.bus_channel);
        }
    }

    fn close_socket(&self) {
        // Dropping the writer handle drains queued frames, then ends the
        // session loop, which closes the socket.
        *self.core.outgoing.lock().unwrap() = None;
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Wrap an awareness update blob into a complete frame.
fn awareness_frame(blob: Vec<u8>) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_var_uint(protocol::MSG_AWARENESS);
    enc.write_var_bytes(&blob);
    enc.into_vec()
}

fn sync_step1_frame(doc: &Doc) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_var_uint(protocol::MSG_SYNC);
    protocol::write_sync_step1(&mut enc, doc);
    enc.into_vec()
}

/// `<server_url>/<room>?<params>`, trailing slashes stripped.
fn build_url(server_url: &str, room: &str, params: &[(String, String)]) -> String {
    let server_url = server_url.trim_end_matches('/');
    if params.is_empty() {
        format!("{server_url}/{room}")
    } else {
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect();
        format!("{server_url}/{room}?{}", query.join("&"))
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Reconnect loop: one iteration per connection attempt.
async fn connection_loop(
    core: Arc<Core>,
    factory: Arc<dyn SocketFactory>,
    max_backoff: Duration,
    resync_interval: Option<Duration>,
) {
    while core.should_connect.load(Ordering::SeqCst) {
        core.set_status(ConnectionStatus::Connecting);
        core.set_synced(false);
        match factory.connect(&core.url).await {
            Ok(socket) => run_session(&core, socket, resync_interval).await,
            Err(e) => {
                log::debug!("connection attempt failed: {e}");
                core.emit(ProviderEvent::ConnectionError(e.to_string()));
                core.unsuccessful_reconnects.fetch_add(1, Ordering::SeqCst);
            }
        }
        if !core.should_connect.load(Ordering::SeqCst) {
            break;
        }
        let attempts = core.unsuccessful_reconnects.load(Ordering::SeqCst);
        tokio::time::sleep(reconnect_delay(attempts, max_backoff)).await;
    }
    core.set_status(ConnectionStatus::Disconnected);
}

/// Drive one open socket until it closes.
async fn run_session(core: &Arc<Core>, socket: Socket, resync_interval: Option<Duration>) {
    let Socket {
        mut sink,
        mut stream,
    } = socket;

    core.unsuccessful_reconnects.store(0, Ordering::SeqCst);
    *core.last_message_received.lock().unwrap() = Instant::now();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    *core.outgoing.lock().unwrap() = Some(out_tx);
    core.set_status(ConnectionStatus::Connected);

    // Handshake: announce our state, then advertise the local presence
    // entry (an empty object still counts).
    let mut failed = sink.send(sync_step1_frame(&core.doc)).await.is_err();
    if !failed {
        let frame = {
            let awareness = core.awareness.lock().unwrap();
            if awareness.local_state().is_some() {
                awareness
                    .encode_update(&[awareness.client_id()])
                    .map(awareness_frame)
            } else {
                None
            }
        };
        if let Some(frame) = frame {
            failed = sink.send(frame).await.is_err();
        }
    }

    let period = MESSAGE_RECONNECT_TIMEOUT / 10;
    let mut watchdog =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut resync = resync_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    while !failed {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                // writer handle dropped: explicit disconnect
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(data)) => {
                    *core.last_message_received.lock().unwrap() = Instant::now();
                    match core.handle_frame(&data, true) {
                        Ok(Some(reply)) => {
                            if sink.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("protocol error on socket, closing: {e}");
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    core.emit(ProviderEvent::ConnectionError(e.to_string()));
                    break;
                }
                None => break,
            },
            _ = watchdog.tick() => {
                let last = *core.last_message_received.lock().unwrap();
                if last.elapsed() > MESSAGE_RECONNECT_TIMEOUT {
                    log::warn!(
                        "no message received for {}s, closing socket",
                        last.elapsed().as_secs()
                    );
                    break;
                }
            },
            _ = async {
                match resync.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending().await,
                }
            } => {
                // repair silent divergence: replay the handshake on the
                // transport only, never on the bus
                if sink.send(sync_step1_frame(&core.doc)).await.is_err() {
                    break;
                }
            },
        }
    }

    *core.outgoing.lock().unwrap() = None;
    let _ = sink.close().await;
    core.emit(ProviderEvent::ConnectionClose(None));
    core.set_synced(false);
    // Peers were only observable through this socket; drop them now
    // rather than waiting out the awareness timeout.
    {
        let mut awareness = core.awareness.lock().unwrap();
        let others: Vec<_> = awareness
            .states()
            .keys()
            .copied()
            .filter(|&c| c != awareness.client_id())
            .collect();
        awareness.remove_states(&others, AwarenessOrigin::Connection);
    }
    core.set_status(ConnectionStatus::Disconnected);
}

/// Forward local document and awareness changes to both channels.
async fn fanout_loop(
    core: Arc<Core>,
    mut updates: mpsc::UnboundedReceiver<Vec<u8>>,
    mut awareness_events: broadcast::Receiver<AwarenessEvent>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => {
                    let mut enc = Encoder::new();
                    enc.write_var_uint(protocol::MSG_SYNC);
                    protocol::write_update(&mut enc, &update);
                    core.broadcast_both(enc.into_vec());
                }
                None => break,
            },
            event = awareness_events.recv() => match event {
                Ok(AwarenessEvent::Update { change, .. }) => {
                    // re-broadcast the changed clients' current records;
                    // receivers dedupe by clock
                    let frame = {
                        let awareness = core.awareness.lock().unwrap();
                        awareness
                            .encode_update(&change.changed_clients())
                            .map(awareness_frame)
                    };
                    if let Some(frame) = frame {
                        core.broadcast_both(frame);
                    }
                }
                Ok(AwarenessEvent::Change { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("awareness event stream lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Handle frames arriving on the local bus.
async fn bus_loop(core: Arc<Core>, mut rx: broadcast::Receiver<BusFrame>) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if frame.origin == core.bus_origin {
                    continue; // our own publication
                }
                // bus frames must never flip sync state
                match core.handle_frame(&frame.data, false) {
                    Ok(Some(reply)) => {
                        // replies stay on the bus; the transport never
                        // sees bus-originated traffic directly
                        core.publish_bus(reply);
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("dropping malformed bus frame: {e}"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("local bus lagged by {n} frames");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Drive the awareness liveness sweep.
async fn sweeper_loop(core: Arc<Core>, period: Duration) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        core.awareness.lock().unwrap().check_timeouts();
    }
}
