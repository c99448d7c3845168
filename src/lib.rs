//! # driftsync — client-side collaboration transport
//!
//! Keeps a replicated [yrs] document in sync with peers through a central
//! WebSocket relay and, at the same time, with other peers in the same
//! process over a local broadcast bus. Wire-compatible with the Yjs
//! y-protocols framing, so it interoperates with y-websocket servers and
//! clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   frames    ┌──────────────┐   WebSocket   ┌────────┐
//! │  Yrs Doc   │◄───────────►│   Provider   │◄─────────────►│ Server │
//! │ + Awareness│             │  (fan-out)   │               │ relay  │
//! └────────────┘             └──────┬───────┘               └────────┘
//!                                   │ LocalBus
//!                            ┌──────┴───────┐
//!                            │ other local  │
//!                            │  providers   │
//!                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — lib0-compatible varint frame primitives
//! - [`protocol`] — sync/awareness/auth message framing
//! - [`awareness`] — ephemeral presence with clocks and liveness eviction
//! - [`transport`] — socket abstraction, WebSocket adapter, backoff
//! - [`broadcast`] — in-process fan-out bus
//! - [`provider`] — lifecycle, routing, events
//!
//! ## Quick start
//!
//! ```no_run
//! use driftsync::{Provider, ProviderOptions};
//! use yrs::Doc;
//!
//! # async fn run() {
//! let doc = Doc::new();
//! let provider = Provider::new(
//!     "wss://demos.yjs.dev",
//!     "my-room",
//!     doc.clone(),
//!     ProviderOptions::default(),
//! );
//! let mut events = provider.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod awareness;
pub mod broadcast;
pub mod codec;
pub mod protocol;
pub mod provider;
pub mod transport;

pub use awareness::{
    modify_awareness_update, Awareness, AwarenessChange, AwarenessEvent, AwarenessOrigin,
    ClientId, ClientMeta, OUTDATED_TIMEOUT,
};
pub use broadcast::{BusFrame, LocalBus};
pub use codec::{CodecError, Decoder, Encoder};
pub use protocol::ProtocolError;
pub use provider::{
    ConnectionStatus, PermissionDeniedHandler, Provider, ProviderEvent, ProviderOptions,
};
pub use transport::{
    reconnect_delay, Socket, SocketFactory, TransportError, WsSocketFactory,
    MESSAGE_RECONNECT_TIMEOUT,
};
