//! Transport plumbing: socket abstraction, WebSocket adapter, backoff.
//!
//! The provider only ever sees a [`Socket`]: a boxed sink/stream pair of
//! binary frames. The default [`WsSocketFactory`] adapts a
//! `tokio-tungstenite` connection into that shape; tests and embedders can
//! inject anything else through [`SocketFactory`].

use std::pin::Pin;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// A connection with no inbound traffic for this long is considered dead
/// and closed, forcing a reconnect.
pub const MESSAGE_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-level failures. These are surfaced as provider events and
/// handled by the reconnect loop; they never propagate to callers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
}

pub type SocketSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// An open bidirectional byte-frame connection.
pub struct Socket {
    pub sink: SocketSink,
    pub stream: SocketStream,
}

/// Builds sockets for the provider's connection loop. Implement this to
/// substitute the transport (tests, tunnels, in-memory pipes).
pub trait SocketFactory: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>>;
}

/// Default factory: a `tokio-tungstenite` WebSocket speaking binary frames.
/// Text frames are ignored; ping/pong is handled by the library; a close
/// frame ends the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsSocketFactory;

impl SocketFactory for WsSocketFactory {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (sink, stream) = ws.split();

            let sink: SocketSink = Box::pin(
                sink.sink_map_err(|e| TransportError::Socket(e.to_string()))
                    .with(|frame: Vec<u8>| {
                        future::ready(Ok::<_, TransportError>(Message::Binary(frame.into())))
                    }),
            );
            let stream: SocketStream = Box::pin(stream.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => {
                        let data: Vec<u8> = data.into();
                        Some(Ok(data))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
                })
            }));
            Ok(Socket { sink, stream })
        })
    }
}

/// Delay before the next reconnect attempt after `unsuccessful_reconnects`
/// attempts that never reached the connected state: `min(100ms · 2ⁿ, max)`.
pub fn reconnect_delay(unsuccessful_reconnects: u32, max_backoff: Duration) -> Duration {
    let factor = 1u64
        .checked_shl(unsuccessful_reconnects)
        .unwrap_or(u64::MAX);
    Duration::from_millis(factor.saturating_mul(100)).min(max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        // ten consecutive unsuccessful attempts with the default cap
        let max = Duration::from_millis(2500);
        let delays: Vec<u64> = (1..=10)
            .map(|n| reconnect_delay(n, max).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![200, 400, 800, 1600, 2500, 2500, 2500, 2500, 2500, 2500]
        );
    }

    #[test]
    fn test_backoff_first_attempt() {
        assert_eq!(
            reconnect_delay(0, Duration::from_millis(2500)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_backoff_huge_attempt_count_saturates() {
        let max = Duration::from_millis(2500);
        assert_eq!(reconnect_delay(63, max), max);
        assert_eq!(reconnect_delay(64, max), max);
        assert_eq!(reconnect_delay(u32::MAX, max), max);
    }

    #[test]
    fn test_backoff_respects_custom_cap() {
        let max = Duration::from_millis(500);
        assert_eq!(reconnect_delay(2, max), Duration::from_millis(400));
        assert_eq!(reconnect_delay(3, max), max);
    }
}
