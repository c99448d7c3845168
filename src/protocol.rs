//! Message framing for document synchronization.
//!
//! Wire format (bit-compatible with the Yjs y-protocols framing):
//! ```text
//! ┌─────────────┬──────────────────────────────────────────────┐
//! │ varuint tag │ payload                                      │
//! ├─────────────┼──────────────────────────────────────────────┤
//! │ 0 sync      │ varuint sub-tag, then sub-payload            │
//! │ 1 awareness │ varbytes awareness update blob               │
//! │ 2 auth      │ varuint sub-tag, then sub-payload            │
//! │ 3 query     │ (empty) — request for full awareness state   │
//! └─────────────┴──────────────────────────────────────────────┘
//!
//! sync sub-messages:
//!   0 step1  │ varbytes state vector of the sender
//!   1 step2  │ varbytes update computed against that state vector
//!   2 update │ varbytes incremental update
//! ```
//!
//! The handshake is the classic two-step differential sync: a peer announces
//! what it has seen (step1), the other side answers with everything missing
//! (step2). Continuous edits then flow as `update` messages.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::codec::{CodecError, Decoder, Encoder};

/// Top-level message tags.
pub const MSG_SYNC: u64 = 0;
pub const MSG_AWARENESS: u64 = 1;
pub const MSG_AUTH: u64 = 2;
pub const MSG_QUERY_AWARENESS: u64 = 3;

/// Sync sub-message tags.
pub const SYNC_STEP_1: u64 = 0;
pub const SYNC_STEP_2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Auth sub-message tags.
pub const AUTH_PERMISSION_DENIED: u64 = 0;

/// Protocol errors. These indicate a desynchronized or malicious peer; the
/// transport layer reacts by dropping the frame or closing the socket.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown sync message type {0}")]
    UnknownSyncMessage(u64),
    #[error("malformed state vector: {0}")]
    BadStateVector(String),
    #[error("malformed awareness state: {0}")]
    BadAwarenessState(String),
}

/// Write a `sync`/`step1` sub-message carrying the document's state vector.
///
/// The caller has already written the top-level `MSG_SYNC` tag.
pub fn write_sync_step1(encoder: &mut Encoder, doc: &Doc) {
    let sv = doc.transact().state_vector().encode_v1();
    encoder.write_var_uint(SYNC_STEP_1);
    encoder.write_var_bytes(&sv);
}

/// Write a `sync`/`step2` sub-message: everything the remote is missing
/// relative to `remote_sv`. `StateVector::default()` encodes the full state.
pub fn write_sync_step2(encoder: &mut Encoder, doc: &Doc, remote_sv: &StateVector) {
    let update = doc.transact().encode_state_as_update_v1(remote_sv);
    encoder.write_var_uint(SYNC_STEP_2);
    encoder.write_var_bytes(&update);
}

/// Write a `sync`/`update` sub-message wrapping an incremental update blob.
pub fn write_update(encoder: &mut Encoder, update: &[u8]) {
    encoder.write_var_uint(SYNC_UPDATE);
    encoder.write_var_bytes(update);
}

/// Apply an update blob to the document, tagging the transaction with
/// `origin` so the provider can recognize its own echo.
///
/// A malformed or stale update must not take the session down: decode and
/// apply failures are logged and swallowed.
fn apply_update_blob(doc: &Doc, blob: &[u8], origin: &Origin) {
    match Update::decode_v1(blob) {
        Ok(update) => {
            let mut txn = doc.transact_mut_with(origin.clone());
            if let Err(e) = txn.apply_update(update) {
                log::error!("failed to apply document update: {e}");
            }
        }
        Err(e) => log::error!("failed to decode document update: {e}"),
    }
}

/// Process one `sync` sub-message and return its sub-tag.
///
/// `step1` appends a `step2` reply to `encoder` (the caller has already
/// written the reply's `MSG_SYNC` tag). `step2` and `update` apply the
/// contained blob to `doc`. Only the caller may treat a `step2` as
/// completing the handshake; the `update` path never flips sync state.
pub fn read_sync_message(
    decoder: &mut Decoder<'_>,
    encoder: &mut Encoder,
    doc: &Doc,
    origin: &Origin,
) -> Result<u64, ProtocolError> {
    let tag = decoder.read_var_uint()?;
    match tag {
        SYNC_STEP_1 => {
            let sv_bytes = decoder.read_var_bytes()?;
            let remote_sv = StateVector::decode_v1(sv_bytes)
                .map_err(|e| ProtocolError::BadStateVector(e.to_string()))?;
            write_sync_step2(encoder, doc, &remote_sv);
        }
        SYNC_STEP_2 | SYNC_UPDATE => {
            let blob = decoder.read_var_bytes()?;
            apply_update_blob(doc, blob, origin);
        }
        other => return Err(ProtocolError::UnknownSyncMessage(other)),
    }
    Ok(tag)
}

/// Write an `auth`/`permission_denied` sub-message.
///
/// The caller has already written the top-level `MSG_AUTH` tag.
pub fn write_permission_denied(encoder: &mut Encoder, reason: &str) {
    encoder.write_var_uint(AUTH_PERMISSION_DENIED);
    encoder.write_var_string(reason);
}

/// Process one `auth` sub-message. Unknown sub-tags are logged and skipped.
pub fn read_auth_message(
    decoder: &mut Decoder<'_>,
    mut on_permission_denied: impl FnMut(&str),
) -> Result<(), ProtocolError> {
    match decoder.read_var_uint()? {
        AUTH_PERMISSION_DENIED => {
            let reason = decoder.read_var_string()?;
            on_permission_denied(reason);
        }
        other => log::warn!("unknown auth message type {other}, ignoring"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn doc_with_text(content: &str) -> Doc {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("test");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        drop(txn);
        doc
    }

    fn text_of(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text("test")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[test]
    fn test_step1_carries_state_vector() {
        let doc = doc_with_text("abc");
        let mut enc = Encoder::new();
        write_sync_step1(&mut enc, &doc);
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_var_uint().unwrap(), SYNC_STEP_1);
        let sv_bytes = dec.read_var_bytes().unwrap();
        let sv = StateVector::decode_v1(sv_bytes).unwrap();
        assert_eq!(sv, doc.transact().state_vector());
    }

    #[test]
    fn test_step1_step2_handshake_converges() {
        let server = doc_with_text("hello from server");
        let client = Doc::new();
        let origin = Origin::from("test");

        // Client announces its (empty) state
        let mut step1 = Encoder::new();
        write_sync_step1(&mut step1, &client);
        let step1 = step1.into_vec();

        // Server reads step1, produces a step2 reply
        let mut dec = Decoder::new(&step1);
        let mut reply = Encoder::new();
        let tag = read_sync_message(&mut dec, &mut reply, &server, &origin).unwrap();
        assert_eq!(tag, SYNC_STEP_1);
        let reply = reply.into_vec();
        assert!(reply.len() > 1);

        // Client applies the step2
        let mut dec = Decoder::new(&reply);
        let mut enc = Encoder::new();
        let tag = read_sync_message(&mut dec, &mut enc, &client, &origin).unwrap();
        assert_eq!(tag, SYNC_STEP_2);
        assert_eq!(enc.len(), 0); // no reply to a step2
        assert_eq!(text_of(&client), "hello from server");
    }

    #[test]
    fn test_update_message_applies() {
        let source = Doc::new();
        let sink = Doc::new();
        let origin = Origin::from("test");

        let text = source.get_or_insert_text("test");
        let update = {
            let mut txn = source.transact_mut();
            text.insert(&mut txn, 0, "edit");
            txn.encode_update_v1()
        };

        let mut enc = Encoder::new();
        write_update(&mut enc, &update);
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        let mut reply = Encoder::new();
        let tag = read_sync_message(&mut dec, &mut reply, &sink, &origin).unwrap();
        assert_eq!(tag, SYNC_UPDATE);
        assert_eq!(text_of(&sink), "edit");
    }

    #[test]
    fn test_malformed_update_is_swallowed() {
        let doc = doc_with_text("keep me");
        let origin = Origin::from("test");

        let mut enc = Encoder::new();
        write_update(&mut enc, &[0xde, 0xad, 0xbe, 0xef]);
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        let mut reply = Encoder::new();
        // Garbage payload: logged, not an error, document untouched
        let tag = read_sync_message(&mut dec, &mut reply, &doc, &origin).unwrap();
        assert_eq!(tag, SYNC_UPDATE);
        assert_eq!(text_of(&doc), "keep me");
    }

    #[test]
    fn test_unknown_sync_sub_tag_errors() {
        let doc = Doc::new();
        let origin = Origin::from("test");
        let mut enc = Encoder::new();
        enc.write_var_uint(7);
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        let mut reply = Encoder::new();
        let err = read_sync_message(&mut dec, &mut reply, &doc, &origin).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSyncMessage(7)));
    }

    #[test]
    fn test_truncated_sync_message_errors() {
        let doc = Doc::new();
        let origin = Origin::from("test");
        // step2 tag declaring a 100-byte payload that is not there
        let buf = vec![SYNC_STEP_2 as u8, 100, 1, 2];
        let mut dec = Decoder::new(&buf);
        let mut reply = Encoder::new();
        let err = read_sync_message(&mut dec, &mut reply, &doc, &origin).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(CodecError::UnexpectedEof)));
    }

    #[test]
    fn test_auth_permission_denied_roundtrip() {
        let mut enc = Encoder::new();
        write_permission_denied(&mut enc, "read-only room");
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        let mut seen = None;
        read_auth_message(&mut dec, |reason| seen = Some(reason.to_string())).unwrap();
        assert_eq!(seen.as_deref(), Some("read-only room"));
    }

    #[test]
    fn test_auth_unknown_sub_tag_ignored() {
        let mut enc = Encoder::new();
        enc.write_var_uint(9);
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        let mut called = false;
        read_auth_message(&mut dec, |_| called = true).unwrap();
        assert!(!called);
    }
}
