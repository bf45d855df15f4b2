//! Binary wire codec for the relay protocol.
//!
//! Frames follow the y-protocols layout spoken by Yjs providers, encoded
//! with Yrs' lib0 primitives:
//! ```text
//! ┌──────────────────┬───────────────────────────────────────────────┐
//! │ varuint kind     │ body                                          │
//! ├──────────────────┼───────────────────────────────────────────────┤
//! │ 0 = Sync         │ varuint sub-type │ varbytes payload           │
//! │                  │   0 = SyncStep1  │   encoded state vector     │
//! │                  │   1 = SyncStep2  │   v1 update (missing part) │
//! │                  │   2 = Update     │   v1 update (incremental)  │
//! ├──────────────────┼───────────────────────────────────────────────┤
//! │ 1 = Awareness    │ varbytes awareness update                     │
//! └──────────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! An awareness update is `varuint count` followed by `count` entries of
//! `varuint client_id │ varuint clock │ varstring json`.
//!
//! The relay only routes Sync and Awareness. Auth, awareness queries and
//! custom tags are rejected as unknown kinds, and [`Message::decode`]
//! rejects frames with trailing bytes.

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::sync::protocol::{MSG_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2, MSG_SYNC_UPDATE};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encode, Encoder, EncoderV1};
use yrs::StateVector;

pub use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};
pub use yrs::sync::SyncMessage;

/// Top-level message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Document synchronization (step1 / step2 / update)
    Sync = MSG_SYNC,
    /// Presence state for the awareness table
    Awareness = MSG_AWARENESS,
}

/// A decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sync(_) => MessageKind::Sync,
            Self::Awareness(_) => MessageKind::Awareness,
        }
    }

    /// Serialize to a binary frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = EncoderV1::new();
        encoder.write_var(self.kind() as u8);
        match self {
            Self::Sync(sync) => sync.encode(&mut encoder),
            Self::Awareness(update) => encoder.write_buf(update.encode_v1()),
        }
        encoder.to_vec()
    }

    /// Decode one message from the front of `frame`, returning the unread rest.
    pub fn decode_partial(frame: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut cursor = Cursor::new(frame);
        let message = match cursor.read_var::<u32>()? {
            kind if kind == u32::from(MSG_SYNC) => Self::Sync(read_sync(&mut cursor)?),
            kind if kind == u32::from(MSG_AWARENESS) => {
                Self::Awareness(decode_awareness_update(cursor.read_buf()?)?)
            }
            other => return Err(DecodeError::UnknownMessageKind(other)),
        };
        Ok((message, &frame[cursor.next..]))
    }

    /// Decode a frame that must contain exactly one message.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let (msg, rest) = Self::decode_partial(frame)?;
        if !rest.is_empty() {
            return Err(DecodeError::TrailingBytes(rest.len()));
        }
        Ok(msg)
    }
}

impl From<Message> for yrs::sync::Message {
    fn from(message: Message) -> Self {
        match message {
            Message::Sync(sync) => Self::Sync(sync),
            Message::Awareness(update) => Self::Awareness(update),
        }
    }
}

impl TryFrom<yrs::sync::Message> for Message {
    type Error = DecodeError;

    fn try_from(message: yrs::sync::Message) -> Result<Self, Self::Error> {
        use yrs::sync::protocol::{MSG_AUTH, MSG_QUERY_AWARENESS};
        match message {
            yrs::sync::Message::Sync(sync) => Ok(Self::Sync(sync)),
            yrs::sync::Message::Awareness(update) => Ok(Self::Awareness(update)),
            yrs::sync::Message::Auth(_) => Err(DecodeError::UnknownMessageKind(MSG_AUTH.into())),
            yrs::sync::Message::AwarenessQuery => {
                Err(DecodeError::UnknownMessageKind(MSG_QUERY_AWARENESS.into()))
            }
            yrs::sync::Message::Custom(tag, _) => Err(DecodeError::UnknownMessageKind(tag.into())),
        }
    }
}

fn read_sync(cursor: &mut Cursor<'_>) -> Result<SyncMessage, DecodeError> {
    let sub_type = cursor.read_var::<u32>()?;
    let payload = cursor.read_buf()?;
    match sub_type {
        t if t == u32::from(MSG_SYNC_STEP_1) => Ok(SyncMessage::SyncStep1(
            StateVector::decode_v1(payload).map_err(DecodeError::from)?,
        )),
        t if t == u32::from(MSG_SYNC_STEP_2) => Ok(SyncMessage::SyncStep2(payload.to_vec())),
        t if t == u32::from(MSG_SYNC_UPDATE) => Ok(SyncMessage::Update(payload.to_vec())),
        other => Err(DecodeError::UnknownSyncType(other)),
    }
}

/// Decode an awareness update, validating every field.
///
/// The whole blob is read before anything is returned, so a malformed
/// update is rejected as a unit. Clocks above `u32::MAX` and states that
/// are not UTF-8 are errors rather than being wrapped or passed through.
pub fn decode_awareness_update(blob: &[u8]) -> Result<AwarenessUpdate, DecodeError> {
    let mut cursor = Cursor::new(blob);
    let count = cursor.read_var::<u32>()?;
    let mut update = AwarenessUpdate { clients: Default::default() };
    for _ in 0..count {
        let client_id = cursor.read_var::<u64>()?;
        let raw_clock = cursor.read_var::<u64>()?;
        let clock = u32::try_from(raw_clock).map_err(|_| DecodeError::ClockOutOfRange(raw_clock))?;
        let json = std::str::from_utf8(cursor.read_buf()?).map_err(|_| DecodeError::InvalidUtf8)?;
        update.clients.insert(client_id, AwarenessUpdateEntry { clock, json: json.into() });
    }
    if cursor.has_content() {
        return Err(DecodeError::TrailingBytes(blob.len() - cursor.next));
    }
    Ok(update)
}

/// Short label of a sync sub-message, for logging.
pub fn sync_label(sync: &SyncMessage) -> &'static str {
    match sync {
        SyncMessage::SyncStep1(_) => "SyncStep1",
        SyncMessage::SyncStep2(_) => "SyncStep2",
        SyncMessage::Update(_) => "Update",
    }
}

/// Frame decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("malformed varint")]
    InvalidVarint,
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u32),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u32),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("awareness clock {0} exceeds u32")]
    ClockOutOfRange(u64),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

impl From<read::Error> for DecodeError {
    fn from(e: read::Error) -> Self {
        match e {
            read::Error::EndOfBuffer(_) => Self::UnexpectedEof,
            read::Error::InvalidVarInt => Self::InvalidVarint,
            other => Self::InvalidPayload(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn awareness(entries: &[(u64, u32, &str)]) -> AwarenessUpdate {
        AwarenessUpdate {
            clients: entries
                .iter()
                .map(|&(id, clock, json)| (id, AwarenessUpdateEntry { clock, json: Arc::from(json) }))
                .collect(),
        }
    }

    #[test]
    fn test_sync_step1_wire_layout() {
        let msg = Message::Sync(SyncMessage::SyncStep1(StateVector::default()));
        // kind 0, sub-type 0, length 1, empty state vector
        assert_eq!(msg.encode(), vec![0, 0, 1, 0]);
    }

    #[test]
    fn test_update_wire_layout() {
        let msg = Message::Sync(SyncMessage::Update(vec![9, 8, 7]));
        assert_eq!(msg.encode(), vec![0, 2, 3, 9, 8, 7]);
        assert_eq!(Message::decode(&[0, 2, 3, 9, 8, 7]).unwrap(), msg);
    }

    #[test]
    fn test_awareness_wire_layout() {
        let msg = Message::Awareness(awareness(&[(5, 1, "{}")]));
        // kind 1, blob length 6: count 1, id 5, clock 1, "{}"
        assert_eq!(msg.encode(), vec![1, 6, 1, 5, 1, 2, b'{', b'}']);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_matches_yrs_sync_message_encoding() {
        let update = awareness(&[(7, 3, r#"{"name":"Alice"}"#)]);
        let ours = Message::Awareness(update.clone()).encode();
        assert_eq!(ours, yrs::sync::Message::Awareness(update).encode_v1());

        let step2 = SyncMessage::SyncStep2(vec![0, 0]);
        assert_eq!(
            Message::Sync(step2.clone()).encode(),
            yrs::sync::Message::Sync(step2).encode_v1()
        );
    }

    #[test]
    fn test_decode_step2() {
        let decoded = Message::decode(&[0, 1, 2, 0, 0]).unwrap();
        assert_eq!(decoded, Message::Sync(SyncMessage::SyncStep2(vec![0, 0])));
    }

    #[test]
    fn test_decode_truncated_payload() {
        // declares 5 payload bytes, carries 2
        assert_eq!(Message::decode(&[0, 2, 5, 1, 2]), Err(DecodeError::UnexpectedEof));
        assert_eq!(Message::decode(&[]), Err(DecodeError::UnexpectedEof));
        assert_eq!(Message::decode(&[0x80]), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_decode_overlong_varint() {
        assert_eq!(Message::decode(&[0xFF; 12]), Err(DecodeError::InvalidVarint));
    }

    #[test]
    fn test_decode_unknown_kinds() {
        // auth, awareness query and custom tags are not relayed
        assert_eq!(Message::decode(&[2, 1]), Err(DecodeError::UnknownMessageKind(2)));
        assert_eq!(Message::decode(&[3]), Err(DecodeError::UnknownMessageKind(3)));
        assert_eq!(Message::decode(&[7, 0]), Err(DecodeError::UnknownMessageKind(7)));
    }

    #[test]
    fn test_decode_unknown_sync_type() {
        assert_eq!(Message::decode(&[0, 7, 0]), Err(DecodeError::UnknownSyncType(7)));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        assert_eq!(Message::decode(&[0, 2, 0, 42, 42]), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn test_decode_partial_returns_rest() {
        let first = Message::Awareness(awareness(&[(1, 1, "{}")]));
        let second = Message::Sync(SyncMessage::Update(vec![6]));
        let mut frame = first.encode();
        frame.extend(second.encode());

        let (decoded, rest) = Message::decode_partial(&frame).unwrap();
        assert_eq!(decoded, first);
        let (decoded, rest) = Message::decode_partial(rest).unwrap();
        assert_eq!(decoded, second);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_awareness_invalid_utf8_rejected() {
        // count 1, id 1, clock 1, 2-byte string that is not UTF-8
        assert_eq!(
            decode_awareness_update(&[1, 1, 1, 2, 0xC3, 0x28]),
            Err(DecodeError::InvalidUtf8)
        );
    }

    #[test]
    fn test_awareness_clock_beyond_u32_rejected() {
        let mut blob = vec![1, 1];
        // varint 2^32
        blob.extend([0x80, 0x80, 0x80, 0x80, 0x10]);
        blob.extend([2, b'{', b'}']);
        assert_eq!(decode_awareness_update(&blob), Err(DecodeError::ClockOutOfRange(1 << 32)));
    }

    #[test]
    fn test_awareness_truncated_and_trailing() {
        assert_eq!(decode_awareness_update(&[1, 1]), Err(DecodeError::UnexpectedEof));
        assert_eq!(decode_awareness_update(&[0, 9]), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_try_from_yrs_message() {
        let sync = yrs::sync::Message::Sync(SyncMessage::Update(vec![1]));
        assert_eq!(Message::try_from(sync).unwrap(), Message::Sync(SyncMessage::Update(vec![1])));
        assert_eq!(
            Message::try_from(yrs::sync::Message::Auth(None)),
            Err(DecodeError::UnknownMessageKind(2))
        );
        assert_eq!(
            Message::try_from(yrs::sync::Message::AwarenessQuery),
            Err(DecodeError::UnknownMessageKind(3))
        );
        assert_eq!(
            Message::try_from(yrs::sync::Message::Custom(9, vec![])),
            Err(DecodeError::UnknownMessageKind(9))
        );
    }

    #[test]
    fn test_large_update_payload() {
        let payload = vec![42u8; 65_536];
        let msg = Message::Sync(SyncMessage::Update(payload.clone()));
        let encoded = msg.encode();
        // kind + sub-type + 3-byte length prefix
        assert_eq!(encoded.len(), payload.len() + 5);
        match Message::decode(&encoded).unwrap() {
            Message::Sync(SyncMessage::Update(p)) => assert_eq!(p, payload),
            other => panic!("unexpected {other:?}"),
        }
    }
}
