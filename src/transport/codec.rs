//! Wire framing for typed messages.
//!
//! A frame is `u32 length (big-endian) | u8 version | u8 kind | payload`,
//! where `length` counts everything after itself and the payload is the
//! JSON encoding of the message body. Encode-then-decode is identity for
//! every message type.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::core::message::Message;

/// Protocol version carried in every frame.
pub const CODEC_VERSION: u8 = 1;

/// Upper bound on a single frame (a snapshot chunk plus headroom).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

fn encode_body(message: &Message) -> Result<Vec<u8>, TransportError> {
    let payload = match message {
        Message::RequestVote(m) => serde_json::to_vec(m),
        Message::RequestVoteResult(m) => serde_json::to_vec(m),
        Message::AppendEntries(m) => serde_json::to_vec(m),
        Message::AppendEntriesResult(m) => serde_json::to_vec(m),
        Message::InstallSnapshot(m) => serde_json::to_vec(m),
        Message::InstallSnapshotResult(m) => serde_json::to_vec(m),
        Message::TimeoutNow(m) => serde_json::to_vec(m),
        Message::TimeoutNowResult(m) => serde_json::to_vec(m),
    };
    payload.map_err(|e| TransportError::Protocol(format!("encode failed: {}", e)))
}

fn decode_body(kind: u8, payload: &[u8]) -> Result<Message, TransportError> {
    let parse_err = |e: serde_json::Error| TransportError::Protocol(format!("decode failed: {}", e));
    Ok(match kind {
        1 => Message::RequestVote(serde_json::from_slice(payload).map_err(parse_err)?),
        2 => Message::RequestVoteResult(serde_json::from_slice(payload).map_err(parse_err)?),
        3 => Message::AppendEntries(serde_json::from_slice(payload).map_err(parse_err)?),
        4 => Message::AppendEntriesResult(serde_json::from_slice(payload).map_err(parse_err)?),
        5 => Message::InstallSnapshot(serde_json::from_slice(payload).map_err(parse_err)?),
        6 => Message::InstallSnapshotResult(serde_json::from_slice(payload).map_err(parse_err)?),
        7 => Message::TimeoutNow(serde_json::from_slice(payload).map_err(parse_err)?),
        8 => Message::TimeoutNowResult(serde_json::from_slice(payload).map_err(parse_err)?),
        other => {
            return Err(TransportError::Protocol(format!("unknown message kind {}", other)))
        }
    })
}

/// Encode one message into a self-delimiting frame.
pub fn encode(message: &Message) -> Result<BytesMut, TransportError> {
    let payload = encode_body(message)?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + 2 + payload.len());
    frame.put_u32((payload.len() + 2) as u32);
    frame.put_u8(CODEC_VERSION);
    frame.put_u8(message.kind());
    frame.put_slice(&payload);
    Ok(frame)
}

/// Try to decode one frame from the front of `buf`. Returns `Ok(None)`
/// when the buffer does not hold a complete frame yet.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, TransportError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if len < 2 || len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!("invalid frame length {}", len)));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let version = buf[0];
    let kind = buf[1];
    if version != CODEC_VERSION {
        return Err(TransportError::Protocol(format!("unsupported codec version {}", version)));
    }
    let message = decode_body(kind, &buf[2..len])?;
    buf.advance(len);
    Ok(Some(message))
}

/// Write one framed message to an async stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), TransportError> {
    let frame = encode(message)?;
    writer.write_all(&frame).await.map_err(|_| TransportError::ConnectionFailed)?;
    writer.flush().await.map_err(|_| TransportError::ConnectionFailed)
}

/// Read one framed message from an async stream. `Ok(None)` on a clean
/// end-of-stream at a frame boundary.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, TransportError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(TransportError::ConnectionFailed),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len < 2 || len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!("invalid frame length {}", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|_| TransportError::ConnectionFailed)?;
    if body[0] != CODEC_VERSION {
        return Err(TransportError::Protocol(format!("unsupported codec version {}", body[0])));
    }
    decode_body(body[1], &body[2..]).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::Entry;
    use crate::core::membership::Membership;
    use crate::core::message::*;
    use bytes::Bytes;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::RequestVote(RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 9,
                last_log_term: 2,
                pre_vote: true,
            }),
            Message::RequestVoteResult(RequestVoteResult {
                term: 3,
                vote_granted: true,
                pre_vote: false,
            }),
            Message::AppendEntries(AppendEntriesArgs {
                term: 4,
                leader_id: 1,
                prev_log_index: 8,
                prev_log_term: 3,
                entries: vec![
                    Entry::command(4, 9, Bytes::from_static(b"SET x 1")),
                    Entry::barrier(4, 10),
                ],
                leader_commit: 7,
            }),
            Message::AppendEntriesResult(AppendEntriesResult {
                term: 4,
                success: false,
                match_index: 0,
                conflict_index: 5,
                conflict_term: 2,
            }),
            Message::InstallSnapshot(InstallSnapshotArgs {
                term: 5,
                leader_id: 1,
                last_included_index: 100,
                last_included_term: 4,
                membership: Membership::bootstrap(1, "node-1".into()),
                membership_index: 1,
                offset: 4096,
                data: Bytes::from_static(b"\x00\x01chunk"),
                done: true,
            }),
            Message::InstallSnapshotResult(InstallSnapshotResult::Failed {
                term: 5,
                reason: "stale term".into(),
            }),
            Message::TimeoutNow(TimeoutNowArgs { term: 6, leader_id: 3 }),
            Message::TimeoutNowResult(TimeoutNowResult { term: 6 }),
        ]
    }

    #[test]
    fn encode_then_decode_is_identity_for_every_kind() {
        for message in sample_messages() {
            let mut buf = encode(&message).unwrap();
            let decoded = decode(&mut buf).unwrap().expect("complete frame");
            assert!(buf.is_empty());
            // Compare via re-encoding; Message has no PartialEq.
            assert_eq!(encode(&message).unwrap(), encode(&decoded).unwrap());
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let message = &sample_messages()[0];
        let frame = encode(message).unwrap();
        let mut partial = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn several_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        for message in sample_messages() {
            buf.extend_from_slice(&encode(&message).unwrap());
        }
        let mut kinds = Vec::new();
        while let Some(message) = decode(&mut buf).unwrap() {
            kinds.push(message.kind());
        }
        assert_eq!(kinds, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn bad_version_is_a_protocol_error() {
        let mut frame = encode(&sample_messages()[0]).unwrap();
        frame[4] = 99;
        assert!(matches!(decode(&mut frame), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let mut frame = encode(&sample_messages()[0]).unwrap();
        frame[5] = 42;
        assert!(matches!(decode(&mut frame), Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        for message in sample_messages() {
            write_message(&mut client, &message).await.unwrap();
        }
        drop(client);
        let mut kinds = Vec::new();
        while let Some(message) = read_message(&mut server).await.unwrap() {
            kinds.push(message.kind());
        }
        assert_eq!(kinds, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
