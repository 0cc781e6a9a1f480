//! Peer-to-peer RPC envelope for the consensus engine.
//!
//! Wire format (bincode standard config, serde mode):
//! ```text
//! ┌────────────────┬──────────────────────────────┐
//! │ length (u32 BE)│ bincode(Request | Response)  │
//! │ 4 bytes        │ variable                     │
//! └────────────────┴──────────────────────────────┘
//! ```
//!
//! One request frame is answered by exactly one response frame. A connection
//! may carry any number of request/response pairs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{Ballot, PeerId, ProposalId, Proposition, Seq};

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Consensus RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request<V> {
    /// Phase 1. Carries the sender's done watermark.
    Prepare {
        ballot: Ballot,
        seq: Seq,
        from: PeerId,
        done: Option<Seq>,
    },
    /// Phase 2.
    Accept {
        ballot: Ballot,
        seq: Seq,
        proposition: Proposition<V>,
    },
    /// Decision broadcast.
    Learn { seq: Seq, proposition: Proposition<V> },
    /// Ask a peer for its `Min()`.
    MinQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrepareReply<V> {
    /// Promise granted. `accepted` is the highest accepted proposition, if any.
    Promise {
        accepted: Option<(Ballot, Proposition<V>)>,
    },
    /// Already promised a ballot at least this high.
    Reject { promised: Ballot },
    /// Slot is below the acceptor's `Min()`.
    Forgotten,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcceptReply {
    Accepted { ballot: Ballot, id: ProposalId },
    Reject { promised: Ballot },
    Forgotten,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response<V> {
    Prepare(PrepareReply<V>),
    Accept(AcceptReply),
    Learned,
    Min(Seq),
}

/// Wire errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
}

/// Serialize a message body with bincode.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserialize a message body with bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on a clean EOF at a frame
/// boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_request_roundtrip() {
        let req: Request<String> = Request::Prepare {
            ballot: Ballot(7),
            seq: 42,
            from: 1,
            done: Some(40),
        };
        let bytes = encode(&req).unwrap();
        match decode::<Request<String>>(&bytes).unwrap() {
            Request::Prepare { ballot, seq, from, done } => {
                assert_eq!(ballot, Ballot(7));
                assert_eq!(seq, 42);
                assert_eq!(from, 1);
                assert_eq!(done, Some(40));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_promise_carries_accepted_value() {
        let prop = Proposition::new("hello".to_string());
        let resp: Response<String> = Response::Prepare(PrepareReply::Promise {
            accepted: Some((Ballot(3), prop.clone())),
        });
        let bytes = encode(&resp).unwrap();
        match decode::<Response<String>>(&bytes).unwrap() {
            Response::Prepare(PrepareReply::Promise { accepted: Some((b, p)) }) => {
                assert_eq!(b, Ballot(3));
                assert_eq!(p, prop);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode::<Request<String>>(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Response::<u32>::Min(9)).await.unwrap();
        write_frame(&mut a, &Response::<u32>::Learned).await.unwrap();
        drop(a);

        let first: Option<Response<u32>> = read_frame(&mut b).await.unwrap();
        assert!(matches!(first, Some(Response::Min(9))));
        let second: Option<Response<u32>> = read_frame(&mut b).await.unwrap();
        assert!(matches!(second, Some(Response::Learned)));
        let eof: Option<Response<u32>> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        let result: Result<Option<Response<u32>>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(_))));
    }
}
