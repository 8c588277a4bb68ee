//! The post-handshake peer wire protocol: `length: u32 BE || body`.
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MSG_CHOKE: u8 = 0;
pub const MSG_UNCHOKE: u8 = 1;
pub const MSG_INTERESTED: u8 = 2;
pub const MSG_NOT_INTERESTED: u8 = 3;
pub const MSG_HAVE: u8 = 4;
pub const MSG_BITFIELD: u8 = 5;
pub const MSG_REQUEST: u8 = 6;
pub const MSG_PIECE: u8 = 7;
pub const MSG_CANCEL: u8 = 8;

/// An upper bound on a single frame's declared length, well above the
/// largest legitimate payload (a PIECE carrying one 2^14-byte block plus
/// its 9-byte header). Guards against a peer claiming a multi-gigabyte
/// frame and forcing an equally large allocation before any bytes arrive.
pub const MAX_FRAME_LEN: u32 = 1 << 17;

/// A framed peer message. `KeepAlive` is the length-0 frame with no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown message id {0}")]
    UnknownId(u8),

    #[error("{name} payload has wrong length: expected {expected}, got {got}")]
    WrongLength {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("frame body is empty but carries a non-zero length with no id")]
    EmptyBody,

    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    OversizedFrame(u32),
}

impl Message {
    fn body(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => Vec::new(),
            Message::Choke => vec![MSG_CHOKE],
            Message::Unchoke => vec![MSG_UNCHOKE],
            Message::Interested => vec![MSG_INTERESTED],
            Message::NotInterested => vec![MSG_NOT_INTERESTED],
            Message::Have { index } => {
                let mut b = vec![MSG_HAVE];
                b.extend_from_slice(&index.to_be_bytes());
                b
            }
            Message::Bitfield { bitfield } => {
                let mut b = vec![MSG_BITFIELD];
                b.extend_from_slice(bitfield);
                b
            }
            Message::Request { index, begin, length } => {
                let mut b = vec![MSG_REQUEST];
                b.extend_from_slice(&index.to_be_bytes());
                b.extend_from_slice(&begin.to_be_bytes());
                b.extend_from_slice(&length.to_be_bytes());
                b
            }
            Message::Piece { index, begin, block } => {
                let mut b = vec![MSG_PIECE];
                b.extend_from_slice(&index.to_be_bytes());
                b.extend_from_slice(&begin.to_be_bytes());
                b.extend_from_slice(block);
                b
            }
            Message::Cancel { index, begin, length } => {
                let mut b = vec![MSG_CANCEL];
                b.extend_from_slice(&index.to_be_bytes());
                b.extend_from_slice(&begin.to_be_bytes());
                b.extend_from_slice(&length.to_be_bytes());
                b
            }
        }
    }

    /// Writes `length: u32 BE || body` to `writer`.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let body = self.body();
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        writer.flush().await
    }

    /// Reads one framed message from `reader`, blocking until a full
    /// frame is available.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, MessageError> {
        let len = reader.read_u32().await?;
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(MessageError::OversizedFrame(len));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Self::from_body(&body)
    }

    fn from_body(body: &[u8]) -> Result<Message, MessageError> {
        if body.is_empty() {
            return Err(MessageError::EmptyBody);
        }
        let id = body[0];
        let payload = &body[1..];
        match id {
            MSG_CHOKE => expect_empty("CHOKE", payload).map(|_| Message::Choke),
            MSG_UNCHOKE => expect_empty("UNCHOKE", payload).map(|_| Message::Unchoke),
            MSG_INTERESTED => expect_empty("INTERESTED", payload).map(|_| Message::Interested),
            MSG_NOT_INTERESTED => expect_empty("NOT_INTERESTED", payload).map(|_| Message::NotInterested),
            MSG_HAVE => {
                let index = read_u32_field("HAVE", payload, 0)?;
                expect_len("HAVE", payload, 4)?;
                Ok(Message::Have { index })
            }
            MSG_BITFIELD => Ok(Message::Bitfield {
                bitfield: payload.to_vec(),
            }),
            MSG_REQUEST => {
                expect_len("REQUEST", payload, 12)?;
                Ok(Message::Request {
                    index: read_u32_field("REQUEST", payload, 0)?,
                    begin: read_u32_field("REQUEST", payload, 4)?,
                    length: read_u32_field("REQUEST", payload, 8)?,
                })
            }
            MSG_PIECE => {
                if payload.len() < 8 {
                    return Err(MessageError::WrongLength {
                        name: "PIECE",
                        expected: 8,
                        got: payload.len(),
                    });
                }
                Ok(Message::Piece {
                    index: read_u32_field("PIECE", payload, 0)?,
                    begin: read_u32_field("PIECE", payload, 4)?,
                    block: payload[8..].to_vec(),
                })
            }
            MSG_CANCEL => {
                expect_len("CANCEL", payload, 12)?;
                Ok(Message::Cancel {
                    index: read_u32_field("CANCEL", payload, 0)?,
                    begin: read_u32_field("CANCEL", payload, 4)?,
                    length: read_u32_field("CANCEL", payload, 8)?,
                })
            }
            other => Err(MessageError::UnknownId(other)),
        }
    }
}

fn expect_len(name: &'static str, payload: &[u8], expected: usize) -> Result<(), MessageError> {
    if payload.len() != expected {
        return Err(MessageError::WrongLength {
            name,
            expected,
            got: payload.len(),
        });
    }
    Ok(())
}

fn expect_empty(name: &'static str, payload: &[u8]) -> Result<(), MessageError> {
    expect_len(name, payload, 0)
}

fn read_u32_field(name: &'static str, payload: &[u8], offset: usize) -> Result<u32, MessageError> {
    payload
        .get(offset..offset + 4)
        .map(|s| u32::from_be_bytes(s.try_into().unwrap()))
        .ok_or(MessageError::WrongLength {
            name,
            expected: offset + 4,
            got: payload.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_encodes_to_the_canonical_byte_sequence() {
        let msg = Message::Request {
            index: 3,
            begin: 0x4000,
            length: 0x4000,
        };
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            vec![
                0x00, 0x00, 0x00, 0x0D, 0x06, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x40, 0x00,
            ]
        );
    }

    #[tokio::test]
    async fn keep_alive_round_trips() {
        let msg = Message::KeepAlive;
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
        let mut cursor = &buf[..];
        let parsed = Message::read(&mut cursor).await.unwrap();
        assert_eq!(parsed, Message::KeepAlive);
    }

    #[tokio::test]
    async fn have_with_wrong_payload_length_is_rejected() {
        // length=3, id=HAVE, only 2 payload bytes instead of 4.
        let bytes = [0u8, 0, 0, 3, MSG_HAVE, 0, 0];
        let mut cursor = &bytes[..];
        let err = Message::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MessageError::WrongLength { .. }));
    }

    #[tokio::test]
    async fn oversized_frame_length_is_rejected_before_allocating() {
        let bytes = (MAX_FRAME_LEN + 1).to_be_bytes();
        let mut cursor = &bytes[..];
        let err = Message::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MessageError::OversizedFrame(len) if len == MAX_FRAME_LEN + 1));
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let bytes = [0u8, 0, 0, 1, 200];
        let mut cursor = &bytes[..];
        let err = Message::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MessageError::UnknownId(200)));
    }

    #[tokio::test]
    async fn bitfield_round_trips() {
        let msg = Message::Bitfield {
            bitfield: vec![0xFF, 0xC0],
        };
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        let mut cursor = &buf[..];
        let parsed = Message::read(&mut cursor).await.unwrap();
        assert_eq!(parsed, msg);
    }
}
