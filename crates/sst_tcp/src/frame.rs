//! Data-plane frames for the TCP stand-in transport.
//!
//! Every frame is a fixed 17-byte header (opcode, op id, offset, length)
//! optionally followed by a payload. Offsets are relative to the start of
//! one internal row, exactly as posted by the table.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const OP_WRITE: u8 = 1;
const OP_WRITE_ACK: u8 = 2;
const OP_READ_REQ: u8 = 3;
const OP_READ_RESP: u8 = 4;

pub const HEADER_LEN: usize = 17;

/// Upper bound on a single frame payload; a row is far smaller than this.
pub const MAX_PAYLOAD: usize = 1 << 24;

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// One-sided write into the receiver's mirror of the sender's row.
    Write { op: u64, offset: u32, payload: Bytes },
    /// Completion for a previously received `Write`.
    WriteAck { op: u64 },
    /// One-sided read of the receiver's local row.
    ReadReq { op: u64, offset: u32, len: u32 },
    /// Payload answering a `ReadReq`; doubles as its completion.
    ReadResp { op: u64, offset: u32, payload: Bytes },
}

impl Frame {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        match self {
            Frame::Write { op, offset, payload } => {
                buf.put_u8(OP_WRITE);
                buf.put_u64_le(*op);
                buf.put_u32_le(*offset);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            Frame::WriteAck { op } => {
                buf.put_u8(OP_WRITE_ACK);
                buf.put_u64_le(*op);
                buf.put_u32_le(0);
                buf.put_u32_le(0);
            }
            Frame::ReadReq { op, offset, len } => {
                buf.put_u8(OP_READ_REQ);
                buf.put_u64_le(*op);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
            }
            Frame::ReadResp { op, offset, payload } => {
                buf.put_u8(OP_READ_RESP);
                buf.put_u64_le(*op);
                buf.put_u32_le(*offset);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
        }
        writer.write_all(&buf).await?;
        writer.flush().await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Frame> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let mut header = &header[..];
        let opcode = header.get_u8();
        let op = header.get_u64_le();
        let offset = header.get_u32_le();
        let len = header.get_u32_le();

        if len as usize > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame payload of {len} bytes exceeds the transport limit"),
            ));
        }

        match opcode {
            OP_WRITE | OP_READ_RESP => {
                let mut payload = vec![0u8; len as usize];
                reader.read_exact(&mut payload).await?;
                let payload = Bytes::from(payload);
                if opcode == OP_WRITE {
                    Ok(Frame::Write { op, offset, payload })
                } else {
                    Ok(Frame::ReadResp { op, offset, payload })
                }
            }
            OP_WRITE_ACK => Ok(Frame::WriteAck { op }),
            OP_READ_REQ => Ok(Frame::ReadReq { op, offset, len }),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame opcode {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(frame: Frame) -> Frame {
        let (mut a, mut b) = tokio::io::duplex(4096);
        frame.write_to(&mut a).await.unwrap();
        Frame::read_from(&mut b).await.unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let write = Frame::Write {
            op: 9,
            offset: 16,
            payload: Bytes::from_static(b"\x01\x02\x03"),
        };
        assert_eq!(round_trip(write.clone()).await, write);

        let ack = Frame::WriteAck { op: 9 };
        assert_eq!(round_trip(ack.clone()).await, ack);

        let req = Frame::ReadReq { op: 3, offset: 0, len: 24 };
        assert_eq!(round_trip(req.clone()).await, req);

        let resp = Frame::ReadResp {
            op: 3,
            offset: 0,
            payload: Bytes::from_static(&[0u8; 24]),
        };
        assert_eq!(round_trip(resp.clone()).await, resp);
    }

    #[tokio::test]
    async fn oversized_payloads_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = BytesMut::new();
        header.put_u8(1);
        header.put_u64_le(0);
        header.put_u32_le(0);
        header.put_u32_le(u32::MAX);
        tokio::io::AsyncWriteExt::write_all(&mut a, &header).await.unwrap();
        let err = Frame::read_from(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
