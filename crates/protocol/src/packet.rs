//! Binary job-protocol packet framing
//!
//! Every packet is a 12 byte header followed by the payload:
//!
//! ```text
//! +------------+-------------+-------------+-----------------------+
//! | magic (4)  | type (u32)  | size (u32)  | args, NUL separated   |
//! | \0REQ/\0RES| big endian  | big endian  | (last arg may hold    |
//! |            |             |             |  arbitrary bytes)     |
//! +------------+-------------+-------------+-----------------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

const MAGIC_REQ: [u8; 4] = *b"\0REQ";
const MAGIC_RES: [u8; 4] = *b"\0RES";
const HEADER_LEN: usize = 12;
/// Upper bound on a single packet payload
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Packet types used by the worker and the result client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    SetClientId = 22,
}

impl PacketType {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => PacketType::CanDo,
            2 => PacketType::CantDo,
            3 => PacketType::ResetAbilities,
            4 => PacketType::PreSleep,
            6 => PacketType::Noop,
            7 => PacketType::SubmitJob,
            8 => PacketType::JobCreated,
            9 => PacketType::GrabJob,
            10 => PacketType::NoJob,
            11 => PacketType::JobAssign,
            12 => PacketType::WorkStatus,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            16 => PacketType::EchoReq,
            17 => PacketType::EchoRes,
            18 => PacketType::SubmitJobBg,
            19 => PacketType::Error,
            22 => PacketType::SetClientId,
            _ => return None,
        })
    }
}

/// Direction marker in the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

/// One framed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub kind: PacketType,
    pub data: Vec<u8>,
}

impl Packet {
    /// Build a request packet from its arguments
    pub fn request(kind: PacketType, args: &[&[u8]]) -> Self {
        Self {
            magic: Magic::Request,
            kind,
            data: args.join(&0u8),
        }
    }

    /// Build a response packet from its arguments
    pub fn response(kind: PacketType, args: &[&[u8]]) -> Self {
        Self {
            magic: Magic::Response,
            kind,
            data: args.join(&0u8),
        }
    }

    /// Split the payload into at most `n` NUL separated arguments
    ///
    /// The last argument keeps any further NUL bytes, which is how job
    /// payloads travel unescaped.
    pub fn args(&self, n: usize) -> Vec<&[u8]> {
        if self.data.is_empty() {
            return Vec::new();
        }
        self.data.splitn(n, |b| *b == 0).collect()
    }

    /// Serialize header and payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.extend_from_slice(match self.magic {
            Magic::Request => &MAGIC_REQ,
            Magic::Response => &MAGIC_RES,
        });
        buf.extend_from_slice(&(self.kind as u32).to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Write the packet to a stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one packet from a stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let magic = match &header[0..4] {
            m if m == &MAGIC_REQ[..] => Magic::Request,
            m if m == &MAGIC_RES[..] => Magic::Response,
            other => return Err(ProtocolError::packet(format!("bad magic {:?}", other))),
        };
        let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let kind = PacketType::from_code(code)
            .ok_or_else(|| ProtocolError::packet(format!("unknown packet type {}", code)))?;
        if size > MAX_PACKET_SIZE {
            return Err(ProtocolError::packet(format!("packet too large: {} bytes", size)));
        }

        let mut data = vec![0u8; size];
        reader.read_exact(&mut data).await?;
        Ok(Self { magic, kind, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = Packet::request(PacketType::CanDo, &[b"service".as_slice()]).encode();
        assert_eq!(&bytes[0..4], b"\0REQ");
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_be_bytes());
        assert_eq!(&bytes[12..], b"service");
    }

    #[test]
    fn test_args_keep_nul_in_last_field() {
        let packet = Packet::response(PacketType::JobAssign, &[b"H:1".as_slice(), b"host", b"a\0b"]);
        let args = packet.args(3);
        assert_eq!(args, vec![&b"H:1"[..], &b"host"[..], &b"a\0b"[..]]);
    }

    #[test]
    fn test_empty_packet_has_no_args() {
        let packet = Packet::request(PacketType::GrabJob, &[]);
        assert!(packet.args(1).is_empty());
        assert_eq!(packet.encode().len(), HEADER_LEN);
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let packet = Packet::response(PacketType::JobCreated, &[b"H:lab:42".as_slice()]);
        let mut bytes = packet.encode();
        bytes.extend(Packet::response(PacketType::Noop, &[]).encode());

        let mut reader = &bytes[..];
        assert_eq!(Packet::read_from(&mut reader).await.unwrap(), packet);
        assert_eq!(
            Packet::read_from(&mut reader).await.unwrap().kind,
            PacketType::Noop
        );
    }

    #[tokio::test]
    async fn test_read_rejects_bad_magic() {
        let mut bytes = Packet::request(PacketType::Noop, &[]).encode();
        bytes[1] = b'X';
        let err = Packet::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Packet(_)));
    }

    #[tokio::test]
    async fn test_read_truncated_stream_is_io_error() {
        let bytes = Packet::request(PacketType::CanDo, &[b"host".as_slice()]).encode();
        let err = Packet::read_from(&mut &bytes[..bytes.len() - 1]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
