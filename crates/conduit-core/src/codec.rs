//! Length-prefixed framing for the two Conduit wire surfaces.
//!
//! Tunnel handshake (client proxy → server proxy), per the tunnel wire
//! format: `[4-byte little-endian length][JSON header]`, then the raw
//! application stream. Control channel (node ↔ manager):
//! `[4-byte big-endian length][JSON frame]`.

use crate::error::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a framed payload. A handshake header is a few hundred bytes;
/// anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Tunnel handshake header, sent once by the client proxy after the
/// transport handshake. Field names are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHeader {
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
    #[serde(rename = "SrcPort")]
    pub src_port: u16,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
    #[serde(rename = "DstPort")]
    pub dst_port: u16,
    /// Where the server proxy should deliver the stream, as "ip:port".
    #[serde(rename = "DstAs")]
    pub dst_as: String,
}

/// Encode a tunnel header into its framed wire form.
pub fn encode_tunnel_header(header: &TunnelHeader) -> ConduitResult<Vec<u8>> {
    let payload = serde_json::to_vec(header)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ConduitError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Write the framed tunnel header to a stream.
pub async fn write_tunnel_header<W>(writer: &mut W, header: &TunnelHeader) -> ConduitResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_tunnel_header(header)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one framed tunnel header from a stream.
pub async fn read_tunnel_header<R>(reader: &mut R) -> ConduitResult<TunnelHeader>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ConduitError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Write one control-channel frame (big-endian length prefix).
pub async fn write_control_frame<W>(writer: &mut W, payload: &[u8]) -> ConduitResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(ConduitError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one control-channel frame.
pub async fn read_control_frame<R>(reader: &mut R) -> ConduitResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ConduitError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TunnelHeader {
        TunnelHeader {
            src_ip: "10.0.0.1".into(),
            src_port: 40022,
            dst_ip: "10.0.0.2".into(),
            dst_port: 9090,
            dst_as: "127.0.0.1:9090".into(),
        }
    }

    #[test]
    fn prefix_is_four_le_bytes() {
        let frame = encode_tunnel_header(&header()).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert!(len <= MAX_FRAME_LEN);
    }

    #[test]
    fn reserialize_is_byte_identical() {
        let frame = encode_tunnel_header(&header()).unwrap();
        let parsed: TunnelHeader = serde_json::from_slice(&frame[4..]).unwrap();
        let again = encode_tunnel_header(&parsed).unwrap();
        assert_eq!(frame, again);
    }

    #[test]
    fn wire_field_names() {
        let frame = encode_tunnel_header(&header()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame[4..]).unwrap();
        for key in ["SrcIP", "SrcPort", "DstIP", "DstPort", "DstAs"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }

    #[tokio::test]
    async fn tunnel_header_round_trip() {
        let mut buf = Vec::new();
        write_tunnel_header(&mut buf, &header()).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_tunnel_header(&mut cursor).await.unwrap();
        assert_eq!(decoded, header());
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        buf.extend(std::iter::repeat(b'x').take(8));
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_tunnel_header(&mut cursor).await,
            Err(ConduitError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_io_error() {
        let good = encode_tunnel_header(&header()).unwrap();
        let mut cursor = std::io::Cursor::new(good[..good.len() - 3].to_vec());
        assert!(matches!(
            read_tunnel_header(&mut cursor).await,
            Err(ConduitError::Io(_))
        ));
    }

    #[tokio::test]
    async fn control_frame_round_trip() {
        let mut buf = Vec::new();
        write_control_frame(&mut buf, b"{\"id\":1}").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_control_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, b"{\"id\":1}");
    }
}
