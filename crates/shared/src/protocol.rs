//! The framed wire protocol spoken between the proxy and its one
//! authenticated client: a packed 9-byte header (`type`, `address`, `size`)
//! followed by `size` bytes of payload, with payloads chunked so no single
//! frame exceeds 4096 bytes on the wire.

use std::net::Ipv4Addr;

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::consts::{FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use crate::errors::ErrorKind;
use crate::net::TcpStreamConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    #[num_enum(default)]
    Unknown = 0,
    TcpOpen = 1,
    TcpData = 2,
    TcpClose = 3,
    TcpStatus = 4,
    UdpData = 5,
    UdpControl = 6,
    System = 7,
}

/// The one-byte payload of a `SYSTEM` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemCode {
    BadPassword = 1,
    AccessDenied = 2,
}

/// The packed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub address: u32,
    pub size: u32,
}

impl FrameHeader {
    pub fn new(msg_type: MessageType, address: u32, size: u32) -> Self {
        FrameHeader {
            msg_type,
            address,
            size,
        }
    }

    pub fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.msg_type.into();
        buf[1..5].copy_from_slice(&self.address.to_le_bytes());
        buf[5..9].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        FrameHeader {
            msg_type: MessageType::from(buf[0]),
            address: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
            size: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
        }
    }
}

/// Packs the four octets of an IPv4 address into the header's `address`
/// field, least-significant-byte-last (`b[0].b[1].b[2].b[3]` in dotted-quad
/// order, stored little-endian).
pub fn ipv4_to_address(addr: Ipv4Addr) -> u32 {
    u32::from_le_bytes(addr.octets())
}

pub fn address_to_ipv4(address: u32) -> Ipv4Addr {
    Ipv4Addr::from(address.to_le_bytes())
}

/// Reads one frame header from `conn`. The caller is responsible for then
/// reading (and, for oversized messages, re-chunking) `header.size` bytes
/// of payload.
pub async fn read_header(conn: &TcpStreamConn) -> Result<FrameHeader, ErrorKind> {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    conn.recv(&mut buf).await?;
    Ok(FrameHeader::from_bytes(&buf))
}

/// Writes a single frame, chunking `payload` into pieces no larger than
/// [`MAX_FRAME_PAYLOAD`] bytes so no on-wire frame (header + payload)
/// exceeds 4096 bytes. Every chunk after the first repeats `msg_type` and
/// `address`, carrying only its own slice's length as `size`.
pub async fn write_frame(
    conn: &TcpStreamConn,
    msg_type: MessageType,
    address: u32,
    payload: &[u8],
) -> Result<(), ErrorKind> {
    if payload.is_empty() {
        let header = FrameHeader::new(msg_type, address, 0);
        return conn.send(&header.to_bytes()).await;
    }
    for chunk in payload.chunks(MAX_FRAME_PAYLOAD) {
        let header = FrameHeader::new(msg_type, address, chunk.len() as u32);
        conn.send(&header.to_bytes()).await?;
        conn.send(chunk).await?;
    }
    Ok(())
}

/// Drains exactly `size` bytes of a frame's payload from `conn` in chunks
/// of at most [`MAX_FRAME_PAYLOAD`] bytes, invoking `on_chunk` for each.
/// Used by the manager when demultiplexing `TCP_DATA`/`UDP_DATA`/
/// `UDP_CONTROL` frames, where the payload is forwarded chunk-by-chunk
/// rather than buffered whole.
pub async fn drain_payload<F, Fut>(
    conn: &TcpStreamConn,
    size: u32,
    mut on_chunk: F,
) -> Result<(), ErrorKind>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut remaining = size as usize;
    while remaining > 0 {
        let take = remaining.min(MAX_FRAME_PAYLOAD);
        let mut buf = vec![0u8; take];
        conn.recv(&mut buf).await?;
        remaining -= take;
        on_chunk(buf).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = FrameHeader::new(MessageType::UdpData, 0xC000_0205, 200);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn unknown_message_type_defaults() {
        let bytes = [99u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let header = FrameHeader::from_bytes(&bytes);
        assert_eq!(header.msg_type, MessageType::Unknown);
    }

    #[test]
    fn ipv4_address_round_trips() {
        let addr: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let encoded = ipv4_to_address(addr);
        assert_eq!(address_to_ipv4(encoded), addr);
    }

    #[test]
    fn address_byte_order_matches_dotted_quad() {
        let addr: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let encoded = ipv4_to_address(addr);
        assert_eq!(encoded.to_le_bytes(), addr.octets());
    }

    // Property 8: frame forward budget.
    #[tokio::test]
    async fn large_payload_chunks_to_wire_budget() {
        use tokio::io::AsyncReadExt;
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload = vec![0x41u8; 5000];
        let writer_task = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let conn = crate::net::TcpStreamConn::from_raw(stream);
            write_frame(&conn, MessageType::TcpData, 0, &payload)
                .await
                .unwrap();
        });

        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut on_wire = Vec::new();
        let mut buf = [0u8; 4096];
        let expected_len = 5000 + 2 * FRAME_HEADER_SIZE;
        while on_wire.len() < expected_len {
            let n = server_side.read(&mut buf).await.unwrap();
            assert!(n > 0);
            on_wire.extend_from_slice(&buf[..n]);
        }
        writer_task.await.unwrap();

        assert_eq!(on_wire.len(), expected_len);
        // First frame: header + 4087-byte chunk; second: header + 913-byte
        // remainder. Neither write exceeds the 4096-byte wire budget.
        let first = FrameHeader::from_bytes(on_wire[0..FRAME_HEADER_SIZE].try_into().unwrap());
        assert_eq!(first.size as usize, MAX_FRAME_PAYLOAD);
        let second_offset = FRAME_HEADER_SIZE + MAX_FRAME_PAYLOAD;
        let second = FrameHeader::from_bytes(
            on_wire[second_offset..second_offset + FRAME_HEADER_SIZE]
                .try_into()
                .unwrap(),
        );
        assert_eq!(second.size as usize, 5000 - MAX_FRAME_PAYLOAD);
        assert!(FRAME_HEADER_SIZE + MAX_FRAME_PAYLOAD <= 4096);
    }
}
