//! UDP source: binds the configured input port with an enlarged receive
//! buffer and resynchronizes the incoming byte stream onto 188-byte TS
//! packet boundaries (datagram boundaries carry no meaning for MPEG-TS).
use crate::error::AppError;
use crate::klv::ts::{SYNC_BYTE, TS_PACKET_LEN};
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

pub struct UdpSource {
    socket: UdpSocket,
}

impl UdpSource {
    /// Bind `0.0.0.0:port` with the OS receive buffer set to at least
    /// `min_buffer_bytes` (per §4.A/§5, default 64 MiB) to absorb bursts.
    pub fn bind(port: u16, min_buffer_bytes: usize) -> Result<Self, AppError> {
        let addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .expect("well-formed loopback-style address");

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(AppError::Bind)?;
        socket.set_reuse_address(true).map_err(AppError::Bind)?;
        socket
            .set_recv_buffer_size(min_buffer_bytes)
            .map_err(AppError::Bind)?;
        socket
            .bind(&addr.into())
            .map_err(AppError::Bind)?;
        socket.set_nonblocking(true).map_err(AppError::Bind)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(AppError::Bind)?;

        Ok(Self { socket })
    }

    /// Receive one UDP datagram into `buf`, returning the number of bytes
    /// read. Never reorders or drops at this layer; jitter absorption is
    /// the Jitter Queue's job, not the socket's.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, AppError> {
        self.socket
            .recv(buf)
            .await
            .map_err(|e| AppError::IngestTransient(format!("udp recv failed: {e}")))
    }
}

/// Splits an arbitrarily-chunked byte stream into aligned 188-byte TS
/// packets, resynchronizing on `0x47` whenever alignment is lost
/// (corrupt stream, packet loss mid-packet). Carries leftover bytes
/// across `feed` calls so packets may straddle datagram boundaries.
#[derive(Default)]
pub struct TsPacketizer {
    buf: BytesMut,
}

impl TsPacketizer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Feed newly-received bytes and drain every complete, sync-aligned
    /// packet currently available.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut packets = Vec::new();

        loop {
            // Resynchronize: drop bytes until a sync byte is at offset 0.
            while !self.buf.is_empty() && self.buf[0] != SYNC_BYTE {
                self.buf = self.buf.split_off(1);
            }

            if self.buf.len() < TS_PACKET_LEN {
                break;
            }

            let packet = self.buf.split_to(TS_PACKET_LEN).freeze();
            packets.push(packet);
        }

        packets
    }
}
