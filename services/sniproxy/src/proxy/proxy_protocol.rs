//! PROXY protocol header generation.
//!
//! When a route asks for it, a PROXY header carrying the original client
//! address is written to the upstream connection before the replayed
//! handshake, so the backend sees the real client instead of the proxy.
//!
//! v1 (text):
//! - `PROXY TCP4 <src ip> <dst ip> <src port> <dst port>\r\n`
//! - `PROXY TCP6 ...` for IPv6, `PROXY UNKNOWN\r\n` when families cannot be unified
//!
//! v2 (binary):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::router::ProxyProtocol;

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Addresses of a proxied connection, as seen by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination (proxy listener) address.
    pub dst_addr: SocketAddr,
}

/// Address pair reduced to a single family.
enum AddressPair {
    V4(Ipv4Addr, Ipv4Addr),
    V6(Ipv6Addr, Ipv6Addr),
    Unknown,
}

impl ProxyHeader {
    /// Create a header for the given connection.
    ///
    /// # Arguments
    /// * `src_addr` - Original client source address and port
    /// * `dst_addr` - Destination address as observed at the listener
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Encode the header for the given mode. `None` yields no bytes.
    pub fn encode(&self, mode: ProxyProtocol) -> Vec<u8> {
        match mode {
            ProxyProtocol::None => Vec::new(),
            ProxyProtocol::V1 => self.encode_v1().into_bytes(),
            ProxyProtocol::V2 => self.encode_v2(),
        }
    }

    /// Generate the PROXY v1 text header.
    pub fn encode_v1(&self) -> String {
        let (family, src_ip, dst_ip) = match self.address_pair() {
            AddressPair::V4(src, dst) => ("TCP4", src.to_string(), dst.to_string()),
            AddressPair::V6(src, dst) => ("TCP6", src.to_string(), dst.to_string()),
            AddressPair::Unknown => return "PROXY UNKNOWN\r\n".to_string(),
        };

        format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            src_ip,
            dst_ip,
            self.src_addr.port(),
            self.dst_addr.port()
        )
    }

    /// Generate the PROXY v2 binary header.
    ///
    /// IPv4-mapped addresses are sent as IPv4. A genuine mixed pair is sent
    /// as IPv6, with the IPv4 side mapped.
    pub fn encode_v2(&self) -> Vec<u8> {
        match (self.src_addr.ip().to_canonical(), self.dst_addr.ip().to_canonical()) {
            (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => self.encode_v2_v4(src_ip, dst_ip),
            (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => self.encode_v2_v6(src_ip, dst_ip),
            (IpAddr::V4(src_ip), IpAddr::V6(dst_ip)) => {
                self.encode_v2_v6(src_ip.to_ipv6_mapped(), dst_ip)
            }
            (IpAddr::V6(src_ip), IpAddr::V4(dst_ip)) => {
                self.encode_v2_v6(src_ip, dst_ip.to_ipv6_mapped())
            }
        }
    }

    /// Unify the address families for the text format.
    fn address_pair(&self) -> AddressPair {
        match (self.src_addr.ip().to_canonical(), self.dst_addr.ip().to_canonical()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => AddressPair::V4(src, dst),
            (IpAddr::V6(src), IpAddr::V6(dst)) => AddressPair::V6(src, dst),
            _ => AddressPair::Unknown,
        }
    }

    fn encode_v2_v4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + IPV4_ADDR_LEN as usize);

        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET | TRANSPORT_STREAM);
        buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());

        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());

        buf
    }

    fn encode_v2_v6(&self, src_ip: Ipv6Addr, dst_ip: Ipv6Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + IPV6_ADDR_LEN as usize);

        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET6 | TRANSPORT_STREAM);
        buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());

        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());

        buf
    }
}

/// Write the PROXY header for `mode` to the upstream connection.
///
/// `client_peer` is the client's address, `client_local` the proxy address
/// the client connected to.
pub async fn write_proxy_header<W>(
    mode: ProxyProtocol,
    client_peer: SocketAddr,
    client_local: SocketAddr,
    upstream: &mut W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if mode == ProxyProtocol::None {
        return Ok(());
    }

    let header = ProxyHeader::new(client_peer, client_local).encode(mode);
    upstream.write_all(&header).await?;

    debug!(version = %mode, bytes = header.len(), "PROXY header sent");
    Ok(())
}
