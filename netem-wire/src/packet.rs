use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use pnet::packet::{
    ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet},
    tcp::{self, MutableTcpPacket, TcpPacket},
    udp::{self, MutableUdpPacket, UdpPacket},
};

use crate::{protocol::Protocol, tls};

/// Minimum IPv4 header length in bytes.
const IPV4_MIN_HEADER_LEN: usize = 20;
/// Minimum TCP header length in bytes.
const TCP_MIN_HEADER_LEN: usize = 20;
/// UDP header length in bytes.
const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Fewer bytes than a minimal IPv4 header.
    #[error("packet too short for an IPv4 header: {0} bytes")]
    Truncated(usize),
    /// The version nibble is not 4.
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    /// The IHL field is below 5 words or runs past the buffer.
    #[error("invalid IPv4 header length: {0} bytes")]
    InvalidHeaderLength(usize),
    /// The total length is shorter than the header or longer than the buffer.
    #[error("invalid IPv4 total length: {0} bytes")]
    InvalidTotalLength(usize),
    /// The datagram is a fragment.
    #[error("IPv4 fragments are not supported")]
    Fragmented,
    /// The IP protocol number is neither TCP nor UDP.
    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),
    /// The transport header is cut short, or its length field disagrees with the datagram.
    #[error("truncated {0} header")]
    TruncatedTransport(Protocol),
    /// Serializing would exceed the 65535 byte IPv4 limit.
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
    /// TLS inspection was requested on a non-TCP packet.
    #[error("not a TCP packet")]
    NotTcp,
    /// The TCP payload is not a ClientHello with a readable server name.
    #[error("TLS parse error: {0}")]
    Tls(#[from] tls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transport {
    protocol: Protocol,
    source_port: u16,
    destination_port: u16,
    /// Offset of the transport payload from the start of the datagram.
    payload_offset: usize,
    /// Offset one past the last payload byte. For UDP this is bounded by the UDP length, so
    /// padding inside the IPv4 total length is not payload.
    payload_end: usize,
}

/// A dissected IPv4 datagram carrying exactly one TCP or UDP layer.
///
/// The packet owns a copy of the raw bytes it was dissected from. Mutations (currently only the
/// TTL) are applied by [`Packet::serialize`], which also fixes up lengths and checksums.
#[derive(Debug, Clone)]
pub struct Packet {
    raw: Vec<u8>,
    header_len: usize,
    ttl: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    transport: Transport,
}

impl Packet {
    /// Parses `raw` as an IPv4 datagram followed by a TCP or UDP header.
    ///
    /// Bytes past the IPv4 total length are ignored.
    pub fn dissect(raw: &[u8]) -> Result<Self> {
        let ip = Ipv4Packet::new(raw).ok_or(Error::Truncated(raw.len()))?;

        let version = ip.get_version();
        if version != 4 {
            return Err(Error::NotIpv4(version));
        }

        let header_len = ip.get_header_length() as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > raw.len() {
            return Err(Error::InvalidHeaderLength(header_len));
        }

        let total_len = ip.get_total_length() as usize;
        if total_len < header_len || total_len > raw.len() {
            return Err(Error::InvalidTotalLength(total_len));
        }

        if ip.get_fragment_offset() != 0 || ip.get_flags() & Ipv4Flags::MoreFragments != 0 {
            return Err(Error::Fragmented);
        }

        let next = ip.get_next_level_protocol();
        let protocol = Protocol::from_ip_number(next).ok_or(Error::UnsupportedProtocol(next.0))?;

        let segment = &raw[header_len..total_len];
        let transport = match protocol {
            Protocol::Tcp => {
                let tcp = TcpPacket::new(segment).ok_or(Error::TruncatedTransport(protocol))?;
                let data_offset = tcp.get_data_offset() as usize * 4;
                if data_offset < TCP_MIN_HEADER_LEN || data_offset > segment.len() {
                    return Err(Error::TruncatedTransport(protocol));
                }

                Transport {
                    protocol,
                    source_port: tcp.get_source(),
                    destination_port: tcp.get_destination(),
                    payload_offset: header_len + data_offset,
                    payload_end: total_len,
                }
            }
            Protocol::Udp => {
                let udp = UdpPacket::new(segment).ok_or(Error::TruncatedTransport(protocol))?;
                let udp_len = udp.get_length() as usize;
                if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
                    return Err(Error::TruncatedTransport(protocol));
                }

                Transport {
                    protocol,
                    source_port: udp.get_source(),
                    destination_port: udp.get_destination(),
                    payload_offset: header_len + UDP_HEADER_LEN,
                    payload_end: header_len + udp_len,
                }
            }
        };

        Ok(Self {
            raw: raw[..total_len].to_vec(),
            header_len,
            ttl: ip.get_ttl(),
            source: ip.get_source(),
            destination: ip.get_destination(),
            transport,
        })
    }

    #[inline]
    pub fn time_to_live(&self) -> u8 {
        self.ttl
    }

    #[inline]
    pub fn set_time_to_live(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    /// Decrements the TTL by one hop, saturating at zero.
    #[inline]
    pub fn decrement_time_to_live(&mut self) {
        self.ttl = self.ttl.saturating_sub(1);
    }

    #[inline]
    pub fn transport_protocol(&self) -> Protocol {
        self.transport.protocol
    }

    #[inline]
    pub fn source_ip_address(&self) -> Ipv4Addr {
        self.source
    }

    #[inline]
    pub fn destination_ip_address(&self) -> Ipv4Addr {
        self.destination
    }

    #[inline]
    pub fn source_port(&self) -> u16 {
        self.transport.source_port
    }

    #[inline]
    pub fn destination_port(&self) -> u16 {
        self.transport.destination_port
    }

    #[inline]
    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.source, self.transport.source_port)
    }

    #[inline]
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.destination, self.transport.destination_port)
    }

    /// The transport-layer payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.transport.payload_offset..self.transport.payload_end]
    }

    /// Length of the whole datagram in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns `true` if this packet is addressed to `ip:port` over `protocol`.
    pub fn match_destination(&self, protocol: Protocol, ip: Ipv4Addr, port: u16) -> bool {
        self.transport.protocol == protocol
            && self.destination == ip
            && self.transport.destination_port == port
    }

    /// Attempts to read the TLS SNI from the TCP payload. This only succeeds on the segment
    /// carrying the ClientHello.
    pub fn parse_tls_server_name(&self) -> Result<String> {
        if self.transport.protocol != Protocol::Tcp {
            return Err(Error::NotTcp);
        }

        Ok(tls::parse_server_name(self.payload())?)
    }

    /// Re-encodes the packet, recomputing the IPv4 total length and all checksums.
    ///
    /// The UDP length is kept as received. Bytes past it are carried along untouched and left out
    /// of the UDP checksum.
    pub fn serialize(&self) -> Result<Bytes> {
        let total_len = self.raw.len();
        let total_len_u16 = u16::try_from(total_len).map_err(|_| Error::TooLarge(total_len))?;

        let mut buf = self.raw.clone();
        let (header, segment) = buf.split_at_mut(self.header_len);

        match self.transport.protocol {
            Protocol::Tcp => {
                let mut tcp = MutableTcpPacket::new(segment)
                    .ok_or(Error::TruncatedTransport(Protocol::Tcp))?;
                tcp.set_checksum(0);
                let checksum =
                    tcp::ipv4_checksum(&tcp.to_immutable(), &self.source, &self.destination);
                tcp.set_checksum(checksum);
            }
            Protocol::Udp => {
                let datagram = &mut segment[..self.transport.payload_end - self.header_len];
                let mut udp = MutableUdpPacket::new(datagram)
                    .ok_or(Error::TruncatedTransport(Protocol::Udp))?;
                udp.set_checksum(0);
                let checksum =
                    udp::ipv4_checksum(&udp.to_immutable(), &self.source, &self.destination);
                // A zero UDP checksum means "no checksum" on the wire.
                udp.set_checksum(if checksum == 0 { 0xffff } else { checksum });
            }
        }

        let mut ip = MutableIpv4Packet::new(header).ok_or(Error::Truncated(self.header_len))?;
        ip.set_total_length(total_len_u16);
        ip.set_ttl(self.ttl);
        ip.set_checksum(0);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);

        Ok(Bytes::from(buf))
    }
}
