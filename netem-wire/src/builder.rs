use std::net::SocketAddrV4;

use bytes::Bytes;
use pnet::packet::{
    ipv4::{self, Ipv4Flags, MutableIpv4Packet},
    tcp::{self, MutableTcpPacket, TcpFlags},
    udp::{self, MutableUdpPacket},
};

use crate::{
    packet::{Error, Result},
    protocol::Protocol,
};

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Builds raw IPv4 datagrams carrying a single TCP segment or UDP datagram.
///
/// This is what a stack attached to a NIC would emit, and is mostly useful to inject traffic
/// into an emulated network from tests.
///
/// # Example
///
/// ```
/// use std::net::SocketAddrV4;
/// use netem_wire::{DatagramBuilder, Packet};
///
/// let raw = DatagramBuilder::udp(
///     "10.0.0.1:5353".parse::<SocketAddrV4>().unwrap(),
///     "10.0.0.2:53".parse::<SocketAddrV4>().unwrap(),
/// )
/// .ttl(16)
/// .payload(&b"query"[..])
/// .build()
/// .unwrap();
///
/// let packet = Packet::dissect(&raw).unwrap();
/// assert_eq!(packet.time_to_live(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct DatagramBuilder {
    protocol: Protocol,
    source: SocketAddrV4,
    destination: SocketAddrV4,
    ttl: u8,
    payload: Bytes,
    sequence: u32,
    syn: bool,
}

impl DatagramBuilder {
    pub const DEFAULT_TTL: u8 = 64;

    fn new(protocol: Protocol, source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self {
            protocol,
            source,
            destination,
            ttl: Self::DEFAULT_TTL,
            payload: Bytes::new(),
            sequence: 0,
            syn: false,
        }
    }

    pub fn tcp(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self::new(Protocol::Tcp, source, destination)
    }

    pub fn udp(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self::new(Protocol::Udp, source, destination)
    }

    /// Swaps source and destination, which is handy to build replies.
    pub fn reply(mut self) -> Self {
        std::mem::swap(&mut self.source, &mut self.destination);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the TCP sequence number. Ignored for UDP.
    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Marks the TCP segment as a SYN instead of PSH|ACK. Ignored for UDP.
    pub fn syn(mut self) -> Self {
        self.syn = true;
        self
    }

    pub fn build(&self) -> Result<Bytes> {
        let transport_header_len = match self.protocol {
            Protocol::Tcp => TCP_HEADER_LEN,
            Protocol::Udp => UDP_HEADER_LEN,
        };
        let total_len = IPV4_HEADER_LEN + transport_header_len + self.payload.len();
        let total_len_u16 = u16::try_from(total_len).map_err(|_| Error::TooLarge(total_len))?;

        let mut buf = vec![0u8; total_len];
        let (header, segment) = buf.split_at_mut(IPV4_HEADER_LEN);
        let segment_len = segment.len();
        let (src, dst) = (self.source.ip(), self.destination.ip());

        match self.protocol {
            Protocol::Tcp => {
                let mut tcp = MutableTcpPacket::new(segment)
                    .ok_or(Error::TruncatedTransport(Protocol::Tcp))?;
                tcp.set_source(self.source.port());
                tcp.set_destination(self.destination.port());
                tcp.set_sequence(self.sequence);
                tcp.set_data_offset((TCP_HEADER_LEN / 4) as u8);
                if self.syn {
                    tcp.set_flags(TcpFlags::SYN);
                } else {
                    tcp.set_acknowledgement(1);
                    tcp.set_flags(TcpFlags::PSH | TcpFlags::ACK);
                }
                tcp.set_window(u16::MAX);
                tcp.set_payload(&self.payload);
                let checksum = tcp::ipv4_checksum(&tcp.to_immutable(), src, dst);
                tcp.set_checksum(checksum);
            }
            Protocol::Udp => {
                let mut udp = MutableUdpPacket::new(segment)
                    .ok_or(Error::TruncatedTransport(Protocol::Udp))?;
                udp.set_source(self.source.port());
                udp.set_destination(self.destination.port());
                udp.set_length(segment_len as u16);
                udp.set_payload(&self.payload);
                let checksum = udp::ipv4_checksum(&udp.to_immutable(), src, dst);
                udp.set_checksum(if checksum == 0 { 0xffff } else { checksum });
            }
        }

        let mut ip = MutableIpv4Packet::new(header).ok_or(Error::Truncated(IPV4_HEADER_LEN))?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(total_len_u16);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(self.ttl);
        ip.set_next_level_protocol(self.protocol.ip_number());
        ip.set_source(*src);
        ip.set_destination(*dst);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);

        Ok(Bytes::from(buf))
    }
}
