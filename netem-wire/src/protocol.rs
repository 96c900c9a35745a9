use std::{fmt, str::FromStr};

use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};

/// The transport protocols the emulator knows how to route and inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Transmission Control Protocol (IP protocol 6).
    Tcp,
    /// User Datagram Protocol (IP protocol 17).
    Udp,
}

/// Returned when parsing a string other than `tcp` or `udp` as a [`Protocol`].
#[derive(Debug, thiserror::Error)]
#[error("invalid protocol: {0}")]
pub struct ParseProtocolError(String);

impl Protocol {
    /// Returns the IPv4 "protocol" header value for this transport.
    pub const fn ip_number(self) -> IpNextHeaderProtocol {
        match self {
            Self::Tcp => IpNextHeaderProtocols::Tcp,
            Self::Udp => IpNextHeaderProtocols::Udp,
        }
    }

    /// Maps an IPv4 "protocol" header value back to a supported transport, if any.
    pub fn from_ip_number(number: IpNextHeaderProtocol) -> Option<Self> {
        if number == IpNextHeaderProtocols::Tcp {
            Some(Self::Tcp)
        } else if number == IpNextHeaderProtocols::Udp {
            Some(Self::Udp)
        } else {
            None
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(ParseProtocolError(s.to_owned()))
        }
    }
}
