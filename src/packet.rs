//! Parsed DHCPv4 messages.
//!
//! The engine never touches wire bytes; the embedding server parses each
//! inbound packet into a [`DhcpRequest`] and seeds a [`DhcpReply`], and the
//! handler fills in (or replaces) the reply. Only the fields the lease
//! logic reads or writes are modelled.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::lease::HwAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// An inbound request, already parsed off the wire.
#[derive(Debug, Clone)]
pub struct DhcpRequest {
    pub message_type: MessageType,
    /// The client hardware address (`chaddr`).
    pub hw: HwAddr,
    /// The client's current address (`ciaddr`); unspecified unless the
    /// client is bound.
    pub ciaddr: Ipv4Addr,
    /// Requested-IP-address option, when the client asked for one.
    pub requested_ip: Option<Ipv4Addr>,
    /// Hostname option, informational.
    pub hostname: Option<String>,
}

impl DhcpRequest {
    pub fn new(message_type: MessageType, hw: HwAddr) -> Self {
        Self {
            message_type,
            hw,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            requested_ip: None,
            hostname: None,
        }
    }

    /// The address a REQUEST is asking to keep: the requested-IP option
    /// when present, otherwise `ciaddr`.
    pub fn confirmed_ip(&self) -> Ipv4Addr {
        self.requested_ip.unwrap_or(self.ciaddr)
    }
}

/// An in-flight reply being assembled by the handler chain.
#[derive(Debug, Clone)]
pub struct DhcpReply {
    pub message_type: MessageType,
    /// The address offered or acknowledged to the client (`yiaddr`).
    pub yiaddr: Ipv4Addr,
    /// Server-identifier option; set by the embedding server before the
    /// lease handler runs.
    pub server_id: Ipv4Addr,
    /// Address-lease-time option.
    pub lease_time: Option<Duration>,
    /// Message option, carried on NAKs.
    pub message: Option<String>,
}

impl DhcpReply {
    /// A fresh reply skeleton for `request`: OFFER for a DISCOVER, ACK
    /// otherwise, with every other field unset.
    pub fn reply_to(request: &DhcpRequest) -> Self {
        let message_type = match request.message_type {
            MessageType::Discover => MessageType::Offer,
            _ => MessageType::Ack,
        };
        Self {
            message_type,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            server_id: Ipv4Addr::UNSPECIFIED,
            lease_time: None,
            message: None,
        }
    }
}
