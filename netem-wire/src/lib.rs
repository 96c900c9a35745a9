#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Raw IPv4 datagram handling for the netem emulator.
//!
//! Packets cross the emulated network as raw bytes. This crate turns them into a structured
//! [`Packet`] view (IPv4 header plus exactly one TCP or UDP layer), writes them back after
//! in-place mutations, and peeks into TLS ClientHello messages to recover the requested server
//! name.

pub mod builder;
pub mod packet;
pub mod protocol;
pub mod tls;

#[cfg(any(test, feature = "test-utils"))]
#[doc(hidden)]
pub mod test_utils;

pub use builder::DatagramBuilder;
pub use packet::Packet;
pub use protocol::Protocol;
