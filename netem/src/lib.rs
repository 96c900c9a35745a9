#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! An in-process IPv4 network emulator for testing censorship circumvention and measurement
//! tools.
//!
//! Stub networks are attached to a [`Backbone`] through [`Link`]s that can carry impairments
//! ([`LinkImpairment`]) and deep packet inspection rules ([`DpiEngine`]). TLS interception
//! inside the emulation is backed by [`MitmConfig`].

pub use netem_common as common;
pub use netem_mitm::{self as mitm, MitmConfig};
pub use netem_sim::*;
pub use netem_wire::{self as wire, DatagramBuilder, Packet, Protocol};
