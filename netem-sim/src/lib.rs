#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Emulated network plumbing.
//!
//! Virtual hosts are attached to [`Nic`]s, pairs of NICs are joined by a [`Link`] that consults
//! a [`DpiEngine`] for every packet it forwards, and a [`Backbone`] routes packets between all
//! the stub networks registered with it.
//!
//! ```text
//! stack ── local NIC ══ link (DPI) ══ internet NIC ── backbone ── internet NIC ══ link ══ local NIC ── stack
//! ```

pub mod backbone;
pub mod dpi;
pub mod link;
pub mod nic;
pub mod stack;

pub use backbone::Backbone;
pub use dpi::{Direction, DpiEngine};
pub use link::{fast_link_factory, Link, LinkFactory, LinkImpairment};
pub use nic::{Nic, NicError};
pub use stack::Stack;
