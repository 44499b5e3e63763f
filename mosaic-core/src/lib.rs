//! Wire protocol and transport substrate for the mosaic commit system.
//!
//! A mosaic cluster is one coordinator and any number of participants
//! exchanging a single record type over an unreliable datagram substrate.
//! This crate holds the pieces both roles share:
//!
//! - [`WireMessage`]: the one on-wire record
//! - [`codec`]: postcard encode/decode for it
//! - [`Transport`]: the substrate seam, with a UDP implementation

#![warn(clippy::pedantic)]

pub mod codec;
mod message;
mod transport;

pub use message::{MessageKind, WireMessage};
pub use transport::{Inbound, Transport, UdpTransport};
