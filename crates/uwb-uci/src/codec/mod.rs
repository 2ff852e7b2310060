//! Transport framing
//!
//! [`header`] holds the pure layout rules for UCI, HBCI and HDLL frames.
//! [`TransportFramer`] applies them on top of a [`crate::bus::BusIo`],
//! including the IRQ/ready-sync handshake UCI reads require.

pub mod error;
mod framer;
pub mod header;

pub use error::CodecError;
pub use framer::{TransportContext, TransportFramer};
