//! Crate containing the client-facing surface of a TealFS node: the
//! bridge that turns path operations into block GET/PUT against the
//! manager, and the HTTP server in front of it

#[macro_use]
extern crate log;

pub mod bridge;
pub mod error;
pub mod web_server;

pub use bridge::{bridge, Bridge, BridgeRunner};
pub use error::Error;
