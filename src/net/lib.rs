//! tealfs_net takes care of inter-node plumbing in TealFS:
//!
//! - the framed binary wire protocol (`payload`)
//! - accepting and dialing TCP connections, one reader task per socket,
//!   with a coordinator task as the single writer to the connection map
//!   (`pool`)
//!
//! The pool surfaces connection status changes and decoded payloads to
//! the manager over channels; it never interprets payloads itself apart
//! from the degraded-path transform applied when a send fails.

#[macro_use]
extern crate log;

pub mod error;
pub mod payload;
pub mod pool;

pub use error::Error;
