//! TealFS node: library surface shared by the server binary and the
//! integration tests

#[macro_use]
extern crate log;

pub mod server;
