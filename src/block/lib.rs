//! Crate containing the local disk store of a TealFS node

#[macro_use]
extern crate log;

pub mod store;

pub use store::DiskStore;
