//! Crate containing the per-node coordination engine of TealFS: the
//! single-writer manager event loop and the weighted block distributor

#[macro_use]
extern crate log;

pub mod distributor;
pub mod manager;
pub mod pending;

pub use distributor::Distributor;
pub use manager::{Manager, ManagerRx, ManagerTx, UiStatus};
