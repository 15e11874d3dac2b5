//! Kiosk supervisor daemon
//!
//! Probes kiosk health, walks an escalating recovery ladder when it fails,
//! and sweeps host resources before they starve the kiosk.

pub mod health;
pub mod ports;
pub mod recovery;
pub mod resources;
pub mod supervisor;

pub use supervisor::{Ports, Supervisor};
