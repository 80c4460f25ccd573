//! BLE-to-cloud gateway core.
//!
//! The crate holds the hardware-independent part of a gateway that keeps
//! many BLE peripherals connected on behalf of a cloud service:
//!
//! - [`ble`] - connection table, attribute tables, subscription slots,
//!   scanning and the [`Radio`](ble::Radio) trait the host stack
//!   implements.
//! - [`gateway`] - the [`Gateway`](gateway::Gateway) itself: radio events
//!   in, cloud requests in, and the bounded notification pipeline out to
//!   the uplink.
//! - [`dfu`] - Nordic Secure DFU of a connected peripheral, driven by
//!   download fragments.
//!
//! Everything is `no_std` and allocation free; state lives in
//! fixed-capacity `heapless` containers behind `embassy-sync` mutexes.
//! The test suite runs on the host (`cargo test`).

#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

// Must come first so the logging macros are visible to every module.
mod fmt;

pub mod ble;
pub mod config;
pub mod dfu;
pub mod error;
pub mod gateway;

pub use error::Error;
pub use gateway::dfu_link::GatewayDfuLink;
pub use gateway::pipeline::{Iteration, NotificationQueue};
pub use gateway::uplink::{Encoder, Message, Publisher, Topic};
pub use gateway::Gateway;
