//! HTTP API gateway for the Ferry live-migration engine.
//!
//! Exposes migration and disk-copying task control plus statistics for
//! the VMs whose monitors live on this host.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod routes;
