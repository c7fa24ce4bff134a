//! # nimbus-cc — cluster controller for the nimbus IaaS stack
//!
//! Facade crate that re-exports the nimbus workspace crates and carries the
//! daemon-only pieces (logging setup and the NC HTTP transport).
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | nimbus-core | Types, error taxonomy, capability traits |
//! | [`controller`] | nimbus-controller | Caches, locks, scheduler, monitor, verb handlers |
//! | [`client`] | nimbus-cc | JSON-over-HTTP node-controller transport |
//! | [`logging`] | nimbus-cc | Tracing subscriber setup |

pub use nimbus_controller as controller;
pub use nimbus_core as core;

pub mod client;
pub mod logging;
