//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).
//!
//! # Modules
//!
//! - [`stream`] - `ChannelSubscription`, a controllable upstream stream.
//! - [`connector`] - `MockConnector` / `MockClient` recording every stream opened.
//! - [`config`] - Canonical test configurations (pool, backoff).

pub mod config;
pub mod connector;
pub mod stream;
