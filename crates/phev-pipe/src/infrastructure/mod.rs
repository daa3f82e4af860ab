//! Infrastructure layer: concrete adapters for the session engine.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `phev_core`; the `application` layer never imports it outside tests.
//!
//! - **`transport`** – [`Transport`](crate::application::transport::Transport)
//!   implementations: TCP to the head unit and an in-memory scripted peer.
//! - **`stages`** – The default PHEV pipeline stages.
//! - **`storage`** – TOML configuration persistence.

pub mod stages;
pub mod storage;
pub mod transport;
