//! # bassline
//!
//! Everything asynchronous around the synchronous `bassline-core` kernel:
//!
//! - [`bridge`]: the [`Bridge`](bridge::Bridge) surface over an in-process
//!   task ([`LocalBridge`](bridge::LocalBridge)) or a peer server
//!   ([`RemoteBridge`](bridge::RemoteBridge))
//! - [`api`]: the axum peer server remote bridges talk to
//! - [`config`]: `bassline.toml`

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;

pub use config::AppConfig;
pub use error::AppError;
