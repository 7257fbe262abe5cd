#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::large_enum_variant,
    clippy::missing_errors_doc
)]
#![forbid(unsafe_code)]
mod config;
pub mod service;
pub use config::{CONFIG, DynAppConfig, OpenIdConfig, UpstreamAuthConfig};
pub use service::{ApplicationId, MailboxId, MailboxSet};

pub mod api;
pub mod request_tracing;
pub mod serve;

pub use async_trait;
pub use axum;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

#[cfg(any(test, feature = "test-utils"))]
pub mod tests;
