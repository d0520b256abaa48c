//! relay-registry: a pull-through blob registry.
//!
//! Blobs missing from local storage are located in upstream repositories
//! named by an image-stream catalog, streamed to the client, and optionally
//! mirrored into local storage in the background.
//!
//! # Layout
//!
//! - [`catalog`]: image streams and candidate repository resolution
//! - [`locator`]: turns a digest into a remote blob source
//! - [`cache`]: descriptor and repository-membership cache
//! - [`pullthrough`]: local-first store with background mirroring
//! - [`limiter`]: admission control for background writes
//! - [`registry`]: per-server wiring of the services above
//! - [`daemon`]: minimal HTTP front serving blobs
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use relay_registry::{config::load_config, daemon, registry::Registry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config(Path::new("/etc/relay-registry/config.yaml"))?;
//!     let registry = Arc::new(Registry::from_config(&config)?);
//!     daemon::serve(config.server.addr, registry).await?;
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod error;
pub mod limiter;
pub mod locator;
pub mod metrics;
pub mod pullthrough;
pub mod registry;

pub use error::{Error, Result};
