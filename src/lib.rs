//! Live kart timing capture and per-driver lap history.
//!
//! kartwall sits between a track's timing relay and a results site. It keeps a
//! live connection to the relay, decodes standings frames, stores the laps of
//! every finished heat and links drivers to the site's user accounts.
//!
//! # Features
//!
//! - **Live standings**: one self-healing feed connection with capped exponential backoff
//! - **Tolerant decoding**: malformed frames are skipped, the last good snapshot stays
//! - **Idempotent capture**: laps are upserted by (session, driver, lap)
//! - **Driver identity**: profiles, manual linking and cross-session stats
//! - **Durable history**: sled-backed store with a retention purge
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kartwall::{Kartwall, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let feed = Kartwall::connect("localhost");
//!     let mut standings = feed.snapshots(UpdateRate::Max(2));
//!
//!     while let Some(snapshot) = standings.next().await {
//!         if let Some(leader) = snapshot.leader() {
//!             println!("P1 {} ({} drivers)", leader.name, snapshot.active_drivers);
//!         }
//!     }
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Live feed
pub mod connection;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod transports;

// Lap history
pub mod capture;
pub mod clock;
pub mod identity;
pub mod store;

// Outer surfaces
pub mod api;
pub mod config;

use std::sync::Arc;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use api::{CaptureApi, CaptureRequest, CaptureResponse, ResponseStatus};
pub use capture::{CaptureReport, DataSource, LapByLapOutcome, LapCaptureService};
pub use config::KartwallConfig;
pub use connection::{BackoffPolicy, ConnectionState, FeedConnectionManager, FeedOptions, FeedStatus};
pub use identity::{DriverIdentityAggregator, IdentityResolver, LinkRequest};
pub use protocol::{FrameDecoder, ParseFailure, decode};
pub use store::{LapStore, LegacyLapSource, MemoryStore, ProfileStore, SledStore};
pub use transport::{FeedConnector, FeedEndpoint, FeedLink, LinkEvent};
pub use transports::TcpConnector;

use config::StorageBackend;
use transport::DEFAULT_FEED_PORT;

/// Entry point for assembling feed connections and the capture stack.
///
/// # Examples
///
/// ## Live standings
/// ```rust,no_run
/// use kartwall::Kartwall;
///
/// # #[tokio::main]
/// # async fn main() {
/// let feed = Kartwall::connect("127.0.0.1");
/// assert_eq!(feed.endpoint().address(), "localhost:8080");
/// # }
/// ```
///
/// ## Capture and queries
/// ```rust,no_run
/// use kartwall::{Kartwall, KartwallConfig};
///
/// # #[tokio::main]
/// # async fn main() -> kartwall::Result<()> {
/// let api = Kartwall::open_capture(&KartwallConfig::default())?;
/// let response = api.handle_json(r#"{"action":"list_drivers"}"#).await;
/// assert!(response.success);
/// # Ok(())
/// # }
/// ```
pub struct Kartwall;

impl Kartwall {
    /// Start a TCP feed connection to the relay on `host` at the well-known port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(host: &str) -> FeedConnectionManager {
        let options = FeedOptions {
            endpoint: FeedEndpoint::for_host(host, DEFAULT_FEED_PORT),
            ..FeedOptions::default()
        };
        let manager = FeedConnectionManager::new(TcpConnector::new(), options);
        manager.connect();
        manager
    }

    /// Start a TCP feed connection configured by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_with(config: &KartwallConfig) -> FeedConnectionManager {
        let manager = FeedConnectionManager::new(config.tcp_connector(), config.feed_options());
        manager.connect();
        manager
    }

    /// Open the configured store and wire capture, identity and the action api
    /// onto it. The store also serves as the legacy lap-by-lap source.
    ///
    /// # Errors
    ///
    /// Returns an error if the sled database at `storage.path` cannot be opened.
    pub fn open_capture(config: &KartwallConfig) -> Result<CaptureApi> {
        let retention = config.retention();
        match config.storage.backend {
            StorageBackend::Memory => Ok(assemble(Arc::new(MemoryStore::new()), retention)),
            StorageBackend::Sled => {
                let store = SledStore::open(&config.storage.path)?;
                Ok(assemble(Arc::new(store), retention))
            }
        }
    }
}

fn assemble<S>(store: Arc<S>, retention: chrono::Duration) -> CaptureApi
where
    S: LapStore + ProfileStore + LegacyLapSource,
{
    let identity = Arc::new(DriverIdentityAggregator::new(store.clone(), store.clone()));
    let capture = Arc::new(
        LapCaptureService::new(store.clone(), identity.clone())
            .with_legacy_source(store)
            .with_retention(retention),
    );
    CaptureApi::new(capture, identity)
}
