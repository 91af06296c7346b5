//! Transport trait for the live timing feed

use std::fmt;

use crate::{KartwallError, Result};

/// Well-known port the timing relay listens on, separate from the web app port.
pub const DEFAULT_FEED_PORT: u16 = 8080;

/// Fixed token sent after opening a link to request a full standings frame.
pub const HANDSHAKE_TOKEN: &str = "REQUEST_DATA";

/// Where the feed lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoint {
    pub host: String,
    pub port: u16,
}

impl FeedEndpoint {
    /// Build an endpoint from the host the application is served from.
    ///
    /// Loopback addresses collapse to `localhost` so a page served from
    /// `127.0.0.1` and one served from `localhost` reach the same relay.
    pub fn for_host(host: &str, port: u16) -> Self {
        let host = host.trim();
        let host = match host {
            "" | "localhost" | "127.0.0.1" => "localhost",
            other => other,
        };
        Self { host: host.to_string(), port }
    }

    /// `host:port`, as accepted by socket connect calls.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for FeedEndpoint {
    fn default() -> Self {
        Self::for_host("localhost", DEFAULT_FEED_PORT)
    }
}

impl fmt::Display for FeedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Something that happened on an open link.
#[derive(Debug)]
pub enum LinkEvent {
    /// One text message pushed by the relay
    Frame(String),
    /// The link reported a fault; a [`LinkEvent::Closed`] normally follows
    Error(KartwallError),
    /// The link is gone and will produce no more events
    Closed,
}

/// Opens links to the feed.
///
/// Implementations only open; the connection manager decides when and how
/// often to call [`FeedConnector::open`].
#[async_trait::async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    /// Open a new duplex text link
    ///
    /// An error here counts as a connection loss for the caller.
    async fn open(&self, endpoint: &FeedEndpoint) -> Result<Box<dyn FeedLink>>;
}

/// One open duplex text link.
#[async_trait::async_trait]
pub trait FeedLink: Send + 'static {
    /// Send one text message to the relay
    async fn send(&mut self, message: &str) -> Result<()>;

    /// Wait for the next event
    ///
    /// Once [`LinkEvent::Closed`] is returned every later call returns it too.
    async fn next_event(&mut self) -> LinkEvent;

    /// Close the link. Safe to call more than once.
    async fn close(&mut self);
}
