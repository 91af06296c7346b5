//! Test utilities: scripted feed transports and sample data
//!
//! The scripted connector stands in for the timing relay so connection tests
//! run without sockets and under paused tokio time.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::transport::{FeedConnector, FeedEndpoint, FeedLink, LinkEvent};
use crate::types::{DriverLaps, LapEntry, SessionPayload};
use crate::{KartwallError, Result};

/// Build a vendor frame with `drivers` rows in reverse position order.
pub fn sample_frame(drivers: usize) -> String {
    let rows: Vec<serde_json::Value> = (0..drivers)
        .rev()
        .map(|i| {
            serde_json::json!({
                "N": format!("Driver {}", i + 1),
                "P": i + 1,
                "K": format!("{:02}", (i % 40) + 1),
                "T": 45_000 + (i as u64 * 137),
                "B": format!("{}.{:03}", 44 + i % 3, (i * 91) % 1000),
                "L": 12,
                "G": "+0.412",
            })
        })
        .collect();

    serde_json::json!({ "N": "Heat 3", "C": 7, "D": rows }).to_string()
}

/// The two-lap "Heat 3" payload used across capture tests.
pub fn heat_three_payload() -> SessionPayload {
    SessionPayload {
        name: "Heat 3".into(),
        drivers: vec![
            DriverLaps {
                driver_key: "A".into(),
                laps: vec![lap(1, 45_231, 1, 7), lap(2, 44_890, 1, 7)],
            },
            DriverLaps {
                driver_key: "B".into(),
                laps: vec![lap(1, 46_010, 2, 12), lap(2, 45_400, 2, 12)],
            },
        ],
        session_date: None,
    }
}

pub fn lap(lap_number: u32, lap_time_ms: u64, position: u32, kart_number: u32) -> LapEntry {
    LapEntry { lap_number, lap_time_ms, position, kart_number }
}

/// Fixed capture instant for deterministic session ids.
pub fn race_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 14, 30, 0).single().unwrap_or_default()
}

enum ScriptedOpen {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<LinkEvent>),
}

#[derive(Default)]
struct ScriptState {
    opens: VecDeque<ScriptedOpen>,
    sent: Vec<String>,
}

/// A [`FeedConnector`] whose open outcomes are queued by the test.
///
/// With nothing queued an open is refused, like a relay that is down.
/// Every open attempt is reported on the channel returned by [`ScriptedConnector::new`].
#[derive(Clone)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
    attempts: mpsc::UnboundedSender<Instant>,
}

/// Test side of an accepted scripted link.
pub struct RelayHandle {
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ScriptedConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Instant>) {
        let (attempts, attempt_rx) = mpsc::unbounded_channel();
        (Self { state: Arc::default(), attempts }, attempt_rx)
    }

    /// Queue an open that succeeds. Dropping the handle closes the link.
    pub fn accept_next(&self) -> RelayHandle {
        let (events, rx) = mpsc::unbounded_channel();
        self.with_state(|state| state.opens.push_back(ScriptedOpen::Accept(rx)));
        RelayHandle { events }
    }

    /// Queue an open that fails.
    pub fn refuse_next(&self, reason: &str) {
        self.with_state(|state| state.opens.push_back(ScriptedOpen::Refuse(reason.to_string())));
    }

    /// Every message the manager sent, across all links.
    pub fn sent(&self) -> Vec<String> {
        self.with_state(|state| state.sent.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl RelayHandle {
    pub fn frame(&self, raw: &str) {
        let _ = self.events.send(LinkEvent::Frame(raw.to_string()));
    }

    pub fn error(&self, reason: &str) {
        let _ = self.events.send(LinkEvent::Error(KartwallError::connection_failed(reason)));
    }

    pub fn close(self) {
        let _ = self.events.send(LinkEvent::Closed);
    }
}

#[async_trait::async_trait]
impl FeedConnector for ScriptedConnector {
    async fn open(&self, _endpoint: &FeedEndpoint) -> Result<Box<dyn FeedLink>> {
        let _ = self.attempts.send(Instant::now());
        let next = self.with_state(|state| state.opens.pop_front());

        match next {
            Some(ScriptedOpen::Accept(events)) => Ok(Box::new(ScriptedLink {
                events,
                state: Arc::clone(&self.state),
                closed: false,
            })),
            Some(ScriptedOpen::Refuse(reason)) => Err(KartwallError::connection_failed(reason)),
            None => Err(KartwallError::connection_failed("relay offline")),
        }
    }
}

struct ScriptedLink {
    events: mpsc::UnboundedReceiver<LinkEvent>,
    state: Arc<Mutex<ScriptState>>,
    closed: bool,
}

#[async_trait::async_trait]
impl FeedLink for ScriptedLink {
    async fn send(&mut self, message: &str) -> Result<()> {
        if self.closed {
            return Err(KartwallError::connection_failed("link is closed"));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sent.push(message.to_string());
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        if self.closed {
            return LinkEvent::Closed;
        }
        match self.events.recv().await {
            Some(LinkEvent::Closed) | None => {
                self.closed = true;
                LinkEvent::Closed
            }
            Some(event) => event,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.events.close();
    }
}
