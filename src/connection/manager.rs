//! Feed connection manager: one logical link to the timing relay

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::BackoffPolicy;
use crate::protocol::FrameDecoder;
use crate::stream::ThrottleExt;
use crate::transport::{FeedConnector, FeedEndpoint, HANDSHAKE_TOKEN, LinkEvent};
use crate::types::{RaceSnapshot, UpdateRate};
use crate::KartwallError;

/// Lifecycle of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state, and the state after an explicit stop
    #[default]
    Disconnected,
    /// An open attempt is in flight
    Connecting,
    /// The link is open and the handshake was sent
    Connected,
    /// The link was lost and a retry timer is pending
    Reconnecting,
}

/// Observable status of a [`FeedConnectionManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Settings for one manager.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub endpoint: FeedEndpoint,
    pub backoff: BackoffPolicy,
    pub handshake: String,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            endpoint: FeedEndpoint::default(),
            backoff: BackoffPolicy::default(),
            handshake: HANDSHAKE_TOKEN.to_string(),
        }
    }
}

/// Owns one logical connection to the live feed.
///
/// Keeps it alive across drops with bounded exponential backoff and publishes
/// every decoded snapshot to subscribers. Independent managers share nothing.
///
/// `connect` and `disconnect` spawn onto the current tokio runtime.
/// Dropping the manager stops it like [`FeedConnectionManager::disconnect`].
pub struct FeedConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn FeedConnector>,
    options: FeedOptions,
    control: Mutex<Control>,
    status_tx: watch::Sender<FeedStatus>,
    snapshot_tx: watch::Sender<Option<Arc<RaceSnapshot>>>,
}

/// Mutable connection bookkeeping, only touched under the lock.
///
/// `epoch` changes on every new attempt and on every stop. Tasks carry the
/// epoch they were started with and give up once it no longer matches.
#[derive(Default)]
struct Control {
    state: ConnectionState,
    retry_count: u32,
    epoch: u64,
    last_error: Option<String>,
    pending_retry: Option<CancellationToken>,
    active: Option<CancellationToken>,
}

impl FeedConnectionManager {
    pub fn new<C>(connector: C, options: FeedOptions) -> Self
    where
        C: FeedConnector,
    {
        Self::with_shared_connector(Arc::new(connector), options)
    }

    pub fn with_shared_connector(connector: Arc<dyn FeedConnector>, options: FeedOptions) -> Self {
        let (status_tx, _) = watch::channel(FeedStatus::default());
        let (snapshot_tx, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                connector,
                options,
                control: Mutex::new(Control::default()),
                status_tx,
                snapshot_tx,
            }),
        }
    }

    /// Start connecting.
    ///
    /// No-op while connecting or connected. While a retry timer is pending the
    /// timer is cancelled and a new attempt starts at once, keeping the retry count.
    pub fn connect(&self) {
        let mut control = self.shared.lock();
        match control.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                trace!(state = ?control.state, "Connect ignored, link already live");
            }
            ConnectionState::Reconnecting => {
                if let Some(timer) = control.pending_retry.take() {
                    timer.cancel();
                }
                debug!(retry_count = control.retry_count, "Reconnecting immediately");
                self.shared.begin_attempt(&mut control);
            }
            ConnectionState::Disconnected => {
                info!(endpoint = %self.shared.options.endpoint, "Connecting to timing feed");
                self.shared.begin_attempt(&mut control);
            }
        }
    }

    /// Stop: cancel any pending retry, close the live link, stay down.
    ///
    /// Idempotent. Nothing reconnects until [`FeedConnectionManager::connect`]
    /// is called again.
    pub fn disconnect(&self) {
        self.shared.stop();
    }

    /// Current status.
    pub fn status(&self) -> FeedStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retry_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Most recently decoded snapshot, kept across decode failures and reconnects.
    pub fn latest_snapshot(&self) -> Option<Arc<RaceSnapshot>> {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn endpoint(&self) -> &FeedEndpoint {
        &self.shared.options.endpoint
    }

    /// Stream of status changes, starting with the current status.
    pub fn status_updates(&self) -> BoxStream<'static, FeedStatus> {
        WatchStream::new(self.shared.status_tx.subscribe()).boxed()
    }

    /// Stream of decoded snapshots.
    ///
    /// Yields the current snapshot first when there is one. With
    /// [`UpdateRate::Max`] intermediate snapshots are dropped, latest wins.
    pub fn snapshots(&self, rate: UpdateRate) -> BoxStream<'static, Arc<RaceSnapshot>> {
        let snapshots = WatchStream::new(self.shared.snapshot_tx.subscribe())
            .filter_map(|snapshot| async move { snapshot });

        match rate.throttle_interval() {
            None => snapshots.boxed(),
            Some(interval) => snapshots.throttle(interval).boxed(),
        }
    }
}

impl Drop for FeedConnectionManager {
    fn drop(&mut self) {
        debug!("Dropping feed connection manager");
        self.shared.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, control: &Control) {
        let status = FeedStatus {
            state: control.state,
            connected: control.state == ConnectionState::Connected,
            last_error: control.last_error.clone(),
            retry_count: control.retry_count,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn begin_attempt(self: &Arc<Self>, control: &mut Control) {
        control.epoch += 1;
        control.state = ConnectionState::Connecting;

        let cancel = CancellationToken::new();
        control.active = Some(cancel.clone());
        self.publish(control);

        let shared = Arc::clone(self);
        let epoch = control.epoch;
        tokio::spawn(async move {
            shared.run_link(epoch, cancel).await;
        });
    }

    fn stop(&self) {
        let mut control = self.lock();
        control.epoch += 1;

        if let Some(timer) = control.pending_retry.take() {
            timer.cancel();
        }
        if let Some(active) = control.active.take() {
            active.cancel();
        }

        if control.state != ConnectionState::Disconnected {
            info!(state = ?control.state, "Disconnecting from timing feed");
        }
        control.state = ConnectionState::Disconnected;
        control.retry_count = 0;
        self.publish(&control);
    }

    /// Open, handshake, then pump frames until the link closes or is cancelled.
    async fn run_link(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = self.connector.open(&self.options.endpoint) => opened,
        };

        let mut link = match opened {
            Ok(link) => link,
            Err(e) => {
                warn!(endpoint = %self.options.endpoint, error = %e, "Feed open failed");
                self.record_error(epoch, &e);
                self.connection_lost(epoch);
                return;
            }
        };

        if !self.mark_connected(epoch) {
            link.close().await;
            return;
        }

        if let Err(e) = link.send(&self.options.handshake).await {
            warn!(error = %e, "Feed handshake failed");
            self.record_error(epoch, &e);
        }

        let mut decoder = FrameDecoder::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    link.close().await;
                    debug!(accepted = decoder.accepted(), rejected = decoder.rejected(), "Feed link closed on request");
                    return;
                }
                event = link.next_event() => event,
            };

            match event {
                LinkEvent::Frame(raw) => match decoder.ingest(&raw) {
                    Ok(snapshot) => {
                        trace!(drivers = snapshot.active_drivers, "Snapshot decoded");
                        if self.is_current(epoch) {
                            self.snapshot_tx.send_replace(Some(snapshot));
                        }
                    }
                    Err(failure) => {
                        debug!(error = %failure, bytes = raw.len(), "Feed frame skipped");
                    }
                },
                LinkEvent::Error(e) => {
                    warn!(error = %e, "Feed link error");
                    self.record_error(epoch, &e);
                }
                LinkEvent::Closed => {
                    debug!(accepted = decoder.accepted(), rejected = decoder.rejected(), "Feed link closed by relay");
                    self.connection_lost(epoch);
                    return;
                }
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    fn mark_connected(&self, epoch: u64) -> bool {
        let mut control = self.lock();
        if control.epoch != epoch || control.state != ConnectionState::Connecting {
            return false;
        }

        control.state = ConnectionState::Connected;
        control.retry_count = 0;
        control.last_error = None;
        self.publish(&control);
        info!(endpoint = %self.options.endpoint, "Timing feed connected");
        true
    }

    fn record_error(&self, epoch: u64, error: &KartwallError) {
        let mut control = self.lock();
        if control.epoch != epoch {
            return;
        }
        control.last_error = Some(error.to_string());
        self.publish(&control);
    }

    /// The single place a retry gets scheduled.
    fn connection_lost(self: &Arc<Self>, epoch: u64) {
        let mut control = self.lock();
        if control.epoch != epoch || control.state == ConnectionState::Disconnected {
            return;
        }

        control.active = None;
        let delay = self.options.backoff.delay_for(control.retry_count);
        control.retry_count = control.retry_count.saturating_add(1);
        control.state = ConnectionState::Reconnecting;

        let timer = CancellationToken::new();
        control.pending_retry = Some(timer.clone());
        self.publish(&control);

        warn!(
            retry_count = control.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Timing feed lost, scheduling reconnect"
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => shared.retry_due(&timer),
            }
        });
    }

    fn retry_due(self: &Arc<Self>, timer: &CancellationToken) {
        let mut control = self.lock();
        if timer.is_cancelled() || control.state != ConnectionState::Reconnecting {
            return;
        }
        control.pending_retry = None;
        debug!(retry_count = control.retry_count, "Retry timer fired");
        self.begin_attempt(&mut control);
    }
}
