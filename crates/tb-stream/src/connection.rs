use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tb_core::stream_msg::{FrameDecoder, FrameMode, DEFAULT_MAX_FRAME_BYTES};
use tb_core::{apply_batch, OrderedEntry, PatchOperation, Snapshot, StreamMsg};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::key::{stream_url, SubscriptionKey};
use crate::transport::{BoxTransport, Connector, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected,
    Closed,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting { .. } => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {}ms)", delay.as_millis())
            }
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug)]
pub struct StreamState<T> {
    pub key: Option<SubscriptionKey>,
    pub status: ConnectionStatus,
    pub snapshot: Snapshot<T>,
    pub error: Option<String>,
    pub ready: bool,
    pub finished: bool,
    pub generation: u64,
    pub frames_applied: u64,
    pub frames_dropped: u64,
}

impl<T> Clone for StreamState<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            status: self.status,
            snapshot: self.snapshot.clone(),
            error: self.error.clone(),
            ready: self.ready,
            finished: self.finished,
            generation: self.generation,
            frames_applied: self.frames_applied,
            frames_dropped: self.frames_dropped,
        }
    }
}

impl<T> StreamState<T> {
    fn idle() -> Self {
        Self {
            key: None,
            status: ConnectionStatus::Idle,
            snapshot: Snapshot::empty(""),
            error: None,
            ready: false,
            finished: false,
            generation: 0,
            frames_applied: 0,
            frames_dropped: 0,
        }
    }

    fn connecting(key: SubscriptionKey, generation: u64) -> Self {
        Self {
            snapshot: Snapshot::empty(key.collection()),
            key: Some(key),
            status: ConnectionStatus::Connecting,
            generation,
            ..Self::idle()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub base_url: Url,
    pub policy: ReconnectPolicy,
    pub max_frame_bytes: usize,
}

impl ConnectionConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            policy: ReconnectPolicy::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

struct ActiveSubscription {
    key: SubscriptionKey,
    shutdown: oneshot::Sender<()>,
}

/// Drivers write state only while their generation is current.
pub struct ConnectionManager<T> {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state_tx: Arc<watch::Sender<StreamState<T>>>,
    active: Option<ActiveSubscription>,
    generation: u64,
}

impl<T> ConnectionManager<T> {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(StreamState::idle());
        Self {
            config,
            connector,
            state_tx: Arc::new(state_tx),
            active: None,
            generation: 0,
        }
    }

    pub fn active_key(&self) -> Option<&SubscriptionKey> {
        self.active.as_ref().map(|active| &active.key)
    }

    pub fn watch(&self) -> watch::Receiver<StreamState<T>> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> StreamState<T> {
        self.state_tx.borrow().clone()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.state_tx.borrow().snapshot.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    pub fn error(&self) -> Option<String> {
        self.state_tx.borrow().error.clone()
    }

    pub fn disable(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.teardown();
        self.generation += 1;
        let generation = self.generation;
        self.state_tx.send_modify(|state| {
            state.generation = generation;
            state.status = ConnectionStatus::Closed;
        });
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(key = %active.key, "stream_teardown");
            let _ = active.shutdown.send(());
        }
    }
}

impl<T> ConnectionManager<T>
where
    T: DeserializeOwned + OrderedEntry + Send + Sync + 'static,
{
    pub fn subscribe(&mut self, key: SubscriptionKey) -> Result<(), StreamError> {
        if self.active_key() == Some(&key) {
            return Ok(());
        }
        let url = stream_url(&self.config.base_url, &key)?;
        self.teardown();
        self.generation += 1;
        let generation = self.generation;
        self.state_tx
            .send_replace(StreamState::connecting(key.clone(), generation));
        info!(key = %key, generation, "stream_subscribe");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            url,
            key: key.clone(),
            connector: Arc::clone(&self.connector),
            policy: self.config.policy,
            max_frame_bytes: self.config.max_frame_bytes,
            generation,
            state_tx: Arc::clone(&self.state_tx),
            shutdown: shutdown_rx,
        };
        tokio::spawn(driver.run());
        self.active = Some(ActiveSubscription {
            key,
            shutdown: shutdown_tx,
        });
        Ok(())
    }

    pub fn retry(&mut self) -> Result<(), StreamError> {
        let Some(key) = self.active_key().cloned() else {
            return Ok(());
        };
        self.teardown();
        self.subscribe(key)
    }
}

impl<T> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.disable();
    }
}

enum Exit {
    Shutdown,
    Stale,
    Closed { finished: bool },
    Abnormal(String),
}

struct Driver<T> {
    url: Url,
    key: SubscriptionKey,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    max_frame_bytes: usize,
    generation: u64,
    state_tx: Arc<watch::Sender<StreamState<T>>>,
    shutdown: oneshot::Receiver<()>,
}

impl<T> Driver<T>
where
    T: DeserializeOwned + OrderedEntry + Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if !self.update(|state| state.status = ConnectionStatus::Connecting) {
                return;
            }
            let connect = self.connector.connect(self.url.clone());
            let connected = tokio::select! {
                result = connect => result,
                _ = &mut self.shutdown => return,
            };

            let reason = match connected {
                Ok(mut transport) => match self.pump(&mut transport, &mut failures).await {
                    Exit::Shutdown | Exit::Stale => {
                        transport.close().await;
                        return;
                    }
                    Exit::Closed { finished } => {
                        transport.close().await;
                        info!(key = %self.key, finished, "stream_closed");
                        self.update(|state| {
                            state.status = ConnectionStatus::Closed;
                            state.finished = finished;
                        });
                        return;
                    }
                    Exit::Abnormal(reason) => reason,
                },
                Err(err) => {
                    warn!("stream_connect_error: {err}");
                    err.to_string()
                }
            };

            failures += 1;
            if self.policy.exhausted(failures) {
                warn!("stream_disconnected: key={} failures={failures}", self.key);
                self.update(|state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.error = Some(format!(
                        "disconnected after {failures} failed connection attempts: {reason}"
                    ));
                });
                return;
            }

            let delay = self.policy.delay_for_attempt(failures);
            debug!(key = %self.key, attempt = failures, ?delay, "stream_reconnect_scheduled");
            if !self.update(|state| {
                state.status = ConnectionStatus::Reconnecting {
                    attempt: failures,
                    delay,
                }
            }) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut self.shutdown => return,
            }
        }
    }

    async fn pump(&mut self, transport: &mut BoxTransport, failures: &mut u32) -> Exit {
        if !self.update(|state| {
            state.status = ConnectionStatus::Connected;
            state.error = None;
            state.ready = false;
        }) {
            return Exit::Stale;
        }
        info!(key = %self.key, generation = self.generation, "stream_connected");

        let mut decoder =
            FrameDecoder::new(self.key.mode(), self.key.collection(), self.max_frame_bytes);
        // Append streams replay from record 0 on every connect.
        let mut replaying = self.key.mode() == FrameMode::AppendRecords;
        loop {
            let event = tokio::select! {
                event = transport.next() => event,
                _ = &mut self.shutdown => return Exit::Shutdown,
            };
            match event {
                Some(Ok(TransportEvent::Text(text))) => {
                    let current = match decoder.decode(&text) {
                        Ok(StreamMsg::Patch(ops)) => {
                            *failures = 0;
                            self.apply(ops, std::mem::take(&mut replaying))
                        }
                        Ok(StreamMsg::Ready) => {
                            *failures = 0;
                            self.update(|state| state.ready = true)
                        }
                        Ok(StreamMsg::Finished) => return Exit::Closed { finished: true },
                        Err(err) => {
                            warn!("stream_decode_error: {err}");
                            self.update(|state| state.frames_dropped += 1)
                        }
                    };
                    if !current {
                        return Exit::Stale;
                    }
                }
                Some(Ok(TransportEvent::Closed { code, reason })) => {
                    let code = code.unwrap_or(CLOSE_ABNORMAL);
                    if code == CLOSE_NORMAL {
                        return Exit::Closed { finished: false };
                    }
                    warn!("stream_closed_abnormally: code={code} reason={reason}");
                    return Exit::Abnormal(format!("closed with code {code}"));
                }
                Some(Err(err)) => {
                    warn!("stream_read_error: {err}");
                    return Exit::Abnormal(err.to_string());
                }
                None => return Exit::Abnormal("connection dropped".to_string()),
            }
        }
    }

    fn apply(&self, ops: Vec<PatchOperation>, restart: bool) -> bool {
        let collection = self.key.collection();
        self.update(|state| {
            let current = std::mem::replace(&mut state.snapshot, Snapshot::empty(collection));
            let base = if restart {
                Snapshot::empty(collection)
            } else {
                current
            };
            state.snapshot = apply_batch(base, &ops);
            state.frames_applied += 1;
            state.ready = true;
        })
    }

    fn update(&self, change: impl FnOnce(&mut StreamState<T>)) -> bool {
        let generation = self.generation;
        let mut current = true;
        self.state_tx.send_if_modified(|state| {
            if state.generation != generation {
                current = false;
                return false;
            }
            change(state);
            true
        });
        current
    }
}
