//! Hub session manager: an authenticated WebSocket client that multiplexes
//! request/response commands over numbered frames, subscribes to state-change
//! events, and reconnects with bounded backoff when the socket drops.

pub mod protocol;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use protocol::{
    auth_frame, command_frame, subscribe_state_changes_frame, HubFrame, StateChange,
};

pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);
const MAX_BACKOFF: Duration = Duration::from_millis(30_000);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Events emitted to the orchestrator.
#[derive(Debug)]
pub enum HubEvent {
    Authenticated { ha_version: Option<String> },
    AuthFailed { message: String },
    StateChanged(StateChange),
    Disconnected,
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid hub url `{0}`")]
    InvalidUrl(String),
    #[error("not connected to the hub")]
    NotConnected,
    #[error("command timeout")]
    Timeout,
    #[error("disconnected before the hub replied")]
    Disconnected,
    #[error("{0}")]
    Hub(String),
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub ws_url: String,
    pub token: String,
}

impl HubSettings {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, HubError> {
        Ok(Self {
            ws_url: hub_ws_url(base_url)?,
            token: token.into(),
        })
    }
}

/// Derive the hub's WebSocket endpoint from its base URL: swap the scheme,
/// then append `/websocket` for supervisor-style embedded endpoints and
/// `/api/websocket` everywhere else.
pub fn hub_ws_url(base_url: &str) -> Result<String, HubError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(HubError::InvalidUrl(base_url.to_string()));
    };
    if ws_base.contains("supervisor/core") {
        Ok(format!("{ws_base}/websocket"))
    } else {
        Ok(format!("{ws_base}/api/websocket"))
    }
}

enum HubRequest {
    Rpc {
        command: String,
        data: Option<Value>,
        reply: oneshot::Sender<Result<Value, HubError>>,
    },
    Disconnect,
}

/// Cloneable handle over the session task. RPCs are relayed to the task that
/// owns the socket, so there is exactly one writer and the request-id counter
/// never races.
#[derive(Clone)]
pub struct HubClient {
    request_tx: mpsc::UnboundedSender<HubRequest>,
}

impl HubClient {
    /// Spawn the session task. Events (authentication, state changes,
    /// disconnects) arrive on the returned receiver.
    pub fn spawn(settings: HubSettings) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(settings, request_rx, event_tx));
        (Self { request_tx }, event_rx)
    }

    /// Issue a hub command and wait for its numbered result frame.
    pub async fn send_command(
        &self,
        command: &str,
        data: Option<Value>,
    ) -> Result<Value, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(HubRequest::Rpc {
                command: command.to_string(),
                data,
                reply: reply_tx,
            })
            .map_err(|_| HubError::NotConnected)?;
        reply_rx.await.map_err(|_| HubError::Disconnected)?
    }

    pub async fn get_config(&self) -> Result<Value, HubError> {
        self.send_command("get_config", None).await
    }

    pub async fn get_areas(&self) -> Result<Value, HubError> {
        self.send_command("config/area_registry/list", None).await
    }

    pub async fn get_devices(&self) -> Result<Value, HubError> {
        self.send_command("config/device_registry/list", None).await
    }

    pub async fn get_entities(&self) -> Result<Value, HubError> {
        self.send_command("config/entity_registry/list", None).await
    }

    pub async fn get_states(&self) -> Result<Value, HubError> {
        self.send_command("get_states", None).await
    }

    pub async fn get_services(&self) -> Result<Value, HubError> {
        self.send_command("get_services", None).await
    }

    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
    ) -> Result<Value, HubError> {
        self.send_command(
            "call_service",
            Some(json!({
                "domain": domain,
                "service": service,
                "service_data": service_data,
            })),
        )
        .await
    }

    /// Stop reconnecting, close the socket, and fail outstanding waiters.
    pub fn disconnect(&self) {
        let _ = self.request_tx.send(HubRequest::Disconnect);
    }
}

/// The RPC surface other components consume. Kept behind a trait so the
/// full-sync collector and the command executor can be exercised against a
/// scripted hub in tests.
#[async_trait]
pub trait HubApi: Send + Sync {
    async fn get_config(&self) -> Result<Value, HubError>;
    async fn get_areas(&self) -> Result<Value, HubError>;
    async fn get_devices(&self) -> Result<Value, HubError>;
    async fn get_entities(&self) -> Result<Value, HubError>;
    async fn get_states(&self) -> Result<Value, HubError>;
    async fn get_services(&self) -> Result<Value, HubError>;
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
    ) -> Result<Value, HubError>;
}

#[async_trait]
impl HubApi for HubClient {
    async fn get_config(&self) -> Result<Value, HubError> {
        HubClient::get_config(self).await
    }

    async fn get_areas(&self) -> Result<Value, HubError> {
        HubClient::get_areas(self).await
    }

    async fn get_devices(&self) -> Result<Value, HubError> {
        HubClient::get_devices(self).await
    }

    async fn get_entities(&self) -> Result<Value, HubError> {
        HubClient::get_entities(self).await
    }

    async fn get_states(&self) -> Result<Value, HubError> {
        HubClient::get_states(self).await
    }

    async fn get_services(&self) -> Result<Value, HubError> {
        HubClient::get_services(self).await
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
    ) -> Result<Value, HubError> {
        HubClient::call_service(self, domain, service, service_data).await
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Value, HubError>>,
    deadline: Instant,
}

struct SessionState {
    next_id: u64,
    authenticated: bool,
    subscribe_request_id: Option<u64>,
    subscription_id: Option<u64>,
    waiters: HashMap<u64, PendingRequest>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            next_id: 1,
            authenticated: false,
            subscribe_request_id: None,
            subscription_id: None,
            waiters: HashMap::new(),
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn fail_waiters(&mut self) {
        for (_, pending) in self.waiters.drain() {
            let _ = pending.reply.send(Err(HubError::Disconnected));
        }
    }
}

enum SessionEnd {
    Shutdown,
    AuthFailed,
    Dropped,
}

async fn run(
    settings: HubSettings,
    mut request_rx: mpsc::UnboundedReceiver<HubRequest>,
    event_tx: mpsc::UnboundedSender<HubEvent>,
) {
    let mut attempts: u32 = 0;
    loop {
        match run_session(&settings, &mut request_rx, &event_tx, &mut attempts).await {
            SessionEnd::Shutdown => break,
            SessionEnd::AuthFailed => break,
            SessionEnd::Dropped => {
                let _ = event_tx.send(HubEvent::Disconnected);
                attempts += 1;
                if attempts > MAX_RECONNECT_ATTEMPTS {
                    warn!(
                        target: "bridge::hub",
                        attempts = attempts - 1,
                        "exhausted hub reconnect attempts; session failed"
                    );
                    let _ = event_tx.send(HubEvent::Error {
                        message: "exhausted hub reconnect attempts".into(),
                    });
                    break;
                }
                let delay = backoff_delay(attempts);
                info!(
                    target: "bridge::hub",
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "hub disconnected; reconnecting"
                );
                if !sleep_unless_disconnected(&mut request_rx, delay).await {
                    break;
                }
            }
        }
    }
    // Anything still queued can never be served.
    while let Ok(request) = request_rx.try_recv() {
        if let HubRequest::Rpc { reply, .. } = request {
            let _ = reply.send(Err(HubError::NotConnected));
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): 1 s doubling per
/// attempt, capped at 30 s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = INITIAL_BACKOFF * 2u32.pow(exp);
    delay.min(MAX_BACKOFF)
}

/// Sleep out the backoff window while still answering requests. Returns
/// false when a disconnect arrived and the run loop should stop.
async fn sleep_unless_disconnected(
    request_rx: &mut mpsc::UnboundedReceiver<HubRequest>,
    delay: Duration,
) -> bool {
    let wake = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => return true,
            request = request_rx.recv() => match request {
                Some(HubRequest::Rpc { reply, .. }) => {
                    let _ = reply.send(Err(HubError::NotConnected));
                }
                Some(HubRequest::Disconnect) | None => return false,
            },
        }
    }
}

async fn run_session(
    settings: &HubSettings,
    request_rx: &mut mpsc::UnboundedReceiver<HubRequest>,
    event_tx: &mpsc::UnboundedSender<HubEvent>,
    attempts: &mut u32,
) -> SessionEnd {
    let (ws_stream, _) = match connect_async(&settings.ws_url).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(target: "bridge::hub", error = %err, url = %settings.ws_url, "hub connect failed");
            return SessionEnd::Dropped;
        }
    };
    debug!(target: "bridge::hub", url = %settings.ws_url, "hub socket open");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut session = SessionState::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match handle_frame(&text, settings, &mut session, &mut ws_tx, event_tx, attempts).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::AuthFailed => {
                            session.fail_waiters();
                            return SessionEnd::AuthFailed;
                        }
                        FrameOutcome::Dropped => {
                            session.fail_waiters();
                            return SessionEnd::Dropped;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(target: "bridge::hub", "hub socket closed");
                    session.fail_waiters();
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "bridge::hub", error = %err, "hub socket error");
                    session.fail_waiters();
                    return SessionEnd::Dropped;
                }
            },
            request = request_rx.recv() => match request {
                Some(HubRequest::Rpc { command, data, reply }) => {
                    if !session.authenticated {
                        let _ = reply.send(Err(HubError::NotConnected));
                        continue;
                    }
                    let id = session.take_id();
                    let frame = command_frame(id, &command, data);
                    session.waiters.insert(id, PendingRequest {
                        reply,
                        deadline: Instant::now() + RPC_TIMEOUT,
                    });
                    if let Err(err) = ws_tx.send(Message::Text(frame.to_string())).await {
                        warn!(target: "bridge::hub", error = %err, command = %command, "hub write failed");
                        session.fail_waiters();
                        return SessionEnd::Dropped;
                    }
                }
                Some(HubRequest::Disconnect) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    session.fail_waiters();
                    return SessionEnd::Shutdown;
                }
            },
            _ = sweep.tick() => {
                expire_waiters(&mut session);
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    AuthFailed,
    Dropped,
}

async fn handle_frame<S>(
    text: &str,
    settings: &HubSettings,
    session: &mut SessionState,
    ws_tx: &mut S,
    event_tx: &mpsc::UnboundedSender<HubEvent>,
    attempts: &mut u32,
) -> FrameOutcome
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = match HubFrame::decode(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            trace!(target: "bridge::hub", "ignoring unknown hub frame");
            return FrameOutcome::Continue;
        }
        Err(err) => {
            debug!(target: "bridge::hub", error = %err, "undecodable hub frame dropped");
            return FrameOutcome::Continue;
        }
    };

    match frame {
        HubFrame::AuthRequired { .. } => {
            let auth = auth_frame(&settings.token);
            if let Err(err) = ws_tx.send(Message::Text(auth.to_string())).await {
                warn!(target: "bridge::hub", error = %err, "failed to send hub auth");
                return FrameOutcome::Dropped;
            }
            FrameOutcome::Continue
        }
        HubFrame::AuthOk { ha_version } => {
            session.authenticated = true;
            *attempts = 0;
            info!(target: "bridge::hub", ha_version = ?ha_version, "hub session authenticated");
            let _ = event_tx.send(HubEvent::Authenticated { ha_version });

            let id = session.take_id();
            session.subscribe_request_id = Some(id);
            let subscribe = subscribe_state_changes_frame(id);
            if let Err(err) = ws_tx.send(Message::Text(subscribe.to_string())).await {
                warn!(target: "bridge::hub", error = %err, "failed to subscribe to state changes");
                return FrameOutcome::Dropped;
            }
            FrameOutcome::Continue
        }
        HubFrame::AuthInvalid { message } => {
            let message = message.unwrap_or_else(|| "hub rejected the access token".into());
            warn!(target: "bridge::hub", %message, "hub authentication failed");
            let _ = event_tx.send(HubEvent::AuthFailed { message });
            FrameOutcome::AuthFailed
        }
        HubFrame::Result {
            id,
            success,
            result,
            error,
        } => {
            if session.subscribe_request_id == Some(id) {
                if success {
                    session.subscription_id = Some(id);
                    debug!(target: "bridge::hub", subscription_id = id, "state change subscription active");
                } else {
                    let message = error.map(|e| e.message()).unwrap_or_default();
                    warn!(target: "bridge::hub", %message, "state change subscription rejected");
                    let _ = event_tx.send(HubEvent::Error {
                        message: format!("state change subscription rejected: {message}"),
                    });
                }
                return FrameOutcome::Continue;
            }
            match session.waiters.remove(&id) {
                Some(pending) => {
                    let outcome = if success {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        let message = error
                            .map(|e| e.message())
                            .unwrap_or_else(|| "hub command failed".into());
                        Err(HubError::Hub(message))
                    };
                    let _ = pending.reply.send(outcome);
                }
                None => {
                    trace!(target: "bridge::hub", id, "late hub result dropped");
                }
            }
            FrameOutcome::Continue
        }
        HubFrame::Event { id: _, event } => {
            if let Some(change) = StateChange::from_event(event) {
                let _ = event_tx.send(HubEvent::StateChanged(change));
            }
            FrameOutcome::Continue
        }
        HubFrame::Pong { .. } => FrameOutcome::Continue,
    }
}

fn expire_waiters(session: &mut SessionState) {
    let now = Instant::now();
    let expired: Vec<u64> = session
        .waiters
        .iter()
        .filter(|(_, pending)| pending.deadline <= now)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        if let Some(pending) = session.waiters.remove(&id) {
            debug!(target: "bridge::hub", id, "hub command timed out");
            let _ = pending.reply.send(Err(HubError::Timeout));
        }
    }
}
