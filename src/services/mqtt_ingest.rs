use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, Incoming, LastWill, MqttOptions, Publish, QoS, SubAck,
    SubscribeReasonCode,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MqttSettings;
use crate::services::broadcaster::{Broadcaster, SensorDataEvent};
use crate::services::resolver::{MachineResolver, ResolveError};
use crate::telemetry::{validate_broker_message, RawBrokerMessage, ValidationError};
use crate::tsdb::{StoreError, TimeSeriesPoint, TimeSeriesStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connected,
    Subscribed,
}

impl ListenerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Connected => "connected",
            ListenerState::Subscribed => "subscribed",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ListenerState::Connected,
            2 => ListenerState::Subscribed,
            _ => ListenerState::Disconnected,
        }
    }
}

/// Connection state and counters shared between the listener task and the
/// health endpoint.
#[derive(Debug, Default)]
pub struct IngestMonitor {
    state: AtomicU8,
    stored: AtomicU64,
    dropped: AtomicU64,
}

impl IngestMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ListenerState) {
        let previous = ListenerState::from_u8(self.state.swap(state as u8, Ordering::Relaxed));
        if previous != state {
            tracing::info!(from = previous.as_str(), to = state.as_str(), "mqtt listener state");
        }
    }

    /// Readings written since start.
    pub fn message_count(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DropReason {
    #[error("topic {0:?} does not have 5 segments")]
    Topic(String),

    #[error("payload is not valid JSON: {0}")]
    Payload(String),

    #[error("invalid reading: {0}")]
    Invalid(#[from] ValidationError),

    #[error("unknown machine {0}")]
    UnknownMachine(String),

    #[error("machine lookup failed: {0}")]
    Directory(String),

    #[error("time-series write failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum MessageOutcome {
    Stored,
    Dropped(DropReason),
}

/// `realm/{realm}/device/{machine}/telemetry` yields `{machine}`.
pub fn machine_id_from_topic(topic: &str) -> Option<&str> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != 5 {
        return None;
    }
    Some(segments[3])
}

/// Processes one broker message end to end. Never retries; every failure
/// is logged and the message is dropped.
pub struct TelemetryHandler {
    resolver: MachineResolver,
    store: Arc<dyn TimeSeriesStore>,
    broadcaster: Broadcaster,
    monitor: Arc<IngestMonitor>,
}

impl TelemetryHandler {
    pub fn new(
        resolver: MachineResolver,
        store: Arc<dyn TimeSeriesStore>,
        broadcaster: Broadcaster,
        monitor: Arc<IngestMonitor>,
    ) -> Self {
        Self {
            resolver,
            store,
            broadcaster,
            monitor,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        match self.process(topic, payload).await {
            Ok(()) => MessageOutcome::Stored,
            Err(reason) => {
                self.monitor.dropped.fetch_add(1, Ordering::Relaxed);
                match &reason {
                    DropReason::Directory(_) | DropReason::Store(_) => {
                        tracing::error!(topic, error = %reason, "dropping broker message")
                    }
                    _ => tracing::warn!(topic, error = %reason, "dropping broker message"),
                }
                MessageOutcome::Dropped(reason)
            }
        }
    }

    async fn process(&self, topic: &str, payload: &[u8]) -> Result<(), DropReason> {
        let raw_id =
            machine_id_from_topic(topic).ok_or_else(|| DropReason::Topic(topic.to_string()))?;
        let raw: RawBrokerMessage =
            serde_json::from_slice(payload).map_err(|err| DropReason::Payload(err.to_string()))?;
        let message = validate_broker_message(&raw)?;

        // A non-UUID id cannot be in the directory.
        let machine_id =
            Uuid::parse_str(raw_id).map_err(|_| DropReason::UnknownMachine(raw_id.to_string()))?;
        let machine = self.resolver.resolve(machine_id).await.map_err(|err| match err {
            ResolveError::NotFound(id) => DropReason::UnknownMachine(id.to_string()),
            ResolveError::Unavailable(err) => DropReason::Directory(err.to_string()),
        })?;

        let point = TimeSeriesPoint::from_reading(
            machine_id,
            &message.sensor_type,
            &machine.location,
            &message.reading,
        );
        self.store.write_point(&point).await?;
        self.monitor.stored.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%machine_id, sensor_type = %message.sensor_type, "stored broker reading");

        self.broadcaster.broadcast(SensorDataEvent {
            machine_id,
            sensor_type: message.sensor_type,
            location: machine.location,
            timestamp: message.reading.timestamp,
            temperature: message.reading.temperature,
            pressure: message.reading.pressure,
            speed: message.reading.speed,
        });
        Ok(())
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn suback_accepted(ack: &SubAck) -> bool {
    !ack.return_codes.is_empty()
        && ack
            .return_codes
            .iter()
            .all(|code| !matches!(code, SubscribeReasonCode::Failure))
}

fn presence_payload(status: &str) -> Vec<u8> {
    json!({ "status": status, "timestamp": Utc::now().to_rfc3339() })
        .to_string()
        .into_bytes()
}

/// Runs one publish on its own task. The permit is taken inside the task so
/// the event loop keeps polling while every handler slot is busy.
fn spawn_handler(
    handler: Arc<TelemetryHandler>,
    in_flight: Arc<Semaphore>,
    publish: Publish,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(_permit) = in_flight.acquire_owned().await else {
            tracing::debug!(topic = %publish.topic, "listener stopping; message not handled");
            return;
        };
        handler.handle(&publish.topic, &publish.payload).await;
    })
}

pub struct MqttIngestService {
    settings: MqttSettings,
    handler: Arc<TelemetryHandler>,
    monitor: Arc<IngestMonitor>,
}

impl MqttIngestService {
    pub fn new(
        settings: MqttSettings,
        handler: Arc<TelemetryHandler>,
        monitor: Arc<IngestMonitor>,
    ) -> Self {
        Self {
            settings,
            handler,
            monitor,
        }
    }

    fn options(&self) -> MqttOptions {
        let settings = &self.settings;
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.broker.clone(), settings.port);
        options.set_keep_alive(settings.keepalive);
        options.set_clean_session(true);
        if let Some(username) = &settings.username {
            options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            settings.status_topic.clone(),
            presence_payload("offline"),
            QoS::AtLeastOnce,
            true,
        ));
        options
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (client, mut eventloop) = AsyncClient::new(self.options(), 32);
            let qos = qos_from(self.settings.qos);
            let in_flight = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
            tracing::info!(
                broker = %self.settings.broker,
                port = self.settings.port,
                topic = %self.settings.topic,
                "mqtt ingest listener starting"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                                if ack.code != ConnectReturnCode::Success {
                                    tracing::warn!(code = ?ack.code, "mqtt connection refused");
                                    continue;
                                }
                                self.monitor.set_state(ListenerState::Connected);
                                if let Err(err) = client.try_subscribe(self.settings.topic.clone(), qos) {
                                    tracing::warn!(error = %err, "failed to request mqtt subscription");
                                }
                            }
                            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                                if !suback_accepted(&ack) {
                                    tracing::warn!(codes = ?ack.return_codes, "mqtt subscription rejected");
                                    continue;
                                }
                                self.monitor.set_state(ListenerState::Subscribed);
                                if let Err(err) = client.try_publish(
                                    self.settings.status_topic.clone(),
                                    QoS::AtLeastOnce,
                                    true,
                                    presence_payload("online"),
                                ) {
                                    tracing::warn!(error = %err, "failed to publish online status");
                                }
                            }
                            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                                spawn_handler(self.handler.clone(), in_flight.clone(), publish);
                            }
                            Ok(Event::Incoming(Incoming::Disconnect)) => {
                                self.monitor.set_state(ListenerState::Disconnected);
                            }
                            Ok(_) => {}
                            Err(err) => {
                                self.monitor.set_state(ListenerState::Disconnected);
                                tracing::warn!(error = %err, "mqtt connection dropped; reconnecting");
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                }
                            }
                        }
                    }
                }
            }

            in_flight.close();
            let _ = client.try_disconnect();
            self.monitor.set_state(ListenerState::Disconnected);
            tracing::info!("mqtt ingest listener stopped");
        })
    }
}
