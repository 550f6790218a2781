//! Live fan-out of ingested readings to WebSocket subscribers.
//!
//! Publishing only enqueues onto a bounded dispatch queue; a separate task
//! copies each event to the matching subscribers with `try_send`, so a slow
//! or vanished subscriber never holds up an ingest path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ALL_MACHINES: &str = "all_machines";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Machine(String),
    AllMachines,
}

impl Channel {
    pub fn machine(machine_id: impl ToString) -> Self {
        Channel::Machine(machine_id.to_string())
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Machine(id) => format!("machine_{id}"),
            Channel::AllMachines => ALL_MACHINES.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDataEvent {
    pub machine_id: Uuid,
    pub sensor_type: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    SensorData(SensorDataEvent),
}

pub type SubscriberId = u64;

struct Subscriber {
    tx: mpsc::Sender<Arc<LiveEvent>>,
    channels: HashSet<Channel>,
}

struct Dispatch {
    channels: Vec<Channel>,
    event: Arc<LiveEvent>,
}

struct Inner {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_tx: mpsc::Sender<Dispatch>,
    queue_rx: Mutex<Option<mpsc::Receiver<Dispatch>>>,
    subscriber_buffer: usize,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize, subscriber_buffer: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                subscriber_buffer: subscriber_buffer.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a live connection with no channels joined yet.
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<Arc<LiveEvent>>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);
        self.write().insert(
            id,
            Subscriber {
                tx,
                channels: HashSet::new(),
            },
        );
        debug!(subscriber = id, "live subscriber connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: SubscriberId) {
        if self.write().remove(&id).is_some() {
            debug!(subscriber = id, "live subscriber disconnected");
        }
    }

    /// Returns false when the subscriber is unknown.
    pub fn join(&self, id: SubscriberId, channel: Channel) -> bool {
        match self.write().get_mut(&id) {
            Some(subscriber) => {
                subscriber.channels.insert(channel);
                true
            }
            None => false,
        }
    }

    pub fn leave(&self, id: SubscriberId, channel: &Channel) {
        if let Some(subscriber) = self.write().get_mut(&id) {
            subscriber.channels.remove(channel);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, channels: Vec<Channel>, event: LiveEvent) -> bool {
        let dispatch = Dispatch {
            channels,
            event: Arc::new(event),
        };
        match self.inner.queue_tx.try_send(dispatch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("broadcast queue full; dropping live event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("broadcast dispatcher stopped; dropping live event");
                false
            }
        }
    }

    /// Publishes a reading on the machine's channel and the global channel.
    /// Never blocks; returns whether the event was queued.
    pub fn broadcast(&self, event: SensorDataEvent) -> bool {
        let channels = vec![Channel::machine(event.machine_id), Channel::AllMachines];
        self.enqueue(channels, LiveEvent::SensorData(event))
    }

    /// Delivers one event per channel: a subscriber that joined both the
    /// machine channel and the global one receives two copies.
    fn deliver(&self, dispatch: &Dispatch) {
        let mut closed = Vec::new();
        {
            let subscribers = self.read();
            for channel in &dispatch.channels {
                for (id, subscriber) in subscribers.iter() {
                    if !subscriber.channels.contains(channel) || closed.contains(id) {
                        continue;
                    }
                    match subscriber.tx.try_send(dispatch.event.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(subscriber = id, channel = %channel.name(), "subscriber lagging; event dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// Starts the dispatcher. Only the first call spawns a task; later
    /// calls return `None`. Stopping it drops every subscriber, which ends
    /// their receive streams.
    pub fn start(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        let broadcaster = self.clone();
        Some(tokio::spawn(async move {
            info!("live broadcaster started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => {
                        let Some(dispatch) = next else { break };
                        broadcaster.deliver(&dispatch);
                    }
                }
            }
            broadcaster.write().clear();
            info!("live broadcaster stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn reading(machine_id: Uuid) -> SensorDataEvent {
        SensorDataEvent {
            machine_id,
            sensor_type: "Temperature".to_string(),
            location: "Plant A".to_string(),
            timestamp: Utc::now(),
            temperature: Some(71.5),
            pressure: None,
            speed: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Arc<LiveEvent>>) -> Option<Arc<LiveEvent>> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    #[test]
    fn channel_names_follow_room_convention() {
        assert_eq!(Channel::machine("abc").name(), "machine_abc");
        assert_eq!(Channel::AllMachines.name(), "all_machines");
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let machine = Uuid::new_v4();
        let value = serde_json::to_value(LiveEvent::SensorData(reading(machine))).unwrap();
        assert_eq!(value["event"], "sensor_data");
        assert_eq!(value["data"]["machine_id"], machine.to_string());
        assert_eq!(value["data"]["temperature"], 71.5);
    }

    #[tokio::test]
    async fn each_joined_channel_delivers_its_own_copy() {
        let broadcaster = Broadcaster::new(16, 8);
        let cancel = CancellationToken::new();
        let handle = broadcaster.start(cancel.clone()).unwrap();
        assert!(broadcaster.start(cancel.clone()).is_none());

        let machine = Uuid::new_v4();
        let (scoped, mut scoped_rx) = broadcaster.connect();
        let (global, mut global_rx) = broadcaster.connect();
        let (both, mut both_rx) = broadcaster.connect();
        let (_idle, mut idle_rx) = broadcaster.connect();

        assert!(broadcaster.join(scoped, Channel::machine(machine)));
        assert!(broadcaster.join(global, Channel::AllMachines));
        broadcaster.join(both, Channel::machine(machine));
        broadcaster.join(both, Channel::machine(machine));
        broadcaster.join(both, Channel::AllMachines);

        assert!(broadcaster.broadcast(reading(machine)));
        assert!(broadcaster.broadcast(reading(Uuid::new_v4())));

        assert!(next(&mut scoped_rx).await.is_some());
        assert!(next(&mut scoped_rx).await.is_none());
        assert!(next(&mut global_rx).await.is_some());
        assert!(next(&mut global_rx).await.is_some());
        // two copies of the first reading, one of the second
        assert!(next(&mut both_rx).await.is_some());
        assert!(next(&mut both_rx).await.is_some());
        assert!(next(&mut both_rx).await.is_some());
        assert!(next(&mut both_rx).await.is_none());
        assert!(next(&mut idle_rx).await.is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn slow_and_closed_subscribers_never_block_publisher() {
        let broadcaster = Broadcaster::new(64, 1);
        let cancel = CancellationToken::new();
        let handle = broadcaster.start(cancel.clone()).unwrap();

        let (slow, mut slow_rx) = broadcaster.connect();
        broadcaster.join(slow, Channel::AllMachines);
        let (gone, gone_rx) = broadcaster.connect();
        broadcaster.join(gone, Channel::AllMachines);
        drop(gone_rx);

        for _ in 0..10 {
            broadcaster.broadcast(reading(Uuid::new_v4()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(next(&mut slow_rx).await.is_some());
        assert!(broadcaster.dropped_events() >= 1);
        assert_eq!(broadcaster.subscriber_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn leave_and_join_on_unknown_subscriber_are_harmless() {
        let broadcaster = Broadcaster::new(4, 4);
        broadcaster.leave(42, &Channel::AllMachines);
        assert!(!broadcaster.join(42, Channel::AllMachines));
        let (id, _rx) = broadcaster.connect();
        broadcaster.leave(id, &Channel::machine("never-joined"));
        broadcaster.disconnect(id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
