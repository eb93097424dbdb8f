//! Keyed pub/sub connecting the poll loops to the output side.
//!
//! Two delivery modes: synchronous (the publisher fans out concurrently and
//! waits for every subscriber, where downstream ordering matters) and
//! detached (the publisher continues immediately; handler failures are
//! caught and logged, never propagated). Detached deliveries are tracked
//! tasks, joined with cancellation at shutdown so no background work leaks.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::devices::{StorageControlData, UnitSnapshots};
use crate::powerflow::Powerflow;
use crate::utils::error::BridgeError;

/// Delivery key. Subscribers register per topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    UnitSnapshots,
    UnitPowerflow,
    CumulatedPowerflow,
    StorageControl,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    UnitSnapshots(Arc<UnitSnapshots>),
    UnitPowerflow(Arc<Powerflow>),
    CumulatedPowerflow(Arc<Powerflow>),
    StorageControl(Arc<StorageControlData>),
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: BridgeEvent) -> Result<(), BridgeError>;
}

pub struct EventBus {
    subscribers: HashMap<Topic, Vec<Arc<dyn Subscriber>>>,
    detached: Mutex<JoinSet<()>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            detached: Mutex::new(JoinSet::new()),
        }
    }

    /// Register a subscriber. Only valid during setup, before the bus is
    /// shared with the poll loops.
    pub fn subscribe(&mut self, topic: Topic, subscriber: Arc<dyn Subscriber>) {
        info!("📬 Subscribed '{}' to {:?}", subscriber.name(), topic);
        self.subscribers.entry(topic).or_default().push(subscriber);
    }

    /// Deliver to all subscribers concurrently and wait for every one.
    /// Handler failures are logged; they do not abort the other deliveries.
    pub async fn publish_sync(&self, topic: Topic, event: BridgeEvent) {
        let Some(subscribers) = self.subscribers.get(&topic) else {
            debug!("📭 No subscribers for {:?}", topic);
            return;
        };

        let mut deliveries = JoinSet::new();
        for subscriber in subscribers {
            let subscriber = subscriber.clone();
            let event = event.clone();
            deliveries.spawn(async move {
                let name = subscriber.name().to_string();
                (name, subscriber.handle(event).await)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    error!("❌ Subscriber '{}' failed on {:?}: {}", name, topic, e)
                }
                Err(e) => error!("❌ Subscriber task panicked on {:?}: {}", topic, e),
            }
        }
    }

    /// Deliver without waiting. Each delivery runs as a tracked task owned
    /// by the bus; failures are caught and logged.
    pub async fn publish_detached(&self, topic: Topic, event: BridgeEvent) {
        let Some(subscribers) = self.subscribers.get(&topic) else {
            debug!("📭 No subscribers for {:?}", topic);
            return;
        };

        let mut detached = self.detached.lock().await;

        // Reap deliveries that already finished so the set stays small
        while detached.try_join_next().is_some() {}

        for subscriber in subscribers {
            let subscriber = subscriber.clone();
            let event = event.clone();
            detached.spawn(async move {
                if let Err(e) = subscriber.handle(event).await {
                    warn!("⚠️  Detached subscriber '{}' failed: {}", subscriber.name(), e);
                }
            });
        }
    }

    /// Cancel in-flight detached deliveries and await them all.
    pub async fn shutdown(&self) {
        let mut detached = self.detached.lock().await;
        let pending = detached.len();
        if pending > 0 {
            info!("🛑 Cancelling {} in-flight detached deliveries", pending);
        }

        detached.abort_all();
        while detached.join_next().await.is_some() {}
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::snapshots::{UnitIdentity, UnitRole};
    use crate::powerflow::{BatteryFlow, ConsumerFlow, GridFlow, InverterFlow};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn powerflow_event() -> BridgeEvent {
        BridgeEvent::UnitPowerflow(Arc::new(Powerflow {
            unit: UnitIdentity { index: 0, role: UnitRole::Leader, key: "leader".to_string() },
            timestamp: Utc::now(),
            inverter: InverterFlow::default(),
            grid: GridFlow::default(),
            battery: BatteryFlow::default(),
            consumer: ConsumerFlow::default(),
            suspect: false,
        }))
    }

    struct Counting {
        name: &'static str,
        count: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl Counting {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, count: AtomicUsize::new(0), delay: Duration::ZERO, fail: false })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self { name, count: AtomicUsize::new(0), delay, fail: false })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, count: AtomicUsize::new(0), delay: Duration::ZERO, fail: true })
        }
    }

    #[async_trait]
    impl Subscriber for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: BridgeEvent) -> Result<(), BridgeError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BridgeError::InvalidData("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_sync_delivery_waits_for_all() {
        let mut bus = EventBus::new();
        let fast = Counting::new("fast");
        let slow = Counting::slow("slow", Duration::from_millis(50));
        bus.subscribe(Topic::UnitPowerflow, fast.clone());
        bus.subscribe(Topic::UnitPowerflow, slow.clone());

        bus.publish_sync(Topic::UnitPowerflow, powerflow_event()).await;

        assert_eq!(fast.count.load(Ordering::SeqCst), 1);
        assert_eq!(slow.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delivery_is_keyed_by_topic() {
        let mut bus = EventBus::new();
        let powerflow_sub = Counting::new("powerflow");
        let storage_sub = Counting::new("storage");
        bus.subscribe(Topic::UnitPowerflow, powerflow_sub.clone());
        bus.subscribe(Topic::StorageControl, storage_sub.clone());

        bus.publish_sync(Topic::UnitPowerflow, powerflow_event()).await;

        assert_eq!(powerflow_sub.count.load(Ordering::SeqCst), 1);
        assert_eq!(storage_sub.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_failure_does_not_block_others() {
        let mut bus = EventBus::new();
        let failing = Counting::failing("failing");
        let healthy = Counting::new("healthy");
        bus.subscribe(Topic::UnitPowerflow, failing.clone());
        bus.subscribe(Topic::UnitPowerflow, healthy.clone());

        bus.publish_sync(Topic::UnitPowerflow, powerflow_event()).await;

        assert_eq!(failing.count.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detached_failure_never_reaches_publisher() {
        let mut bus = EventBus::new();
        bus.subscribe(Topic::UnitPowerflow, Counting::failing("failing"));

        // Returns immediately; the failure is swallowed by the task
        bus.publish_detached(Topic::UnitPowerflow, powerflow_event()).await;
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_detached_tasks() {
        let mut bus = EventBus::new();
        let stuck = Counting::slow("stuck", Duration::from_secs(3600));
        bus.subscribe(Topic::UnitPowerflow, stuck.clone());

        bus.publish_detached(Topic::UnitPowerflow, powerflow_event()).await;

        let start = std::time::Instant::now();
        bus.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(stuck.count.load(Ordering::SeqCst), 0);
    }
}
