use log::{debug, error, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::utils::error::BridgeError;

/// Drives independently ticked polling loops.
///
/// Every loop runs Idle -> Polling -> Success | RecoverableFailure |
/// Cancelled. A recoverable fault skips that loop's cycle; any other fault
/// terminates that loop alone. No loop ever blocks another; a slow source
/// only delays its own next tick.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    loops: JoinSet<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            loops: JoinSet::new(),
        }
    }

    /// Watch side of the shared shutdown flag, for collaborators that need
    /// to stop alongside the loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawn a polling loop with its own tick interval. The body factory is
    /// invoked once per tick; ticks within one loop are strictly
    /// sequential, across loops there is no ordering.
    pub fn spawn_loop<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send,
    {
        let name = name.into();
        let mut shutdown = self.shutdown.subscribe();

        info!("⏱️  Starting poll loop '{}' every {:?}", name, interval);

        self.loops.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("🛑 Poll loop '{}' cancelled", name);
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Flag may have flipped while this tick was pending
                        if *shutdown.borrow() {
                            info!("🛑 Poll loop '{}' cancelled", name);
                            break;
                        }

                        match body().await {
                            Ok(()) => debug!("✅ Poll loop '{}' tick done", name),
                            Err(e) if e.is_recoverable() => {
                                warn!("⚠️  Poll loop '{}' skipping this cycle: {}", name, e);
                            }
                            Err(e) => {
                                error!("❌ Poll loop '{}' hit a fatal error, terminating: {}", name, e);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Flip the shutdown flag and wait for every loop to terminate.
    pub async fn shutdown(&mut self) {
        info!("🛑 Shutting down {} poll loop(s)", self.loops.len());
        let _ = self.shutdown.send(true);

        while let Some(joined) = self.loops.join_next().await {
            if let Err(e) = joined {
                error!("❌ Poll loop task ended abnormally: {}", e);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_loop_ticks_repeatedly() {
        let mut scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.spawn_loop("counter", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;

        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_recoverable_failure_skips_cycle_and_continues() {
        let mut scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.spawn_loop("flaky", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err(BridgeError::Timeout)
                } else {
                    Ok(())
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;

        // Failures never stopped the ticking
        assert!(count.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_fatal_error_terminates_only_that_loop() {
        let mut scheduler = Scheduler::new();
        let fatal_count = Arc::new(AtomicUsize::new(0));
        let healthy_count = Arc::new(AtomicUsize::new(0));

        let c = fatal_count.clone();
        scheduler.spawn_loop("fatal", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::ConfigError("broken".to_string()))
            }
        });

        let c = healthy_count.clone();
        scheduler.spawn_loop("healthy", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;

        assert_eq!(fatal_count.load(Ordering::SeqCst), 1);
        assert!(healthy_count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops_promptly() {
        let mut scheduler = Scheduler::new();
        scheduler.spawn_loop("slow-interval", Duration::from_secs(3600), || async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = std::time::Instant::now();
        scheduler.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
