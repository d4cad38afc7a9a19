//! Background reconciliation loop with an explicit start/stop lifecycle.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::reconciler::{OrderReconciler, ReconcileReport};

/// Latest completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// 1-based pass counter since the last `start()`
    pub pass: u64,
    pub report: ReconcileReport,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs [`OrderReconciler::reconcile_once`] on a fixed interval and on demand.
///
/// Instances are independent; nothing is process-global.
pub struct ReconcilerService {
    reconciler: Arc<OrderReconciler>,
    poll_interval: Duration,
    trigger: Arc<Notify>,
    passes: watch::Sender<PassSummary>,
    running: Mutex<Option<Running>>,
}

impl ReconcilerService {
    pub fn new(reconciler: Arc<OrderReconciler>, poll_interval: Duration) -> Self {
        let (passes, _) = watch::channel(PassSummary::default());
        Self {
            reconciler,
            poll_interval,
            trigger: Arc::new(Notify::new()),
            passes,
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("Reconciler service already running");
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let reconciler = self.reconciler.clone();
        let trigger = self.trigger.clone();
        let passes = self.passes.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pass = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => debug!("Reconciliation triggered"),
                }

                pass += 1;
                let report = reconciler.reconcile_once().await;
                passes.send_replace(PassSummary { pass, report });
            }

            info!(passes = pass, "Reconciler service stopped");
        });

        info!(poll_interval_ms = poll_interval.as_millis() as u64, "Reconciler service started");
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Signal the loop to stop and wait for the in-flight pass to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }

    /// Run a pass as soon as possible (e.g. on a pushed exchange event).
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Observe completed passes.
    pub fn subscribe(&self) -> watch::Receiver<PassSummary> {
        self.passes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::testkit::open_filled_bracket;
    use crate::bracket::{BracketLinkRegistry, CascadeCanceller, RetryPolicy};
    use crate::config::ReconciliationConfig;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    fn service(
        registry: &Arc<BracketLinkRegistry>,
        exchange: &Arc<MockExchange>,
        poll_interval: Duration,
    ) -> ReconcilerService {
        let config = ReconciliationConfig::default();
        let cascade = Arc::new(CascadeCanceller::new(
            registry.clone(),
            exchange.clone(),
            RetryPolicy::immediate(3),
            config.call_timeout(),
        ));
        let reconciler = Arc::new(OrderReconciler::new(
            registry.clone(),
            exchange.clone(),
            cascade,
            &config,
        ));
        ReconcilerService::new(reconciler, poll_interval)
    }

    async fn wait_for_pass(rx: &mut watch::Receiver<PassSummary>, pass: u64) -> PassSummary {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().pass >= pass {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let registry = Arc::new(BracketLinkRegistry::new());
        let exchange = Arc::new(MockExchange::new());
        let service = service(&registry, &exchange, Duration::from_secs(3600));

        assert!(service.start().await);
        assert!(!service.start().await);
        assert!(service.is_running().await);

        let mut rx = service.subscribe();
        let first = wait_for_pass(&mut rx, 1).await;
        assert_eq!(first.report, ReconcileReport::default());

        service.stop().await;
        assert!(!service.is_running().await);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_runs_detection_between_ticks() {
        let registry = Arc::new(BracketLinkRegistry::new());
        let exchange = Arc::new(MockExchange::new());
        let link = open_filled_bracket(&registry, &exchange, "BTCUSDT", dec!(0.5), dec!(50000)).await;
        let service = service(&registry, &exchange, Duration::from_secs(3600));
        let mut rx = service.subscribe();

        service.start().await;
        wait_for_pass(&mut rx, 1).await;

        exchange.external_flatten("BTCUSDT").await;
        service.trigger();
        let second = wait_for_pass(&mut rx, 2).await;

        assert_eq!(second.report.external_full_closes, 1);
        assert!(!registry.group(&link.group_id).await.unwrap().is_active());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let exchange = Arc::new(MockExchange::new());
        let first_registry = Arc::new(BracketLinkRegistry::new());
        let second_registry = Arc::new(BracketLinkRegistry::new());
        open_filled_bracket(&first_registry, &exchange, "BTCUSDT", dec!(0.5), dec!(50000)).await;

        let first = service(&first_registry, &exchange, Duration::from_secs(3600));
        let second = service(&second_registry, &exchange, Duration::from_secs(3600));
        let (mut rx_a, mut rx_b) = (first.subscribe(), second.subscribe());
        first.start().await;
        second.start().await;

        assert_eq!(wait_for_pass(&mut rx_a, 1).await.report.groups_checked, 1);
        assert_eq!(wait_for_pass(&mut rx_b, 1).await.report.groups_checked, 0);

        first.stop().await;
        assert!(second.is_running().await);
        second.stop().await;
    }
}
