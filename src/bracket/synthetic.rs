//! Synthetic margin stops.
//!
//! Exchange-native TP/SL trigger on price distance. Operators usually think
//! in margin P&L instead ("cut at -35% of margin"), so this monitor checks
//! the leveraged P&L of each active bracket against the configured
//! thresholds and closes the position itself when one is crossed.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::placement::BracketPlacer;
use super::registry::BracketLinkRegistry;
use super::retry::with_timeout;
use crate::error::Result;
use crate::exchange::ExchangeCapability;
use crate::model::CloseReason;
use crate::risk::{MarginThresholdEvaluator, MarginTrigger};

/// Watches margin P&L of active brackets and closes on threshold.
pub struct SyntheticStopMonitor {
    registry: Arc<BracketLinkRegistry>,
    exchange: Arc<dyn ExchangeCapability>,
    placer: Arc<BracketPlacer>,
    evaluator: MarginThresholdEvaluator,
    leverage: Decimal,
    account: String,
    call_timeout: Duration,
}

impl SyntheticStopMonitor {
    pub fn new(
        registry: Arc<BracketLinkRegistry>,
        exchange: Arc<dyn ExchangeCapability>,
        placer: Arc<BracketPlacer>,
        evaluator: MarginThresholdEvaluator,
        leverage: Decimal,
        account: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            exchange,
            placer,
            evaluator,
            leverage,
            account: account.into(),
            call_timeout,
        }
    }

    /// Evaluate the active bracket on `symbol` at the current mark price.
    ///
    /// Returns the trigger that fired, if any. The mark price reported with
    /// the position is the price used for margin P&L.
    pub async fn check(&self, symbol: &str) -> Result<Option<MarginTrigger>> {
        if !self.evaluator.config().enabled {
            return Ok(None);
        }
        let Some(group_id) = self.registry.active_group_for(symbol, &self.account).await else {
            return Ok(None);
        };
        let Some(snapshot) = self.registry.group_snapshot(&group_id).await else {
            return Ok(None);
        };
        if snapshot.expected_position().is_zero() {
            return Ok(None);
        }

        let position = with_timeout(self.call_timeout, self.exchange.get_position(symbol)).await?;
        if position.is_flat() {
            // Left to the reconciler to classify
            return Ok(None);
        }

        let entry_price = if position.avg_entry_price > Decimal::ZERO {
            position.avg_entry_price
        } else {
            match snapshot.entry().and_then(|e| e.avg_fill_price) {
                Some(price) => price,
                None => return Ok(None),
            }
        };

        let Some(trigger) = self.evaluator.evaluate(
            entry_price,
            position.mark_price,
            snapshot.link.direction,
            self.leverage,
        )?
        else {
            return Ok(None);
        };

        let reason = match trigger {
            MarginTrigger::StopLoss => CloseReason::SyntheticStop,
            MarginTrigger::TakeProfit => CloseReason::SyntheticTakeProfit,
        };
        warn!(
            group_id = %group_id,
            %symbol,
            entry_price = %entry_price,
            mark_price = %position.mark_price,
            leverage = %self.leverage,
            reason = %reason,
            "Margin threshold crossed, closing position"
        );

        self.placer.close_bracket(&group_id, reason).await?;
        Ok(Some(trigger))
    }

    /// Check every active bracket; failures are logged per symbol.
    pub async fn check_all(&self) -> Vec<(String, MarginTrigger)> {
        let mut fired = Vec::new();
        for group in self.registry.active_groups().await {
            let symbol = group.link.symbol;
            match self.check(&symbol).await {
                Ok(Some(trigger)) => fired.push((symbol, trigger)),
                Ok(None) => {}
                Err(e) => warn!(
                    group_id = %group.link.group_id,
                    %symbol,
                    error = %e,
                    "Synthetic stop check failed"
                ),
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::testkit::ACCOUNT;
    use crate::bracket::{BracketOrderRequest, CascadeCanceller, RetryPolicy};
    use crate::exchange::{ExchangeError, MockCall, MockExchange};
    use crate::model::{OrderRole, OrderStatus, PositionDirection};
    use crate::risk::{BaseRiskSettings, MarginStopConfig, MarketRegime, RiskInputs};
    use rust_decimal_macros::dec;

    struct Harness {
        registry: Arc<BracketLinkRegistry>,
        exchange: Arc<MockExchange>,
        placer: Arc<BracketPlacer>,
        monitor: SyntheticStopMonitor,
    }

    fn harness(config: MarginStopConfig) -> Harness {
        let registry = Arc::new(BracketLinkRegistry::new());
        let exchange = Arc::new(MockExchange::new());
        let cascade = Arc::new(CascadeCanceller::new(
            registry.clone(),
            exchange.clone(),
            RetryPolicy::immediate(3),
            Duration::from_secs(1),
        ));
        let placer = Arc::new(BracketPlacer::new(
            registry.clone(),
            exchange.clone(),
            cascade,
            RetryPolicy::immediate(3),
            Duration::from_secs(1),
            ACCOUNT,
        ));
        let monitor = SyntheticStopMonitor::new(
            registry.clone(),
            exchange.clone(),
            placer.clone(),
            MarginThresholdEvaluator::new(config),
            dec!(3),
            ACCOUNT,
            Duration::from_secs(1),
        );
        Harness {
            registry,
            exchange,
            placer,
            monitor,
        }
    }

    fn request(symbol: &str, direction: PositionDirection, quantity: rust_decimal::Decimal) -> BracketOrderRequest {
        BracketOrderRequest {
            symbol: symbol.to_string(),
            direction,
            quantity,
            limit_price: None,
            risk: RiskInputs::new(BaseRiskSettings::default(), dec!(3), MarketRegime::Normal),
        }
    }

    #[tokio::test]
    async fn test_short_margin_stop() {
        let h = harness(MarginStopConfig::default());
        h.exchange.set_price("DOGEUSDT", dec!(0.16466)).await;
        let placed = h
            .placer
            .open_bracket(request("DOGEUSDT", PositionDirection::Short, dec!(1000)))
            .await
            .unwrap();

        // -3.90% of margin: nothing happens
        h.exchange.set_price("DOGEUSDT", dec!(0.16680)).await;
        assert_eq!(h.monitor.check("DOGEUSDT").await.unwrap(), None);

        h.exchange.set_price("DOGEUSDT", dec!(0.25)).await;
        assert_eq!(
            h.monitor.check("DOGEUSDT").await.unwrap(),
            Some(MarginTrigger::StopLoss)
        );

        assert!(h.exchange.position("DOGEUSDT").await.quantity.is_zero());
        let snapshot = h.registry.group_snapshot(&placed.group_id).await.unwrap();
        assert_eq!(snapshot.link.close_reason, Some(CloseReason::SyntheticStop));
        assert_eq!(
            snapshot.conditional(OrderRole::StopLoss).unwrap().status,
            OrderStatus::Cancelled
        );
        assert_eq!(snapshot.with_role(OrderRole::Close).count(), 1);

        // Closed group is no longer watched
        assert_eq!(h.monitor.check("DOGEUSDT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_long_margin_take_profit() {
        let h = harness(MarginStopConfig {
            enabled: true,
            stop_loss_pct: dec!(35),
            take_profit_pct: dec!(10),
        });
        h.exchange.set_price("BTCUSDT", dec!(50000)).await;
        h.placer
            .open_bracket(request("BTCUSDT", PositionDirection::Long, dec!(0.5)))
            .await
            .unwrap();

        h.exchange.set_price("BTCUSDT", dec!(52000)).await;
        let fired = h.monitor.check_all().await;
        assert_eq!(fired, vec![("BTCUSDT".to_string(), MarginTrigger::TakeProfit)]);
        assert!(h.registry.active_groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_monitor_never_fires() {
        let h = harness(MarginStopConfig {
            enabled: false,
            ..MarginStopConfig::default()
        });
        h.exchange.set_price("BTCUSDT", dec!(50000)).await;
        h.placer
            .open_bracket(request("BTCUSDT", PositionDirection::Long, dec!(0.5)))
            .await
            .unwrap();

        h.exchange.set_price("BTCUSDT", dec!(10000)).await;
        assert_eq!(h.monitor.check("BTCUSDT").await.unwrap(), None);
        assert_eq!(h.registry.active_groups().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_close_is_retried_on_next_check() {
        let h = harness(MarginStopConfig::default());
        h.exchange.set_price("BTCUSDT", dec!(50000)).await;
        let placed = h
            .placer
            .open_bracket(request("BTCUSDT", PositionDirection::Long, dec!(0.5)))
            .await
            .unwrap();

        h.exchange.set_price("BTCUSDT", dec!(40000)).await;
        h.exchange
            .fail_next(MockCall::Place, ExchangeError::Rejected("busy".into()))
            .await;
        assert!(h.monitor.check("BTCUSDT").await.is_err());
        assert_eq!(h.exchange.position("BTCUSDT").await.quantity, dec!(0.5));

        assert_eq!(
            h.monitor.check("BTCUSDT").await.unwrap(),
            Some(MarginTrigger::StopLoss)
        );
        assert!(h.exchange.position("BTCUSDT").await.quantity.is_zero());

        let snapshot = h.registry.group_snapshot(&placed.group_id).await.unwrap();
        assert_eq!(snapshot.link.close_reason, Some(CloseReason::SyntheticStop));
        let closes: Vec<_> = snapshot.with_role(OrderRole::Close).collect();
        assert_eq!(closes.len(), 2);
        assert_eq!(closes[0].status, OrderStatus::Rejected);
        assert_eq!(closes[1].status, OrderStatus::Filled);
        assert!(closes[1].client_order_id.ends_with("-close2"));
    }

    #[tokio::test]
    async fn test_no_active_bracket() {
        let h = harness(MarginStopConfig::default());
        assert_eq!(h.monitor.check("ETHUSDT").await.unwrap(), None);
        assert!(h.monitor.check_all().await.is_empty());
    }
}
