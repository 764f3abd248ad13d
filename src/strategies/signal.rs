// src/strategies/signal.rs
use rust_decimal::Decimal;

use crate::config::OrdersConfig;
use crate::core::orders::{PendingStops, StopOrder, StopOrderKind};
use crate::types::{OrderType, Side};
use crate::utils::precision::round_to_increment;

/// What a strategy asks the bot to do. `price` is the reference price of
/// the entry; market orders ignore it at submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSignal {
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub stop_loss: Option<StopOrder>,
    pub take_profit: Option<StopOrder>,
}

impl TradeSignal {
    pub fn new(side: Side, order_type: OrderType, price: Decimal) -> Self {
        Self {
            side,
            order_type,
            price,
            stop_loss: None,
            take_profit: None,
        }
    }

    /// An entry guarded by a take-profit and a stop-loss on the opposite side.
    pub fn with_stop_orders(
        side: Side,
        price: Decimal,
        orders: &OrdersConfig,
        min_price_increment: Decimal,
    ) -> Self {
        let stop_side = side.reverse();
        // +1 when the stops close a long, -1 when they close a short
        let sign = match stop_side {
            Side::Sell => Decimal::ONE,
            Side::Buy => Decimal::NEGATIVE_ONE,
        };
        let at = |ratio: Decimal| round_to_increment(price * (Decimal::ONE + ratio), min_price_increment);

        let take_profit = StopOrder {
            side: stop_side,
            kind: StopOrderKind::TakeProfit,
            trigger_price: at(orders.take_profit_ratio * sign),
            limit_price: None,
        };
        let (kind, limit_price) = match orders.stop_loss_order_type {
            OrderType::Limit => (
                StopOrderKind::StopLimit,
                Some(at(-orders.stop_loss_exec_ratio * sign)),
            ),
            OrderType::Market => (StopOrderKind::StopLoss, None),
        };
        let stop_loss = StopOrder {
            side: stop_side,
            kind,
            trigger_price: at(-orders.stop_loss_ratio * sign),
            limit_price,
        };

        Self {
            side,
            order_type: orders.order_type,
            price: round_to_increment(price, min_price_increment),
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
        }
    }

    /// The closing order for a stop that fired at `price`.
    pub fn from_stop(stop: &StopOrder, price: Decimal) -> Self {
        match (stop.kind, stop.limit_price) {
            (StopOrderKind::StopLimit, Some(limit)) => Self::new(stop.side, OrderType::Limit, limit),
            _ => Self::new(stop.side, OrderType::Market, price),
        }
    }

    /// Moves the protective pair out of the signal.
    pub fn take_stops(&mut self) -> PendingStops {
        PendingStops {
            stop_loss: self.stop_loss.take(),
            take_profit: self.take_profit.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn orders(stop_loss_order_type: OrderType) -> OrdersConfig {
        OrdersConfig {
            order_type: OrderType::Limit,
            stop_loss_order_type,
            take_profit_ratio: dec!(0.02),
            stop_loss_ratio: dec!(0.01),
            stop_loss_exec_ratio: dec!(0.015),
        }
    }

    #[test]
    fn long_entry_gets_sell_stops_around_the_price() {
        let signal = TradeSignal::with_stop_orders(Side::Buy, dec!(100), &orders(OrderType::Limit), dec!(0.01));
        assert_eq!(signal.order_type, OrderType::Limit);

        let tp = signal.take_profit.unwrap();
        assert_eq!((tp.side, tp.kind, tp.trigger_price), (Side::Sell, StopOrderKind::TakeProfit, dec!(102)));

        let sl = signal.stop_loss.unwrap();
        assert_eq!(sl.kind, StopOrderKind::StopLimit);
        assert_eq!(sl.trigger_price, dec!(99));
        assert_eq!(sl.limit_price, Some(dec!(98.5)));
    }

    #[test]
    fn short_entry_mirrors_the_stops() {
        let signal = TradeSignal::with_stop_orders(Side::Sell, dec!(200), &orders(OrderType::Market), dec!(0.1));
        let tp = signal.take_profit.unwrap();
        let sl = signal.stop_loss.unwrap();
        assert_eq!(tp.side, Side::Buy);
        assert_eq!(tp.trigger_price, dec!(196));
        assert_eq!(sl.kind, StopOrderKind::StopLoss);
        assert_eq!(sl.trigger_price, dec!(202));
        assert_eq!(sl.limit_price, None);
    }

    #[test]
    fn fired_stop_becomes_a_closing_signal() {
        let limit = StopOrder {
            side: Side::Sell,
            kind: StopOrderKind::StopLimit,
            trigger_price: dec!(99),
            limit_price: Some(dec!(98.5)),
        };
        let signal = TradeSignal::from_stop(&limit, dec!(98.9));
        assert_eq!((signal.side, signal.order_type, signal.price), (Side::Sell, OrderType::Limit, dec!(98.5)));

        let take = StopOrder {
            kind: StopOrderKind::TakeProfit,
            limit_price: None,
            trigger_price: dec!(102),
            ..limit
        };
        let signal = TradeSignal::from_stop(&take, dec!(102.3));
        assert_eq!((signal.order_type, signal.price), (OrderType::Market, dec!(102.3)));
        assert!(signal.stop_loss.is_none());
    }
}
