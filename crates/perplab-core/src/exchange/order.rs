//! Order, fill and rejection records.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type OrderId = u64;

/// Position/order direction. One-way mode: the account is long, short, or
/// flat, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short; multiplies price moves into PnL.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

/// Which way price must move to trigger a stop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    RisesTo,
    FallsTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    Fok,
    PostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    /// A stop-limit whose trigger fired; now resting at its limit price.
    Triggered,
    Filled,
    Cancelled,
    Rejected,
}

/// A resting or in-flight order. Created by the runner, owned by the order
/// book until filled, cancelled or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub side: Side,
    /// Notional in USDT at submission.
    pub size_usdt: f64,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_direction: Option<TriggerDirection>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub leverage: f64,
    pub created_ts_ms: i64,
    pub status: OrderStatus,
}

impl Order {
    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderStatus::New | OrderStatus::Triggered)
    }
}

/// Why a fill happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillReason {
    Entry,
    ExitTp,
    ExitSl,
    ExitSignal,
    ExitLiquidation,
    ExitEndOfData,
    ExitPartial,
}

impl FillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillReason::Entry => "entry",
            FillReason::ExitTp => "exit_tp",
            FillReason::ExitSl => "exit_sl",
            FillReason::ExitSignal => "exit_signal",
            FillReason::ExitLiquidation => "exit_liquidation",
            FillReason::ExitEndOfData => "exit_end_of_data",
            FillReason::ExitPartial => "exit_partial",
        }
    }

    pub fn is_exit(&self) -> bool {
        !matches!(self, FillReason::Entry)
    }
}

/// An execution record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub ts_ms: i64,
    pub price: f64,
    pub size_qty: f64,
    pub fee_usdt: f64,
    pub reason: FillReason,
    pub slippage_applied_bps: f64,
}

/// Why an order was rejected without aborting the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BelowMinNotional,
    /// Non-reduce-only order while a position is open (one-way mode).
    OneWayViolation,
    ExceedsMaxLeverage,
    ReduceOnlyWithoutPosition,
    InsufficientBalance,
    /// IOC/FOK/PostOnly constraint could not be satisfied at submission.
    TimeInForce,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::BelowMinNotional => "below_min_notional",
            RejectReason::OneWayViolation => "one_way_violation",
            RejectReason::ExceedsMaxLeverage => "exceeds_max_leverage",
            RejectReason::ReduceOnlyWithoutPosition => "reduce_only_without_position",
            RejectReason::InsufficientBalance => "insufficient_balance",
            RejectReason::TimeInForce => "time_in_force",
        }
    }
}

/// A recorded rejection: counted, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub ts_ms: i64,
    pub reason: RejectReason,
    pub side: Side,
    pub size_usdt: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn fill_reason_labels() {
        assert_eq!(FillReason::ExitLiquidation.as_str(), "exit_liquidation");
        assert!(FillReason::ExitSl.is_exit());
        assert!(!FillReason::Entry.is_exit());
    }

    #[test]
    fn order_activity_by_status() {
        let mut order = Order {
            id: 1,
            side: Side::Long,
            size_usdt: 1_000.0,
            order_type: OrderType::StopMarket,
            limit_price: None,
            trigger_price: Some(50_000.0),
            trigger_direction: Some(TriggerDirection::RisesTo),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
            leverage: 1.0,
            created_ts_ms: 0,
            status: OrderStatus::New,
        };
        assert!(order.is_active());
        order.status = OrderStatus::Filled;
        assert!(!order.is_active());
    }
}
