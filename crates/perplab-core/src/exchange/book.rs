//! The resting order book: a small indexed map keyed by order id.
//!
//! Ids are sequential per run, so iteration in key order is submission
//! order, which keeps trigger processing deterministic.

use super::order::{Order, OrderId, OrderStatus};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    orders: BTreeMap<OrderId, Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, order: Order) {
        debug_assert!(!self.orders.contains_key(&order.id), "duplicate order id");
        self.orders.insert(order.id, order);
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn get_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&id)
    }

    /// Cancel an active order; true when a state change happened.
    pub fn cancel(&mut self, id: OrderId) -> bool {
        match self.orders.get_mut(&id) {
            Some(order) if order.is_active() => {
                order.status = OrderStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Amend an active order in place; true when the order was active.
    pub fn amend(&mut self, id: OrderId, f: impl FnOnce(&mut Order)) -> bool {
        match self.orders.get_mut(&id) {
            Some(order) if order.is_active() => {
                f(order);
                true
            }
            _ => false,
        }
    }

    /// Ids of active orders in submission order.
    pub fn active_ids(&self) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|o| o.is_active())
            .map(|o| o.id)
            .collect()
    }

    /// Cancel every active reduce-only order (bracket cleanup after a
    /// position is destroyed).
    pub fn cancel_reduce_only(&mut self) -> usize {
        let mut n = 0;
        for order in self.orders.values_mut() {
            if order.is_active() && order.reduce_only {
                order.status = OrderStatus::Cancelled;
                n += 1;
            }
        }
        n
    }

    pub fn active_count(&self) -> usize {
        self.orders.values().filter(|o| o.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
