// =============================================================================
// Event bus — two bounded queues with different overflow policies
// =============================================================================
//
// tickQ   capacity 1000, lossy: when full the oldest tick is dropped and a
//         counter incremented. Stale ticks are worthless; a slow consumer
//         must not grow memory without bound.
// orderQ  capacity 100, bounded wait (5s default): order updates must never
//         be dropped; a producer blocks until space or logs a fatal timeout.
//
// Each queue has a single consumer (the engine's tick / order loop).
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::types::{OrderUpdate, Tick};

pub const TICK_QUEUE_CAPACITY: usize = 1000;
pub const ORDER_QUEUE_CAPACITY: usize = 100;
/// Default bounded wait for order-queue producers.
pub const ORDER_PUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue statistics for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub tick_q_size: usize,
    pub tick_q_cap: usize,
    pub ticks_dropped: u64,
    pub order_q_size: usize,
    pub order_q_cap: usize,
    pub orders_enqueued: u64,
}

pub struct EventBus {
    ticks: Mutex<VecDeque<Tick>>,
    tick_data: Notify,
    ticks_dropped: AtomicU64,

    orders: Mutex<VecDeque<OrderUpdate>>,
    order_data: Notify,
    order_space: Notify,
    orders_enqueued: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            ticks: Mutex::new(VecDeque::with_capacity(TICK_QUEUE_CAPACITY)),
            tick_data: Notify::new(),
            ticks_dropped: AtomicU64::new(0),
            orders: Mutex::new(VecDeque::with_capacity(ORDER_QUEUE_CAPACITY)),
            order_data: Notify::new(),
            order_space: Notify::new(),
            orders_enqueued: AtomicU64::new(0),
        }
    }

    // ── Tick queue (lossy) ──────────────────────────────────────────────

    /// Enqueue a tick, dropping the oldest one if the queue is full.
    pub fn publish_tick(&self, tick: Tick) {
        {
            let mut q = self.ticks.lock();
            if q.len() >= TICK_QUEUE_CAPACITY {
                q.pop_front();
                let dropped = self.ticks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 0 {
                    warn!(
                        dropped,
                        "tick queue saturated: consumer is slower than the feed"
                    );
                }
            }
            q.push_back(tick);
        }
        self.tick_data.notify_one();
    }

    /// Wait up to `wait` for the next tick. Single consumer.
    pub async fn next_tick(&self, wait: Duration) -> Option<Tick> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.tick_data.notified();
            if let Some(tick) = self.ticks.lock().pop_front() {
                return Some(tick);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    // ── Order queue (bounded wait) ──────────────────────────────────────

    /// Enqueue an order update, waiting up to `ORDER_PUT_TIMEOUT` for
    /// space. Returns false (and logs at error level) on timeout — order
    /// updates are critical, so a timeout means the consumer is hung.
    pub async fn publish_order(&self, update: OrderUpdate) -> bool {
        let deadline = Instant::now() + ORDER_PUT_TIMEOUT;
        let mut pending = Some(update);
        loop {
            let notified = self.order_space.notified();
            {
                let mut q = self.orders.lock();
                if q.len() < ORDER_QUEUE_CAPACITY {
                    q.push_back(pending.take().expect("pending is set until pushed"));
                    self.orders_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.order_data.notify_one();
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                let id = pending
                    .as_ref()
                    .map(|u| u.exchange_id.clone())
                    .unwrap_or_default();
                error!(
                    exchange_id = %id,
                    "order queue timeout: update not enqueued within 5s, processor may be hung"
                );
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Wait up to `wait` for the next order update. Single consumer.
    pub async fn next_order(&self, wait: Duration) -> Option<OrderUpdate> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.order_data.notified();
            {
                let mut q = self.orders.lock();
                if let Some(update) = q.pop_front() {
                    drop(q);
                    self.order_space.notify_one();
                    return Some(update);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    // ── Stats ───────────────────────────────────────────────────────────

    pub fn stats(&self) -> BusStats {
        BusStats {
            tick_q_size: self.ticks.lock().len(),
            tick_q_cap: TICK_QUEUE_CAPACITY,
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            order_q_size: self.orders.lock().len(),
            order_q_cap: ORDER_QUEUE_CAPACITY,
            orders_enqueued: self.orders_enqueued.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("EventBus")
            .field("tick_q", &stats.tick_q_size)
            .field("order_q", &stats.order_q_size)
            .field("ticks_dropped", &stats.ticks_dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::types::OrderStatus;

    fn tick(token: u32, ltp: f64) -> Tick {
        Tick {
            token,
            ltp,
            cum_volume: 0,
            ltt: clock::now_exchange(),
        }
    }

    fn update(id: &str) -> OrderUpdate {
        OrderUpdate {
            exchange_id: id.to_string(),
            token: 1,
            status: OrderStatus::Complete,
            filled_qty: 10,
            avg_price: 100.0,
            reason: None,
        }
    }

    #[tokio::test]
    async fn tick_overflow_drops_oldest() {
        let bus = EventBus::new();
        for i in 0..(TICK_QUEUE_CAPACITY + 5) {
            bus.publish_tick(tick(1, i as f64));
        }

        let stats = bus.stats();
        assert_eq!(stats.tick_q_size, TICK_QUEUE_CAPACITY);
        assert_eq!(stats.ticks_dropped, 5);

        // The oldest five were dropped: the head is now ltp = 5.
        let head = bus.next_tick(Duration::from_millis(10)).await.unwrap();
        assert!((head.ltp - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn tick_depth_never_exceeds_capacity() {
        let bus = EventBus::new();
        for i in 0..5000 {
            bus.publish_tick(tick(1, i as f64));
            assert!(bus.stats().tick_q_size <= TICK_QUEUE_CAPACITY);
        }
        assert_eq!(bus.stats().ticks_dropped, 4000);
    }

    #[tokio::test]
    async fn next_tick_times_out_when_empty() {
        let bus = EventBus::new();
        let got = bus.next_tick(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn order_updates_flow_in_fifo_order() {
        let bus = EventBus::new();
        assert!(bus.publish_order(update("a")).await);
        assert!(bus.publish_order(update("b")).await);

        let first = bus.next_order(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.exchange_id, "a");
        let second = bus.next_order(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.exchange_id, "b");
        assert_eq!(bus.stats().orders_enqueued, 2);
    }

    #[tokio::test]
    async fn order_put_waits_for_consumer_when_full() {
        let bus = std::sync::Arc::new(EventBus::new());
        for i in 0..ORDER_QUEUE_CAPACITY {
            assert!(bus.publish_order(update(&i.to_string())).await);
        }

        // Queue is full; a producer should block until the consumer drains.
        let producer_bus = bus.clone();
        let producer =
            tokio::spawn(async move { producer_bus.publish_order(update("late")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let _ = bus.next_order(Duration::from_millis(10)).await.unwrap();
        assert!(producer.await.unwrap());
    }
}
