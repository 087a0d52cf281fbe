// =============================================================================
// Market feed — subscription, watchdog, reconnect, and the thread bridge
// =============================================================================
//
// The vendor SDK owns one background thread for socket I/O. Its callbacks
// run on that thread and must not touch scheduler-owned structures; they
// classify the payload and schedule the publish on a runtime handle
// captured at start. This is the single thread -> core crossing in the
// whole engine.
//
// The main loop is self-healing: ensure login, (re)issue the subscription,
// then watchdog the packet clock. A socket that stays silent past the
// threshold is a zombie — nominally open, delivering nothing — and is torn
// down and reconnected with exponential backoff (2s doubling to 60s,
// reset to 2s after the next successful subscription).
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAdapter, FeedCallbacks};
use crate::clock;
use crate::core::bus::EventBus;
use crate::core::offload::ThreadOffload;
use crate::error::EngineError;
use crate::types::{OrderStatus, OrderUpdate, Tick};

/// Initial reconnect backoff.
const RECONNECT_INITIAL: Duration = Duration::from_secs(2);
/// Backoff ceiling.
const RECONNECT_MAX: Duration = Duration::from_secs(60);
/// Default watchdog silence threshold.
const SILENCE_THRESHOLD: Duration = Duration::from_secs(10);
/// Watchdog poll cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

// ── Message classification ──────────────────────────────────────────────

/// An event extracted from one socket payload.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(Tick),
    Order(OrderUpdate),
}

fn field_u64(v: &Value, key: &str) -> Option<u64> {
    match v.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_f64(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_tick(v: &Value) -> Option<Tick> {
    let token = field_u64(v, "tk")? as u32;
    let ltp = field_f64(v, "ltp")?;
    if ltp <= 0.0 {
        return None;
    }
    let cum_volume = field_u64(v, "v").unwrap_or(0);
    let ltt = field_u64(v, "ltt")
        .map(|secs| clock::from_epoch_secs(secs as i64))
        .unwrap_or_else(clock::now_exchange);
    Some(Tick {
        token,
        ltp,
        cum_volume,
        ltt,
    })
}

fn parse_order_update(v: &Value) -> Option<OrderUpdate> {
    let exchange_id = v
        .get("orderId")
        .or_else(|| v.get("nOrdNo"))?
        .as_str()
        .map(str::to_string)
        .or_else(|| v.get("orderId").and_then(|x| x.as_u64()).map(|n| n.to_string()))?;
    let status_raw = v
        .get("orderStatus")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let status = match status_raw.as_str() {
        "complete" | "traded" => OrderStatus::Complete,
        "rejected" => OrderStatus::Rejected,
        "cancelled" | "canceled" => OrderStatus::Cancelled,
        _ => OrderStatus::Placed,
    };
    Some(OrderUpdate {
        exchange_id,
        token: field_u64(v, "tk").unwrap_or(0) as u32,
        status,
        filled_qty: field_u64(v, "fldQty").unwrap_or(0),
        avg_price: field_f64(v, "avgPrc").unwrap_or(0.0),
        reason: v
            .get("rejectionReason")
            .and_then(|r| r.as_str())
            .map(str::to_string),
    })
}

/// Classify one raw socket payload into zero or more events.
///
/// - a JSON array is a tick batch;
/// - an object with a `data` array is a wrapped tick batch;
/// - an object carrying `orderId` / `orderStatus` is an order update;
/// - anything else (heartbeats, acks) is dropped.
pub fn classify_message(payload: &Value) -> Vec<FeedEvent> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(parse_tick)
            .map(FeedEvent::Tick)
            .collect(),
        Value::Object(map) => {
            if map.contains_key("orderId") || map.contains_key("orderStatus") {
                return parse_order_update(payload)
                    .map(FeedEvent::Order)
                    .into_iter()
                    .collect();
            }
            if let Some(Value::Array(items)) = map.get("data") {
                return items
                    .iter()
                    .filter_map(parse_tick)
                    .map(FeedEvent::Tick)
                    .collect();
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

// ── MarketFeed ──────────────────────────────────────────────────────────

pub struct MarketFeed {
    broker: Arc<dyn BrokerAdapter>,
    bus: Arc<EventBus>,
    subscribed: Mutex<HashSet<u32>>,
    last_packet: Arc<Mutex<Instant>>,
    connected: Arc<AtomicBool>,
    stopped: AtomicBool,
    silence_threshold: Duration,
    watchdog_interval: Duration,
}

impl MarketFeed {
    pub fn new(broker: Arc<dyn BrokerAdapter>, bus: Arc<EventBus>) -> Self {
        Self::with_watchdog(broker, bus, SILENCE_THRESHOLD, WATCHDOG_INTERVAL)
    }

    pub fn with_watchdog(
        broker: Arc<dyn BrokerAdapter>,
        bus: Arc<EventBus>,
        silence_threshold: Duration,
        watchdog_interval: Duration,
    ) -> Self {
        Self {
            broker,
            bus,
            subscribed: Mutex::new(HashSet::new()),
            last_packet: Arc::new(Mutex::new(Instant::now())),
            connected: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            silence_threshold,
            watchdog_interval,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.broker.stop_feed();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Union `tokens` into the subscription set and push them to the broker.
    /// Safe to call while disconnected — the set is re-sent on reconnect.
    pub async fn subscribe(&self, tokens: &[u32], offload: &ThreadOffload) {
        let fresh: Vec<u32> = {
            let mut set = self.subscribed.lock();
            tokens.iter().copied().filter(|t| set.insert(*t)).collect()
        };
        if fresh.is_empty() {
            return;
        }
        let broker = self.broker.clone();
        let count = fresh.len();
        match offload.submit(move || broker.subscribe(fresh)).await {
            Ok(Ok(())) => info!(count, "subscribed tokens"),
            Ok(Err(e)) | Err(e) => {
                warn!(error = %e, "subscribe failed, tokens will be re-sent on reconnect")
            }
        }
    }

    /// Callbacks handed to the SDK thread. Each one only touches thread-safe
    /// state or schedules onto the captured runtime handle.
    fn make_callbacks(&self) -> FeedCallbacks {
        let handle = Handle::current();
        let bus = self.bus.clone();
        let last_packet = self.last_packet.clone();
        let connected = self.connected.clone();
        let connected_close = self.connected.clone();

        FeedCallbacks {
            on_open: Box::new(move || {
                connected.store(true, Ordering::Relaxed);
                info!("market socket open");
            }),
            on_message: Box::new(move |payload| {
                *last_packet.lock() = Instant::now();
                for event in classify_message(&payload) {
                    let bus = bus.clone();
                    // Sole thread -> core bridge: schedule on the runtime.
                    handle.spawn(async move {
                        match event {
                            FeedEvent::Tick(tick) => bus.publish_tick(tick),
                            FeedEvent::Order(update) => {
                                bus.publish_order(update).await;
                            }
                        }
                    });
                }
            }),
            on_error: Box::new(move |err| {
                error!(error = %err, "market socket error");
            }),
            on_close: Box::new(move |msg| {
                connected_close.store(false, Ordering::Relaxed);
                warn!(message = %msg, "market socket closed");
            }),
        }
    }

    /// Self-healing main loop. Runs until `stop`.
    pub async fn run(self: Arc<Self>, offload: Arc<ThreadOffload>) {
        let mut reconnect_delay = RECONNECT_INITIAL;
        while !self.is_stopped() {
            match self.establish(&offload).await {
                Ok(()) => {
                    // Successful subscription resets the backoff.
                    reconnect_delay = RECONNECT_INITIAL;
                    match self.watchdog().await {
                        Ok(()) => break, // stopped
                        Err(e) => warn!(error = %e, "watchdog tripped, reconnecting"),
                    }
                }
                Err(e) => warn!(error = %e, "feed establish failed"),
            }
            if self.is_stopped() {
                break;
            }
            debug!(delay_s = reconnect_delay.as_secs(), "reconnect backoff");
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = (reconnect_delay * 2).min(RECONNECT_MAX);
        }
        info!("market feed loop ended");
    }

    /// Login if needed, attach callbacks, re-issue the subscription.
    async fn establish(&self, offload: &ThreadOffload) -> Result<(), EngineError> {
        while !self.broker.is_logged_in() {
            if self.is_stopped() {
                return Err(EngineError::Shutdown);
            }
            let broker = self.broker.clone();
            match offload.submit(move || broker.login()).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "broker login failed, retrying in 2s");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.broker.start_feed(self.make_callbacks())?;

        let tokens: Vec<u32> = self.subscribed.lock().iter().copied().collect();
        if !tokens.is_empty() {
            let broker = self.broker.clone();
            let count = tokens.len();
            offload.submit(move || broker.subscribe(tokens)).await??;
            info!(count, "subscription issued");
        }
        *self.last_packet.lock() = Instant::now();
        Ok(())
    }

    /// Poll the packet clock; `Err(FeedStarved)` means zombie connection.
    async fn watchdog(&self) -> Result<(), EngineError> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            tokio::time::sleep(self.watchdog_interval).await;
            let silent = self.last_packet.lock().elapsed();
            if silent > self.silence_threshold {
                self.connected.store(false, Ordering::Relaxed);
                self.broker.stop_feed();
                return Err(EngineError::FeedStarved {
                    silent_secs: silent.as_secs(),
                });
            }
        }
    }
}
