// =============================================================================
// Engine lifecycle — boot, configure, run loops, square-off, shutdown
// =============================================================================
//
// One Engine value owns every subsystem; nothing is global. Boot wires the
// components, reconciles risk state against the broker and starts the
// self-healing feed loop, then waits idle. /engine/start validates and
// persists the configuration, builds the per-instrument runtimes and
// launches the three run loops (tick, order, heartbeat), all bound by one
// `is_running` flag. Square-off flattens every position at the cutoff (or
// on panic) and stops the loops.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::paper::PaperBroker;
use crate::broker::{live::LiveBroker, BrokerAdapter};
use crate::clock;
use crate::config::EngineConfig;
use crate::context::{EngineContext, SizingContext};
use crate::core::breaker::CircuitBreaker;
use crate::core::bus::{BusStats, EventBus};
use crate::core::limiter::TokenBucket;
use crate::core::offload::ThreadOffload;
use crate::data::aggregator::CandleAggregator;
use crate::data::feed::MarketFeed;
use crate::data::instruments::InstrumentCache;
use crate::error::EngineError;
use crate::execution::pipeline::ExecutionPipeline;
use crate::risk::sentinel::{RiskConfig, RiskSentinel, RiskStatus};
use crate::settings::Settings;
use crate::store::{Store, KEY_CURRENT_STATE, KEY_STRATEGY_CONFIG};
use crate::strategy::build_strategy;
use crate::strategy::runtime::{StrategyRuntime, StrategySnapshot};
use crate::types::{Bar, EngineMode, Side};

/// Tick/order queue poll timeout.
const LOOP_POLL: Duration = Duration::from_secs(2);
/// Risk sync cadence inside the heartbeat.
const SYNC_EVERY_SECS: u64 = 30;

/// Health payload for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub engine_running: bool,
    pub mode: EngineMode,
    pub feed_connected: bool,
    pub strategy: Option<String>,
    pub risk: RiskStatus,
    pub queues: BusStats,
    pub active_strategies: Vec<String>,
}

pub struct Engine {
    settings: Settings,
    mode: EngineMode,
    broker: Arc<dyn BrokerAdapter>,
    /// Present in paper mode: drives simulated fills off closed bars.
    paper: Option<Arc<PaperBroker>>,
    offload: Arc<ThreadOffload>,
    bus: Arc<EventBus>,
    feed: Arc<MarketFeed>,
    store: Store,
    instruments: Arc<InstrumentCache>,
    sentinel: Arc<RiskSentinel>,
    pipeline: Arc<ExecutionPipeline>,
    ctx: Arc<EngineContext>,
    positions_cb: CircuitBreaker,
    broker_limiter: TokenBucket,
    strategies: RwLock<HashMap<u32, Arc<StrategyRuntime>>>,
    aggregator: Mutex<CandleAggregator>,
    is_running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config: RwLock<Option<EngineConfig>>,
}

impl Engine {
    /// Boot phase: wire components, load the instrument master, reconcile
    /// risk state, start the feed loop, restore persisted intent, go idle.
    pub async fn boot(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let store = Store::connect(&settings.database_url).await?;

        let (broker, paper): (Arc<dyn BrokerAdapter>, Option<Arc<PaperBroker>>) =
            if settings.paper_trading {
                let paper = Arc::new(PaperBroker::new());
                (paper.clone(), Some(paper))
            } else {
                (Arc::new(LiveBroker::new(&settings)?), None)
            };

        Self::assemble(settings, broker, paper, store).await
    }

    pub(crate) async fn assemble(
        settings: Settings,
        broker: Arc<dyn BrokerAdapter>,
        paper: Option<Arc<PaperBroker>>,
        store: Store,
    ) -> anyhow::Result<Arc<Self>> {
        let mode = broker.mode();
        let offload = Arc::new(ThreadOffload::default());
        let bus = Arc::new(EventBus::new());

        // Paper mode has no real socket; a long silence threshold keeps the
        // watchdog from cycling a connection that cannot starve.
        let feed = Arc::new(if mode == EngineMode::Paper {
            MarketFeed::with_watchdog(
                broker.clone(),
                bus.clone(),
                Duration::from_secs(3600),
                Duration::from_secs(1),
            )
        } else {
            MarketFeed::new(broker.clone(), bus.clone())
        });

        // Instrument master: DB first, broker fetch on a cold start. A
        // failed fetch leaves the cache empty; /engine/start then rejects
        // every symbol instead of the whole process dying.
        let mut instruments = store.load_instruments().await?;
        if instruments.is_empty() {
            let b = broker.clone();
            match offload.submit(move || b.fetch_instruments()).await {
                Ok(Ok(fetched)) => {
                    store.save_instruments(&fetched).await?;
                    instruments = fetched;
                }
                Ok(Err(e)) | Err(e) => {
                    error!(error = %e, "instrument master fetch failed, cache is empty");
                }
            }
        }
        let instruments = Arc::new(InstrumentCache::new(instruments));

        let sentinel = Arc::new(RiskSentinel::new(RiskConfig::default()));
        let pipeline = Arc::new(ExecutionPipeline::new(
            broker.clone(),
            offload.clone(),
            store.clone(),
            sentinel.clone(),
            instruments.clone(),
        ));

        // Restore persisted intent so a crash keeps capital and limits.
        let restored = store.load_config(KEY_CURRENT_STATE).await?;
        let sizing = restored
            .as_ref()
            .map(SizingContext::from_config)
            .unwrap_or_else(|| SizingContext::from_config(&EngineConfig::default()));
        if let Some(config) = &restored {
            sentinel.update_config(RiskConfig {
                max_daily_loss: config.max_daily_loss,
                max_concurrent_trades: config.max_concurrent_trades,
            });
            info!(
                strategy = %config.strategy_name,
                capital = config.capital,
                symbols = config.symbols.len(),
                "persisted state restored"
            );
        }

        let ctx = Arc::new(EngineContext::new(
            pipeline.clone(),
            sentinel.clone(),
            instruments.clone(),
            sizing,
        ));

        let engine = Arc::new(Self {
            settings,
            mode,
            broker,
            paper,
            offload,
            bus,
            feed,
            store,
            instruments,
            sentinel,
            pipeline,
            ctx,
            positions_cb: CircuitBreaker::for_positions(),
            broker_limiter: TokenBucket::with_defaults("broker"),
            strategies: RwLock::new(HashMap::new()),
            aggregator: Mutex::new(CandleAggregator::new()),
            is_running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config: RwLock::new(restored),
        });

        // Reconcile risk state against the broker book before going idle.
        if let Err(e) = engine
            .sentinel
            .sync_state(engine.broker.clone(), &engine.offload, &engine.positions_cb)
            .await
        {
            warn!(error = %e, "boot risk sync failed, continuing with defaults");
        }

        // The feed loop runs for the life of the process.
        let feed = engine.feed.clone();
        let offload = engine.offload.clone();
        tokio::spawn(feed.run(offload));

        info!(mode = %engine.mode, "engine booted, idle until /engine/start");
        Ok(engine)
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Configure & start ───────────────────────────────────────────────

    /// Validate, persist and apply a configuration, then start the run
    /// loops. Rejected outright if the engine is already running.
    pub async fn configure_and_start(self: Arc<Self>, config: EngineConfig) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::Configuration("engine already running".into()));
        }
        config.validate()?;
        let resolved = self.instruments.resolve_symbols(&config.symbols)?;

        // Persisted atomically before anything is mutated.
        self.store.save_config(KEY_CURRENT_STATE, &config).await?;
        self.store.save_config(KEY_STRATEGY_CONFIG, &config).await?;

        self.sentinel.update_config(RiskConfig {
            max_daily_loss: config.max_daily_loss,
            max_concurrent_trades: config.max_concurrent_trades,
        });
        *self.ctx.sizing.write() = SizingContext::from_config(&config);

        // Build one runtime per instrument.
        let mut runtimes = HashMap::new();
        for (symbol, token) in &resolved {
            let strategy = build_strategy(&config.strategy_name, &config.strategy_params)?;
            runtimes.insert(
                *token,
                Arc::new(StrategyRuntime::new(
                    symbol.clone(),
                    *token,
                    strategy,
                    self.ctx.clone(),
                )),
            );
        }
        *self.strategies.write() = runtimes;
        *self.config.write() = Some(config);

        self.reconcile().await;

        let tokens: Vec<u32> = resolved.iter().map(|(_, t)| *t).collect();
        self.feed.subscribe(&tokens, &self.offload).await;

        self.is_running.store(true, Ordering::Release);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().tick_loop()));
        tasks.push(tokio::spawn(self.clone().order_loop()));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));

        info!(strategies = self.strategies.read().len(), "engine running");
        Ok(())
    }

    /// Restore capital and per-strategy positions from the broker.
    async fn reconcile(&self) {
        // Available capital.
        match self.mode {
            EngineMode::Live => {
                self.broker_limiter.acquire().await;
                let broker = self.broker.clone();
                match self.offload.submit(move || broker.get_limits()).await {
                    Ok(Ok(available)) => {
                        self.ctx.set_available_capital(available);
                        info!(available, "live capital reconciled");
                    }
                    Ok(Err(e)) | Err(e) => warn!(error = %e, "limits fetch failed"),
                }
            }
            EngineMode::Paper => {
                let capital = self.ctx.sizing.read().total_capital;
                self.ctx.set_available_capital(capital);
            }
        }

        // Positions.
        let broker = self.broker.clone();
        match self
            .positions_cb
            .call_blocking(&self.offload, move || broker.get_positions())
            .await
        {
            Ok(rows) => {
                let strategies = self.strategies.read();
                for row in rows {
                    if let Some(rt) = strategies.get(&row.token) {
                        rt.sync_position(row.net_qty, row.avg_price);
                    }
                }
            }
            Err(e) => warn!(error = %e, "position reconcile failed"),
        }

        if let Err(e) = self
            .sentinel
            .sync_state(self.broker.clone(), &self.offload, &self.positions_cb)
            .await
        {
            warn!(error = %e, "risk sync failed during reconcile");
        }
    }

    // ── Run loops ───────────────────────────────────────────────────────

    /// Route ticks to the aggregator and the owning strategy. Decision
    /// work is spawned fire-and-forget so one slow strategy cannot block
    /// the router.
    async fn tick_loop(self: Arc<Self>) {
        info!("tick loop started");
        while self.is_running() {
            let Some(tick) = self.bus.next_tick(LOOP_POLL).await else {
                continue;
            };
            let closed = self.aggregator.lock().update(&tick);

            let runtime = self.strategies.read().get(&tick.token).cloned();
            if let Some(rt) = &runtime {
                if rt.is_active() {
                    rt.on_tick(&tick);
                }
            }
            if let Some(bar) = closed {
                self.dispatch_bar(bar).await;
            }
        }
        info!("tick loop ended");
    }

    /// Route a closed bar: simulated fills first (paper), then the owning
    /// strategy's decision, detached.
    async fn dispatch_bar(&self, bar: Bar) {
        if let Some(paper) = &self.paper {
            for update in paper.process_bar(&bar) {
                self.bus.publish_order(update).await;
            }
        }
        let runtime = self.strategies.read().get(&bar.token).cloned();
        if let Some(rt) = runtime {
            if rt.is_active() {
                tokio::spawn(async move { rt.on_bar_close(bar).await });
            }
        }
    }

    /// Route order updates to the ledger and the owning strategy.
    async fn order_loop(self: Arc<Self>) {
        info!("order loop started");
        while self.is_running() {
            let Some(update) = self.bus.next_order(LOOP_POLL).await else {
                continue;
            };
            self.pipeline.apply_order_update(&update).await;

            let runtime = self.strategies.read().get(&update.token).cloned();
            match runtime {
                Some(rt) => rt.on_order_update(&update),
                None => {
                    // Token 0 means the broker omitted it: fan out.
                    if update.token == 0 {
                        for rt in self.strategies.read().values() {
                            rt.on_order_update(&update);
                        }
                    }
                }
            }
        }
        info!("order loop ended");
    }

    /// 1 Hz heartbeat: square-off cutoff, time-forced bar closes, periodic
    /// risk sync.
    async fn heartbeat_loop(self: Arc<Self>) {
        info!("heartbeat loop started");
        let mut beats: u64 = 0;
        while self.is_running() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            beats += 1;
            let now = clock::now_exchange();

            if clock::past_cutoff(now, self.settings.square_off_time) {
                warn!("square-off time reached");
                self.square_off().await;
                break;
            }

            let stale = self.aggregator.lock().force_close(now);
            for bar in stale {
                self.dispatch_bar(bar).await;
            }

            if beats % SYNC_EVERY_SECS == 0 {
                if let Err(e) = self
                    .sentinel
                    .sync_state(self.broker.clone(), &self.offload, &self.positions_cb)
                    .await
                {
                    warn!(error = %e, "periodic risk sync failed");
                }
            }
        }
        info!("heartbeat loop ended");
    }

    // ── Control operations ──────────────────────────────────────────────

    /// Flatten every open position, wait briefly, stop the loops.
    pub async fn square_off(&self) {
        warn!("auto square-off: flattening all positions");
        let runtimes: Vec<Arc<StrategyRuntime>> =
            self.strategies.read().values().cloned().collect();
        for rt in runtimes {
            rt.force_flat().await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.is_running.store(false, Ordering::Release);
    }

    /// Idempotent stop. Does not square off.
    pub fn stop(&self) {
        if self.is_running.swap(false, Ordering::AcqRel) {
            info!("engine stopped");
        }
    }

    /// Manual panic: square off immediately.
    pub async fn panic_square_off(&self) {
        warn!("manual panic square-off requested");
        self.square_off().await;
    }

    /// Final shutdown: stop loops, cancel the feed, close the store, stop
    /// the offload pool last.
    pub async fn shutdown(&self) {
        self.stop();
        self.feed.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.store.close().await;
        self.offload.stop();
        info!("engine shut down");
    }

    /// Route an authenticated webhook signal to the matching strategy.
    pub async fn webhook_signal(
        &self,
        symbol: &str,
        action: Side,
        price: f64,
        qty: Option<u64>,
    ) -> Result<String, EngineError> {
        let runtime = self
            .strategies
            .read()
            .values()
            .find(|rt| rt.symbol == symbol)
            .cloned();
        let Some(rt) = runtime else {
            return Err(EngineError::Configuration(format!(
                "no active strategy for '{symbol}'"
            )));
        };
        rt.on_external_signal(action, price, qty).await;
        Ok(rt.symbol.clone())
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            engine_running: self.is_running(),
            mode: self.mode,
            feed_connected: self.feed.is_connected(),
            strategy: self.config.read().as_ref().map(|c| c.strategy_name.clone()),
            risk: self.sentinel.status(),
            queues: self.bus.stats(),
            active_strategies: self
                .strategies
                .read()
                .values()
                .filter(|rt| rt.is_active())
                .map(|rt| rt.symbol.clone())
                .collect(),
        }
    }

    pub fn status(&self) -> Vec<StrategySnapshot> {
        let mut snapshots: Vec<StrategySnapshot> = self
            .strategies
            .read()
            .values()
            .map(|rt| rt.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        snapshots
    }

    pub fn webhook_passphrase(&self) -> &str {
        &self.settings.webhook_passphrase
    }

    /// Test/bridge access to the bus (ticks can be published directly).
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Reset the day-scoped risk state (operational endpoint).
    pub async fn daily_reset(&self) {
        self.sentinel.daily_reset();
        if let Err(e) = self
            .sentinel
            .sync_state(self.broker.clone(), &self.offload, &self.positions_cb)
            .await
        {
            warn!(error = %e, "risk sync after daily reset failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.mode)
            .field("running", &self.is_running())
            .field("strategies", &self.strategies.read().len())
            .finish()
    }
}
