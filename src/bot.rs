//! Copy-trade engine: one polling session against one tracked wallet.
//!
//! Each cycle:
//! - Sweeps stop-loss coverage for filter changes and resolved markets
//! - Fetches the wallet's activity and keeps only unseen trades
//! - Runs every new trade through classify, size, risk and route
//! - Runs the polled stop-loss and, in paper mode, market settlement
//! - Persists the paper ledger
//!
//! Cycles never overlap. The next one is scheduled only after the previous
//! one has finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ActivityFeed, MarketLookup, PriceFeed, PriceTick};
use crate::db::{CopyTradeRecord, Database};
use crate::error::OrderFailure;
use crate::models::{TrackedPosition, TradeEvent, TradeSide};
use crate::notify::{Notification, NotificationSink};
use crate::trading::{
    classify, validate_wallet, BuyHistory, CopyConfig, Deduplicator, ExecutionMode,
    ExecutionOutcome, ExecutionRouter, ExposureSnapshot, PaperLedger, PaperStats, PollBatch,
    PositionSizer, RiskCheck, SettlementChecker, SizedOrder, SizingContext, StopLossExit,
    StopLossMonitor,
};

/// Below this many shares a position counts as fully exited.
const DUST_SHARES: Decimal = dec!(0.01);

/// Per-session polling state. Guarded by one lock so `stop` and an in-flight
/// cycle never see half-updated values.
struct Session {
    polling: bool,
    wallet: String,
    dedup: Deduplicator,
    sink: Option<NotificationSink>,
}

/// Which BUY tiers were already copied for a token.
#[derive(Debug, Clone, Copy, Default)]
struct Placements {
    initial: bool,
    high_confidence_add: bool,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    trades_seen: AtomicU64,
    copied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    stop_losses: AtomicU64,
    settlements: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one new trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Copied,
    Skipped,
    Failed,
}

/// Summary of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub new_trades: usize,
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stop_losses: usize,
    pub settlements: usize,
}

impl CycleReport {
    fn record(&mut self, action: TradeAction) {
        match action {
            TradeAction::Copied => self.copied += 1,
            TradeAction::Skipped => self.skipped += 1,
            TradeAction::Failed => self.failed += 1,
        }
    }
}

/// The copy-trade engine.
pub struct Bot {
    config: Arc<CopyConfig>,
    feed: Arc<dyn ActivityFeed>,
    markets: Arc<dyn MarketLookup>,
    router: ExecutionRouter,
    ledger: Option<Arc<RwLock<PaperLedger>>>,
    monitor: StopLossMonitor,
    settlement: SettlementChecker,
    db: Option<Database>,

    /// Address holding our live positions
    own_wallet: Option<String>,

    session: Mutex<Session>,
    tracked: DashMap<String, TrackedPosition>,
    placements: DashMap<String, Placements>,
    buys: Mutex<BuyHistory>,
    counters: Counters,
}

impl Bot {
    pub fn new(
        config: Arc<CopyConfig>,
        mode: ExecutionMode,
        feed: Arc<dyn ActivityFeed>,
        markets: Arc<dyn MarketLookup>,
        price_feed: Option<Arc<dyn PriceFeed>>,
    ) -> Self {
        let ledger = match &mode {
            ExecutionMode::Paper(ledger) => Some(ledger.clone()),
            ExecutionMode::Live(_) => None,
        };

        Self {
            router: ExecutionRouter::new(mode, config.use_market_orders),
            monitor: StopLossMonitor::new(config.clone(), price_feed),
            settlement: SettlementChecker::new(config.clone()),
            session: Mutex::new(Session {
                polling: false,
                wallet: String::new(),
                dedup: Deduplicator::new(config.require_transaction_hash),
                sink: None,
            }),
            config,
            feed,
            markets,
            ledger,
            db: None,
            own_wallet: None,
            tracked: DashMap::new(),
            placements: DashMap::new(),
            buys: Mutex::new(BuyHistory::default()),
            counters: Counters::default(),
        }
    }

    /// Journal routed orders and persist the paper ledger.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Wallet whose positions back live SELL sizing.
    pub fn with_own_wallet(mut self, address: impl Into<String>) -> Self {
        self.own_wallet = Some(address.into());
        self
    }

    pub fn is_paper(&self) -> bool {
        self.router.is_paper()
    }

    pub fn monitor(&self) -> &StopLossMonitor {
        &self.monitor
    }

    pub fn ledger(&self) -> Option<&Arc<RwLock<PaperLedger>>> {
        self.ledger.as_ref()
    }

    /// Notional we hold in a token.
    pub fn tracked_exposure(&self, token_id: &str) -> Decimal {
        self.tracked
            .get(token_id)
            .map(|p| p.usdc_value)
            .unwrap_or_default()
    }

    pub async fn is_polling(&self) -> bool {
        self.session.lock().await.polling
    }

    /// Begin a session against `wallet`. The first poll only records a
    /// baseline; nothing already in the feed is copied.
    pub async fn start(&self, wallet: &str, sink: Option<NotificationSink>) -> Result<()> {
        validate_wallet(wallet)?;

        {
            let mut session = self.session.lock().await;
            session.dedup.reset();
            session.wallet = wallet.to_string();
            session.sink = sink;
            session.polling = true;
        }

        self.seed_from_ledger().await;

        info!(
            wallet = %wallet,
            paper = self.is_paper(),
            cap = %self.config.max_bet_per_market(),
            interval_ms = self.config.poll_interval().as_millis() as u64,
            "Copy session started"
        );
        self.report_cap_usage();
        Ok(())
    }

    /// End the session. In-flight order results are still logged, but no
    /// further notifications are delivered.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if session.polling {
            session.polling = false;
            session.sink = None;
            info!(wallet = %session.wallet, "Copy session stopped");
        }
    }

    /// Restored paper positions count against the per-market cap.
    async fn seed_from_ledger(&self) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let ledger = ledger.read().await;
        for position in ledger.positions() {
            self.tracked.entry(position.token_id.clone()).or_insert_with(|| {
                TrackedPosition::new(
                    position.token_id.clone(),
                    position.condition_id.clone(),
                    position.entry_value,
                )
            });
            self.placements.entry(position.token_id.clone()).or_default().initial = true;
        }
    }

    fn report_cap_usage(&self) {
        let cap = self.config.max_bet_per_market();
        for position in self.tracked.iter() {
            if position.usdc_value >= cap {
                warn!(
                    token = %position.token_id,
                    exposure = %position.usdc_value.round_dp(2),
                    cap = %cap,
                    "Per-market cap already reached, new BUYs in this token will be skipped"
                );
            } else {
                debug!(
                    token = %position.token_id,
                    exposure = %position.usdc_value.round_dp(2),
                    remaining = %(cap - position.usdc_value).round_dp(2),
                    "Existing exposure"
                );
            }
        }
    }

    async fn notify(&self, notification: Notification) {
        let sink = self.session.lock().await.sink.clone();
        match sink {
            Some(sink) => sink.emit(notification),
            None => debug!(?notification, "No active session, notification dropped"),
        }
    }

    /// One polling cycle. Per-trade failures are logged and never abort the
    /// rest of the batch.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let wallet = {
            let session = self.session.lock().await;
            if !session.polling {
                return Ok(report);
            }
            session.wallet.clone()
        };
        Counters::bump(&self.counters.cycles);
        debug!(wallet = %wallet, "Polling cycle");

        if !self.is_paper() {
            self.monitor.sweep_filter();
            self.release_resolved().await;
        }

        match self.feed.latest_activity(&wallet).await {
            Ok(records) => {
                let batch = {
                    let mut session = self.session.lock().await;
                    if !session.polling {
                        return Ok(report);
                    }
                    session.dedup.ingest(&records)
                };

                match batch {
                    PollBatch::Baseline { seeded } => {
                        info!(seeded, "Baseline recorded, earlier activity will not be copied")
                    }
                    PollBatch::New(events) => {
                        for event in events {
                            report.new_trades += 1;
                            match self.process_trade(&event).await {
                                Ok(action) => report.record(action),
                                Err(e) => {
                                    Counters::bump(&self.counters.failed);
                                    report.failed += 1;
                                    error!(tx = %event.id, error = %e, "Failed to process trade");
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(
                wallet = %wallet,
                error = %e,
                "Activity fetch failed, retrying next cycle"
            ),
        }

        report.stop_losses += self.sweep_stop_losses().await;

        if let Some(ledger) = &self.ledger {
            let settled = self
                .settlement
                .settle_resolved(ledger, self.markets.as_ref())
                .await;
            for settlement in settled {
                report.settlements += 1;
                Counters::bump(&self.counters.settlements);
                self.forget(&settlement.token_id);
                self.notify(Notification::PositionSettled {
                    market: settlement.market,
                    token_id: settlement.token_id,
                    shares: settlement.shares,
                    price: settlement.price,
                    pnl: settlement.pnl,
                })
                .await;
            }

            self.persist_ledger().await?;
        }

        if report != CycleReport::default() {
            info!(
                new_trades = report.new_trades,
                copied = report.copied,
                skipped = report.skipped,
                failed = report.failed,
                stop_losses = report.stop_losses,
                settlements = report.settlements,
                "Cycle complete"
            );
        }
        Ok(report)
    }

    /// classify -> size -> risk -> route for one new trade.
    async fn process_trade(&self, event: &TradeEvent) -> Result<TradeAction> {
        Counters::bump(&self.counters.trades_seen);
        self.notify(Notification::TradeDetected {
            market: event.market_label().to_string(),
            outcome: event.outcome.clone(),
            side: event.side,
            price: event.price,
            size: event.size,
            usdc_size: event.usdc_size,
            tx: event.id.clone(),
        })
        .await;

        if let Err(reason) = classify(event, &self.config, self.router.is_ready()) {
            debug!(tx = %event.id, reason = %reason, "Trade not eligible");
            return Ok(self.skip(event, reason.to_string()).await);
        }

        let ctx = self.sizing_context(event).await?;
        let sizer = PositionSizer::new(&self.config);
        let order = match sizer.size(event, &ctx) {
            Ok(order) => order,
            Err(skip) => {
                info!(tx = %event.id, code = skip.code(), reason = %skip, "Sizing skipped trade");
                return Ok(self.skip(event, skip.to_string()).await);
            }
        };

        if order.capped || order.bumped {
            self.notify(Notification::OrderCapped {
                market: event.market_label().to_string(),
                current: ctx.current_exposure,
                cap: self.config.max_bet_per_market(),
                value: order.value,
                bumped: order.bumped,
            })
            .await;
        }

        let snapshot = self.exposure_snapshot(&event.token_id).await;
        if let Err(rejection) = RiskCheck::new(&self.config).check(&order, &snapshot) {
            warn!(
                tx = %event.id,
                reason = rejection.reason.code(),
                would_be = %rejection.would_be.round_dp(2),
                limit = %rejection.limit,
                "Risk limit rejected order"
            );
            return Ok(self.skip(event, rejection.to_string()).await);
        }

        // Exposure may have moved since sizing.
        if order.high_confidence_add {
            let fresh = self.tracked_exposure(&event.token_id);
            if let Err(skip) = sizer.recheck_high_confidence(order.value, fresh) {
                return Ok(self.skip(event, skip.to_string()).await);
            }
        }

        let outcome = match self.router.route(&order, event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failure = OrderFailure::Other(format!("{e:#}"));
                return Ok(self.order_failed(event, &order, failure).await);
            }
        };

        if !outcome.success {
            let failure = outcome
                .failure
                .clone()
                .unwrap_or_else(|| OrderFailure::Other("order rejected".to_string()));
            return Ok(self.order_failed(event, &order, failure).await);
        }

        self.apply_fill(event, &order, &ctx, &outcome).await;
        Counters::bump(&self.counters.copied);

        self.journal(event, &order, "executed", outcome.order_id.clone(), None)
            .await;
        self.notify(Notification::OrderPlaced {
            market: event.market_label().to_string(),
            outcome: event.outcome.clone(),
            side: order.side,
            price: outcome.price,
            shares: outcome.shares,
            value: outcome.value,
            label: order.label.clone(),
            paper: outcome.paper,
            order_id: outcome.order_id.clone(),
        })
        .await;

        Ok(TradeAction::Copied)
    }

    async fn skip(&self, event: &TradeEvent, reason: String) -> TradeAction {
        Counters::bump(&self.counters.skipped);
        self.notify(Notification::OrderSkipped {
            market: event.market_label().to_string(),
            outcome: event.outcome.clone(),
            price: event.price,
            reason,
        })
        .await;
        TradeAction::Skipped
    }

    async fn order_failed(
        &self,
        event: &TradeEvent,
        order: &SizedOrder,
        failure: OrderFailure,
    ) -> TradeAction {
        if failure.is_skip() {
            info!(tx = %event.id, error = failure.raw(), "Market not tradable, skipping");
            self.journal(event, order, "skipped", None, Some(failure.raw().to_string()))
                .await;
            return self.skip(event, failure.raw().to_string()).await;
        }

        Counters::bump(&self.counters.failed);
        warn!(
            tx = %event.id,
            side = %order.side,
            value = %order.value,
            error = failure.raw(),
            hint = failure.hint(),
            "Copy order failed"
        );
        self.journal(event, order, "failed", None, Some(failure.raw().to_string()))
            .await;
        self.notify(Notification::OrderFailed {
            market: event.market_label().to_string(),
            side: order.side,
            value: order.value,
            error: failure.raw().to_string(),
            hint: failure.hint(),
        })
        .await;
        TradeAction::Failed
    }

    async fn sizing_context(&self, event: &TradeEvent) -> Result<SizingContext> {
        let placements = self
            .placements
            .get(&event.token_id)
            .map(|p| *p)
            .unwrap_or_default();

        let mut ctx = SizingContext {
            current_exposure: self.tracked_exposure(&event.token_id),
            initial_placed: placements.initial,
            add_placed: placements.high_confidence_add,
            ..Default::default()
        };

        if event.side == TradeSide::Sell {
            ctx.own_shares = self.own_shares(&event.token_id).await?;

            let wallet = self.session.lock().await.wallet.clone();
            ctx.tracked_remaining_shares =
                match self.feed.position_shares(&wallet, &event.token_id).await {
                    Ok(shares) => Some(shares),
                    Err(e) => {
                        debug!(
                            token = %event.token_id,
                            error = %e,
                            "Tracked position unknown, copying trade size"
                        );
                        None
                    }
                };
        }

        Ok(ctx)
    }

    async fn own_shares(&self, token_id: &str) -> Result<Decimal> {
        if let Some(ledger) = &self.ledger {
            return Ok(ledger
                .read()
                .await
                .position(token_id)
                .map(|p| p.shares)
                .unwrap_or_default());
        }

        let Some(wallet) = &self.own_wallet else {
            return Ok(Decimal::ZERO);
        };
        self.feed
            .position_shares(wallet, token_id)
            .await
            .context("Failed to look up own position")
    }

    async fn exposure_snapshot(&self, token_id: &str) -> ExposureSnapshot {
        let token_exposure = self.tracked_exposure(token_id);

        if let Some(ledger) = &self.ledger {
            let ledger = ledger.read().await;
            return ExposureSnapshot {
                open_positions: ledger.open_positions(),
                total_exposure: ledger.total_exposure(),
                token_exposure,
                token_open: ledger.position(token_id).is_some(),
            };
        }

        ExposureSnapshot {
            open_positions: self.tracked.len(),
            total_exposure: self.tracked.iter().map(|p| p.usdc_value).sum(),
            token_exposure,
            token_open: self.tracked.contains_key(token_id),
        }
    }

    async fn apply_fill(
        &self,
        event: &TradeEvent,
        order: &SizedOrder,
        ctx: &SizingContext,
        outcome: &ExecutionOutcome,
    ) {
        let token_id = &event.token_id;

        match order.side {
            TradeSide::Buy => {
                self.tracked
                    .entry(token_id.clone())
                    .and_modify(|p| p.add(outcome.value))
                    .or_insert_with(|| {
                        TrackedPosition::new(
                            token_id.clone(),
                            event.condition_id.clone(),
                            outcome.value,
                        )
                    });

                {
                    let mut placements = self.placements.entry(token_id.clone()).or_default();
                    if order.high_confidence_add {
                        placements.high_confidence_add = true;
                    } else {
                        placements.initial = true;
                    }
                }

                self.buys
                    .lock()
                    .await
                    .record(&event.condition_id, &event.outcome, outcome.price, Utc::now());

                if !self.is_paper() {
                    self.monitor.register(
                        token_id,
                        &event.condition_id,
                        event.market_label(),
                        outcome.price,
                        outcome.shares,
                    );
                }
            }
            TradeSide::Sell => {
                let remaining = match &self.ledger {
                    Some(ledger) => ledger
                        .read()
                        .await
                        .position(token_id)
                        .map(|p| p.shares)
                        .unwrap_or_default(),
                    None => (ctx.own_shares - outcome.shares).max(Decimal::ZERO),
                };

                if remaining < DUST_SHARES {
                    self.forget(token_id);
                } else if ctx.own_shares > Decimal::ZERO {
                    if let Some(mut position) = self.tracked.get_mut(token_id) {
                        position.retain_fraction(remaining / ctx.own_shares);
                    }
                }
                self.monitor.on_sell(token_id, remaining);

                debug!(token = %token_id, remaining = %remaining, "Position reduced");
            }
        }
    }

    /// Drop every trace of a closed position.
    fn forget(&self, token_id: &str) {
        self.tracked.remove(token_id);
        self.placements.remove(token_id);
    }

    /// Live positions in resolved markets stop counting against the limits.
    /// Covered tokens are released by the stop-loss sweep, the rest are
    /// looked up here.
    async fn release_resolved(&self) {
        for token in self.monitor.sweep_resolved(self.markets.as_ref()).await {
            self.forget(&token);
        }

        let uncovered: Vec<(String, String)> = self
            .tracked
            .iter()
            .filter(|p| !p.condition_id.is_empty() && !self.monitor.book().contains(&p.token_id))
            .map(|p| (p.token_id.clone(), p.condition_id.clone()))
            .collect();

        for (token_id, condition_id) in uncovered {
            match self.markets.resolution(&condition_id).await {
                Ok(Some(resolution)) if resolution.resolved => {
                    info!(token = %token_id, "Market resolved, releasing position");
                    self.forget(&token_id);
                }
                Ok(_) => {}
                Err(e) => debug!(token = %token_id, error = %e, "Resolution lookup failed"),
            }
        }
    }

    /// Polled stop-loss for whichever mode is active.
    async fn sweep_stop_losses(&self) -> usize {
        let now = Utc::now();
        let exits = match (&self.ledger, self.router.executor()) {
            (Some(ledger), _) => {
                let buys = self.buys.lock().await;
                self.settlement
                    .paper_stop_losses(ledger, self.markets.as_ref(), &buys, now)
                    .await
            }
            (None, Some(executor)) => {
                let mut exits = self.monitor.confirm_pending(executor.as_ref()).await;
                exits.extend(
                    self.monitor
                        .sweep_polled(self.markets.as_ref(), executor.as_ref(), now)
                        .await,
                );
                exits
            }
            (None, None) => Vec::new(),
        };

        let count = exits.len();
        for exit in exits {
            self.on_stop_loss(exit).await;
        }
        count
    }

    async fn on_stop_loss(&self, exit: StopLossExit) {
        Counters::bump(&self.counters.stop_losses);
        if exit.remaining_shares < DUST_SHARES {
            self.forget(&exit.token_id);
        } else if let Some(mut position) = self.tracked.get_mut(&exit.token_id) {
            let held = exit.remaining_shares + exit.shares;
            position.retain_fraction(exit.remaining_shares / held);
        }
        self.notify(Notification::StopLossTriggered {
            market: exit.market,
            token_id: exit.token_id,
            entry_price: exit.entry_price,
            price: exit.price,
            shares: exit.shares,
            loss_pct: exit.loss_pct,
            paper: self.is_paper(),
            resolved: exit.resolved,
        })
        .await;
    }

    /// Feed pushed prices to the stop-loss monitor until the channel closes.
    pub fn spawn_tick_handler(
        self: &Arc<Self>,
        mut ticks: mpsc::Receiver<PriceTick>,
    ) -> JoinHandle<()> {
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                let Some(executor) = bot.router.executor() else {
                    continue;
                };
                if let Some(exit) = bot.monitor.handle_tick(&tick, executor.as_ref()).await {
                    bot.on_stop_loss(exit).await;
                }
            }
            debug!("Price tick channel closed");
        })
    }

    async fn journal(
        &self,
        event: &TradeEvent,
        order: &SizedOrder,
        status: &str,
        order_id: Option<String>,
        error_message: Option<String>,
    ) {
        let Some(db) = &self.db else {
            return;
        };

        let record = CopyTradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_tx: event.id.clone(),
            token_id: event.token_id.clone(),
            market: event.market_label().to_string(),
            side: order.side.as_str().to_string(),
            shares: order.shares.to_string(),
            price: order.price.to_string(),
            value: order.value.to_string(),
            mode: if self.is_paper() { "paper" } else { "live" }.to_string(),
            status: status.to_string(),
            order_id,
            error_message,
            created_at: Utc::now(),
        };

        if let Err(e) = db.record_copy_trade(&record).await {
            warn!(tx = %event.id, error = %e, "Failed to journal copy trade");
        }
    }

    async fn persist_ledger(&self) -> Result<()> {
        if let (Some(db), Some(ledger)) = (&self.db, &self.ledger) {
            db.save_paper_ledger(&*ledger.read().await)
                .await
                .context("Failed to persist paper ledger")?;
        }
        Ok(())
    }

    /// Poll until stopped or `shutdown` flips. A cycle always runs to
    /// completion before the next sleep starts.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SessionStats {
        info!(
            paper = self.is_paper(),
            interval_ms = self.config.poll_interval().as_millis() as u64,
            "Starting copy loop"
        );

        loop {
            if *shutdown.borrow() || !self.is_polling().await {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Error in polling cycle");
            }

            let closed = tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if closed {
                break;
            }
        }

        self.stop().await;
        if let Err(e) = self.persist_ledger().await {
            error!(error = %e, "Final ledger save failed");
        }

        let stats = self.stats().await;
        info!("Copy loop finished\n{stats}");
        stats
    }

    pub async fn stats(&self) -> SessionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let paper = match &self.ledger {
            Some(ledger) => Some(ledger.read().await.stats(&HashMap::new())),
            None => None,
        };
        let exposure: Decimal = self.tracked.iter().map(|p| p.usdc_value).sum();
        let open_positions = self.tracked.len();
        let is_polling = self.is_polling().await;

        SessionStats {
            cycles: load(&self.counters.cycles),
            trades_seen: load(&self.counters.trades_seen),
            copied: load(&self.counters.copied),
            skipped: load(&self.counters.skipped),
            failed: load(&self.counters.failed),
            stop_losses: load(&self.counters.stop_losses),
            settlements: load(&self.counters.settlements),
            open_positions,
            covered_positions: self.monitor.book().len(),
            exposure,
            is_polling,
            paper,
        }
    }
}

/// Session statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub cycles: u64,
    pub trades_seen: u64,
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub stop_losses: u64,
    pub settlements: u64,
    pub open_positions: usize,
    pub covered_positions: usize,
    pub exposure: Decimal,
    pub is_polling: bool,
    pub paper: Option<PaperStats>,
}

impl std::fmt::Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Session Statistics ===")?;
        writeln!(f, "Cycles:          {}", self.cycles)?;
        writeln!(f, "Trades Seen:     {}", self.trades_seen)?;
        writeln!(
            f,
            "Copied:          {} (Skipped: {}, Failed: {})",
            self.copied, self.skipped, self.failed
        )?;
        writeln!(f, "Stop-Losses:     {}", self.stop_losses)?;
        writeln!(f, "Settlements:     {}", self.settlements)?;
        writeln!(
            f,
            "Open Positions:  {} ({} under stop-loss)",
            self.open_positions, self.covered_positions
        )?;
        writeln!(f, "Exposure:        ${:.2}", self.exposure)?;
        let status = if self.is_polling { "Polling" } else { "Stopped" };
        let mode = if self.paper.is_some() { "(Paper)" } else { "" };
        writeln!(f, "Status:          {} {}", status, mode)?;
        if let Some(paper) = &self.paper {
            write!(f, "{paper}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ActivityResponse, OrderExecutor, OrderReceipt, OrderRequest, OrderState};
    use crate::error::FeedError;
    use crate::models::{MarketResolution, OutcomeToken};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio_test::{assert_err, assert_ok};

    const WALLET: &str = "0x1111111111111111111111111111111111111111";

    #[derive(Default)]
    struct ScriptedFeed {
        batches: StdMutex<VecDeque<Vec<ActivityResponse>>>,
        shares: StdMutex<HashMap<String, Decimal>>,
    }

    impl ScriptedFeed {
        fn push(&self, batch: Vec<ActivityResponse>) {
            self.batches.lock().unwrap().push_back(batch);
        }

        fn pending(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ActivityFeed for ScriptedFeed {
        async fn latest_activity(&self, _wallet: &str) -> Result<Vec<ActivityResponse>, FeedError> {
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn position_shares(&self, _wallet: &str, token_id: &str) -> Result<Decimal> {
            Ok(self
                .shares
                .lock()
                .unwrap()
                .get(token_id)
                .copied()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct FakeMarkets {
        resolutions: StdMutex<HashMap<String, MarketResolution>>,
    }

    #[async_trait]
    impl MarketLookup for FakeMarkets {
        async fn resolution(&self, condition_id: &str) -> Result<Option<MarketResolution>> {
            Ok(self.resolutions.lock().unwrap().get(condition_id).cloned())
        }

        async fn outcome_tokens(&self, _condition_id: &str) -> Result<Vec<OutcomeToken>> {
            Ok(Vec::new())
        }

        async fn current_price(&self, _token_id: &str) -> Result<Option<Decimal>> {
            Ok(None)
        }
    }

    fn trade(hash: &str, token: &str, side: &str, ts: i64) -> ActivityResponse {
        ActivityResponse {
            activity_type: "TRADE".to_string(),
            condition_id: format!("0xcond-{token}"),
            asset: token.to_string(),
            side: side.to_string(),
            price: dec!(0.5),
            size: dec!(20),
            usdc_size: dec!(10),
            timestamp: ts,
            transaction_hash: hash.to_string(),
            outcome: "Yes".to_string(),
            title: format!("Market {token}"),
            ..Default::default()
        }
    }

    struct Harness {
        bot: Bot,
        feed: Arc<ScriptedFeed>,
        markets: Arc<FakeMarkets>,
        ledger: Arc<RwLock<PaperLedger>>,
    }

    fn paper_bot(config: CopyConfig) -> Harness {
        let feed = Arc::new(ScriptedFeed::default());
        let markets = Arc::new(FakeMarkets::default());
        let ledger = Arc::new(RwLock::new(PaperLedger::new(dec!(1000))));
        let bot = Bot::new(
            Arc::new(config),
            ExecutionMode::Paper(ledger.clone()),
            feed.clone(),
            markets.clone(),
            None,
        );
        Harness {
            bot,
            feed,
            markets,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_first_poll_copies_nothing() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.feed.push(vec![trade("0xb", "tok", "BUY", 200), trade("0xa", "tok", "BUY", 100)]);

        let (sink, mut rx) = NotificationSink::channel();
        h.bot.start(WALLET, Some(sink)).await.unwrap();

        let baseline = h.bot.run_cycle().await.unwrap();
        assert_eq!(baseline.new_trades, 0);
        assert_eq!(h.ledger.read().await.balance(), dec!(1000));

        let report = h.bot.run_cycle().await.unwrap();
        assert_eq!(report.new_trades, 1);
        assert_eq!(report.copied, 1);
        assert_eq!(h.ledger.read().await.balance(), dec!(995));
        assert_eq!(h.bot.tracked_exposure("tok"), dec!(5));

        assert!(matches!(rx.try_recv().unwrap(), Notification::TradeDetected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Notification::OrderPlaced { paper: true, .. }));
    }

    #[tokio::test]
    async fn test_repeated_records_are_not_copied_twice() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.bot.start(WALLET, None).await.unwrap();

        h.bot.run_cycle().await.unwrap();
        assert_eq!(h.bot.run_cycle().await.unwrap().copied, 1);
        assert_eq!(h.bot.run_cycle().await.unwrap().new_trades, 0);
    }

    #[tokio::test]
    async fn test_second_default_buy_in_token_is_skipped() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100), trade("0xb", "tok", "BUY", 101)]);
        h.bot.start(WALLET, None).await.unwrap();

        h.bot.run_cycle().await.unwrap();
        let report = h.bot.run_cycle().await.unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_position_limit_isolated_per_trade() {
        let config = CopyConfig {
            max_positions: 1,
            ..CopyConfig::default()
        };
        let h = paper_bot(config);
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "one", "BUY", 100), trade("0xb", "two", "BUY", 101)]);
        h.bot.start(WALLET, None).await.unwrap();

        h.bot.run_cycle().await.unwrap();
        let report = h.bot.run_cycle().await.unwrap();
        assert_eq!(report.new_trades, 2);
        assert_eq!(report.copied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.ledger.read().await.open_positions(), 1);
    }

    #[tokio::test]
    async fn test_full_exit_mirrored() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.feed.push(vec![trade("0xb", "tok", "SELL", 200)]);
        h.bot.start(WALLET, None).await.unwrap();

        h.bot.run_cycle().await.unwrap();
        h.bot.run_cycle().await.unwrap();
        assert!(h.ledger.read().await.position("tok").is_some());

        let report = h.bot.run_cycle().await.unwrap();
        assert_eq!(report.copied, 1);
        assert!(h.ledger.read().await.position("tok").is_none());
        assert_eq!(h.bot.tracked_exposure("tok"), Decimal::ZERO);
        assert_eq!(h.ledger.read().await.balance(), dec!(1000));
    }

    #[tokio::test]
    async fn test_resolved_market_settles_paper_position() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.bot.start(WALLET, None).await.unwrap();
        h.bot.run_cycle().await.unwrap();
        h.bot.run_cycle().await.unwrap();

        h.markets.resolutions.lock().unwrap().insert(
            "0xcond-tok".to_string(),
            MarketResolution {
                condition_id: "0xcond-tok".to_string(),
                resolved: true,
                settlement_price: Some(Decimal::ONE),
            },
        );

        let report = h.bot.run_cycle().await.unwrap();
        assert_eq!(report.settlements, 1);
        let ledger = h.ledger.read().await;
        assert!(ledger.position("tok").is_none());
        assert_eq!(ledger.balance(), dec!(1005));
    }

    #[tokio::test]
    async fn test_stop_halts_polling() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.bot.start(WALLET, None).await.unwrap();
        h.bot.run_cycle().await.unwrap();

        h.bot.stop().await;
        assert!(!h.bot.is_polling().await);
        assert_eq!(h.bot.run_cycle().await.unwrap(), CycleReport::default());
        assert_eq!(h.feed.pending(), 1);
    }

    #[tokio::test]
    async fn test_restart_takes_new_baseline() {
        let h = paper_bot(CopyConfig::default());
        h.feed.push(vec![]);
        h.feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        h.bot.start(WALLET, None).await.unwrap();
        h.bot.run_cycle().await.unwrap();
        h.bot.stop().await;

        h.bot.start(WALLET, None).await.unwrap();
        let report = h.bot.run_cycle().await.unwrap();
        assert_eq!(report.new_trades, 0);
    }

    #[tokio::test]
    async fn test_invalid_wallet_rejected() {
        let h = paper_bot(CopyConfig::default());
        assert_err!(h.bot.start("not-a-wallet", None).await);
        assert!(!h.bot.is_polling().await);

        assert_ok!(h.bot.start(WALLET, None).await);
        assert!(h.bot.is_polling().await);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = CopyConfig {
            poll_interval_ms: 1_000,
            ..CopyConfig::default()
        };
        let h = paper_bot(config);
        h.bot.start(WALLET, None).await.unwrap();

        let bot = Arc::new(h.bot);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(bot.clone().run(rx));
        tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert!(!stats.is_polling);
        assert!(!bot.is_polling().await);
    }

    /// Accepts every order and leaves it resting.
    struct RestingExecutor;

    #[async_trait]
    impl OrderExecutor for RestingExecutor {
        fn is_ready(&self) -> bool {
            true
        }

        async fn place_order(&self, _request: &OrderRequest) -> Result<OrderReceipt> {
            Ok(OrderReceipt {
                success: true,
                order_id: Some("order-1".to_string()),
                error: None,
            })
        }

        async fn order_state(&self, _order_id: &str) -> Result<OrderState> {
            Ok(OrderState::Live)
        }
    }

    fn live_bot(config: CopyConfig) -> (Bot, Arc<ScriptedFeed>, Arc<FakeMarkets>) {
        let feed = Arc::new(ScriptedFeed::default());
        let markets = Arc::new(FakeMarkets::default());
        let bot = Bot::new(
            Arc::new(config),
            ExecutionMode::Live(Arc::new(RestingExecutor)),
            feed.clone(),
            markets.clone(),
            None,
        );
        (bot, feed, markets)
    }

    fn resolve(markets: &FakeMarkets, condition_id: &str) {
        markets.resolutions.lock().unwrap().insert(
            condition_id.to_string(),
            MarketResolution {
                condition_id: condition_id.to_string(),
                resolved: true,
                settlement_price: Some(Decimal::ONE),
            },
        );
    }

    #[tokio::test]
    async fn test_live_resolved_positions_free_position_slots() {
        let config = CopyConfig {
            max_positions: 2,
            stop_loss_market_filter: vec!["one".to_string()],
            ..CopyConfig::default()
        };
        let (bot, feed, markets) = live_bot(config);
        feed.push(vec![]);
        feed.push(vec![trade("0xa", "one", "BUY", 100), trade("0xb", "two", "BUY", 101)]);
        feed.push(vec![trade("0xc", "three", "BUY", 200)]);
        bot.start(WALLET, None).await.unwrap();

        bot.run_cycle().await.unwrap();
        assert_eq!(bot.run_cycle().await.unwrap().copied, 2);
        assert!(bot.monitor().book().contains("one"));
        assert!(!bot.monitor().book().contains("two"));

        resolve(&markets, "0xcond-one");
        resolve(&markets, "0xcond-two");

        let report = bot.run_cycle().await.unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(bot.tracked_exposure("one"), Decimal::ZERO);
        assert_eq!(bot.tracked_exposure("two"), Decimal::ZERO);
        assert!(bot.tracked_exposure("three") > Decimal::ZERO);
        assert!(!bot.monitor().book().contains("one"));
    }

    #[tokio::test]
    async fn test_partial_stop_loss_exit_keeps_remaining_exposure() {
        let (bot, feed, _markets) = live_bot(CopyConfig::default());
        feed.push(vec![]);
        feed.push(vec![trade("0xa", "tok", "BUY", 100)]);
        bot.start(WALLET, None).await.unwrap();

        bot.run_cycle().await.unwrap();
        bot.run_cycle().await.unwrap();
        let before = bot.tracked_exposure("tok");
        assert!(before > Decimal::ZERO);

        let exit = StopLossExit {
            token_id: "tok".to_string(),
            market: "Market tok".to_string(),
            entry_price: dec!(0.5),
            price: dec!(0.3),
            shares: dec!(10),
            loss_pct: dec!(40),
            remaining_shares: dec!(10),
            resolved: false,
            order_id: None,
        };
        bot.on_stop_loss(exit.clone()).await;
        assert_eq!(bot.tracked_exposure("tok"), before / dec!(2));

        bot.on_stop_loss(StopLossExit {
            remaining_shares: Decimal::ZERO,
            ..exit
        })
        .await;
        assert_eq!(bot.tracked_exposure("tok"), Decimal::ZERO);
    }
}
