//! Account drivers: the per-account reconciliation loop and its supervisor.
//!
//! Each cycle of an [`AccountDriver`]:
//! - fetches signals for every configured trader pair concurrently
//! - takes one positions snapshot, one deal-history snapshot and the quotes
//!   of the batch symbols
//! - classifies every pair against those snapshots
//! - executes all updates, then all creates, then all closes, one request
//!   at a time
//!
//! Nothing is carried over between cycles except the broker session.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::{SignalBatch, SignalClient, SignalSource, TraderPair};
use crate::broker::{
    AccountInfo, BridgeGateway, BrokerGateway, Credentials, DryRun, OrderRequest, OrderResult,
    PaperGateway, QuoteStatus, SymbolInfo, Tick,
};
use crate::config::{AccountConfig, GatewayConfig, Settings};
use crate::db::{ActionRecord, CycleRecord, Journal};
use crate::error::{BrokerError, BrokerResult, SetupError};
use crate::trading::{
    Classifier, Decision, DecisionKind, MarketSnapshot, OrderPolicy, ReconciliationPlan,
    SignalValidator, SymbolMapper,
};

/// Upper bound on retrying the initial broker connection.
const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Timing and window settings of one driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub poll_interval: Duration,
    pub history_days: i64,
    pub broker_timeout: Duration,
    pub setup_timeout: Duration,
    pub clock_symbol: String,
}

impl DriverConfig {
    pub fn from_settings(settings: &Settings, account: &AccountConfig) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            history_days: settings.history_days,
            broker_timeout: settings.broker_timeout(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            clock_symbol: account.clock_symbol.clone(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            history_days: 10,
            broker_timeout: Duration::from_secs(10),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            clock_symbol: "EURUSD".to_string(),
        }
    }
}

/// Observable state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Fetching,
    Classifying,
    Acting,
    Sleeping,
    ShuttingDown,
}

/// Bound a broker call. A timed out call has no confirmed outcome.
pub async fn with_timeout<T, F>(after: Duration, call: &'static str, fut: F) -> BrokerResult<T>
where
    F: Future<Output = BrokerResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout { call, after }),
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub id: String,
    pub login: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs_ok: usize,
    pub pairs_failed: usize,
    pub signals: usize,
    pub invalid_signals: usize,
    pub creates: usize,
    pub updates: usize,
    pub closes: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub failures: usize,
    /// Set when the cycle stopped before classification
    pub aborted: Option<String>,
}

impl CycleReport {
    fn new(login: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            login,
            started_at: now,
            finished_at: now,
            pairs_ok: 0,
            pairs_failed: 0,
            signals: 0,
            invalid_signals: 0,
            creates: 0,
            updates: 0,
            closes: 0,
            ignored: 0,
            skipped: 0,
            failures: 0,
            aborted: None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    fn record(&self) -> CycleRecord {
        CycleRecord {
            id: self.id.clone(),
            login: self.login,
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            pairs_ok: self.pairs_ok as i64,
            pairs_failed: self.pairs_failed as i64,
            signals: self.signals as i64,
            invalid_signals: self.invalid_signals as i64,
            creates: self.creates as i64,
            updates: self.updates as i64,
            closes: self.closes as i64,
            ignored: self.ignored as i64,
            skipped: self.skipped as i64,
            failures: self.failures as i64,
            error: self.aborted.clone(),
        }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.aborted {
            return write!(f, "cycle {} aborted: {}", self.id, reason);
        }
        write!(
            f,
            "pairs {}/{} ok, {} signals ({} invalid), created {}, updated {}, closed {}, ignored {}, skipped {}, failed {}",
            self.pairs_ok,
            self.pairs_ok + self.pairs_failed,
            self.signals,
            self.invalid_signals,
            self.creates,
            self.updates,
            self.closes,
            self.ignored,
            self.skipped,
            self.failures
        )
    }
}

/// Reconciliation loop of one broker account.
///
/// The driver owns its gateway for its whole lifetime; trade requests are
/// issued strictly one after another.
pub struct AccountDriver<G, S> {
    login: u64,
    credentials: Credentials,
    pairs: Vec<TraderPair>,
    validator: SignalValidator,
    symbols: SymbolMapper,
    policy: OrderPolicy,
    config: DriverConfig,
    gateway: G,
    source: S,
    journal: Option<Journal>,
    state: DriverState,
}

impl<G: BrokerGateway, S: SignalSource> AccountDriver<G, S> {
    pub fn new(
        account: &AccountConfig,
        separator: &str,
        config: DriverConfig,
        gateway: G,
        source: S,
    ) -> Result<Self, SetupError> {
        let pairs = account.trader_pairs(separator)?;
        Ok(Self {
            login: account.login,
            credentials: account.credentials(),
            pairs,
            validator: SignalValidator::new(account.validator_config()),
            symbols: account.symbol_mapper(),
            policy: account.order_policy(),
            config,
            gateway,
            source,
            journal: None,
            state: DriverState::Idle,
        })
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn transition(&mut self, next: DriverState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Driver state");
            self.state = next;
        }
    }

    /// Open the broker session, retrying transient failures with backoff.
    ///
    /// Returns `Ok(None)` when shutdown was requested while retrying.
    pub async fn setup(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<AccountInfo>, SetupError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(self.config.setup_timeout))
            .build();

        loop {
            let attempt = with_timeout(
                self.config.broker_timeout,
                "connect",
                self.gateway.connect(&self.credentials),
            )
            .await;

            let err = match attempt {
                Ok(account) => {
                    info!(
                        login = account.login,
                        server = %account.server,
                        balance = %account.balance,
                        gateway = self.gateway.name(),
                        traders = self.pairs.len(),
                        "Broker session ready"
                    );
                    return Ok(Some(account));
                }
                Err(e @ BrokerError::Authentication(_)) => {
                    return Err(SetupError::Connect {
                        login: self.login,
                        source: e,
                    })
                }
                Err(e) => e,
            };

            let Some(delay) = backoff.next_backoff() else {
                return Err(SetupError::Connect {
                    login: self.login,
                    source: err,
                });
            };
            warn!(error = %err, retry_in = ?delay, "Broker connection failed, retrying");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Run cycles until `shutdown` flips to `true`, then release the session.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SetupError> {
        if self.setup(&mut shutdown).await?.is_none() {
            self.transition(DriverState::ShuttingDown);
            return Ok(());
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_cycle().await;
            if report.is_aborted() {
                warn!(cycle = %report.id, "{report}");
            } else {
                info!(cycle = %report.id, "{report}");
            }

            self.transition(DriverState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.close_session().await;
        Ok(())
    }

    /// Connect, run a single cycle and release the session.
    pub async fn run_once(&mut self) -> Result<CycleReport, SetupError> {
        let (_tx, mut rx) = watch::channel(false);
        self.setup(&mut rx).await?;
        let report = self.run_cycle().await;
        self.close_session().await;
        Ok(report)
    }

    async fn close_session(&mut self) {
        self.transition(DriverState::ShuttingDown);
        let timeout = self.config.broker_timeout;
        match with_timeout(timeout, "shutdown", self.gateway.shutdown()).await {
            Ok(()) => info!("Broker session released"),
            Err(e) => warn!(error = %e, "Broker shutdown failed"),
        }
    }

    /// One fetch, classify, act pass. Never fails: problems are logged and
    /// reflected in the report.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::new(self.login);

        self.transition(DriverState::Fetching);
        let batches = self.fetch_batches(&mut report).await;

        if batches.is_empty() {
            debug!("No signal batch fetched this cycle");
            return self.finish(report).await;
        }

        let timeout = self.config.broker_timeout;
        let now = match with_timeout(timeout, "server_time", self.gateway.server_time(&self.config.clock_symbol)).await {
            Ok(Some(time)) => time,
            Ok(None) => Utc::now(),
            Err(e) => {
                debug!(error = %e, "Server clock unavailable, using wall clock");
                Utc::now()
            }
        };

        let positions = match with_timeout(timeout, "positions", self.gateway.positions()).await {
            Ok(positions) => positions,
            Err(e) => return self.abort(report, format!("positions snapshot failed: {e}")).await,
        };

        // Deal times are broker-stamped; the window end allows for clock skew.
        let from = now - chrono::Duration::days(self.config.history_days);
        let to = now + chrono::Duration::days(1);
        let deals = match with_timeout(timeout, "history_deals", self.gateway.history_deals(from, to)).await {
            Ok(deals) => deals,
            Err(e) => return self.abort(report, format!("deal history snapshot failed: {e}")).await,
        };

        let market = MarketSnapshot {
            now,
            quotes: self.gather_quotes(&batches).await,
        };

        self.transition(DriverState::Classifying);
        let plans: Vec<ReconciliationPlan> = batches
            .iter()
            .map(|batch| {
                let span = info_span!("pair", trader = batch.pair.trader_id(), source = %batch.pair.source);
                let _entered = span.enter();
                Classifier::new(&batch.pair.family, &self.validator, &self.symbols)
                    .holding(&batch.held_tags)
                    .classify(&batch.signals, &positions, &deals, &market)
            })
            .collect();

        for plan in &plans {
            report.ignored += plan.count("ignore_closed")
                + plan.count("ignore_unchanged")
                + plan.count("ignore_stale")
                + plan.count("hold");
            report.skipped += plan.count("skip_no_quote") + plan.rejected.len();
        }

        self.transition(DriverState::Acting);
        let updates: Vec<&Decision> = plans.iter().flat_map(|p| p.updates()).collect();
        let creates: Vec<&Decision> = plans.iter().flat_map(|p| p.creates()).collect();
        let closes: Vec<&Decision> = plans.iter().flat_map(|p| p.closes()).collect();

        for decision in updates {
            if self.execute(&report.id, decision).await {
                report.updates += 1;
            } else {
                report.failures += 1;
            }
        }
        for decision in creates {
            if self.execute(&report.id, decision).await {
                report.creates += 1;
            } else {
                report.failures += 1;
            }
        }
        for decision in closes {
            if self.execute(&report.id, decision).await {
                report.closes += 1;
            } else {
                report.failures += 1;
            }
        }

        self.finish(report).await
    }

    async fn fetch_batches(&mut self, report: &mut CycleReport) -> Vec<SignalBatch> {
        let results = self.source.fetch_many(&self.pairs).await;

        let mut batches = Vec::with_capacity(results.len());
        for (pair, result) in results {
            match result {
                Ok(batch) => {
                    report.pairs_ok += 1;
                    report.signals += batch.signals.len();
                    report.invalid_signals += batch.invalid_signal_count;
                    batches.push(batch);
                }
                Err(e) => {
                    report.pairs_failed += 1;
                    warn!(
                        trader = pair.trader_id(),
                        source = %pair.source,
                        error = %e,
                        "Signal fetch failed, skipping pair this cycle"
                    );
                }
            }
        }
        batches
    }

    async fn gather_quotes(&mut self, batches: &[SignalBatch]) -> HashMap<String, QuoteStatus> {
        let symbols: BTreeSet<String> = batches
            .iter()
            .flat_map(|b| b.signals.iter())
            .map(|s| self.symbols.broker_symbol(&s.symbol))
            .collect();

        let timeout = self.config.broker_timeout;
        let mut quotes = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            let status = match with_timeout(timeout, "select_symbol", self.gateway.select_symbol(&symbol)).await {
                Ok(false) => QuoteStatus::UnknownSymbol,
                Ok(true) => match with_timeout(timeout, "tick", self.gateway.tick(&symbol)).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(%symbol, error = %e, "Quote request failed");
                        QuoteStatus::Unavailable
                    }
                },
                Err(e) => {
                    warn!(%symbol, error = %e, "Symbol selection failed");
                    QuoteStatus::Unavailable
                }
            };
            quotes.insert(symbol, status);
        }
        quotes
    }

    async fn abort(&mut self, mut report: CycleReport, reason: String) -> CycleReport {
        error!(cycle = %report.id, %reason, "Cycle aborted");
        report.aborted = Some(reason);
        self.finish(report).await
    }

    async fn finish(&mut self, mut report: CycleReport) -> CycleReport {
        report.finished_at = Utc::now();
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_cycle(&report.record()).await {
                warn!(error = %e, "Failed to journal cycle");
            }
        }
        report
    }

    /// Symbol constraints and a live quote, needed to price a deal.
    async fn trading_context(&self, symbol: &str) -> Result<(SymbolInfo, Tick), String> {
        let timeout = self.config.broker_timeout;
        let info = with_timeout(timeout, "symbol_info", self.gateway.symbol_info(symbol))
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("symbol {symbol} is not available"))?;

        match with_timeout(timeout, "tick", self.gateway.tick(symbol))
            .await
            .map_err(|e| e.to_string())?
        {
            QuoteStatus::Live(tick) => Ok((info, tick)),
            QuoteStatus::Unavailable => Err(format!("no quote for {symbol}")),
            QuoteStatus::UnknownSymbol => Err(format!("symbol {symbol} is not available")),
        }
    }

    async fn build_request(&self, decision: &Decision) -> Result<OrderRequest, String> {
        match &decision.kind {
            DecisionKind::Update { signal, position } => {
                Ok(self.policy.modify_request(position, signal))
            }
            DecisionKind::Create {
                signal,
                broker_symbol,
                ..
            } => {
                let (info, tick) = self.trading_context(broker_symbol).await?;
                self.policy
                    .open_request(decision.tag, signal, &info, &tick)
                    .ok_or_else(|| {
                        format!(
                            "size {} x {} is not a tradable volume",
                            signal.size, self.policy.volume_coefficient
                        )
                    })
            }
            DecisionKind::Close { position } => {
                let (info, tick) = self.trading_context(&position.symbol).await?;
                Ok(self.policy.close_request(position, &info, &tick))
            }
            _ => Err(format!("{} needs no broker request", decision.label())),
        }
    }

    /// Issue the broker request for one decision. Returns whether it succeeded.
    async fn execute(&mut self, cycle_id: &str, decision: &Decision) -> bool {
        let action = decision.label();
        let tag = decision.tag;

        let request = match self.build_request(decision).await {
            Ok(request) => request,
            Err(reason) => {
                warn!(%tag, action, %reason, "Action skipped");
                self.journal_action(cycle_id, decision, "", None, &reason, false)
                    .await;
                return false;
            }
        };

        let timeout = self.config.broker_timeout;
        let outcome = with_timeout(timeout, "order_send", self.gateway.order_send(&request)).await;

        match outcome {
            Ok(result) if result.is_success() => {
                info!(
                    %tag,
                    action,
                    symbol = %request.symbol,
                    retcode = result.retcode,
                    order = result.order,
                    price = %result.price,
                    "Request executed"
                );
                self.journal_result(cycle_id, decision, &request, &result, true)
                    .await;
                true
            }
            Ok(result) => {
                let account = with_timeout(timeout, "account_info", self.gateway.account_info())
                    .await
                    .ok();
                error!(
                    %tag,
                    action,
                    retcode = result.retcode,
                    comment = %result.comment,
                    request = ?request,
                    account = ?account,
                    "Broker rejected request"
                );
                self.journal_result(cycle_id, decision, &request, &result, false)
                    .await;
                false
            }
            Err(e) => {
                error!(
                    %tag,
                    action,
                    error = %e,
                    request = ?request,
                    "Broker request unconfirmed"
                );
                self.journal_action(cycle_id, decision, &request.symbol, None, &e.to_string(), false)
                    .await;
                false
            }
        }
    }

    async fn journal_result(
        &self,
        cycle_id: &str,
        decision: &Decision,
        request: &OrderRequest,
        result: &OrderResult,
        success: bool,
    ) {
        self.journal_action(
            cycle_id,
            decision,
            &request.symbol,
            Some(result.retcode),
            &result.comment,
            success,
        )
        .await;
    }

    async fn journal_action(
        &self,
        cycle_id: &str,
        decision: &Decision,
        symbol: &str,
        retcode: Option<u32>,
        comment: &str,
        success: bool,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };

        let (signal_id, ticket) = match &decision.kind {
            DecisionKind::Create { signal, .. } => (Some(signal.external_signal_id.clone()), None),
            DecisionKind::Update { signal, position } => (
                Some(signal.external_signal_id.clone()),
                Some(position.ticket as i64),
            ),
            DecisionKind::Close { position } => (None, Some(position.ticket as i64)),
            _ => (None, None),
        };

        let record = ActionRecord {
            cycle_id: cycle_id.to_string(),
            login: self.login,
            kind: decision.label().to_string(),
            tag: decision.tag.to_string(),
            signal_id,
            ticket,
            symbol: symbol.to_string(),
            retcode: retcode.map(i64::from),
            comment: comment.to_string(),
            success,
        };
        if let Err(e) = journal.record_action(&record).await {
            warn!(error = %e, "Failed to journal action");
        }
    }
}

/// Runs one driver task per configured account.
pub struct Supervisor {
    settings: Settings,
    dry_run: bool,
    once: bool,
    only_login: Option<u64>,
    journal: Option<Journal>,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            dry_run: false,
            once: false,
            only_login: None,
            journal: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub fn only_login(mut self, login: Option<u64>) -> Self {
        self.only_login = login;
        self
    }

    pub fn with_journal(mut self, journal: Option<Journal>) -> Self {
        self.journal = journal;
        self
    }

    /// Run every selected account until shutdown. Returns the number of
    /// accounts whose driver ended with a setup failure.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<usize> {
        let accounts: Vec<AccountConfig> = self
            .settings
            .accounts
            .iter()
            .filter(|a| self.only_login.map_or(true, |login| a.login == login))
            .cloned()
            .collect();

        if accounts.is_empty() {
            anyhow::bail!("No configured account matches the selection");
        }

        info!(
            accounts = accounts.len(),
            dry_run = self.dry_run,
            once = self.once,
            "Starting account drivers"
        );

        let mut handles = Vec::with_capacity(accounts.len());
        for account in accounts {
            let span = info_span!("account", login = account.login, bot = %account.bot_name);
            let task = run_account(
                self.settings.clone(),
                account.clone(),
                self.journal.clone(),
                self.dry_run,
                self.once,
                shutdown.clone(),
            );
            handles.push((account.login, tokio::spawn(task.instrument(span))));
        }

        let mut failed = 0;
        for (login, handle) in handles {
            match handle.await {
                Ok(Ok(())) => info!(login, "Account driver stopped"),
                Ok(Err(e)) => {
                    failed += 1;
                    error!(login, error = %e, "Account driver failed to start");
                }
                Err(e) => {
                    failed += 1;
                    error!(login, error = %e, "Account driver task panicked");
                }
            }
        }
        Ok(failed)
    }
}

/// Build and drive one account with the gateway its configuration names.
pub async fn run_account(
    settings: Settings,
    account: AccountConfig,
    journal: Option<Journal>,
    dry_run: bool,
    once: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SetupError> {
    let source = SignalClient::with_options(
        &settings.signal_api_url,
        settings.fetch_timeout(),
        settings.batch_fetch,
    )
    .map_err(|e| SetupError::Client {
        login: account.login,
        message: e.to_string(),
    })?;

    let run = AccountRun {
        settings: &settings,
        account: &account,
        journal,
        once,
        shutdown,
    };

    match &account.gateway {
        GatewayConfig::Bridge { url } => {
            let gateway = BridgeGateway::with_timeout(
                url.as_str(),
                account.server_utc_offset_minutes,
                settings.broker_timeout(),
            )
            .map_err(|e| SetupError::Client {
                login: account.login,
                message: e.to_string(),
            })?;
            if dry_run {
                run.drive(DryRun::new(gateway), source).await
            } else {
                run.drive(gateway, source).await
            }
        }
        GatewayConfig::Paper { balance, quotes } => {
            let mut gateway = PaperGateway::new(account.login, *balance);
            for (symbol, quote) in quotes {
                gateway = gateway.with_quote(symbol, quote.bid, quote.ask);
            }
            if dry_run {
                run.drive(DryRun::new(gateway), source).await
            } else {
                run.drive(gateway, source).await
            }
        }
    }
}

struct AccountRun<'a> {
    settings: &'a Settings,
    account: &'a AccountConfig,
    journal: Option<Journal>,
    once: bool,
    shutdown: watch::Receiver<bool>,
}

impl AccountRun<'_> {
    async fn drive<G, S>(self, gateway: G, source: S) -> Result<(), SetupError>
    where
        G: BrokerGateway,
        S: SignalSource,
    {
        let config = DriverConfig::from_settings(self.settings, self.account);
        let mut driver =
            AccountDriver::new(self.account, &self.settings.separator, config, gateway, source)?;
        if let Some(journal) = self.journal {
            driver = driver.with_journal(journal);
        }

        if self.once {
            let report = driver.run_once().await?;
            info!(cycle = %report.id, "{report}");
            Ok(())
        } else {
            driver.run(self.shutdown).await
        }
    }
}
