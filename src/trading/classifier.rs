//! Partitioning of one trader's signals against the account state.
//!
//! For each signal, in input order:
//! 1. a closed deal with the same tag wins: the signal already ran its course
//!    and is never recreated;
//! 2. otherwise an open position with the same tag is compared on stop loss
//!    and take profit and updated when they differ;
//! 3. otherwise the signal is validated and copied if still fresh.
//!
//! Once every signal is decided, each owned position without a signal in the
//! batch is closed, unless its signal was published but unreadable this cycle:
//! such held tags are neither created, updated nor closed. Classification
//! performs no I/O.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::broker::QuoteStatus;
use crate::error::MalformedSignal;
use crate::models::{HistoricalDeal, Position, TradeSignal};

use super::orders::SymbolMapper;
use super::tag::{CorrelationTag, TagFamily};
use super::validator::{SignalValidator, StaleReason, Validation, ValidationReport};

/// Decimal places stop loss and take profit are compared at.
const LEVEL_PRECISION: u32 = 5;

/// Clock and quotes gathered by the driver before classifying.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub now: DateTime<Utc>,
    /// Quote status per broker symbol
    pub quotes: HashMap<String, QuoteStatus>,
}

impl MarketSnapshot {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            quotes: HashMap::new(),
        }
    }

    pub fn with_quote(mut self, symbol: impl Into<String>, status: QuoteStatus) -> Self {
        self.quotes.insert(symbol.into(), status);
        self
    }

    /// Symbols never quoted this cycle count as unavailable.
    pub fn quote(&self, symbol: &str) -> QuoteStatus {
        self.quotes
            .get(symbol)
            .copied()
            .unwrap_or(QuoteStatus::Unavailable)
    }
}

/// What to do about one signal or one orphaned position.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionKind {
    Create {
        signal: TradeSignal,
        broker_symbol: String,
        report: ValidationReport,
    },
    Update {
        signal: TradeSignal,
        position: Position,
    },
    IgnoreClosed {
        signal_id: String,
        deal_ticket: u64,
    },
    IgnoreUnchanged {
        signal_id: String,
        ticket: u64,
    },
    IgnoreStale {
        signal_id: String,
        reason: StaleReason,
        report: ValidationReport,
    },
    /// No quote or unknown symbol; retried next cycle
    SkipNoQuote {
        signal_id: String,
        broker_symbol: String,
        unknown_symbol: bool,
    },
    Close {
        position: Position,
    },
    /// Signal unreadable this cycle; the position is left as is
    Hold {
        signal_id: String,
        ticket: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub tag: CorrelationTag,
    pub kind: DecisionKind,
}

impl Decision {
    /// Short label used in logs and the journal.
    pub fn label(&self) -> &'static str {
        match self.kind {
            DecisionKind::Create { .. } => "create",
            DecisionKind::Update { .. } => "update",
            DecisionKind::IgnoreClosed { .. } => "ignore_closed",
            DecisionKind::IgnoreUnchanged { .. } => "ignore_unchanged",
            DecisionKind::IgnoreStale { .. } => "ignore_stale",
            DecisionKind::SkipNoQuote { .. } => "skip_no_quote",
            DecisionKind::Close { .. } => "close",
            DecisionKind::Hold { .. } => "hold",
        }
    }

    /// Whether the decision needs a broker call.
    pub fn is_action(&self) -> bool {
        matches!(
            self.kind,
            DecisionKind::Create { .. } | DecisionKind::Update { .. } | DecisionKind::Close { .. }
        )
    }

    fn log(&self, family: &TagFamily) {
        let tag = self.tag;
        match &self.kind {
            DecisionKind::Create {
                signal, report, ..
            } => info!(
                %tag,
                signal_id = %signal.external_signal_id,
                trader = family.trader_id(),
                symbol = %signal.symbol,
                direction = %signal.direction,
                age_minutes = report.age_minutes(),
                drift_pips = ?report.drift_pips,
                "Create"
            ),
            DecisionKind::Update { signal, position } => info!(
                %tag,
                signal_id = %signal.external_signal_id,
                ticket = position.ticket,
                old_sl = ?position.stop_loss,
                new_sl = ?signal.stop_loss,
                old_tp = ?position.take_profit,
                new_tp = ?signal.take_profit,
                "Update"
            ),
            DecisionKind::IgnoreClosed {
                signal_id,
                deal_ticket,
            } => debug!(%tag, %signal_id, deal_ticket, "Ignore: already closed"),
            DecisionKind::IgnoreUnchanged { signal_id, ticket } => {
                debug!(%tag, %signal_id, ticket, "Ignore: unchanged")
            }
            DecisionKind::IgnoreStale {
                signal_id,
                reason,
                report,
            } => warn!(
                %tag,
                %signal_id,
                %reason,
                age_minutes = report.age_minutes(),
                max_age_minutes = report.max_age.num_minutes(),
                current_price = ?report.current_price,
                drift_pips = ?report.drift_pips,
                max_drift_pips = %report.max_drift_pips,
                "Ignore: stale signal"
            ),
            DecisionKind::SkipNoQuote {
                signal_id,
                broker_symbol,
                unknown_symbol,
            } => warn!(
                %tag,
                %signal_id,
                symbol = %broker_symbol,
                unknown_symbol,
                "Skip: no quote"
            ),
            DecisionKind::Close { position } => info!(
                %tag,
                ticket = position.ticket,
                symbol = %position.symbol,
                "Close: signal withdrawn"
            ),
            DecisionKind::Hold { signal_id, ticket } => warn!(
                %tag,
                %signal_id,
                ticket,
                "Hold: signal unreadable this cycle, position kept"
            ),
        }
    }
}

/// Decisions for one trader pair, in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub decisions: Vec<Decision>,
    /// Signals whose id could not be turned into a tag
    pub rejected: Vec<MalformedSignal>,
}

impl ReconciliationPlan {
    pub fn updates(&self) -> impl Iterator<Item = &Decision> {
        self.decisions
            .iter()
            .filter(|d| matches!(d.kind, DecisionKind::Update { .. }))
    }

    pub fn creates(&self) -> impl Iterator<Item = &Decision> {
        self.decisions
            .iter()
            .filter(|d| matches!(d.kind, DecisionKind::Create { .. }))
    }

    pub fn closes(&self) -> impl Iterator<Item = &Decision> {
        self.decisions
            .iter()
            .filter(|d| matches!(d.kind, DecisionKind::Close { .. }))
    }

    /// Number of decisions with the given label.
    pub fn count(&self, label: &str) -> usize {
        self.decisions.iter().filter(|d| d.label() == label).count()
    }

    pub fn has_actions(&self) -> bool {
        self.decisions.iter().any(Decision::is_action)
    }
}

/// Null-safe comparison of two price levels at 5 decimal places.
pub fn levels_equal(a: Option<Decimal>, b: Option<Decimal>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.round_dp(LEVEL_PRECISION) == b.round_dp(LEVEL_PRECISION),
        _ => false,
    }
}

/// Classifier for one trader family on one account.
pub struct Classifier<'a> {
    family: &'a TagFamily,
    validator: &'a SignalValidator,
    symbols: &'a SymbolMapper,
    held: Option<&'a HashSet<CorrelationTag>>,
}

impl<'a> Classifier<'a> {
    pub fn new(
        family: &'a TagFamily,
        validator: &'a SignalValidator,
        symbols: &'a SymbolMapper,
    ) -> Self {
        Self {
            family,
            validator,
            symbols,
            held: None,
        }
    }

    /// Tags of signals that were published but could not be read this cycle.
    pub fn holding(mut self, held: &'a HashSet<CorrelationTag>) -> Self {
        self.held = Some(held);
        self
    }

    fn is_held(&self, tag: CorrelationTag) -> bool {
        self.held.is_some_and(|held| held.contains(&tag))
    }

    pub fn classify(
        &self,
        signals: &[TradeSignal],
        positions: &[Position],
        deals: &[HistoricalDeal],
        market: &MarketSnapshot,
    ) -> ReconciliationPlan {
        let mut plan = ReconciliationPlan::default();

        let mut open_by_tag: HashMap<CorrelationTag, Vec<&Position>> = HashMap::new();
        for position in positions.iter().filter(|p| self.family.owns(p.correlation_tag)) {
            open_by_tag
                .entry(position.correlation_tag)
                .or_default()
                .push(position);
        }

        // A tag that is open again is not terminal, whatever the history says.
        let mut closed_by_tag: HashMap<CorrelationTag, &HistoricalDeal> = HashMap::new();
        for deal in deals.iter().filter(|d| {
            self.family.owns(d.correlation_tag) && !open_by_tag.contains_key(&d.correlation_tag)
        }) {
            closed_by_tag.entry(deal.correlation_tag).or_insert(deal);
        }

        let mut signal_tags = HashSet::new();
        for signal in signals {
            let tag = match self.family.tag(&signal.external_signal_id) {
                Ok(tag) => tag,
                Err(e) => {
                    warn!(
                        signal_id = %signal.external_signal_id,
                        trader = self.family.trader_id(),
                        error = %e,
                        "Signal id cannot be tagged"
                    );
                    plan.rejected.push(MalformedSignal {
                        signal_id: signal.external_signal_id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if self.is_held(tag) {
                debug!(%tag, signal_id = %signal.external_signal_id, "Held tag, signal skipped");
                continue;
            }
            signal_tags.insert(tag);

            if let Some(deal) = closed_by_tag.get(&tag) {
                plan.decisions.push(Decision {
                    tag,
                    kind: DecisionKind::IgnoreClosed {
                        signal_id: signal.external_signal_id.clone(),
                        deal_ticket: deal.ticket,
                    },
                });
            } else if let Some(open) = open_by_tag.get(&tag) {
                for position in open {
                    plan.decisions.push(self.compare_levels(tag, signal, position));
                }
            } else {
                plan.decisions.push(self.validate_new(tag, signal, market));
            }
        }

        // Closes come last and keep position input order.
        for position in positions {
            let tag = position.correlation_tag;
            if !open_by_tag.contains_key(&tag) || signal_tags.contains(&tag) {
                continue;
            }
            let kind = if self.is_held(tag) {
                DecisionKind::Hold {
                    signal_id: self.family.decode(tag).unwrap_or_default(),
                    ticket: position.ticket,
                }
            } else {
                DecisionKind::Close {
                    position: position.clone(),
                }
            };
            plan.decisions.push(Decision { tag, kind });
        }

        for decision in &plan.decisions {
            decision.log(self.family);
        }
        plan
    }

    fn compare_levels(
        &self,
        tag: CorrelationTag,
        signal: &TradeSignal,
        position: &Position,
    ) -> Decision {
        let unchanged = levels_equal(position.stop_loss, signal.stop_loss)
            && levels_equal(position.take_profit, signal.take_profit);

        let kind = if unchanged {
            DecisionKind::IgnoreUnchanged {
                signal_id: signal.external_signal_id.clone(),
                ticket: position.ticket,
            }
        } else {
            DecisionKind::Update {
                signal: signal.clone(),
                position: position.clone(),
            }
        };
        Decision { tag, kind }
    }

    fn validate_new(
        &self,
        tag: CorrelationTag,
        signal: &TradeSignal,
        market: &MarketSnapshot,
    ) -> Decision {
        let broker_symbol = self.symbols.broker_symbol(&signal.symbol);
        let quote = market.quote(&broker_symbol);
        let signal_id = signal.external_signal_id.clone();

        let kind = match self
            .validator
            .validate(signal, &broker_symbol, &quote, market.now)
        {
            Validation::Accepted(report) => DecisionKind::Create {
                signal: signal.clone(),
                broker_symbol,
                report,
            },
            Validation::Stale { reason, report } => DecisionKind::IgnoreStale {
                signal_id,
                reason,
                report,
            },
            Validation::QuoteUnavailable => DecisionKind::SkipNoQuote {
                signal_id,
                broker_symbol,
                unknown_symbol: false,
            },
            Validation::SymbolUnavailable => DecisionKind::SkipNoQuote {
                signal_id,
                broker_symbol,
                unknown_symbol: true,
            },
        };
        Decision { tag, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Tick;
    use crate::models::Direction;
    use crate::trading::validator::ValidatorConfig;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    const TAG_77: u64 = 40465699977;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn family() -> TagFamily {
        TagFamily::new("404656", "999").unwrap()
    }

    fn validator() -> SignalValidator {
        SignalValidator::new(ValidatorConfig {
            max_signal_age_minutes: 30,
            max_price_drift_pips: dec!(5),
        })
    }

    fn market() -> MarketSnapshot {
        MarketSnapshot::new(now()).with_quote(
            "EURUSD",
            QuoteStatus::Live(Tick {
                bid: dec!(1.1000),
                ask: dec!(1.1001),
                time: now(),
            }),
        )
    }

    fn signal(id: &str, sl: Option<Decimal>, tp: Option<Decimal>) -> TradeSignal {
        TradeSignal {
            external_signal_id: id.to_string(),
            symbol: "EUR/USD".to_string(),
            direction: Direction::Buy,
            size: dec!(1),
            issued_at: now() - Duration::minutes(5),
            order_price: dec!(1.1000),
            market_price: None,
            stop_loss: sl,
            take_profit: tp,
        }
    }

    fn position(ticket: u64, tag: u64, sl: Option<Decimal>, tp: Option<Decimal>) -> Position {
        Position {
            ticket,
            correlation_tag: CorrelationTag::new(tag),
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            volume: dec!(1),
            open_price: dec!(1.1),
            stop_loss: sl,
            take_profit: tp,
            opened_at: now() - Duration::minutes(4),
        }
    }

    fn deal(ticket: u64, tag: u64, position_id: u64) -> HistoricalDeal {
        HistoricalDeal {
            ticket,
            correlation_tag: CorrelationTag::new(tag),
            position_id,
            symbol: "EURUSD".to_string(),
            closed_at: now() - Duration::minutes(1),
        }
    }

    fn classify(
        signals: &[TradeSignal],
        positions: &[Position],
        deals: &[HistoricalDeal],
        market: &MarketSnapshot,
    ) -> ReconciliationPlan {
        let family = family();
        let validator = validator();
        let symbols = SymbolMapper::default();
        Classifier::new(&family, &validator, &symbols).classify(signals, positions, deals, market)
    }

    #[test]
    fn test_levels_equal() {
        assert!(levels_equal(None, None));
        assert!(levels_equal(Some(dec!(1.100001)), Some(dec!(1.1))));
        assert!(!levels_equal(Some(dec!(1.10000)), Some(dec!(1.10001))));
        assert!(!levels_equal(Some(dec!(1.1)), None));
        assert!(!levels_equal(None, Some(dec!(1.1))));
    }

    #[test]
    fn test_changed_stop_loss_yields_update() {
        let signals = [signal("77", Some(dec!(1.10001)), Some(dec!(1.11000)))];
        let positions = [position(5, TAG_77, Some(dec!(1.10000)), Some(dec!(1.11000)))];

        let plan = classify(&signals, &positions, &[], &market());

        assert_eq!(plan.decisions.len(), 1);
        assert_eq!(plan.decisions[0].tag.value(), TAG_77);
        match &plan.decisions[0].kind {
            DecisionKind::Update { signal, position } => {
                assert_eq!(signal.stop_loss, Some(dec!(1.10001)));
                assert_eq!(position.ticket, 5);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_closed_signal_is_never_recreated() {
        let signals = [signal("77", None, None)];
        let deals = [deal(300, TAG_77, 5)];

        let plan = classify(&signals, &[], &deals, &market());

        assert_eq!(
            plan.decisions[0].kind,
            DecisionKind::IgnoreClosed {
                signal_id: "77".to_string(),
                deal_ticket: 300
            }
        );
        assert!(!plan.has_actions());
    }

    #[test]
    fn test_open_position_takes_precedence_over_history() {
        // Entry deal of the currently open position is in the history too.
        let signals = [signal("77", Some(dec!(1.09)), None)];
        let positions = [position(5, TAG_77, Some(dec!(1.09)), None)];
        let deals = [deal(300, TAG_77, 5)];

        let plan = classify(&signals, &positions, &deals, &market());
        assert_eq!(plan.count("ignore_unchanged"), 1);
        assert_eq!(plan.count("ignore_closed"), 0);
    }

    #[test]
    fn test_unchanged_levels_are_idempotent() {
        let signals = [signal("77", Some(dec!(1.0950000004)), None)];
        let positions = [position(5, TAG_77, Some(dec!(1.095)), None)];

        for _ in 0..3 {
            let plan = classify(&signals, &positions, &[], &market());
            assert_eq!(plan.count("ignore_unchanged"), 1);
            assert_eq!(plan.updates().count(), 0);
        }
    }

    #[test]
    fn test_null_level_on_one_side_is_an_update() {
        let signals = [signal("77", None, Some(dec!(1.2)))];
        let positions = [position(5, TAG_77, Some(dec!(1.05)), Some(dec!(1.2)))];

        let plan = classify(&signals, &positions, &[], &market());
        assert_eq!(plan.updates().count(), 1);
    }

    #[test]
    fn test_fresh_signal_is_created() {
        let signals = [signal("78", Some(dec!(1.09)), None)];
        let plan = classify(&signals, &[], &[], &market());

        match &plan.decisions[0].kind {
            DecisionKind::Create {
                broker_symbol,
                report,
                ..
            } => {
                assert_eq!(broker_symbol, "EURUSD");
                assert_eq!(report.drift_pips, Some(dec!(1)));
            }
            other => panic!("expected create, got {other:?}"),
        }
        assert_eq!(plan.decisions[0].tag.value(), 40465699978);
    }

    #[test]
    fn test_old_signal_is_stale() {
        let mut old = signal("78", None, None);
        old.issued_at = now() - Duration::minutes(45);

        let plan = classify(&[old], &[], &[], &market());
        assert!(matches!(
            plan.decisions[0].kind,
            DecisionKind::IgnoreStale {
                reason: StaleReason::TooOld,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_quote_skips_signal() {
        let plan = classify(&[signal("78", None, None)], &[], &[], &MarketSnapshot::new(now()));
        assert!(matches!(
            plan.decisions[0].kind,
            DecisionKind::SkipNoQuote {
                unknown_symbol: false,
                ..
            }
        ));
        assert!(!plan.has_actions());
    }

    #[test]
    fn test_orphans_closed_after_signals_in_position_order() {
        let signals = [signal("77", None, None)];
        let positions = [
            position(8, 40465699990, None, None),
            position(5, TAG_77, None, None),
            position(6, 40465699981, None, None),
        ];

        let plan = classify(&signals, &positions, &[], &market());

        let closes: Vec<u64> = plan
            .closes()
            .map(|d| match &d.kind {
                DecisionKind::Close { position } => position.ticket,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(closes, vec![8, 6]);
        // Signal decisions precede every close.
        assert_eq!(plan.decisions[0].label(), "ignore_unchanged");
        assert!(plan.decisions[1..].iter().all(|d| d.label() == "close"));
    }

    #[test]
    fn test_foreign_positions_are_left_alone() {
        let positions = [
            position(1, 0, None, None),
            position(2, 123456, None, None),
            // Another trader sharing the separator
            position(3, 4046599977, None, None),
        ];
        let plan = classify(&[], &positions, &[], &market());
        assert!(plan.decisions.is_empty());
    }

    #[test]
    fn test_positions_sharing_a_tag_are_handled_individually() {
        let signals = [signal("77", Some(dec!(1.09)), None)];
        let positions = [
            position(5, TAG_77, Some(dec!(1.09)), None),
            position(6, TAG_77, Some(dec!(1.08)), None),
        ];
        let plan = classify(&signals, &positions, &[], &market());
        assert_eq!(plan.count("ignore_unchanged"), 1);
        assert_eq!(plan.updates().count(), 1);

        let plan = classify(&[], &positions, &[], &market());
        assert_eq!(plan.closes().count(), 2);
    }

    #[test]
    fn test_held_tag_is_neither_closed_nor_changed() {
        let family = family();
        let validator = validator();
        let symbols = SymbolMapper::default();
        let held: HashSet<CorrelationTag> = [CorrelationTag::new(TAG_77)].into_iter().collect();

        // "77" dropped at the fetch boundary, "81" withdrawn for real.
        let positions = [
            position(5, TAG_77, Some(dec!(1.09)), None),
            position(6, 40465699981, None, None),
        ];
        let plan = Classifier::new(&family, &validator, &symbols)
            .holding(&held)
            .classify(&[], &positions, &[], &market());

        assert_eq!(plan.decisions.len(), 2);
        assert_eq!(
            plan.decisions[0].kind,
            DecisionKind::Hold {
                signal_id: "77".to_string(),
                ticket: 5
            }
        );
        assert_eq!(plan.closes().count(), 1);
        assert_eq!(plan.decisions[1].tag.value(), 40465699981);

        // A readable duplicate of a held id is not acted on either.
        let signals = [signal("77", Some(dec!(1.08)), None)];
        let plan = Classifier::new(&family, &validator, &symbols)
            .holding(&held)
            .classify(&signals, &positions[..1], &[], &market());
        assert_eq!(plan.count("hold"), 1);
        assert!(!plan.has_actions());
    }

    #[test]
    fn test_untaggable_signal_is_rejected() {
        let plan = classify(&[signal("123456789012", None, None)], &[], &[], &market());
        assert!(plan.decisions.is_empty());
        assert_eq!(plan.rejected.len(), 1);
    }
}
