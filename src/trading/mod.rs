//! Reconciliation engine: tags, validation, classification, order building.

mod classifier;
mod orders;
mod tag;
mod validator;

pub use classifier::{Classifier, Decision, DecisionKind, MarketSnapshot, ReconciliationPlan};
pub use orders::{OrderPolicy, SymbolMapper};
pub use tag::{validate_separator, CorrelationTag, TagFamily};
pub use validator::{SignalValidator, ValidatorConfig};
