//! Correlation tags ("magic numbers") linking a remote signal to a local trade.
//!
//! A tag is the decimal concatenation `{trader_id}{separator}{signal_id}`
//! stored in the broker's 64-bit magic field. It is the only link between a
//! signal and the positions or deals it produced.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TagError;

/// Broker-side correlation value of a copied trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationTag(u64);

impl CorrelationTag {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationTag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The set of tags owned by one trader under one separator.
///
/// Membership is decided by decoding a tag back into its trader and signal
/// segments, never by prefix matching alone: the decimal form is split at the
/// first occurrence of the separator after a non-empty trader segment.
/// [`TagFamily::new`] rejects trader ids for which that split would be
/// ambiguous, which makes tags injective across every accepted trader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagFamily {
    trader_id: String,
    separator: String,
}

impl TagFamily {
    pub fn new(trader_id: impl Into<String>, separator: impl Into<String>) -> Result<Self, TagError> {
        let trader_id = trader_id.into();
        let separator = separator.into();

        validate_separator(&separator)?;
        require_digits("trader id", &trader_id)?;
        if trader_id.starts_with('0') {
            return Err(TagError::LeadingZero(trader_id));
        }

        // Decoding searches from index 1, so the first separator occurrence
        // past that point must be the one right after the trader id.
        let head = format!("{}{}", trader_id, &separator[..separator.len() - 1]);
        if head[1..].contains(separator.as_str()) {
            return Err(TagError::AmbiguousSeparator {
                trader_id,
                separator,
            });
        }

        Ok(Self {
            trader_id,
            separator,
        })
    }

    pub fn trader_id(&self) -> &str {
        &self.trader_id
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Digit prefix shared by every tag of this family.
    pub fn prefix(&self) -> String {
        format!("{}{}", self.trader_id, self.separator)
    }

    /// Compose the tag for a signal id.
    pub fn tag(&self, external_signal_id: &str) -> Result<CorrelationTag, TagError> {
        require_digits("signal id", external_signal_id)?;

        let digits = format!("{}{}", self.prefix(), external_signal_id);
        digits
            .parse::<u64>()
            .map(CorrelationTag)
            .map_err(|_| TagError::Overflow { digits })
    }

    /// Recover the signal id from a tag owned by this family.
    pub fn decode(&self, tag: CorrelationTag) -> Option<String> {
        let (trader_id, signal_id) = split_tag(tag, &self.separator)?;
        (trader_id == self.trader_id).then(|| signal_id.to_string())
    }

    pub fn owns(&self, tag: CorrelationTag) -> bool {
        self.decode(tag).is_some()
    }
}

impl fmt::Display for TagFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.trader_id, self.separator)
    }
}

/// Validate a deployment separator on its own.
pub fn validate_separator(separator: &str) -> Result<(), TagError> {
    require_digits("separator", separator)
}

/// Split a tag into its (trader, signal) segments under `separator`.
fn split_tag(tag: CorrelationTag, separator: &str) -> Option<(String, String)> {
    if separator.is_empty() {
        return None;
    }
    let digits = tag.0.to_string();
    // Trader segment is non-empty, so the search starts at index 1.
    let at = digits.get(1..)?.find(separator)? + 1;
    let signal = &digits[at + separator.len()..];
    if signal.is_empty() {
        return None;
    }
    Some((digits[..at].to_string(), signal.to_string()))
}

fn require_digits(field: &'static str, value: &str) -> Result<(), TagError> {
    if value.is_empty() {
        return Err(TagError::Empty { field });
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TagError::NotNumeric {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
