//! Change reason reduction.
//!
//! Folds the chronologically ordered reasons recorded for one key between a
//! base marker and the current marker into a single overall reason:
//!
//! - net existence changed (adds != removes): the most recent structural reason
//! - net existence unchanged but something changed on the way: the change reason
//! - nothing recorded: no row
//!
//! Two structural reasons of the same polarity with no opposite one between
//! them cannot come out of a consistent ledger and are reported as corruption.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Effect of a reason on entity existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Entity starts existing.
    Add,
    /// Entity stops existing.
    Remove,
    /// Entity payload changed in place.
    Change,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
            Self::Change => write!(f, "change"),
        }
    }
}

/// Errors raised while reducing a reason chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReducerError {
    /// The reason is not part of the artifact's vocabulary.
    #[error("Unknown change reason '{reason}' for {vocabulary}")]
    UnknownReason {
        /// Vocabulary in use.
        vocabulary: &'static str,
        /// Offending reason.
        reason: String,
    },
    /// Two adds or two removes follow each other.
    #[error("Multiple {polarity} reasons in a row (last: '{reason}')")]
    ConsecutiveStructural {
        /// Polarity that repeated.
        polarity: Polarity,
        /// Reason of the repeated event.
        reason: String,
    },
}

/// The reasons an artifact can record, grouped by polarity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonVocabulary {
    name: &'static str,
    adds: &'static [&'static str],
    removes: &'static [&'static str],
    change: &'static str,
}

impl ReasonVocabulary {
    /// Blacklist reasons.
    pub const BLACKLIST: Self = Self {
        name: "blacklist",
        adds: &["blocked"],
        removes: &["unblocked"],
        change: "changed",
    };

    /// Notification list reasons.
    pub const NOTIFICATIONS: Self = Self {
        name: "notifications",
        adds: &["new"],
        removes: &["resolved", "blacklisted", "no_longer_seen"],
        change: "changed",
    };

    /// Exception list reasons.
    pub const EXCEPTIONS: Self = Self {
        name: "exceptions",
        adds: &["added"],
        removes: &["removed"],
        change: "changed",
    };

    /// Vocabulary name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reason recorded for plain additions.
    pub fn add_reason(&self) -> &'static str {
        self.adds[0]
    }

    /// Reason recorded for in-place changes.
    pub fn change_reason(&self) -> &'static str {
        self.change
    }

    /// Every reason, adds first, then removes, then change.
    pub fn all(&self) -> Vec<&'static str> {
        let mut all: Vec<&'static str> = self.adds.iter().chain(self.removes).copied().collect();
        if !all.contains(&self.change) {
            all.push(self.change);
        }
        all
    }

    /// Classify a reason.
    pub fn classify(&self, reason: &str) -> Result<Polarity, ReducerError> {
        if self.adds.contains(&reason) {
            Ok(Polarity::Add)
        } else if self.removes.contains(&reason) {
            Ok(Polarity::Remove)
        } else if reason == self.change {
            Ok(Polarity::Change)
        } else {
            Err(ReducerError::UnknownReason {
                vocabulary: self.name,
                reason: reason.to_string(),
            })
        }
    }
}

/// Summary of a reason chain that can be composed with the summary of the chain that follows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSummary {
    first_structural: Option<Polarity>,
    last_structural: Option<(Polarity, String)>,
    net: i64,
    has_change: bool,
}

impl ChainSummary {
    /// Summarize a chain, oldest reason first.
    pub fn from_chain<S: AsRef<str>>(
        vocabulary: &ReasonVocabulary,
        chain: &[S],
    ) -> Result<Self, ReducerError> {
        let mut summary = Self::default();
        for reason in chain {
            summary.push(vocabulary, reason.as_ref())?;
        }
        Ok(summary)
    }

    /// Append one reason.
    pub fn push(&mut self, vocabulary: &ReasonVocabulary, reason: &str) -> Result<(), ReducerError> {
        match vocabulary.classify(reason)? {
            Polarity::Change => self.has_change = true,
            polarity => {
                if let Some((last, _)) = &self.last_structural {
                    if *last == polarity {
                        return Err(ReducerError::ConsecutiveStructural {
                            polarity,
                            reason: reason.to_string(),
                        });
                    }
                }
                self.first_structural.get_or_insert(polarity);
                self.net += if polarity == Polarity::Add { 1 } else { -1 };
                self.last_structural = Some((polarity, reason.to_string()));
            }
        }
        Ok(())
    }

    /// Summary of `self` followed by `next`.
    pub fn then(self, next: Self) -> Result<Self, ReducerError> {
        if let (Some((last, _)), Some(first)) = (&self.last_structural, next.first_structural) {
            if *last == first {
                let reason = next
                    .last_structural
                    .as_ref()
                    .map(|(_, r)| r.clone())
                    .unwrap_or_default();
                return Err(ReducerError::ConsecutiveStructural { polarity: first, reason });
            }
        }
        Ok(Self {
            first_structural: self.first_structural.or(next.first_structural),
            last_structural: next.last_structural.or(self.last_structural),
            net: self.net + next.net,
            has_change: self.has_change || next.has_change,
        })
    }

    /// Net number of existence changes (+1 per add, -1 per remove).
    pub fn net(&self) -> i64 {
        self.net
    }

    /// Overall reason, or `None` when nothing visible changed.
    pub fn reason(&self, vocabulary: &ReasonVocabulary) -> Option<String> {
        if self.net != 0 {
            self.last_structural.as_ref().map(|(_, r)| r.clone())
        } else if self.has_change {
            Some(vocabulary.change_reason().to_string())
        } else {
            None
        }
    }
}

/// Reduce a reason chain, oldest first, to one overall reason.
pub fn reduce<S: AsRef<str>>(
    vocabulary: &ReasonVocabulary,
    chain: &[S],
) -> Result<Option<String>, ReducerError> {
    Ok(ChainSummary::from_chain(vocabulary, chain)?.reason(vocabulary))
}
