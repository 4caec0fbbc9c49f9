//! Retention policies and the PolicyEngine.
//!
//! [`evaluate`] is a pure function of the policy, the record's tags and its
//! age in days: no clock reads, no randomness. Re-evaluating the same inputs
//! during an audit always reproduces the same decision.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use nocturne_state::Record;
use serde::{Deserialize, Serialize};

use crate::domain::error::{NocturneError, Result};

/// Retention strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Strategy {
    /// Forget once the record is older than `retention_days`.
    TimeBased,
    /// Forget once the record is older than a window shrunk by its risk score.
    RiskBased,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::TimeBased => "time_based",
            Strategy::RiskBased => "risk_based",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = NocturneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "time_based" => Ok(Strategy::TimeBased),
            "risk_based" => Ok(Strategy::RiskBased),
            other => Err(NocturneError::UnsupportedStrategy(other.to_string())),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = NocturneError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Strategy> for String {
    fn from(s: Strategy) -> Self {
        s.as_str().to_string()
    }
}

#[derive(Deserialize)]
struct PolicyFields {
    retention_days: i64,
    strategy: String,
    #[serde(default)]
    exempt_tags: Vec<String>,
}

/// A retention policy. Validated on construction; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyFields")]
pub struct Policy {
    retention_days: u32,
    strategy: Strategy,
    exempt_tags: BTreeSet<String>,
}

impl TryFrom<PolicyFields> for Policy {
    type Error = NocturneError;

    fn try_from(fields: PolicyFields) -> Result<Self> {
        Policy::new(
            fields.retention_days,
            fields.strategy.parse()?,
            fields.exempt_tags,
        )
    }
}

impl Policy {
    pub fn new<I, S>(retention_days: i64, strategy: Strategy, exempt_tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let retention_days = u32::try_from(retention_days).map_err(|_| {
            NocturneError::InvalidPolicy(format!(
                "retention_days must be a non-negative integer, got {retention_days}"
            ))
        })?;
        let exempt_tags: BTreeSet<String> = exempt_tags.into_iter().map(Into::into).collect();
        if exempt_tags.iter().any(|t| t.trim().is_empty()) {
            return Err(NocturneError::InvalidPolicy(
                "exempt tags must not be blank".to_string(),
            ));
        }
        Ok(Self {
            retention_days,
            strategy,
            exempt_tags,
        })
    }

    /// Time-based policy with no exemptions.
    pub fn time_based(retention_days: u32) -> Self {
        Self {
            retention_days,
            strategy: Strategy::TimeBased,
            exempt_tags: BTreeSet::new(),
        }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn exempt_tags(&self) -> &BTreeSet<String> {
        &self.exempt_tags
    }
}

/// Keep/forget verdict for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Keep,
    Forget,
}

/// External risk score in `[0, 1]`; higher means riskier to retain.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct RiskScore(f64);

impl RiskScore {
    pub fn new(score: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&score) {
            return Err(NocturneError::InsufficientSignal(format!(
                "risk score must be within [0, 1], got {score}"
            )));
        }
        Ok(Self(score))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

/// External inputs a strategy may need beyond tags and age.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub risk: Option<RiskScore>,
}

impl Signals {
    pub fn with_risk(score: RiskScore) -> Self {
        Self { risk: Some(score) }
    }
}

/// Evaluate `policy` for a record with no external signals.
pub fn evaluate(policy: &Policy, record_tags: &BTreeSet<String>, age_days: u64) -> Result<Decision> {
    evaluate_with(policy, record_tags, age_days, &Signals::default())
}

/// Evaluate `policy` for a record.
///
/// Precedence: an exempt tag always keeps the record; otherwise the strategy
/// decides. A risk-based policy without a risk score fails with
/// `InsufficientSignal` rather than guessing.
pub fn evaluate_with(
    policy: &Policy,
    record_tags: &BTreeSet<String>,
    age_days: u64,
    signals: &Signals,
) -> Result<Decision> {
    if !policy.exempt_tags.is_disjoint(record_tags) {
        return Ok(Decision::Keep);
    }

    let forget = match policy.strategy {
        Strategy::TimeBased => age_days > u64::from(policy.retention_days),
        Strategy::RiskBased => {
            let score = signals.risk.ok_or_else(|| {
                NocturneError::InsufficientSignal(
                    "risk_based policy requires a risk score".to_string(),
                )
            })?;
            let window = f64::from(policy.retention_days) * (1.0 - score.value());
            age_days as f64 > window
        }
    };
    Ok(if forget {
        Decision::Forget
    } else {
        Decision::Keep
    })
}

/// Source of risk scores for risk-based policies.
#[async_trait]
pub trait RiskSignalSource: Send + Sync {
    /// Risk score for `record`, or `None` when no signal is available.
    async fn risk_score(&self, record: &Record) -> Result<Option<RiskScore>>;
}

/// Signal source that never has a score.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRiskSignal;

#[async_trait]
impl RiskSignalSource for NoRiskSignal {
    async fn risk_score(&self, _record: &Record) -> Result<Option<RiskScore>> {
        Ok(None)
    }
}
