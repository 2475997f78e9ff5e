use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, VigilError};

/// Vigil version information
pub const VIGIL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Well-known metric names emitted by the agent
pub const POLL_COUNT_METRIC: &str = "PollCount";
pub const RANDOM_VALUE_METRIC: &str = "RandomValue";

/// Kind of a metric, selects which value field is populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Accumulating metric, submissions add to the stored delta
    Counter,
    /// Point-in-time metric, submissions replace the stored value
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            other => Err(VigilError::UnknownKind(other.to_string())),
        }
    }
}

/// A single metric record as exchanged between agent, server and snapshot file.
///
/// Exactly one of `delta` / `value` is set, matching `kind`. Absent fields are
/// omitted from the JSON form so that `0` and "not set" stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    /// Check the record invariants: non-empty id and exactly the field that
    /// matches the kind.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(VigilError::InvalidMetric("empty metric id".into()));
        }
        match (self.kind, self.delta, self.value) {
            (MetricKind::Counter, Some(_), None) => Ok(()),
            (MetricKind::Gauge, None, Some(v)) if v.is_finite() => Ok(()),
            (MetricKind::Gauge, None, Some(_)) => Err(VigilError::InvalidMetric(format!(
                "gauge {} carries a non-finite value",
                self.id
            ))),
            (kind, _, _) => Err(VigilError::InvalidMetric(format!(
                "{} {} must carry only its {} field",
                kind,
                self.id,
                if kind == MetricKind::Counter { "delta" } else { "value" }
            ))),
        }
    }

    /// Apply `incoming` onto this stored record.
    ///
    /// Gauges are last-write-wins, counters accumulate. The stored record is
    /// left untouched when the kinds differ or the counter would overflow.
    pub fn merge(&mut self, incoming: &Metric) -> Result<()> {
        if self.kind != incoming.kind {
            return Err(VigilError::KindMismatch {
                id: self.id.clone(),
                stored: self.kind,
                incoming: incoming.kind,
            });
        }
        match self.kind {
            MetricKind::Gauge => {
                self.value = incoming.value;
            }
            MetricKind::Counter => {
                let current = self.delta.unwrap_or(0);
                let added = incoming.delta.unwrap_or(0);
                let total = current.checked_add(added).ok_or_else(|| {
                    VigilError::InvalidMetric(format!("counter {} overflows", self.id))
                })?;
                self.delta = Some(total);
            }
        }
        Ok(())
    }

    /// Render the populated value the way the plain-text read path prints it.
    pub fn value_string(&self) -> String {
        match self.kind {
            MetricKind::Counter => self.delta.unwrap_or_default().to_string(),
            MetricKind::Gauge => self.value.unwrap_or_default().to_string(),
        }
    }
}

/// An ordered batch of records submitted or persisted together
pub type Batch = Vec<Metric>;
