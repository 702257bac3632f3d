//! Single sensor conditions and their state-aware hysteresis evaluation.
//!
//! A condition compares one parameter of one sensor against a threshold.
//! While the targeted relay is off, the raw threshold decides; once it is on,
//! the comparison is widened by the hysteresis band so the relay holds its
//! state until the value has moved clearly back across the threshold.
//!
//! ```text
//!   op   relay off          relay on
//!   >    actual >  t        actual >  t - h
//!   <    actual <  t        actual <  t + h
//!   >=   actual >= t        actual >  t - h
//!   <=   actual <= t        actual <  t + h
//!   ==   actual == t        actual == t
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::relay::RelayState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Numbers in rule files are sometimes stored as strings by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Number(f64),
    Text(String),
}

impl Threshold {
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().ok()?,
        };
        v.is_finite().then_some(v)
    }
}

#[cfg(test)]
impl From<f64> for Threshold {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

/// How a condition joins the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(alias = "sensorId")]
    pub sensor: String,
    pub param: String,
    pub op: Operator,
    pub value: Threshold,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hysteresis: Option<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<Logic>,
}

impl Condition {
    /// Hysteresis band; unparsable or negative values count as no band.
    pub fn band(&self) -> f64 {
        self.hysteresis
            .as_ref()
            .and_then(Threshold::as_f64)
            .map(|h| h.max(0.0))
            .unwrap_or(0.0)
    }

    /// Human-readable form used in switch explanations.
    pub fn describe(&self, actual: Option<f64>) -> String {
        let band = self.band();
        let band = if band > 0.0 {
            format!(" ±{band}")
        } else {
            String::new()
        };
        let threshold = match self.value.as_f64() {
            Some(v) => v.to_string(),
            None => format!("{:?}", self.value),
        };
        let actual = match actual {
            Some(v) => v.to_string(),
            None => "n/a".to_string(),
        };
        format!(
            "{} {} {threshold}{band} @{} (now {actual})",
            self.param, self.op, self.sensor
        )
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate `actual` against `cond` given the relay's current state.
/// Missing data or an unparsable threshold always yields `false`.
pub fn evaluate(actual: Option<f64>, cond: &Condition, current: RelayState) -> bool {
    let (Some(actual), Some(t)) = (actual, cond.value.as_f64()) else {
        return false;
    };
    let h = cond.band();

    match (cond.op, current) {
        (Operator::Gt, RelayState::Off) => actual > t,
        (Operator::Gt, RelayState::On) => actual > t - h,
        (Operator::Lt, RelayState::Off) => actual < t,
        (Operator::Lt, RelayState::On) => actual < t + h,
        (Operator::Ge, RelayState::Off) => actual >= t,
        (Operator::Ge, RelayState::On) => actual > t - h,
        (Operator::Le, RelayState::Off) => actual <= t,
        (Operator::Le, RelayState::On) => actual < t + h,
        (Operator::Eq, _) => actual == t,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
