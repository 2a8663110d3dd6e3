//! Incremental market-structure engine.
//!
//! Detectors maintain swing pivots, trend, zones, Fibonacci levels, rolling
//! extremes and fib-derived zones in O(1) per exec bar. Rule evaluation only
//! ever reads their current field values; structures are record-only and
//! cannot influence market data or fills.
//!
//! Detectors reference each other by name at declaration time; the engine
//! resolves names to slots at construction and updates in declaration order
//! (a dependency must be declared before its dependent). No detector writes
//! to another's state: dependents receive a copy of the upstream swing
//! outputs each bar.

pub mod derived_zone;
pub mod fibonacci;
pub mod rolling_window;
pub mod swing;
pub mod trend;
pub mod zone;

use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::feed::Feed;
use crate::params::Params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Registered structure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    Swing,
    Trend,
    Zone,
    Fibonacci,
    RollingWindow,
    DerivedZone,
}

impl StructureKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "swing" => Ok(StructureKind::Swing),
            "trend" => Ok(StructureKind::Trend),
            "zone" => Ok(StructureKind::Zone),
            "fibonacci" => Ok(StructureKind::Fibonacci),
            "rolling_window" => Ok(StructureKind::RollingWindow),
            "derived_zone" => Ok(StructureKind::DerivedZone),
            other => Err(PerpLabError::Config(format!(
                "unknown structure kind '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StructureKind::Swing => "swing",
            StructureKind::Trend => "trend",
            StructureKind::Zone => "zone",
            StructureKind::Fibonacci => "fibonacci",
            StructureKind::RollingWindow => "rolling_window",
            StructureKind::DerivedZone => "derived_zone",
        }
    }

    /// The kind this kind must depend on, if any.
    pub fn required_dependency(&self) -> Option<StructureKind> {
        match self {
            StructureKind::Trend
            | StructureKind::Zone
            | StructureKind::Fibonacci
            | StructureKind::DerivedZone => Some(StructureKind::Swing),
            StructureKind::Swing | StructureKind::RollingWindow => None,
        }
    }
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry output fields per kind, used by manifests and the contract
/// audit. Derived-zone slot fields (`zone{i}_*`) are addressed dynamically
/// and are not listed here.
pub fn kind_output_fields(kind: StructureKind) -> &'static [&'static str] {
    match kind {
        StructureKind::Swing => swing::FIELDS,
        StructureKind::Trend => trend::FIELDS,
        StructureKind::Zone => zone::FIELDS,
        StructureKind::Fibonacci => fibonacci::FIELDS,
        StructureKind::RollingWindow => rolling_window::FIELDS,
        StructureKind::DerivedZone => derived_zone::FIELDS,
    }
}

/// How a field behaves under rule operators.
///
/// `eq` only accepts discrete fields (states, directions, flags, counters);
/// comparing continuous levels for exact equality is a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Numeric,
    Discrete,
}

/// Copy of a swing detector's public outputs, handed to dependents.
///
/// Levels are NaN until the corresponding pivot has been confirmed.
#[derive(Debug, Clone, Copy)]
pub struct SwingState {
    pub high_level: f64,
    pub low_level: f64,
    pub prev_high_level: f64,
    pub prev_low_level: f64,
    pub high_idx: Option<usize>,
    pub low_idx: Option<usize>,
    /// +1 when the most recent confirmed pivot is a high, -1 for a low, 0 none.
    pub last_pivot_dir: i8,
    pub version: u64,
}

impl SwingState {
    pub fn empty() -> Self {
        Self {
            high_level: f64::NAN,
            low_level: f64::NAN,
            prev_high_level: f64::NAN,
            prev_low_level: f64::NAN,
            high_idx: None,
            low_idx: None,
            last_pivot_dir: 0,
            version: 0,
        }
    }

    pub fn has_pair(&self) -> bool {
        self.high_level.is_finite() && self.low_level.is_finite()
    }
}

/// An incremental structure detector.
///
/// `update` is called once per exec bar in declaration order, warmup
/// included. `get_field` returns the current value of a named output or
/// None for unknown names; not-yet-ready outputs are NaN.
pub trait Detector {
    fn kind(&self) -> StructureKind;

    /// Bars needed before outputs can start becoming ready. A lower bound:
    /// pivot-dependent outputs may stay NaN longer on quiet data.
    fn warmup_bars(&self) -> usize;

    /// Indicator column this detector samples each bar (e.g. an ATR for
    /// zone widths). Resolved against the exec feed at registration.
    fn aux_column(&self) -> Option<&str> {
        None
    }

    fn update(&mut self, bar_idx: usize, bar: &Bar, dep: Option<&SwingState>, aux: f64);

    fn get_field(&self, name: &str) -> Option<f64>;

    /// Output field names, fixed per kind (contract-audited).
    fn fields(&self) -> &'static [&'static str];

    fn field_class(&self, name: &str) -> FieldClass {
        let _ = name;
        FieldClass::Numeric
    }

    /// Monotonic counter, bumped only when material outputs change.
    fn version(&self) -> u64;

    /// Swing detectors expose their state for dependents.
    fn swing_state(&self) -> Option<SwingState> {
        None
    }
}

/// A structure declaration as consumed from the Play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureDecl {
    pub key: String,
    pub kind: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

struct Slot {
    key: String,
    detector: Box<dyn Detector>,
    dep_slot: Option<usize>,
    aux_column: Option<String>,
}

/// Holds all declared detectors and drives them bar by bar.
pub struct StructureEngine {
    slots: Vec<Slot>,
    by_key: HashMap<String, usize>,
}

impl StructureEngine {
    /// Build detectors from declarations, resolving dependencies and aux
    /// indicator columns against the exec feed. Declaration order is update
    /// order; a dependency must appear before its dependent.
    pub fn from_decls(decls: &[StructureDecl], exec_feed: &Feed) -> Result<Self> {
        let mut engine = StructureEngine {
            slots: Vec::with_capacity(decls.len()),
            by_key: HashMap::with_capacity(decls.len()),
        };

        for decl in decls {
            if engine.by_key.contains_key(&decl.key) {
                return Err(PerpLabError::Config(format!(
                    "duplicate structure key '{}'",
                    decl.key
                )));
            }

            let kind = StructureKind::parse(&decl.kind)?;
            let detector: Box<dyn Detector> = match kind {
                StructureKind::Swing => Box::new(swing::SwingDetector::new(&decl.key, &decl.params)?),
                StructureKind::Trend => Box::new(trend::TrendDetector::new(&decl.key, &decl.params)?),
                StructureKind::Zone => Box::new(zone::ZoneDetector::new(&decl.key, &decl.params)?),
                StructureKind::Fibonacci => {
                    Box::new(fibonacci::FibonacciDetector::new(&decl.key, &decl.params)?)
                }
                StructureKind::RollingWindow => Box::new(rolling_window::RollingWindowDetector::new(
                    &decl.key,
                    &decl.params,
                )?),
                StructureKind::DerivedZone => Box::new(derived_zone::DerivedZoneDetector::new(
                    &decl.key,
                    &decl.params,
                )?),
            };

            let dep_slot = match (kind.required_dependency(), &decl.depends_on) {
                (None, None) => None,
                (None, Some(name)) => {
                    return Err(PerpLabError::Config(format!(
                        "structure '{}' of kind '{kind}' takes no dependency, got '{name}'",
                        decl.key
                    )))
                }
                (Some(required), None) => {
                    return Err(PerpLabError::Config(format!(
                        "structure '{}' of kind '{kind}' must declare depends_on a {required}",
                        decl.key
                    )))
                }
                (Some(required), Some(name)) => {
                    let slot = *engine.by_key.get(name).ok_or_else(|| {
                        PerpLabError::Config(format!(
                            "structure '{}' depends on '{name}', which is not declared before it",
                            decl.key
                        ))
                    })?;
                    if engine.slots[slot].detector.kind() != required {
                        return Err(PerpLabError::Config(format!(
                            "structure '{}' depends on '{name}' of kind '{}', expected {required}",
                            decl.key,
                            engine.slots[slot].detector.kind()
                        )));
                    }
                    Some(slot)
                }
            };

            let aux_column = detector.aux_column().map(str::to_string);
            if let Some(col) = &aux_column {
                if !exec_feed.has_indicator(col) {
                    return Err(PerpLabError::Config(format!(
                        "structure '{}' requires indicator column '{col}' on the exec feed; declare it as a feature",
                        decl.key
                    )));
                }
            }

            engine.by_key.insert(decl.key.clone(), engine.slots.len());
            engine.slots.push(Slot {
                key: decl.key.clone(),
                detector,
                dep_slot,
                aux_column,
            });
        }

        Ok(engine)
    }

    /// Advance every detector by one exec bar, in declaration order.
    pub fn update_bar(&mut self, bar_idx: usize, bar: &Bar, exec_feed: &Feed) {
        for i in 0..self.slots.len() {
            let dep = self.slots[i]
                .dep_slot
                .and_then(|d| self.slots[d].detector.swing_state());
            let aux = match &self.slots[i].aux_column {
                Some(col) => exec_feed.indicator_value(col, bar_idx),
                None => f64::NAN,
            };
            self.slots[i]
                .detector
                .update(bar_idx, bar, dep.as_ref(), aux);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_of(&self, key: &str) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    pub fn key_of(&self, slot: usize) -> &str {
        &self.slots[slot].key
    }

    pub fn detector(&self, slot: usize) -> &dyn Detector {
        self.slots[slot].detector.as_ref()
    }

    /// Current value of `key.field`, NaN-free contract: None for unknown
    /// names, NaN for known-but-not-ready outputs.
    pub fn get_field(&self, key: &str, field: &str) -> Option<f64> {
        let slot = self.slot_of(key)?;
        self.slots[slot].detector.get_field(field)
    }

    /// Largest warmup over all detectors (exec bars).
    pub fn warmup_bars(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.detector.warmup_bars())
            .max()
            .unwrap_or(0)
    }

    /// Sum of all detector versions; changes iff any material output changed.
    pub fn version_sum(&self) -> u64 {
        self.slots.iter().map(|s| s.detector.version()).sum()
    }
}

impl fmt::Debug for StructureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructureEngine")
            .field("keys", &self.slots.iter().map(|s| &s.key).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    fn decl(key: &str, kind: &str, depends_on: Option<&str>, pairs: &[(&str, ParamValue)]) -> StructureDecl {
        StructureDecl {
            key: key.into(),
            kind: kind.into(),
            params: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            depends_on: depends_on.map(str::to_string),
        }
    }

    fn empty_feed() -> Feed {
        use crate::feed::test_support::bars_from_closes;
        use crate::timeframe::Timeframe;
        let bars = bars_from_closes(Timeframe::H1, 1_704_067_200_000, &[100.0, 101.0]);
        Feed::from_bars("BTCUSDT", Timeframe::H1, &bars).unwrap()
    }

    #[test]
    fn dependency_must_be_declared_first() {
        let feed = empty_feed();
        let decls = vec![
            decl(
                "trend",
                "trend",
                Some("swings"),
                &[],
            ),
            decl(
                "swings",
                "swing",
                None,
                &[("left", ParamValue::from(2_i64)), ("right", ParamValue::from(2_i64))],
            ),
        ];
        assert!(StructureEngine::from_decls(&decls, &feed).is_err());
    }

    #[test]
    fn dependency_kind_is_checked() {
        let feed = empty_feed();
        let decls = vec![
            decl(
                "win",
                "rolling_window",
                None,
                &[
                    ("field", ParamValue::from("high")),
                    ("mode", ParamValue::from("max")),
                    ("window", ParamValue::from(10_i64)),
                ],
            ),
            decl("trend", "trend", Some("win"), &[]),
        ];
        assert!(StructureEngine::from_decls(&decls, &feed).is_err());
    }

    #[test]
    fn unknown_kind_is_config_error() {
        let feed = empty_feed();
        let decls = vec![decl("x", "order_blocks", None, &[])];
        assert!(StructureEngine::from_decls(&decls, &feed).is_err());
    }

    #[test]
    fn duplicate_keys_rejected() {
        let feed = empty_feed();
        let swing_params: Vec<(&str, ParamValue)> = vec![
            ("left", ParamValue::from(2_i64)),
            ("right", ParamValue::from(2_i64)),
        ];
        let decls = vec![
            decl("s", "swing", None, &swing_params),
            decl("s", "swing", None, &swing_params),
        ];
        assert!(StructureEngine::from_decls(&decls, &feed).is_err());
    }
}
