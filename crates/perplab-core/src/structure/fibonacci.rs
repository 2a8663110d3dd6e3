//! Fibonacci retracement/extension levels from the latest swing pair.

use super::{Detector, FieldClass, StructureKind, SwingState};
use crate::bar::Bar;
use crate::error::Result;
use crate::params::{ParamReader, Params};

pub(super) const FIELDS: &[&str] = &[
    "level_0",
    "level_236",
    "level_382",
    "level_500",
    "level_618",
    "level_786",
    "level_1000",
    "level_1272",
    "level_1618",
    "direction",
    "version",
];

/// Ratios matching the `level_*` field names, in per-mille notation.
const RATIOS: &[(usize, f64)] = &[
    (0, 0.0),
    (236, 0.236),
    (382, 0.382),
    (500, 0.5),
    (618, 0.618),
    (786, 0.786),
    (1000, 1.0),
    (1272, 1.272),
    (1618, 1.618),
];

/// Exposes retracement and extension levels of the most recent swing
/// high/low pair.
///
/// For an upswing (the low pivot precedes the high pivot), `level_0` sits
/// at the high and ratios walk back toward the low, so `level_382` is a
/// 38.2% retracement of the advance. For a downswing the ladder is
/// mirrored from the low. Extensions (>100%) project beyond the anchor.
pub struct FibonacciDetector {
    levels: [f64; 9],
    direction: f64,
    seen_swing_version: u64,
    version: u64,
}

impl FibonacciDetector {
    pub fn new(key: &str, params: &Params) -> Result<Self> {
        ParamReader::new(key, params).check_known(&[])?;
        Ok(Self {
            levels: [f64::NAN; 9],
            direction: 0.0,
            seen_swing_version: 0,
            version: 0,
        })
    }

    fn recompute(&mut self, dep: &SwingState) {
        let (high, low) = (dep.high_level, dep.low_level);
        let range = high - low;
        // Upswing when the low pivot is older than the high pivot.
        let upswing = match (dep.high_idx, dep.low_idx) {
            (Some(h), Some(l)) => h >= l,
            _ => return,
        };

        for (slot, &(_, ratio)) in RATIOS.iter().enumerate() {
            self.levels[slot] = if upswing {
                high - range * ratio
            } else {
                low + range * ratio
            };
        }
        self.direction = if upswing { 1.0 } else { -1.0 };
        self.version += 1;
    }
}

impl Detector for FibonacciDetector {
    fn kind(&self) -> StructureKind {
        StructureKind::Fibonacci
    }

    fn warmup_bars(&self) -> usize {
        0
    }

    fn update(&mut self, _bar_idx: usize, _bar: &Bar, dep: Option<&SwingState>, _aux: f64) {
        let dep = match dep {
            Some(d) => d,
            None => return,
        };
        if dep.version == self.seen_swing_version {
            return;
        }
        self.seen_swing_version = dep.version;

        if dep.has_pair() {
            self.recompute(dep);
        }
    }

    fn get_field(&self, name: &str) -> Option<f64> {
        if name == "direction" {
            return Some(self.direction);
        }
        if name == "version" {
            return Some(self.version as f64);
        }
        let suffix = name.strip_prefix("level_")?;
        let mille: usize = suffix.parse().ok()?;
        RATIOS
            .iter()
            .position(|&(m, _)| m == mille)
            .map(|slot| self.levels[slot])
    }

    fn fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn field_class(&self, name: &str) -> FieldClass {
        match name {
            "direction" | "version" => FieldClass::Discrete,
            _ => FieldClass::Numeric,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
