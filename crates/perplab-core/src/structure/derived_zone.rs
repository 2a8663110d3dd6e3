//! Bounded slot set of Fibonacci-derived zones.

use super::{Detector, FieldClass, StructureKind, SwingState};
use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::params::{ParamReader, Params};

/// Hard cap on configurable slots; keeps per-bar work and field fan-out bounded.
pub const MAX_SLOTS: usize = 8;

pub(super) const FIELDS: &[&str] = &[
    "active_count",
    "any_active",
    "any_touched_this_bar",
    "closest_active_lower",
    "closest_active_upper",
    "version",
];

const STATE_NONE: f64 = 0.0;
const STATE_ACTIVE: f64 = 1.0;
const STATE_BROKEN: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
struct SlotZone {
    instance_id: u64,
    lower: f64,
    upper: f64,
    state: f64,
    /// +1: acts as support (upswing retracement); -1: resistance.
    side: i8,
}

impl SlotZone {
    fn empty() -> Self {
        Self {
            instance_id: 0,
            lower: f64::NAN,
            upper: f64::NAN,
            state: STATE_NONE,
            side: 0,
        }
    }
}

/// Allocates up to `max_active` zones, one per confirmed swing pair, whose
/// band spans the `fib_lower`..`fib_upper` retracement of that swing. Each
/// slot runs the zone state machine (ACTIVE until a close crosses through);
/// aggregates summarise the live set for rule evaluation.
///
/// When every slot is occupied by an ACTIVE zone, a new swing replaces the
/// oldest zone (smallest instance id); BROKEN slots are recycled first.
pub struct DerivedZoneDetector {
    max_active: usize,
    fib_lower: f64,
    fib_upper: f64,
    slots: Vec<SlotZone>,
    next_instance_id: u64,
    seen_swing_version: u64,
    any_touched_this_bar: bool,
    last_close: f64,
    version: u64,
}

impl DerivedZoneDetector {
    pub fn new(key: &str, params: &Params) -> Result<Self> {
        let r = ParamReader::new(key, params);
        r.check_known(&["max_active", "fib_lower", "fib_upper"])?;

        let max_active = r.require_usize("max_active")?;
        if max_active == 0 || max_active > MAX_SLOTS {
            return Err(PerpLabError::Config(format!(
                "{key}: max_active must be between 1 and {MAX_SLOTS}"
            )));
        }

        let fib_lower = r.opt_f64("fib_lower", 0.5)?;
        let fib_upper = r.opt_f64("fib_upper", 0.618)?;
        if !(0.0..=2.0).contains(&fib_lower) || !(0.0..=2.0).contains(&fib_upper) {
            return Err(PerpLabError::Config(format!(
                "{key}: fib ratios must lie in [0, 2]"
            )));
        }
        if fib_lower >= fib_upper {
            return Err(PerpLabError::Config(format!(
                "{key}: fib_lower must be below fib_upper"
            )));
        }

        Ok(Self {
            max_active,
            fib_lower,
            fib_upper,
            slots: vec![SlotZone::empty(); max_active],
            next_instance_id: 0,
            seen_swing_version: 0,
            any_touched_this_bar: false,
            last_close: f64::NAN,
            version: 0,
        })
    }

    fn spawn_zone(&mut self, dep: &SwingState) {
        let (high, low) = (dep.high_level, dep.low_level);
        let range = high - low;
        let upswing = match (dep.high_idx, dep.low_idx) {
            (Some(h), Some(l)) => h >= l,
            _ => return,
        };

        // Band endpoints from the two configured ratios, normalised so that
        // lower < upper regardless of swing direction.
        let (a, b) = if upswing {
            (high - range * self.fib_upper, high - range * self.fib_lower)
        } else {
            (low + range * self.fib_lower, low + range * self.fib_upper)
        };
        let (lower, upper) = if a <= b { (a, b) } else { (b, a) };

        // Prefer recycling a non-active slot; otherwise evict the oldest.
        let slot_idx = self
            .slots
            .iter()
            .position(|s| s.state != STATE_ACTIVE)
            .unwrap_or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.instance_id)
                    .map(|(i, _)| i)
                    .expect("slots is never empty")
            });

        self.next_instance_id += 1;
        self.slots[slot_idx] = SlotZone {
            instance_id: self.next_instance_id,
            lower,
            upper,
            state: STATE_ACTIVE,
            side: if upswing { 1 } else { -1 },
        };
        self.version += 1;
    }

    fn closest_active(&self) -> Option<&SlotZone> {
        let price = self.last_close;
        self.slots
            .iter()
            .filter(|s| s.state == STATE_ACTIVE)
            .min_by(|a, b| {
                let da = (price - (a.lower + a.upper) / 2.0).abs();
                let db = (price - (b.lower + b.upper) / 2.0).abs();
                da.partial_cmp(&db)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Deterministic tie-break on instance id.
                    .then(a.instance_id.cmp(&b.instance_id))
            })
    }
}

impl Detector for DerivedZoneDetector {
    fn kind(&self) -> StructureKind {
        StructureKind::DerivedZone
    }

    fn warmup_bars(&self) -> usize {
        0
    }

    fn update(&mut self, _bar_idx: usize, bar: &Bar, dep: Option<&SwingState>, _aux: f64) {
        self.any_touched_this_bar = false;
        self.last_close = bar.close;

        for slot in &mut self.slots {
            if slot.state != STATE_ACTIVE {
                continue;
            }
            let closed_through = if slot.side == 1 {
                bar.close < slot.lower
            } else {
                bar.close > slot.upper
            };
            if closed_through {
                slot.state = STATE_BROKEN;
                self.version += 1;
            } else if bar.low <= slot.upper && bar.high >= slot.lower {
                self.any_touched_this_bar = true;
            }
        }

        if let Some(dep) = dep {
            if dep.version != self.seen_swing_version {
                self.seen_swing_version = dep.version;
                if dep.has_pair() {
                    self.spawn_zone(dep);
                }
            }
        }
    }

    fn get_field(&self, name: &str) -> Option<f64> {
        match name {
            "active_count" => {
                return Some(
                    self.slots
                        .iter()
                        .filter(|s| s.state == STATE_ACTIVE)
                        .count() as f64,
                )
            }
            "any_active" => {
                let any = self.slots.iter().any(|s| s.state == STATE_ACTIVE);
                return Some(if any { 1.0 } else { 0.0 });
            }
            "any_touched_this_bar" => {
                return Some(if self.any_touched_this_bar { 1.0 } else { 0.0 })
            }
            "closest_active_lower" => {
                return Some(self.closest_active().map(|s| s.lower).unwrap_or(f64::NAN))
            }
            "closest_active_upper" => {
                return Some(self.closest_active().map(|s| s.upper).unwrap_or(f64::NAN))
            }
            "version" => return Some(self.version as f64),
            _ => {}
        }

        // Slot fields: zone{i}_{lower|upper|state}
        let rest = name.strip_prefix("zone")?;
        let (idx_str, field) = rest.split_once('_')?;
        let idx: usize = idx_str.parse().ok()?;
        let slot = self.slots.get(idx)?;
        match field {
            "lower" => Some(slot.lower),
            "upper" => Some(slot.upper),
            "state" => Some(slot.state),
            _ => None,
        }
    }

    fn fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn field_class(&self, name: &str) -> FieldClass {
        match name {
            "closest_active_lower" | "closest_active_upper" => FieldClass::Numeric,
            n if n.starts_with("zone") && (n.ends_with("lower") || n.ends_with("upper")) => {
                FieldClass::Numeric
            }
            _ => FieldClass::Discrete,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
