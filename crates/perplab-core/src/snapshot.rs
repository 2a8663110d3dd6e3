//! Read-only snapshot view over feeds, indicators and structures.
//!
//! A snapshot is built once per evaluation point (each 1-minute sub-bar of
//! an exec bar). Paths are compiled to [`PathRef`]s ahead of the run, so a
//! read is an O(1) array access; the snapshot never recomputes anything.
//! A read of a not-yet-warm value returns NaN and the caller short-circuits
//! (all comparisons against NaN are false).
//!
//! Path grammar:
//! - `price.{mark,last,close,open,high,low,volume}[@offset]`
//! - `indicator.[role.]key[.field][@offset]`
//! - `structure.key.field`
//! - bare `key[.field][@offset]` auto-resolved against structures first,
//!   then indicator declarations (ambiguous keys are a compile error)
//!
//! Offsets address previous closed bars at the path's own timeframe.
//! Feed reads are timestamp-gated: an indicator on a coarser role
//! forward-fills from the latest bar whose close is at or before the
//! snapshot's evaluation timestamp.

use crate::error::{PerpLabError, Result};
use crate::feed::MultiFeed;
use crate::structure::{FieldClass, StructureEngine};
use crate::timeframe::TfRole;
use serde::Serialize;

/// Price namespace fields, all served from the 1-minute quote feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    Mark,
    Last,
    Close,
    Open,
    High,
    Low,
    Volume,
}

impl PriceField {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mark" => PriceField::Mark,
            "last" => PriceField::Last,
            "close" => PriceField::Close,
            "open" => PriceField::Open,
            "high" => PriceField::High,
            "low" => PriceField::Low,
            "volume" => PriceField::Volume,
            _ => return None,
        })
    }
}

/// A compiled snapshot path. Compilation resolves names, roles and offsets
/// once; reads afterwards are constant-time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PathRef {
    Price {
        field: PriceField,
        offset: usize,
    },
    Indicator {
        role: TfRole,
        column: String,
        offset: usize,
    },
    Structure {
        slot: usize,
        /// Kept for manifests and plumbing audits.
        key: String,
        field: String,
    },
}

impl PathRef {
    /// Canonical dotted form, used in manifests and audit reports.
    pub fn canonical(&self) -> String {
        match self {
            PathRef::Price { field, offset } => {
                let name = format!("price.{}", serde_field_name(field));
                with_offset(name, *offset)
            }
            PathRef::Indicator {
                role,
                column,
                offset,
            } => with_offset(format!("indicator.{role}.{column}"), *offset),
            PathRef::Structure { key, field, .. } => format!("structure.{key}.{field}"),
        }
    }
}

fn serde_field_name(field: &PriceField) -> &'static str {
    match field {
        PriceField::Mark => "mark",
        PriceField::Last => "last",
        PriceField::Close => "close",
        PriceField::Open => "open",
        PriceField::High => "high",
        PriceField::Low => "low",
        PriceField::Volume => "volume",
    }
}

fn with_offset(name: String, offset: usize) -> String {
    if offset == 0 {
        name
    } else {
        format!("{name}@{offset}")
    }
}

/// Compiles dotted path strings against the run's feeds and structures.
pub struct PathResolver<'a> {
    feeds: &'a MultiFeed,
    structures: &'a StructureEngine,
}

impl<'a> PathResolver<'a> {
    pub fn new(feeds: &'a MultiFeed, structures: &'a StructureEngine) -> Self {
        Self { feeds, structures }
    }

    /// Compile a path, returning the reference and its operator class.
    pub fn compile(&self, path: &str) -> Result<(PathRef, FieldClass)> {
        let (body, offset) = split_offset(path)?;
        let tokens: Vec<&str> = body.split('.').collect();
        if tokens.is_empty() || tokens.iter().any(|t| t.is_empty()) {
            return Err(PerpLabError::Config(format!("malformed path '{path}'")));
        }

        match tokens[0] {
            "price" => {
                if tokens.len() != 2 {
                    return Err(PerpLabError::Config(format!(
                        "price path '{path}' must be price.<field>"
                    )));
                }
                let field = PriceField::parse(tokens[1]).ok_or_else(|| {
                    PerpLabError::Config(format!("unknown price field '{}'", tokens[1]))
                })?;
                Ok((PathRef::Price { field, offset }, FieldClass::Numeric))
            }
            "indicator" => self.compile_indicator(path, &tokens[1..], offset),
            "structure" => {
                if offset != 0 {
                    return Err(PerpLabError::Config(format!(
                        "structure path '{path}' cannot take an offset; structures expose current state only"
                    )));
                }
                if tokens.len() != 3 {
                    return Err(PerpLabError::Config(format!(
                        "structure path '{path}' must be structure.<key>.<field>"
                    )));
                }
                self.compile_structure(tokens[1], tokens[2])
            }
            _ => self.compile_bare(path, &tokens, offset),
        }
    }

    fn compile_indicator(
        &self,
        path: &str,
        rest: &[&str],
        offset: usize,
    ) -> Result<(PathRef, FieldClass)> {
        if rest.is_empty() {
            return Err(PerpLabError::Config(format!(
                "indicator path '{path}' is missing a key"
            )));
        }

        // Optional explicit role segment: indicator.htf.ema_50
        let (role, rest) = match TfRole::parse(rest[0]) {
            Ok(role) => (Some(role), &rest[1..]),
            Err(_) => (None, rest),
        };
        if rest.is_empty() {
            return Err(PerpLabError::Config(format!(
                "indicator path '{path}' is missing a key"
            )));
        }

        let key = rest[0];
        let column = match rest.len() {
            1 => key.to_string(),
            2 => format!("{key}.{}", rest[1]),
            _ => {
                return Err(PerpLabError::Config(format!(
                    "indicator path '{path}' has too many segments"
                )))
            }
        };

        let role = match role {
            Some(role) => {
                let feed = self.feeds.feed(role).ok_or_else(|| {
                    PerpLabError::Config(format!(
                        "path '{path}' references role {role}, which is not declared"
                    ))
                })?;
                if !feed.has_indicator(&column) {
                    return Err(self.unknown_indicator(path, role, key, &column));
                }
                role
            }
            None => self.find_indicator_role(path, key, &column)?,
        };

        Ok((
            PathRef::Indicator {
                role,
                column,
                offset,
            },
            FieldClass::Numeric,
        ))
    }

    fn find_indicator_role(&self, path: &str, key: &str, column: &str) -> Result<TfRole> {
        let mut hits: Vec<TfRole> = Vec::new();
        for role in self.feeds.roles() {
            if self
                .feeds
                .feed(role)
                .is_some_and(|f| f.has_indicator(column))
            {
                hits.push(role);
            }
        }
        match hits.len() {
            0 => Err(self.unknown_indicator(path, TfRole::Exec, key, column)),
            1 => Ok(hits[0]),
            _ => Err(PerpLabError::Config(format!(
                "path '{path}' is ambiguous: indicator '{key}' is declared on multiple roles; qualify as indicator.<role>.{key}"
            ))),
        }
    }

    fn unknown_indicator(&self, path: &str, role: TfRole, key: &str, column: &str) -> PerpLabError {
        // Multi-output declarations need a field segment; say so when the
        // bare key has sibling columns.
        let has_siblings = self.feeds.feed(role).is_some_and(|f| {
            f.indicator_keys()
                .any(|k| k.starts_with(key) && k.len() > key.len() && k.as_bytes()[key.len()] == b'.')
        });
        if has_siblings && column == key {
            PerpLabError::Config(format!(
                "path '{path}': indicator '{key}' is multi-output; address a field like {key}.signal"
            ))
        } else {
            PerpLabError::Config(format!(
                "path '{path}': unknown feature key '{column}'"
            ))
        }
    }

    fn compile_structure(&self, key: &str, field: &str) -> Result<(PathRef, FieldClass)> {
        let slot = self.structures.slot_of(key).ok_or_else(|| {
            PerpLabError::Config(format!("unknown structure key '{key}'"))
        })?;
        let detector = self.structures.detector(slot);
        if detector.get_field(field).is_none() {
            return Err(PerpLabError::Config(format!(
                "structure '{key}' has no field '{field}' (known: {})",
                detector.fields().join(", ")
            )));
        }
        let class = detector.field_class(field);
        Ok((
            PathRef::Structure {
                slot,
                key: key.to_string(),
                field: field.to_string(),
            },
            class,
        ))
    }

    fn compile_bare(
        &self,
        path: &str,
        tokens: &[&str],
        offset: usize,
    ) -> Result<(PathRef, FieldClass)> {
        // Structures shadow indicators for bare keys; a structure key never
        // collides with a canonical indicator name in a valid Play.
        if let Some(_slot) = self.structures.slot_of(tokens[0]) {
            if offset != 0 {
                return Err(PerpLabError::Config(format!(
                    "path '{path}': structure reads cannot take an offset"
                )));
            }
            if tokens.len() != 2 {
                return Err(PerpLabError::Config(format!(
                    "path '{path}': structure reads need a field, like {}.{}",
                    tokens[0],
                    "state"
                )));
            }
            return self.compile_structure(tokens[0], tokens[1]);
        }

        self.compile_indicator(path, tokens, offset)
    }
}

/// Strip a trailing `@N` offset. Offsets must be plain non-negative integers.
fn split_offset(path: &str) -> Result<(&str, usize)> {
    match path.rsplit_once('@') {
        None => Ok((path, 0)),
        Some((body, digits)) => {
            let offset: usize = digits.parse().map_err(|_| {
                PerpLabError::Config(format!("path '{path}' has a malformed offset '@{digits}'"))
            })?;
            Ok((body, offset))
        }
    }
}

/// The stable read-only view handed to the rule evaluator.
///
/// `ts_ms` is the close of the current 1-minute sub-bar; every feed read is
/// gated to bars whose close does not exceed it.
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    feeds: &'a MultiFeed,
    structures: &'a StructureEngine,
    ts_ms: i64,
    quote_idx: usize,
    exec_idx: usize,
    mark_price: f64,
}

impl<'a> Snapshot<'a> {
    pub fn new(
        feeds: &'a MultiFeed,
        structures: &'a StructureEngine,
        exec_idx: usize,
        quote_idx: usize,
    ) -> Self {
        let quote = feeds.quote();
        Self {
            feeds,
            structures,
            ts_ms: quote.ts_close(quote_idx),
            quote_idx,
            exec_idx,
            mark_price: quote.close(quote_idx),
        }
    }

    pub fn ts_ms(&self) -> i64 {
        self.ts_ms
    }

    pub fn exec_idx(&self) -> usize {
        self.exec_idx
    }

    pub fn quote_idx(&self) -> usize {
        self.quote_idx
    }

    pub fn mark_price(&self) -> f64 {
        self.mark_price
    }

    /// Index of `role`'s bar visible at this snapshot's timestamp, used by
    /// native-bar window sampling.
    pub fn role_idx(&self, role: TfRole) -> Option<usize> {
        self.feeds.role_idx_at(role, self.ts_ms)
    }

    /// Read a compiled path. Not-yet-warm values and out-of-range offsets
    /// come back as NaN; the evaluator treats any comparison with NaN as
    /// false.
    pub fn get(&self, path: &PathRef) -> f64 {
        match path {
            PathRef::Price { field, offset } => {
                let quote = self.feeds.quote();
                let Some(idx) = self.quote_idx.checked_sub(*offset) else {
                    return f64::NAN;
                };
                match field {
                    PriceField::Mark | PriceField::Last | PriceField::Close => quote.close(idx),
                    PriceField::Open => quote.open(idx),
                    PriceField::High => quote.high(idx),
                    PriceField::Low => quote.low(idx),
                    PriceField::Volume => quote.volume(idx),
                }
            }
            PathRef::Indicator {
                role,
                column,
                offset,
            } => {
                let Some(feed) = self.feeds.feed(*role) else {
                    return f64::NAN;
                };
                let Some(idx) = feed.idx_at_or_before(self.ts_ms) else {
                    return f64::NAN;
                };
                let Some(idx) = idx.checked_sub(*offset) else {
                    return f64::NAN;
                };
                feed.indicator_value(column, idx)
            }
            PathRef::Structure { slot, field, .. } => self
                .structures
                .detector(*slot)
                .get_field(field)
                .unwrap_or(f64::NAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::bars_from_closes;
    use crate::feed::Feed;
    use crate::params::ParamValue;
    use crate::structure::StructureDecl;
    use crate::timeframe::Timeframe;
    use std::collections::BTreeMap;

    const T0: i64 = 1_704_067_200_000;

    fn store() -> (MultiFeed, StructureEngine) {
        // 3 hourly bars, 180 minute bars.
        let exec_closes = [100.0, 102.0, 104.0];
        let mut exec = Feed::from_bars(
            "BTCUSDT",
            Timeframe::H1,
            &bars_from_closes(Timeframe::H1, T0, &exec_closes),
        )
        .unwrap();
        exec.set_indicator("ema_2", vec![f64::NAN, 101.0, 103.0]).unwrap();
        exec.set_indicator("macd_12_26_9.macd", vec![f64::NAN, 0.5, 0.7])
            .unwrap();
        exec.set_indicator("macd_12_26_9.signal", vec![f64::NAN, 0.4, 0.6])
            .unwrap();

        let quote_closes: Vec<f64> = (0..180).map(|i| 100.0 + i as f64 * 0.01).collect();
        let quote = Feed::from_bars(
            "BTCUSDT",
            Timeframe::M1,
            &bars_from_closes(Timeframe::M1, T0, &quote_closes),
        )
        .unwrap();

        let mut feeds = BTreeMap::new();
        feeds.insert(TfRole::Exec, exec);
        let feeds = MultiFeed::new(feeds, quote).unwrap();

        let mut swing_params = crate::params::Params::new();
        swing_params.insert("left".into(), ParamValue::from(2_i64));
        swing_params.insert("right".into(), ParamValue::from(2_i64));
        let decls = vec![StructureDecl {
            key: "swings".into(),
            kind: "swing".into(),
            params: swing_params,
            depends_on: None,
        }];
        let structures = StructureEngine::from_decls(&decls, feeds.exec()).unwrap();

        (feeds, structures)
    }

    #[test]
    fn price_paths_read_the_quote_feed() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        let (mark, _) = resolver.compile("price.mark").unwrap();
        let (high, _) = resolver.compile("price.high").unwrap();

        let snap = Snapshot::new(&feeds, &structures, 0, 30);
        assert_eq!(snap.get(&mark), feeds.quote().close(30));
        assert_eq!(snap.get(&high), feeds.quote().high(30));
        assert_eq!(snap.mark_price(), feeds.quote().close(30));
    }

    #[test]
    fn indicator_reads_forward_fill_by_timestamp() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        let (ema, _) = resolver.compile("ema_2").unwrap();

        // Minute 30 sits inside exec bar 0: no hourly close yet -> NaN.
        let snap = Snapshot::new(&feeds, &structures, 0, 30);
        assert!(snap.get(&ema).is_nan());

        // Minute 59 closes exactly at the first hourly close: bar 0 value (NaN).
        let snap = Snapshot::new(&feeds, &structures, 0, 59);
        assert!(snap.get(&ema).is_nan());

        // Minute 125 is inside exec bar 2: sees bar 1's value.
        let snap = Snapshot::new(&feeds, &structures, 2, 125);
        assert_eq!(snap.get(&ema), 101.0);

        // The final minute of bar 2 sees bar 2's value.
        let snap = Snapshot::new(&feeds, &structures, 2, 179);
        assert_eq!(snap.get(&ema), 103.0);
    }

    #[test]
    fn offsets_address_previous_bars_at_native_tf() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        let (prev, _) = resolver.compile("ema_2@1").unwrap();

        let snap = Snapshot::new(&feeds, &structures, 2, 179);
        assert_eq!(snap.get(&prev), 101.0);

        // Offset past the start of data is NaN, not a panic.
        let (way_back, _) = resolver.compile("ema_2@9").unwrap();
        assert!(snap.get(&way_back).is_nan());
    }

    #[test]
    fn multi_output_requires_field_segment() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        assert!(resolver.compile("macd_12_26_9.signal").is_ok());
        let err = resolver.compile("macd_12_26_9").unwrap_err();
        assert!(err.to_string().contains("multi-output"));
    }

    #[test]
    fn unknown_key_is_compile_error() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        assert!(resolver.compile("ema_99").is_err());
        assert!(resolver.compile("structure.ghost.state").is_err());
        assert!(resolver.compile("price.typical").is_err());
    }

    #[test]
    fn structure_paths_reject_offsets_and_check_fields() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        assert!(resolver.compile("structure.swings.high_level").is_ok());
        assert!(resolver.compile("swings.high_level").is_ok());
        assert!(resolver.compile("structure.swings.high_level@1").is_err());
        assert!(resolver.compile("structure.swings.altitude").is_err());
    }

    #[test]
    fn structure_field_class_flows_through() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        let (_, class) = resolver.compile("swings.last_pivot_dir").unwrap();
        assert_eq!(class, FieldClass::Discrete);
        let (_, class) = resolver.compile("swings.high_level").unwrap();
        assert_eq!(class, FieldClass::Numeric);
    }

    #[test]
    fn canonical_round_trips() {
        let (feeds, structures) = store();
        let resolver = PathResolver::new(&feeds, &structures);
        let (p, _) = resolver.compile("ema_2@1").unwrap();
        assert_eq!(p.canonical(), "indicator.exec.ema_2@1");
        let (p, _) = resolver.compile("price.mark").unwrap();
        assert_eq!(p.canonical(), "price.mark");
    }
}
