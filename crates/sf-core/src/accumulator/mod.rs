mod builtins;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sf_config::AccumulatorConfig;

use crate::record::Record;

// ---------------------------------------------------------------------------
// AccValue — serialisable accumulator state
// ---------------------------------------------------------------------------

/// Accumulator state as a tagged variant so checkpoints can serialise it
/// without knowing which accumulator produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum AccValue {
    Sum(f64),
    Count(u64),
    Avg { sum: f64, count: u64 },
    Min(Option<f64>),
    Max(Option<f64>),
    Set(BTreeSet<String>),
    /// Opaque state owned by a custom accumulator.
    Custom(Vec<u8>),
}

// ---------------------------------------------------------------------------
// AccumulatorDef — one registry entry
// ---------------------------------------------------------------------------

/// Folds one record into the state. `field` is the configured payload field.
pub type MergeFn =
    Arc<dyn Fn(&mut AccValue, &Record, Option<&str>) -> anyhow::Result<()> + Send + Sync>;

/// Renders the final state as the window result value.
pub type FinalizeFn = Arc<dyn Fn(&AccValue) -> serde_json::Value + Send + Sync>;

/// Capability table entry: `name → (initial state, merge_fn, finalize_fn)`.
#[derive(Clone)]
pub struct AccumulatorDef {
    pub name: String,
    pub initial: AccValue,
    pub merge: MergeFn,
    pub finalize: FinalizeFn,
    /// Whether merging the same record twice leaves the result unchanged.
    /// Accumulators that are not replay safe must run with offset dedup.
    pub replay_safe: bool,
    /// Whether the accumulator reads `accumulator.field`.
    pub needs_field: bool,
}

impl fmt::Debug for AccumulatorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatorDef")
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("replay_safe", &self.replay_safe)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AccumulatorRegistry
// ---------------------------------------------------------------------------

/// Explicit table of accumulator functions, built at startup and handed to
/// the window manager. There is no process-wide registration.
#[derive(Debug, Clone, Default)]
pub struct AccumulatorRegistry {
    defs: BTreeMap<String, Arc<AccumulatorDef>>,
}

impl AccumulatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with `sum`, `count`, `avg`, `min`, `max`, `set`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for def in builtins::all() {
            registry.defs.insert(def.name.clone(), Arc::new(def));
        }
        registry
    }

    /// Register a custom accumulator. Fails if the name is already taken.
    pub fn register(&mut self, def: AccumulatorDef) -> anyhow::Result<()> {
        if self.defs.contains_key(&def.name) {
            anyhow::bail!("accumulator {:?} is already registered", def.name);
        }
        self.defs.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AccumulatorDef>> {
        self.defs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }

    /// Bind the configured accumulator, checking the replay contract.
    pub fn resolve(&self, config: &AccumulatorConfig) -> anyhow::Result<Accumulator> {
        let def = self.get(&config.kind).ok_or_else(|| {
            anyhow::anyhow!(
                "accumulator.kind {:?} is not registered (known: {})",
                config.kind,
                self.names().collect::<Vec<_>>().join(", ")
            )
        })?;
        if def.needs_field && config.field.is_none() {
            anyhow::bail!(
                "accumulator.field is required for accumulator.kind = {:?}",
                config.kind
            );
        }
        if !def.replay_safe && !config.dedup_by_offset {
            anyhow::bail!(
                "accumulator {:?} does not tolerate replay; set accumulator.dedup_by_offset = true",
                config.kind
            );
        }
        Ok(Accumulator {
            def: Arc::clone(def),
            field: config.field.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Accumulator — a definition bound to its input field
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Accumulator {
    def: Arc<AccumulatorDef>,
    field: Option<String>,
}

impl Accumulator {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn initial(&self) -> AccValue {
        self.def.initial.clone()
    }

    /// Fold `record` into a copy of `state` and return the new state. The
    /// input is left untouched when the merge fails.
    pub fn merge(&self, state: &AccValue, record: &Record) -> anyhow::Result<AccValue> {
        let mut next = state.clone();
        (self.def.merge)(&mut next, record, self.field.as_deref())?;
        Ok(next)
    }

    pub fn finalize(&self, state: &AccValue) -> serde_json::Value {
        (self.def.finalize)(state)
    }

    pub fn replay_safe(&self) -> bool {
        self.def.replay_safe
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourcePosition;
    use serde_json::json;

    fn rec(value: serde_json::Value) -> Record {
        Record::new("k", 0, value, SourcePosition::new(0, 0))
    }

    fn cfg(kind: &str, field: Option<&str>, dedup: bool) -> AccumulatorConfig {
        AccumulatorConfig {
            kind: kind.to_string(),
            field: field.map(str::to_string),
            dedup_by_offset: dedup,
        }
    }

    fn fold(acc: &Accumulator, values: &[serde_json::Value]) -> serde_json::Value {
        let mut state = acc.initial();
        for v in values {
            state = acc.merge(&state, &rec(v.clone())).unwrap();
        }
        acc.finalize(&state)
    }

    #[test]
    fn builtin_sum_count_avg() {
        let reg = AccumulatorRegistry::with_builtins();
        let values = [json!({"v": 2}), json!({"v": 3.5}), json!({"v": "4"})];

        let sum = reg.resolve(&cfg("sum", Some("v"), true)).unwrap();
        assert_eq!(fold(&sum, &values), json!(9.5));

        let count = reg.resolve(&cfg("count", None, true)).unwrap();
        assert_eq!(fold(&count, &values), json!(3));

        let avg = reg.resolve(&cfg("avg", Some("v"), true)).unwrap();
        assert_eq!(fold(&avg, &values), json!(9.5 / 3.0));
    }

    #[test]
    fn builtin_min_max_set() {
        let reg = AccumulatorRegistry::with_builtins();
        let values = [json!({"v": 7}), json!({"v": -1}), json!({"v": 7})];

        let min = reg.resolve(&cfg("min", Some("v"), true)).unwrap();
        assert_eq!(fold(&min, &values), json!(-1.0));

        let max = reg.resolve(&cfg("max", Some("v"), true)).unwrap();
        assert_eq!(fold(&max, &values), json!(7.0));

        let set = reg.resolve(&cfg("set", Some("v"), true)).unwrap();
        assert_eq!(fold(&set, &values), json!(["-1", "7"]));
    }

    #[test]
    fn empty_min_finalizes_to_null() {
        let reg = AccumulatorRegistry::with_builtins();
        let min = reg.resolve(&cfg("min", Some("v"), true)).unwrap();
        assert_eq!(min.finalize(&min.initial()), serde_json::Value::Null);
    }

    #[test]
    fn merge_failure_leaves_state_untouched() {
        let reg = AccumulatorRegistry::with_builtins();
        let sum = reg.resolve(&cfg("sum", Some("v"), true)).unwrap();
        let state = sum.merge(&sum.initial(), &rec(json!({"v": 1}))).unwrap();
        assert!(sum.merge(&state, &rec(json!({"v": "abc"}))).is_err());
        assert!(sum.merge(&state, &rec(json!({"other": 1}))).is_err());
        assert_eq!(state, AccValue::Sum(1.0));
    }

    #[test]
    fn unknown_kind_lists_known_names() {
        let reg = AccumulatorRegistry::with_builtins();
        let err = reg.resolve(&cfg("median", Some("v"), true)).unwrap_err();
        assert!(err.to_string().contains("median"));
        assert!(err.to_string().contains("sum"));
    }

    #[test]
    fn custom_accumulator_replay_contract() {
        let mut reg = AccumulatorRegistry::with_builtins();
        reg.register(AccumulatorDef {
            name: "concat".into(),
            initial: AccValue::Custom(Vec::new()),
            merge: Arc::new(|state: &mut AccValue, record: &Record, _field: Option<&str>| {
                if let AccValue::Custom(bytes) = state {
                    bytes.extend_from_slice(record.key.as_bytes());
                }
                Ok(())
            }),
            finalize: Arc::new(|state: &AccValue| match state {
                AccValue::Custom(bytes) => json!(String::from_utf8_lossy(bytes)),
                _ => serde_json::Value::Null,
            }),
            replay_safe: false,
            needs_field: false,
        })
        .unwrap();

        assert!(reg.resolve(&cfg("concat", None, false)).is_err());
        let acc = reg.resolve(&cfg("concat", None, true)).unwrap();
        assert!(!acc.replay_safe());
        assert_eq!(fold(&acc, &[json!({}), json!({})]), json!("kk"));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = AccumulatorRegistry::with_builtins();
        let sum = reg.get("sum").unwrap().as_ref().clone();
        assert!(reg.register(sum).is_err());
    }

    #[test]
    fn acc_value_serialises_tagged() {
        let v = AccValue::Avg { sum: 3.0, count: 2 };
        let text = serde_json::to_string(&v).unwrap();
        assert_eq!(text, r#"{"type":"avg","state":{"sum":3.0,"count":2}}"#);
        let back: AccValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }
}
