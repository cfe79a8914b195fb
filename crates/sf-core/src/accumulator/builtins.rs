use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Value, json};

use super::{AccValue, AccumulatorDef};
use crate::record::Record;

/// Built-in accumulators: `sum`, `count`, `avg`, `min`, `max`, `set`.
pub(super) fn all() -> Vec<AccumulatorDef> {
    vec![
        def("sum", AccValue::Sum(0.0), true, merge_sum, |s| match s {
            AccValue::Sum(v) => json!(v),
            _ => Value::Null,
        }),
        def("count", AccValue::Count(0), false, merge_count, |s| match s {
            AccValue::Count(n) => json!(n),
            _ => Value::Null,
        }),
        def(
            "avg",
            AccValue::Avg { sum: 0.0, count: 0 },
            true,
            merge_avg,
            |s| match s {
                AccValue::Avg { sum, count } if *count > 0 => json!(sum / *count as f64),
                _ => Value::Null,
            },
        ),
        def("min", AccValue::Min(None), true, merge_min, |s| match s {
            AccValue::Min(Some(v)) => json!(v),
            _ => Value::Null,
        }),
        def("max", AccValue::Max(None), true, merge_max, |s| match s {
            AccValue::Max(Some(v)) => json!(v),
            _ => Value::Null,
        }),
        def("set", AccValue::Set(BTreeSet::new()), true, merge_set, |s| match s {
            AccValue::Set(items) => json!(items),
            _ => Value::Null,
        }),
    ]
}

fn def(
    name: &str,
    initial: AccValue,
    needs_field: bool,
    merge: fn(&mut AccValue, &Record, Option<&str>) -> anyhow::Result<()>,
    finalize: fn(&AccValue) -> Value,
) -> AccumulatorDef {
    AccumulatorDef {
        name: name.to_string(),
        initial,
        merge: Arc::new(merge),
        finalize: Arc::new(finalize),
        // min/max/set are idempotent; sum/count/avg over-count replays unless
        // offset dedup is on (at-least-once mode).
        replay_safe: true,
        needs_field,
    }
}

// ---------------------------------------------------------------------------
// merge functions
// ---------------------------------------------------------------------------

fn merge_sum(state: &mut AccValue, record: &Record, field: Option<&str>) -> anyhow::Result<()> {
    let v = numeric_field(record, field)?;
    match state {
        AccValue::Sum(total) => *total += v,
        other => bail!("sum accumulator cannot merge into {other:?}"),
    }
    Ok(())
}

fn merge_count(state: &mut AccValue, _record: &Record, _field: Option<&str>) -> anyhow::Result<()> {
    match state {
        AccValue::Count(n) => *n += 1,
        other => bail!("count accumulator cannot merge into {other:?}"),
    }
    Ok(())
}

fn merge_avg(state: &mut AccValue, record: &Record, field: Option<&str>) -> anyhow::Result<()> {
    let v = numeric_field(record, field)?;
    match state {
        AccValue::Avg { sum, count } => {
            *sum += v;
            *count += 1;
        }
        other => bail!("avg accumulator cannot merge into {other:?}"),
    }
    Ok(())
}

fn merge_min(state: &mut AccValue, record: &Record, field: Option<&str>) -> anyhow::Result<()> {
    let v = numeric_field(record, field)?;
    match state {
        AccValue::Min(cur) => *cur = Some(cur.map_or(v, |c| c.min(v))),
        other => bail!("min accumulator cannot merge into {other:?}"),
    }
    Ok(())
}

fn merge_max(state: &mut AccValue, record: &Record, field: Option<&str>) -> anyhow::Result<()> {
    let v = numeric_field(record, field)?;
    match state {
        AccValue::Max(cur) => *cur = Some(cur.map_or(v, |c| c.max(v))),
        other => bail!("max accumulator cannot merge into {other:?}"),
    }
    Ok(())
}

fn merge_set(state: &mut AccValue, record: &Record, field: Option<&str>) -> anyhow::Result<()> {
    let item = match required_field(record, field)? {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => n.as_f64().map(|f| f.to_string()).unwrap_or_default(),
        other => other.to_string(),
    };
    match state {
        AccValue::Set(items) => {
            items.insert(item);
        }
        other => bail!("set accumulator cannot merge into {other:?}"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// field helpers
// ---------------------------------------------------------------------------

fn required_field<'a>(record: &'a Record, field: Option<&str>) -> anyhow::Result<&'a Value> {
    let name = field.context("accumulator field not configured")?;
    record
        .field(name)
        .with_context(|| format!("record {} has no field {name:?}", record.position))
}

/// Numbers are taken as-is; numeric strings are parsed.
fn numeric_field(record: &Record, field: Option<&str>) -> anyhow::Result<f64> {
    match required_field(record, field)? {
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field value {n} is not representable as f64")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("field value {s:?} is not numeric")),
        other => bail!("field value {other} is not numeric"),
    }
}
