//! Parameter binding and column decoding at the engine boundary.

use crate::config::SplOptions;
use crate::error::{Error, Result};
use crate::geometry::{GeoJsonBuffer, Geometry};
use crate::value::{Value, as_integer};
use bytes::Bytes;
use indexmap::IndexMap;
use rusqlite::Statement;
use rusqlite::types::{Null, ValueRef};

/// One complete set of bindings for a single execution of a statement.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BindPass {
    Positional(Vec<Value>),
    Named(IndexMap<String, Value>),
}

impl BindPass {
    fn from_element(value: Value) -> Self {
        match value {
            Value::List(items) => BindPass::Positional(items),
            Value::Map(entries) => BindPass::Named(entries),
            scalar => BindPass::Positional(vec![scalar]),
        }
    }
}

/// Splits a parameter argument into bind passes for a statement declaring
/// `count` parameters. An empty result means a single unbound execution.
pub(crate) fn classify(par: Option<Value>, count: usize) -> Vec<BindPass> {
    let par = match par {
        Some(Value::Null) | None => return Vec::new(),
        Some(_) if count == 0 => return Vec::new(),
        Some(par) => par,
    };
    match par {
        Value::List(items) => {
            let nested = items
                .iter()
                .any(|item| item.is_list() || item.is_named_params());
            if nested {
                items.into_iter().map(BindPass::from_element).collect()
            } else if items.len() == count {
                vec![BindPass::Positional(items)]
            } else {
                items
                    .into_iter()
                    .map(|item| BindPass::Positional(vec![item]))
                    .collect()
            }
        }
        map if map.is_named_params() => match map {
            Value::Map(entries) => vec![BindPass::Named(entries)],
            _ => Vec::new(),
        },
        single => vec![BindPass::Positional(vec![single])],
    }
}

/// Binds one pass. Lists and maps bind as JSON text when `auto_json` is on.
pub(crate) fn bind_pass(
    stmt: &mut Statement<'_>,
    pass: &BindPass,
    options: &SplOptions,
) -> Result<()> {
    match pass {
        BindPass::Positional(values) => {
            for (offset, value) in values.iter().enumerate() {
                bind_value(stmt, offset + 1, value, options)?;
            }
        }
        BindPass::Named(entries) => {
            for (name, value) in entries {
                if let Some(index) = stmt.parameter_index(name)? {
                    bind_value(stmt, index, value, options)?;
                }
            }
        }
    }
    Ok(())
}

fn bind_value(
    stmt: &mut Statement<'_>,
    index: usize,
    value: &Value,
    options: &SplOptions,
) -> Result<()> {
    match value {
        Value::Text(text) => stmt.raw_bind_parameter(index, text.as_str())?,
        Value::Bool(flag) => stmt.raw_bind_parameter(index, i64::from(*flag))?,
        Value::Number(number) => match as_integer(*number) {
            Some(integer) => stmt.raw_bind_parameter(index, integer)?,
            None => stmt.raw_bind_parameter(index, *number)?,
        },
        Value::Blob(bytes) => stmt.raw_bind_parameter(index, &bytes[..])?,
        Value::List(_) | Value::Map(_) if options.auto_json => {
            let json = serde_json::to_string(value)
                .map_err(|err| Error::Marshal(format!("Unable to encode parameter {index}: {err}")))?;
            stmt.raw_bind_parameter(index, json)?
        }
        Value::List(_) | Value::Map(_) | Value::Null => stmt.raw_bind_parameter(index, Null)?,
    }
    Ok(())
}

/// Strings that might hold a JSON literal.
pub(crate) fn maybe_json(text: &str) -> bool {
    text == "null"
        || (text.len() >= 2
            && ((text.starts_with('"') && text.ends_with('"'))
                || (text.starts_with('{') && text.ends_with('}'))
                || (text.starts_with('[') && text.ends_with(']'))))
}

pub(crate) fn decode_column(
    raw: ValueRef<'_>,
    options: &SplOptions,
    geojson: &mut GeoJsonBuffer,
) -> Result<Value> {
    Ok(match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::Number(integer as f64),
        ValueRef::Real(real) => Value::Number(real),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if options.auto_json && maybe_json(&text) {
                serde_json::from_str(&text).unwrap_or_else(|_| Value::Text(text.into_owned()))
            } else {
                Value::Text(text.into_owned())
            }
        }
        ValueRef::Blob(bytes) => match options.auto_geojson {
            Some(geo) => match Geometry::parse(bytes) {
                Some(geometry) => geojson.to_value(&geometry, geo)?,
                None => Value::Blob(Bytes::copy_from_slice(bytes)),
            },
            None => Value::Blob(Bytes::copy_from_slice(bytes)),
        },
    })
}

/// Repeated names get an increasing numeric suffix: `[a, a, b]` becomes
/// `[a, a1, b]`.
pub(crate) fn dedup_columns<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for name in names {
        let mut candidate = name.to_string();
        let mut suffix = 1;
        while columns.contains(&candidate) {
            candidate = format!("{name}{suffix}");
            suffix += 1;
        }
        columns.push(candidate);
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Coord, Shape};
    use rusqlite::Connection;

    fn list(items: Vec<Value>) -> Value {
        Value::List(items)
    }

    #[test]
    fn flat_list_matching_count_is_one_pass() {
        let passes = classify(Some(list(vec![1.into(), 2.into()])), 2);
        assert_eq!(passes, vec![BindPass::Positional(vec![1.into(), 2.into()])]);
    }

    #[test]
    fn flat_list_with_other_length_binds_each_element() {
        let passes = classify(Some(list(vec![1.into(), 2.into(), 3.into()])), 1);
        assert_eq!(passes.len(), 3);
        assert_eq!(passes[2], BindPass::Positional(vec![3.into()]));
    }

    #[test]
    fn nested_lists_and_named_objects_are_passes() {
        let passes = classify(
            Some(list(vec![
                list(vec![1.into(), "a".into()]),
                Value::map([("@a", 2)]),
                7.into(),
            ])),
            2,
        );
        assert_eq!(passes.len(), 3);
        assert!(matches!(passes[1], BindPass::Named(_)));
        assert_eq!(passes[2], BindPass::Positional(vec![7.into()]));
    }

    #[test]
    fn scalars_among_passes_bind_positionally() {
        let passes = classify(Some(list(vec![list(vec![1.into()]), 7.into(), "s".into()])), 1);
        assert_eq!(
            passes,
            vec![
                BindPass::Positional(vec![1.into()]),
                BindPass::Positional(vec![7.into()]),
                BindPass::Positional(vec!["s".into()]),
            ]
        );
    }

    #[test]
    fn named_object_and_scalars() {
        assert!(matches!(
            classify(Some(Value::map([(":x", 1)])), 1).as_slice(),
            [BindPass::Named(_)]
        ));
        let plain = Value::map([("x", 1)]);
        assert_eq!(
            classify(Some(plain.clone()), 1),
            vec![BindPass::Positional(vec![plain])]
        );
        assert!(classify(Some(5.into()), 0).is_empty());
        assert!(classify(Some(Value::Null), 3).is_empty());
        assert!(classify(None, 3).is_empty());
    }

    #[test]
    fn binds_values_by_type() {
        let conn = Connection::open_in_memory().expect("open");
        let mut stmt = conn
            .prepare("select typeof(?1), typeof(?2), typeof(?3), typeof(?4), typeof(?5), ?6")
            .expect("prepare");
        let pass = BindPass::Positional(vec![
            "t".into(),
            true.into(),
            2.into(),
            2.5.into(),
            Value::blob(vec![1u8]),
            list(vec![1.into(), "x".into()]),
        ]);
        bind_pass(&mut stmt, &pass, &SplOptions::default()).expect("bind");
        let mut rows = stmt.raw_query();
        let row = rows.next().expect("step").expect("row");
        let kinds: (String, String, String, String, String, String) = (
            row.get(0).expect("0"),
            row.get(1).expect("1"),
            row.get(2).expect("2"),
            row.get(3).expect("3"),
            row.get(4).expect("4"),
            row.get(5).expect("5"),
        );
        assert_eq!(
            kinds,
            (
                "text".into(),
                "integer".into(),
                "integer".into(),
                "real".into(),
                "blob".into(),
                r#"[1,"x"]"#.into()
            )
        );
    }

    #[test]
    fn objects_bind_null_without_auto_json() {
        let conn = Connection::open_in_memory().expect("open");
        let mut stmt = conn.prepare("select typeof(@a)").expect("prepare");
        let pass = BindPass::Named(
            [("@a".to_string(), Value::map([("k", 1)]))]
                .into_iter()
                .collect(),
        );
        bind_pass(&mut stmt, &pass, &SplOptions::default().without_json()).expect("bind");
        let mut rows = stmt.raw_query();
        let row = rows.next().expect("step").expect("row");
        let kind: String = row.get(0).expect("kind");
        assert_eq!(kind, "null");
    }

    #[test]
    fn unknown_named_parameters_are_skipped() {
        let conn = Connection::open_in_memory().expect("open");
        let mut stmt = conn.prepare("select :a").expect("prepare");
        let pass = BindPass::Named(
            [(":a".to_string(), 1.into()), (":zz".to_string(), 2.into())]
                .into_iter()
                .collect(),
        );
        bind_pass(&mut stmt, &pass, &SplOptions::default()).expect("bind");
        let mut rows = stmt.raw_query();
        let row = rows.next().expect("step").expect("row");
        let value: i64 = row.get(0).expect("value");
        assert_eq!(value, 1);
    }

    #[test]
    fn text_that_looks_like_json_is_parsed() {
        let options = SplOptions::default();
        let mut buffer = GeoJsonBuffer::new();
        let decoded = decode_column(ValueRef::Text(br#"{"a":[1]}"#), &options, &mut buffer)
            .expect("json");
        assert_eq!(decoded, Value::map([("a", list(vec![1.into()]))]));
        let broken = decode_column(ValueRef::Text(b"[oops]"), &options, &mut buffer)
            .expect("fallback");
        assert_eq!(broken, Value::from("[oops]"));
        let raw = decode_column(ValueRef::Text(b"[1]"), &options.without_json(), &mut buffer)
            .expect("raw");
        assert_eq!(raw, Value::from("[1]"));
        assert_eq!(
            decode_column(ValueRef::Integer(3), &options, &mut buffer).expect("int"),
            Value::Number(3.0)
        );
    }

    #[test]
    fn geometry_blobs_decode_when_enabled() {
        let blob = Geometry::new(0, Shape::Point(Coord::xy(1.0, 2.0))).to_blob();
        let mut buffer = GeoJsonBuffer::new();
        let geo = decode_column(ValueRef::Blob(&blob), &SplOptions::default(), &mut buffer)
            .expect("geojson");
        assert_eq!(geo.as_map().and_then(|map| map["type"].as_str()), Some("Point"));
        let raw = decode_column(
            ValueRef::Blob(&blob),
            &SplOptions::default().without_geojson(),
            &mut buffer,
        )
        .expect("raw");
        assert_eq!(raw, Value::blob(blob));
    }

    #[test]
    fn json_sniffing() {
        assert!(maybe_json("null"));
        assert!(maybe_json("\"x\""));
        assert!(maybe_json("{}"));
        assert!(!maybe_json("\""));
        assert!(!maybe_json("nullish"));
        assert!(!maybe_json("[1"));
    }

    #[test]
    fn duplicate_columns_get_suffixes() {
        assert_eq!(dedup_columns(["a", "a", "b"]), vec!["a", "a1", "b"]);
        assert_eq!(dedup_columns(["a", "a", "a1"]), vec!["a", "a1", "a11"]);
    }
}
