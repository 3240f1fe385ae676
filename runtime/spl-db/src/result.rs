use crate::value::Value;
use bytes::Bytes;
use indexmap::IndexMap;

/// Materialized rows of the last statement executed on a connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultView {
    cols: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl ResultView {
    pub fn new(cols: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { cols, rows }
    }

    /// The first row, or its only value when the row has one column.
    pub fn first(&self) -> Value {
        match self.rows.first() {
            None => Value::Null,
            Some(row) if row.len() == 1 => row[0].clone(),
            Some(row) => Value::List(row.clone()),
        }
    }

    pub fn flat(&self) -> Vec<Value> {
        self.rows.iter().flatten().cloned().collect()
    }

    pub fn cols(&self) -> &[String] {
        &self.cols
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn objs(&self) -> Vec<IndexMap<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.cols
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drops the materialized data; views already handed out are unaffected.
    pub fn free(&mut self) {
        self.cols = Vec::new();
        self.rows = Vec::new();
    }

    /// Moves the data out, leaving the view freed.
    pub fn take(&mut self) -> ResultView {
        std::mem::take(self)
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.cols, self.rows)
    }

    /// Every blob cell, in row order.
    pub fn blobs(&self) -> Vec<Bytes> {
        self.rows
            .iter()
            .flatten()
            .filter_map(|value| value.as_bytes().cloned())
            .collect()
    }

    /// `[cols, rows]`, the wire form of a synced result.
    pub fn into_value(self) -> Value {
        let cols = Value::List(self.cols.into_iter().map(Value::Text).collect());
        let rows = Value::List(self.rows.into_iter().map(Value::List).collect());
        Value::List(vec![cols, rows])
    }

    pub fn from_value(value: Value) -> Option<Self> {
        let mut parts = value.into_list()?;
        if parts.len() != 2 {
            return None;
        }
        let rows = parts.pop()?.into_list()?;
        let cols = parts.pop()?.into_list()?;
        let cols = cols
            .into_iter()
            .map(|col| match col {
                Value::Text(name) => Some(name),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        let rows = rows
            .into_iter()
            .map(Value::into_list)
            .collect::<Option<Vec<_>>>()?;
        Some(Self { cols, rows })
    }
}
