//! CSV row sources for data-driven scenarios.
//!
//! Rows are loaded once at plan build and shared immutably across virtual
//! users. Sequential order hands out rows round-robin through an atomic
//! cursor; random order picks a uniformly random index per iteration and
//! never shuffles in place.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading a CSV source at plan build.
#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error("failed to read csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to open file: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv file has no usable rows")]
    EmptyData,

    #[error("row {row}: missing column {column}")]
    MissingColumn { row: usize, column: usize },

    #[error("row {row}, column {column}: cannot cast '{value}' to {kind}")]
    BadCast {
        row: usize,
        column: usize,
        value: String,
        kind: &'static str,
    },
}

/// Value type a tagged CSV column is cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    #[default]
    String,
    Int,
    Float,
    Bool,
}

impl VarKind {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "int" => VarKind::Int,
            "float" => VarKind::Float,
            "bool" => VarKind::Bool,
            _ => VarKind::String,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            VarKind::String => "string",
            VarKind::Int => "int",
            VarKind::Float => "float",
            VarKind::Bool => "bool",
        }
    }

    fn cast(&self, raw: &str, row: usize, column: usize) -> Result<Value, DataSourceError> {
        let bad = |kind| DataSourceError::BadCast {
            row,
            column,
            value: raw.to_string(),
            kind,
        };
        match self {
            VarKind::String => Ok(Value::String(raw.to_string())),
            VarKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| bad(self.label())),
            VarKind::Float => raw
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| bad(self.label())),
            VarKind::Bool => match raw.trim().to_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(bad(self.label())),
            },
        }
    }
}

/// A tagged column: which variable name it binds and how it is typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarTag {
    pub tag: String,
    pub kind: VarKind,
}

/// Iteration order over rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowOrder {
    #[default]
    Random,
    Sequential,
}

impl RowOrder {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sequential" => RowOrder::Sequential,
            _ => RowOrder::Random,
        }
    }
}

/// Loader options mirroring the plan's `data` entries.
#[derive(Debug, Clone)]
pub struct CsvSpec {
    pub path: String,
    pub delimiter: u8,
    pub skip_first_line: bool,
    pub skip_empty_line: bool,
    pub allow_quota: bool,
    /// Column index → variable tag.
    pub vars: HashMap<usize, VarTag>,
    pub order: RowOrder,
}

/// A shared, immutable set of rows with a thread-safe iteration strategy.
#[derive(Debug, Clone)]
pub struct RowSource {
    rows: Arc<Vec<HashMap<String, Value>>>,
    order: RowOrder,
    cursor: Arc<AtomicUsize>,
}

impl RowSource {
    /// Load rows from the CSV file described by `spec`.
    pub fn load(spec: &CsvSpec) -> Result<Self, DataSourceError> {
        let file = std::fs::File::open(Path::new(&spec.path))?;
        Self::from_reader(spec, file)
    }

    /// Load from any reader; used by tests with in-memory CSV content.
    pub fn from_reader<R: std::io::Read>(
        spec: &CsvSpec,
        reader: R,
    ) -> Result<Self, DataSourceError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(spec.delimiter)
            .has_headers(spec.skip_first_line)
            .quoting(spec.allow_quota)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (row_idx, record) in csv_reader.records().enumerate() {
            let record = record?;
            if spec.skip_empty_line && record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            let mut row = HashMap::with_capacity(spec.vars.len());
            for (&column, var) in &spec.vars {
                let raw = record.get(column).ok_or(DataSourceError::MissingColumn {
                    row: row_idx,
                    column,
                })?;
                row.insert(var.tag.clone(), var.kind.cast(raw, row_idx, column)?);
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(DataSourceError::EmptyData);
        }

        info!(path = %spec.path, rows = rows.len(), order = ?spec.order, "csv source loaded");

        Ok(Self {
            rows: Arc::new(rows),
            order: spec.order,
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Hand out one row according to the configured order.
    pub fn next_row(&self) -> HashMap<String, Value> {
        let index = match self.order {
            RowOrder::Sequential => self.cursor.fetch_add(1, Ordering::Relaxed) % self.rows.len(),
            RowOrder::Random => rand::thread_rng().gen_range(0..self.rows.len()),
        };
        self.rows[index].clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(order: RowOrder) -> CsvSpec {
        let mut vars = HashMap::new();
        vars.insert(
            0,
            VarTag {
                tag: "name".into(),
                kind: VarKind::String,
            },
        );
        vars.insert(
            1,
            VarTag {
                tag: "age".into(),
                kind: VarKind::Int,
            },
        );
        CsvSpec {
            path: "<memory>".into(),
            delimiter: b',',
            skip_first_line: false,
            skip_empty_line: true,
            allow_quota: false,
            vars,
            order,
        }
    }

    const ROWS: &str = "alice,30\nbob,41\ncarol,28\n";

    #[test]
    fn sequential_order_round_robins() {
        let source = RowSource::from_reader(&spec(RowOrder::Sequential), ROWS.as_bytes()).unwrap();

        let names: Vec<String> = (0..4)
            .map(|_| {
                source.next_row()["name"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol", "alice"]);
    }

    #[test]
    fn random_order_stays_in_bounds() {
        let source = RowSource::from_reader(&spec(RowOrder::Random), ROWS.as_bytes()).unwrap();
        for _ in 0..50 {
            let row = source.next_row();
            assert!(row.contains_key("name"));
            assert!(row["age"].is_i64());
        }
    }

    #[test]
    fn typed_casts_apply() {
        let mut s = spec(RowOrder::Sequential);
        s.vars.insert(
            1,
            VarTag {
                tag: "age".into(),
                kind: VarKind::Int,
            },
        );
        let source = RowSource::from_reader(&s, "dave,52\n".as_bytes()).unwrap();
        let row = source.next_row();
        assert_eq!(row["age"], Value::from(52));
    }

    #[test]
    fn bad_cast_is_a_load_error() {
        let s = spec(RowOrder::Sequential);
        let result = RowSource::from_reader(&s, "eve,not-a-number\n".as_bytes());
        assert!(matches!(result, Err(DataSourceError::BadCast { .. })));
    }

    #[test]
    fn empty_lines_are_skipped() {
        let s = spec(RowOrder::Sequential);
        let source = RowSource::from_reader(&s, "alice,30\n,\nbob,41\n".as_bytes());
        // The ",," line is all-empty and skipped, leaving two rows.
        assert_eq!(source.unwrap().row_count(), 2);
    }

    #[test]
    fn header_line_can_be_skipped() {
        let mut s = spec(RowOrder::Sequential);
        s.skip_first_line = true;
        let source =
            RowSource::from_reader(&s, "name,age\nalice,30\n".as_bytes()).unwrap();
        assert_eq!(source.row_count(), 1);
    }

    #[test]
    fn empty_file_is_an_error() {
        let s = spec(RowOrder::Sequential);
        assert!(matches!(
            RowSource::from_reader(&s, "".as_bytes()),
            Err(DataSourceError::EmptyData)
        ));
    }

    #[test]
    fn shared_across_tasks() {
        let source =
            Arc::new(RowSource::from_reader(&spec(RowOrder::Sequential), ROWS.as_bytes()).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let source = Arc::clone(&source);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    let row = source.next_row();
                    assert!(row.contains_key("name"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
