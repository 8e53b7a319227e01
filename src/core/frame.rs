//! Purpose: The frame data model: data columns, index columns, labels and a null mask.
//! Exports: `Frame`, `NullMask`, `Row`, `Rows`, `RowMap`.
//! Role: Unit of transfer between transports, the API layer and backends.
//! Invariants: All columns and indices share one length; names are unique across both.
//! Invariants: When present the null mask has one entry per row and is authoritative;
//! the stored value of a null cell is only a fill.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::builder::DenseBuilder;
use super::column::Column;
use super::dtype::{DType, Value};
use super::error::{Error, ErrorKind};

pub type RowMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NullMask {
    rows: Vec<BTreeSet<String>>,
}

impl NullMask {
    pub fn new(len: usize) -> Self {
        Self {
            rows: vec![BTreeSet::new(); len],
        }
    }

    pub fn from_rows(rows: Vec<BTreeSet<String>>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn mark(&mut self, row: usize, name: impl Into<String>) {
        if row >= self.rows.len() {
            self.rows.resize(row + 1, BTreeSet::new());
        }
        self.rows[row].insert(name.into());
    }

    pub fn is_null(&self, row: usize, name: &str) -> bool {
        self.rows.get(row).is_some_and(|nulls| nulls.contains(name))
    }

    pub fn row(&self, row: usize) -> Option<&BTreeSet<String>> {
        self.rows.get(row)
    }

    pub fn rows(&self) -> &[BTreeSet<String>] {
        &self.rows
    }

    pub fn has_nulls(&self) -> bool {
        self.rows.iter().any(|nulls| !nulls.is_empty())
    }

    fn slice(&self, start: usize, end: usize) -> NullMask {
        NullMask {
            rows: self.rows[start..end].to_vec(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    columns: Vec<Column>,
    indices: Vec<Column>,
    labels: BTreeMap<String, Value>,
    nulls: Option<NullMask>,
}

/// Owned pieces of a frame, for callers that restructure columns.
#[derive(Debug, Default)]
pub struct FrameParts {
    pub columns: Vec<Column>,
    pub indices: Vec<Column>,
    pub labels: BTreeMap<String, Value>,
    pub nulls: Option<NullMask>,
}

impl Frame {
    pub fn new(columns: Vec<Column>, indices: Vec<Column>) -> Result<Frame, Error> {
        let mut seen = HashSet::new();
        let mut len = None;
        for column in columns.iter().chain(indices.iter()) {
            if !seen.insert(column.name().to_string()) {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("duplicate column name '{}'", column.name())));
            }
            match len {
                None => len = Some(column.len()),
                Some(expected) if expected != column.len() => {
                    return Err(Error::new(ErrorKind::Schema).with_message(format!(
                        "column '{}' has {} rows, expected {expected}",
                        column.name(),
                        column.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Frame {
            columns,
            indices,
            labels: BTreeMap::new(),
            nulls: None,
        })
    }

    pub fn from_parts(parts: FrameParts) -> Result<Frame, Error> {
        let frame = Frame::new(parts.columns, parts.indices)?.with_labels(parts.labels);
        match parts.nulls {
            Some(mask) => frame.with_nulls(mask),
            None => Ok(frame),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, Value>) -> Frame {
        self.labels = labels;
        self
    }

    pub fn with_nulls(mut self, mask: NullMask) -> Result<Frame, Error> {
        if mask.len() != self.len() {
            return Err(Error::new(ErrorKind::Schema).with_message(format!(
                "null mask has {} rows, frame has {}",
                mask.len(),
                self.len()
            )));
        }
        for nulls in mask.rows() {
            if let Some(unknown) = nulls.iter().find(|name| self.find(name).is_none()) {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("null mask names unknown column '{unknown}'")));
            }
        }
        self.nulls = Some(mask);
        Ok(self)
    }

    /// Builds a frame from row maps. Missing cells become nulls; the dtype of
    /// each column comes from its values, with mixed ints and floats widened to floats.
    pub fn from_rows(rows: &[RowMap], index_names: &[&str]) -> Result<Frame, Error> {
        let mut order: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for row in rows {
            for name in row.keys() {
                if seen.insert(name.as_str()) {
                    order.push(name.clone());
                }
            }
        }

        let mut mask = NullMask::new(rows.len());
        let mut columns = Vec::new();
        let mut indices = Vec::new();
        for name in order {
            let dtype = infer_dtype(rows.iter().filter_map(|row| row.get(&name)));
            let mut builder = DenseBuilder::new(name.clone(), dtype, rows.len());
            for (number, row) in rows.iter().enumerate() {
                match row.get(&name) {
                    Some(value) => builder.append(value.clone())?,
                    None => {
                        builder.append(dtype.null_value())?;
                        mask.mark(number, name.clone());
                    }
                }
            }
            if index_names.contains(&name.as_str()) {
                indices.push(builder.finish());
            } else {
                columns.push(builder.finish());
            }
        }

        let frame = Frame::new(columns, indices)?;
        if mask.has_nulls() {
            frame.with_nulls(mask)
        } else {
            Ok(frame)
        }
    }

    pub fn into_parts(self) -> FrameParts {
        FrameParts {
            columns: self.columns,
            indices: self.indices,
            labels: self.labels,
            nulls: self.nulls,
        }
    }

    pub fn len(&self) -> usize {
        self.columns
            .first()
            .or_else(|| self.indices.first())
            .map(Column::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(Column::name).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn indices(&self) -> &[Column] {
        &self.indices
    }

    pub fn labels(&self) -> &BTreeMap<String, Value> {
        &self.labels
    }

    pub fn nulls(&self) -> Option<&NullMask> {
        self.nulls.as_ref()
    }

    pub fn column(&self, name: &str) -> Result<&Column, Error> {
        self.columns
            .iter()
            .find(|column| column.name() == name)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound).with_message(format!("column '{name}' not found"))
            })
    }

    pub fn index(&self, name: &str) -> Option<&Column> {
        self.indices.iter().find(|column| column.name() == name)
    }

    /// Looks up a data column first, then an index column.
    pub fn find(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .chain(self.indices.iter())
            .find(|column| column.name() == name)
    }

    pub fn is_null(&self, row: usize, name: &str) -> bool {
        self.nulls
            .as_ref()
            .is_some_and(|mask| mask.is_null(row, name))
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<Frame, Error> {
        let len = self.len();
        if start > end || end > len {
            return Err(Error::new(ErrorKind::BadRange)
                .with_message(format!("bad frame slice [{start}, {end}) of length {len}")));
        }
        let columns = self
            .columns
            .iter()
            .map(|column| column.slice(start, end))
            .collect::<Result<Vec<_>, _>>()?;
        let indices = self
            .indices
            .iter()
            .map(|column| column.slice(start, end))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Frame {
            columns,
            indices,
            labels: self.labels.clone(),
            nulls: self.nulls.as_ref().map(|mask| mask.slice(start, end)),
        })
    }

    pub fn rows(&self, include_index: bool) -> Rows<'_> {
        Rows {
            frame: self,
            next: 0,
            include_index,
        }
    }
}

fn infer_dtype<'a>(values: impl Iterator<Item = &'a Value>) -> DType {
    let mut dtype = None;
    for value in values {
        dtype = match (dtype, value.dtype()) {
            (None, found) => Some(found),
            (Some(DType::Int64), DType::Float64) => Some(DType::Float64),
            (Some(current), _) => Some(current),
        };
    }
    dtype.unwrap_or(DType::Float64)
}

pub struct Rows<'a> {
    frame: &'a Frame,
    next: usize,
    include_index: bool,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Row<'a>> {
        if self.next >= self.frame.len() {
            return None;
        }
        let row = Row {
            frame: self.frame,
            number: self.next,
            include_index: self.include_index,
        };
        self.next += 1;
        Some(row)
    }
}

/// A borrowed view of one row; null cells read as absent.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    frame: &'a Frame,
    number: usize,
    include_index: bool,
}

impl Row<'_> {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if self.frame.is_null(self.number, name) {
            return None;
        }
        let column = if self.include_index {
            self.frame.find(name)
        } else {
            self.frame.column(name).ok()
        };
        column.and_then(|column| column.at(self.number).ok())
    }

    pub fn to_map(&self) -> RowMap {
        let mut values = RowMap::new();
        let indices: &[Column] = if self.include_index {
            self.frame.indices()
        } else {
            &[]
        };
        for column in self.frame.columns().iter().chain(indices.iter()) {
            if self.frame.is_null(self.number, column.name()) {
                continue;
            }
            if let Ok(value) = column.at(self.number) {
                values.insert(column.name().to_string(), value);
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Frame, NullMask, RowMap};
    use crate::core::column::Column;
    use crate::core::dtype::{DType, Value};
    use crate::core::error::ErrorKind;

    fn sample() -> Frame {
        Frame::new(
            vec![
                Column::dense("a", vec![1i64, 2, 3]),
                Column::label("host", "srv1", 3),
            ],
            vec![Column::dense("key", vec!["x", "y", "z"])],
        )
        .expect("frame")
    }

    #[test]
    fn rejects_unequal_lengths_and_duplicate_names() {
        let err = Frame::new(
            vec![
                Column::dense("a", vec![1i64, 2]),
                Column::dense("b", vec![1i64]),
            ],
            Vec::new(),
        )
        .expect_err("length mismatch");
        assert_eq!(err.kind(), ErrorKind::Schema);

        let err = Frame::new(
            vec![Column::dense("a", vec![1i64])],
            vec![Column::dense("a", vec![2i64])],
        )
        .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn rows_skip_null_cells_and_optionally_include_index() {
        let mut mask = NullMask::new(3);
        mask.mark(1, "a");
        let frame = sample().with_nulls(mask).expect("mask");

        let rows: Vec<RowMap> = frame.rows(true).map(|row| row.to_map()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("key"), Some(&Value::from("x")));
        assert!(!rows[1].contains_key("a"));
        assert_eq!(rows[1].get("host"), Some(&Value::from("srv1")));

        let without_index = frame.rows(false).next().expect("row").to_map();
        assert!(!without_index.contains_key("key"));
    }

    #[test]
    fn mask_length_must_match() {
        let err = sample()
            .with_nulls(NullMask::new(2))
            .expect_err("short mask");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn slice_carries_labels_and_mask() {
        let mut mask = NullMask::new(3);
        mask.mark(2, "a");
        let labels = BTreeMap::from([("source".to_string(), Value::from("test"))]);
        let frame = sample().with_labels(labels).with_nulls(mask).expect("mask");

        let part = frame.slice(1, 3).expect("slice");
        assert_eq!(part.len(), 2);
        assert!(part.is_null(1, "a"));
        assert_eq!(part.labels().get("source"), Some(&Value::from("test")));
        assert_eq!(frame.slice(2, 4).expect_err("range").kind(), ErrorKind::BadRange);
    }

    #[test]
    fn from_rows_fills_missing_cells_and_widens_numbers() {
        let rows = vec![
            RowMap::from([
                ("k".to_string(), Value::from("a")),
                ("n".to_string(), Value::Int(1)),
            ]),
            RowMap::from([
                ("k".to_string(), Value::from("b")),
                ("n".to_string(), Value::Float(2.5)),
                ("s".to_string(), Value::from("only here")),
            ]),
        ];
        let frame = Frame::from_rows(&rows, &["k"]).expect("frame");
        assert_eq!(frame.indices()[0].name(), "k");
        assert_eq!(frame.column("n").expect("n").dtype(), DType::Float64);
        assert!(frame.is_null(0, "s"));
        assert_eq!(frame.column("s").expect("s").string_at(0).expect("fill"), "");
        assert!(!frame.is_null(1, "s"));
    }

    #[test]
    fn missing_column_is_not_found() {
        let err = sample().column("nope").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
