//! Purpose: Named, typed column storage for frames.
//! Exports: `Column`, `ColumnData`, `ColumnKind`.
//! Role: Dense columns own one value per row; label columns hold a single scalar
//! that stands for every row.
//! Invariants: A column has exactly one dtype; a label column stores one element.
//! Invariants: Typed accessors never convert between dtypes.
use std::borrow::Cow;

use super::dtype::{DType, Value};
use super::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    String(Vec<String>),
    Time(Vec<i64>),
}

impl ColumnData {
    pub fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::Bool => ColumnData::Bool(Vec::with_capacity(capacity)),
            DType::Int64 => ColumnData::Int(Vec::with_capacity(capacity)),
            DType::Float64 => ColumnData::Float(Vec::with_capacity(capacity)),
            DType::String => ColumnData::String(Vec::with_capacity(capacity)),
            DType::TimestampNs => ColumnData::Time(Vec::with_capacity(capacity)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            ColumnData::Bool(_) => DType::Bool,
            ColumnData::Int(_) => DType::Int64,
            ColumnData::Float(_) => DType::Float64,
            ColumnData::String(_) => DType::String,
            ColumnData::Time(_) => DType::TimestampNs,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(values) => values.len(),
            ColumnData::Int(values) => values.len(),
            ColumnData::Float(values) => values.len(),
            ColumnData::String(values) => values.len(),
            ColumnData::Time(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one row, widening `Int64` into a `Float64` column.
    pub fn push(&mut self, value: Value) -> Result<(), Error> {
        let value = value.coerce(self.dtype())?;
        match (self, value) {
            (ColumnData::Bool(values), Value::Bool(value)) => values.push(value),
            (ColumnData::Int(values), Value::Int(value)) => values.push(value),
            (ColumnData::Float(values), Value::Float(value)) => values.push(value),
            (ColumnData::String(values), Value::String(value)) => values.push(value),
            (ColumnData::Time(values), Value::Time(value)) => values.push(value),
            (data, value) => return Err(mismatch(data.dtype(), value.dtype())),
        }
        Ok(())
    }

    /// Overwrites row `index`, which must already exist.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Error> {
        let len = self.len();
        if index >= len {
            return Err(out_of_bounds(index, len));
        }
        let value = value.coerce(self.dtype())?;
        match (self, value) {
            (ColumnData::Bool(values), Value::Bool(value)) => values[index] = value,
            (ColumnData::Int(values), Value::Int(value)) => values[index] = value,
            (ColumnData::Float(values), Value::Float(value)) => values[index] = value,
            (ColumnData::String(values), Value::String(value)) => values[index] = value,
            (ColumnData::Time(values), Value::Time(value)) => values[index] = value,
            (data, value) => return Err(mismatch(data.dtype(), value.dtype())),
        }
        Ok(())
    }

    /// Pads with the dtype's null fill until `len` rows exist.
    pub fn pad_to(&mut self, len: usize) {
        match self {
            ColumnData::Bool(values) => values.resize(len.max(values.len()), false),
            ColumnData::Int(values) => values.resize(len.max(values.len()), 0),
            ColumnData::Float(values) => values.resize(len.max(values.len()), f64::NAN),
            ColumnData::String(values) => values.resize(len.max(values.len()), String::new()),
            ColumnData::Time(values) => values.resize(len.max(values.len()), 0),
        }
    }

    fn value_at(&self, index: usize) -> Value {
        match self {
            ColumnData::Bool(values) => Value::Bool(values[index]),
            ColumnData::Int(values) => Value::Int(values[index]),
            ColumnData::Float(values) => Value::Float(values[index]),
            ColumnData::String(values) => Value::String(values[index].clone()),
            ColumnData::Time(values) => Value::Time(values[index]),
        }
    }

    fn slice(&self, start: usize, end: usize) -> ColumnData {
        match self {
            ColumnData::Bool(values) => ColumnData::Bool(values[start..end].to_vec()),
            ColumnData::Int(values) => ColumnData::Int(values[start..end].to_vec()),
            ColumnData::Float(values) => ColumnData::Float(values[start..end].to_vec()),
            ColumnData::String(values) => ColumnData::String(values[start..end].to_vec()),
            ColumnData::Time(values) => ColumnData::Time(values[start..end].to_vec()),
        }
    }
}

impl From<Vec<bool>> for ColumnData {
    fn from(values: Vec<bool>) -> Self {
        ColumnData::Bool(values)
    }
}

impl From<Vec<i64>> for ColumnData {
    fn from(values: Vec<i64>) -> Self {
        ColumnData::Int(values)
    }
}

impl From<Vec<f64>> for ColumnData {
    fn from(values: Vec<f64>) -> Self {
        ColumnData::Float(values)
    }
}

impl From<Vec<String>> for ColumnData {
    fn from(values: Vec<String>) -> Self {
        ColumnData::String(values)
    }
}

impl From<Vec<&str>> for ColumnData {
    fn from(values: Vec<&str>) -> Self {
        ColumnData::String(values.into_iter().map(str::to_string).collect())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColumnKind {
    Dense,
    Label,
}

#[derive(Clone, Debug, PartialEq)]
enum Values {
    Dense(ColumnData),
    Label { value: Value, len: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    name: String,
    values: Values,
}

impl Column {
    pub fn dense(name: impl Into<String>, data: impl Into<ColumnData>) -> Self {
        Self {
            name: name.into(),
            values: Values::Dense(data.into()),
        }
    }

    pub fn label(name: impl Into<String>, value: impl Into<Value>, len: usize) -> Self {
        Self {
            name: name.into(),
            values: Values::Label {
                value: value.into(),
                len,
            },
        }
    }

    /// Dense column of timestamps given as nanoseconds since the epoch.
    pub fn times(name: impl Into<String>, nanos: Vec<i64>) -> Self {
        Self::dense(name, ColumnData::Time(nanos))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ColumnKind {
        match self.values {
            Values::Dense(_) => ColumnKind::Dense,
            Values::Label { .. } => ColumnKind::Label,
        }
    }

    pub fn is_label(&self) -> bool {
        self.kind() == ColumnKind::Label
    }

    pub fn dtype(&self) -> DType {
        match &self.values {
            Values::Dense(data) => data.dtype(),
            Values::Label { value, .. } => value.dtype(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.values {
            Values::Dense(data) => data.len(),
            Values::Label { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dense payload, or `None` for a label column.
    pub fn data(&self) -> Option<&ColumnData> {
        match &self.values {
            Values::Dense(data) => Some(data),
            Values::Label { .. } => None,
        }
    }

    /// The shared scalar of a label column.
    pub fn label_value(&self) -> Option<&Value> {
        match &self.values {
            Values::Dense(_) => None,
            Values::Label { value, .. } => Some(value),
        }
    }

    pub fn at(&self, index: usize) -> Result<Value, Error> {
        let len = self.len();
        if index >= len {
            return Err(out_of_bounds(index, len).with_message(format!(
                "index {index} out of bounds for column '{}' of length {len}",
                self.name
            )));
        }
        Ok(match &self.values {
            Values::Dense(data) => data.value_at(index),
            Values::Label { value, .. } => value.clone(),
        })
    }

    pub fn int_at(&self, index: usize) -> Result<i64, Error> {
        match self.typed_at(index, DType::Int64)? {
            Value::Int(value) => Ok(value),
            other => Err(mismatch(DType::Int64, other.dtype())),
        }
    }

    pub fn float_at(&self, index: usize) -> Result<f64, Error> {
        match self.typed_at(index, DType::Float64)? {
            Value::Float(value) => Ok(value),
            other => Err(mismatch(DType::Float64, other.dtype())),
        }
    }

    pub fn string_at(&self, index: usize) -> Result<String, Error> {
        match self.typed_at(index, DType::String)? {
            Value::String(value) => Ok(value),
            other => Err(mismatch(DType::String, other.dtype())),
        }
    }

    pub fn bool_at(&self, index: usize) -> Result<bool, Error> {
        match self.typed_at(index, DType::Bool)? {
            Value::Bool(value) => Ok(value),
            other => Err(mismatch(DType::Bool, other.dtype())),
        }
    }

    pub fn time_at(&self, index: usize) -> Result<i64, Error> {
        match self.typed_at(index, DType::TimestampNs)? {
            Value::Time(value) => Ok(value),
            other => Err(mismatch(DType::TimestampNs, other.dtype())),
        }
    }

    fn typed_at(&self, index: usize, dtype: DType) -> Result<Value, Error> {
        if self.dtype() != dtype {
            return Err(mismatch(dtype, self.dtype()));
        }
        self.at(index)
    }

    pub fn ints(&self) -> Result<Cow<'_, [i64]>, Error> {
        match &self.values {
            Values::Dense(ColumnData::Int(values)) => Ok(Cow::Borrowed(values)),
            Values::Label {
                value: Value::Int(value),
                len,
            } => Ok(Cow::Owned(vec![*value; *len])),
            _ => Err(mismatch(DType::Int64, self.dtype())),
        }
    }

    pub fn floats(&self) -> Result<Cow<'_, [f64]>, Error> {
        match &self.values {
            Values::Dense(ColumnData::Float(values)) => Ok(Cow::Borrowed(values)),
            Values::Label {
                value: Value::Float(value),
                len,
            } => Ok(Cow::Owned(vec![*value; *len])),
            _ => Err(mismatch(DType::Float64, self.dtype())),
        }
    }

    pub fn strings(&self) -> Result<Cow<'_, [String]>, Error> {
        match &self.values {
            Values::Dense(ColumnData::String(values)) => Ok(Cow::Borrowed(values)),
            Values::Label {
                value: Value::String(value),
                len,
            } => Ok(Cow::Owned(vec![value.clone(); *len])),
            _ => Err(mismatch(DType::String, self.dtype())),
        }
    }

    pub fn bools(&self) -> Result<Cow<'_, [bool]>, Error> {
        match &self.values {
            Values::Dense(ColumnData::Bool(values)) => Ok(Cow::Borrowed(values)),
            Values::Label {
                value: Value::Bool(value),
                len,
            } => Ok(Cow::Owned(vec![*value; *len])),
            _ => Err(mismatch(DType::Bool, self.dtype())),
        }
    }

    pub fn time_values(&self) -> Result<Cow<'_, [i64]>, Error> {
        match &self.values {
            Values::Dense(ColumnData::Time(values)) => Ok(Cow::Borrowed(values)),
            Values::Label {
                value: Value::Time(value),
                len,
            } => Ok(Cow::Owned(vec![*value; *len])),
            _ => Err(mismatch(DType::TimestampNs, self.dtype())),
        }
    }

    /// Rows `[start, end)` as a new column of the same kind.
    pub fn slice(&self, start: usize, end: usize) -> Result<Column, Error> {
        let len = self.len();
        if start > end || end > len {
            return Err(Error::new(ErrorKind::BadRange).with_message(format!(
                "bad slice [{start}, {end}) for column '{}' of length {len}",
                self.name
            )));
        }
        let values = match &self.values {
            Values::Dense(data) => Values::Dense(data.slice(start, end)),
            Values::Label { value, .. } => Values::Label {
                value: value.clone(),
                len: end - start,
            },
        };
        Ok(Column {
            name: self.name.clone(),
            values,
        })
    }

    /// Appends one row. A label column only accepts its own scalar.
    pub fn append(&mut self, value: Value) -> Result<(), Error> {
        match &mut self.values {
            Values::Dense(data) => data.push(value),
            Values::Label { value: label, len } => {
                let value = value.coerce(label.dtype())?;
                if *label != value {
                    return Err(Error::new(ErrorKind::TypeMismatch).with_message(format!(
                        "label column '{}' holds {label:?}, cannot append {value:?}",
                        self.name
                    )));
                }
                *len += 1;
                Ok(())
            }
        }
    }

    pub fn with_name(&self, name: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            values: self.values.clone(),
        }
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

fn mismatch(expected: DType, actual: DType) -> Error {
    Error::new(ErrorKind::TypeMismatch)
        .with_message(format!("expected {expected} value, found {actual}"))
}

fn out_of_bounds(index: usize, len: usize) -> Error {
    Error::new(ErrorKind::OutOfBounds).with_message(format!("index {index} out of bounds for length {len}"))
}

#[cfg(test)]
mod tests {
    use super::{Column, ColumnKind};
    use crate::core::dtype::{DType, Value};
    use crate::core::error::ErrorKind;

    #[test]
    fn label_append_rejects_a_different_scalar() {
        let mut column = Column::label("host", "srv1", 3);
        column.append(Value::from("srv1")).expect("same scalar");
        assert_eq!(column.len(), 4);

        let err = column
            .append(Value::from("srv2"))
            .expect_err("different scalar");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(column.len(), 4);
    }

    #[test]
    fn appended_ints_widen_into_float_columns() {
        let mut column = Column::dense("f", vec![0.5f64]);
        column.append(Value::Int(2)).expect("widen");
        assert_eq!(column.floats().expect("floats").to_vec(), vec![0.5, 2.0]);

        let mut label = Column::label("scale", 3.0f64, 1);
        label.append(Value::Int(3)).expect("same scalar once widened");
        assert_eq!(label.len(), 2);

        let mut ints = Column::dense("n", vec![1i64]);
        let err = ints.append(Value::Float(1.5)).expect_err("no narrowing");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(ints.len(), 1);
    }

    #[test]
    fn label_accessors_materialize_every_row() {
        let column = Column::label("host", "srv1", 3);
        assert_eq!(column.kind(), ColumnKind::Label);
        assert_eq!(column.string_at(2).expect("row"), "srv1");
        assert_eq!(column.strings().expect("strings").len(), 3);
        assert_eq!(column.at(3).expect_err("past end").kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn typed_accessor_refuses_other_dtypes() {
        let column = Column::dense("n", vec![1i64, 2, 3]);
        assert_eq!(column.int_at(1).expect("int"), 2);
        let err = column.float_at(1).expect_err("no implicit cast");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn slice_keeps_kind_and_validates_range() {
        let dense = Column::dense("n", vec![1.0f64, 2.0, 3.0, 4.0]);
        let part = dense.slice(1, 3).expect("slice");
        assert_eq!(part.floats().expect("floats").as_ref(), &[2.0, 3.0]);

        let label = Column::label("l", 5i64, 4);
        let part = label.slice(0, 2).expect("slice");
        assert!(part.is_label());
        assert_eq!(part.len(), 2);

        assert_eq!(dense.slice(3, 2).expect_err("inverted").kind(), ErrorKind::BadRange);
        assert_eq!(dense.slice(0, 5).expect_err("past end").kind(), ErrorKind::BadRange);
    }

    #[test]
    fn dense_append_checks_dtype() {
        let mut column = Column::dense("s", vec!["a"]);
        column.append(Value::from("b")).expect("string");
        assert_eq!(column.dtype(), DType::String);
        let err = column.append(Value::Int(1)).expect_err("int into string");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn with_name_copies_values() {
        let column = Column::dense("a", vec![true, false]);
        let renamed = column.with_name("b");
        assert_eq!(renamed.name(), "b");
        assert_eq!(renamed.bools().expect("bools").as_ref(), &[true, false]);
    }
}
