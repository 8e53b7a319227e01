//! Purpose: Incremental construction of dense and label columns.
//! Exports: `ColumnBuilder`, `DenseBuilder`, `LabelBuilder`.
//! Role: Used by backends to assemble frames row by row.
//! Invariants: `set` past the end pads intermediate rows with the dtype's null fill.
use super::column::{Column, ColumnData};
use super::dtype::{DType, Value};
use super::error::{Error, ErrorKind};

#[derive(Debug)]
pub struct DenseBuilder {
    name: String,
    data: ColumnData,
}

impl DenseBuilder {
    pub fn new(name: impl Into<String>, dtype: DType, capacity: usize) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::with_capacity(dtype, capacity),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn append(&mut self, value: Value) -> Result<(), Error> {
        self.data.push(value.coerce(self.data.dtype())?)
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Error> {
        let value = value.coerce(self.data.dtype())?;
        if index >= self.data.len() {
            self.data.pad_to(index + 1);
        }
        self.data.set(index, value)
    }

    /// Pads trailing rows so the column reaches `len`.
    pub fn pad_to(&mut self, len: usize) {
        self.data.pad_to(len);
    }

    pub fn finish(self) -> Column {
        Column::dense(self.name, self.data)
    }
}

#[derive(Debug)]
pub struct LabelBuilder {
    name: String,
    dtype: DType,
    value: Option<Value>,
    len: usize,
}

impl LabelBuilder {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            value: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: Value) -> Result<(), Error> {
        let index = self.len;
        self.set(index, value)
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Error> {
        let value = value.coerce(self.dtype)?;
        match &self.value {
            None => self.value = Some(value),
            Some(existing) if *existing == value => {}
            Some(existing) => {
                return Err(Error::new(ErrorKind::TypeMismatch).with_message(format!(
                    "label column '{}' holds {existing:?}, cannot set {value:?}",
                    self.name
                )));
            }
        }
        self.len = self.len.max(index + 1);
        Ok(())
    }

    pub fn pad_to(&mut self, len: usize) {
        self.len = self.len.max(len);
    }

    pub fn finish(self) -> Column {
        let value = self.value.unwrap_or_else(|| self.dtype.null_value());
        Column::label(self.name, value, self.len)
    }
}

#[derive(Debug)]
pub enum ColumnBuilder {
    Dense(DenseBuilder),
    Label(LabelBuilder),
}

impl ColumnBuilder {
    pub fn dense(name: impl Into<String>, dtype: DType, capacity: usize) -> Self {
        ColumnBuilder::Dense(DenseBuilder::new(name, dtype, capacity))
    }

    pub fn label(name: impl Into<String>, dtype: DType) -> Self {
        ColumnBuilder::Label(LabelBuilder::new(name, dtype))
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnBuilder::Dense(builder) => builder.len(),
            ColumnBuilder::Label(builder) => builder.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, value: Value) -> Result<(), Error> {
        match self {
            ColumnBuilder::Dense(builder) => builder.append(value),
            ColumnBuilder::Label(builder) => builder.append(value),
        }
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Error> {
        match self {
            ColumnBuilder::Dense(builder) => builder.set(index, value),
            ColumnBuilder::Label(builder) => builder.set(index, value),
        }
    }

    pub fn pad_to(&mut self, len: usize) {
        match self {
            ColumnBuilder::Dense(builder) => builder.pad_to(len),
            ColumnBuilder::Label(builder) => builder.pad_to(len),
        }
    }

    pub fn finish(self) -> Column {
        match self {
            ColumnBuilder::Dense(builder) => builder.finish(),
            ColumnBuilder::Label(builder) => builder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnBuilder, DenseBuilder, LabelBuilder};
    use crate::core::dtype::{DType, Value};
    use crate::core::error::ErrorKind;

    #[test]
    fn dense_set_pads_with_null_fill() {
        let mut builder = DenseBuilder::new("f", DType::Float64, 2);
        builder.append(Value::Float(1.0)).expect("append");
        builder.set(3, Value::Int(4)).expect("set widens int");
        let column = builder.finish();
        let values = column.floats().expect("floats");
        assert_eq!(values.len(), 4);
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan());
        assert!(values[2].is_nan());
        assert_eq!(values[3], 4.0);
    }

    #[test]
    fn dense_append_rejects_other_dtype() {
        let mut builder = ColumnBuilder::dense("s", DType::String, 0);
        let err = builder.append(Value::Bool(true)).expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(builder.is_empty());
    }

    #[test]
    fn label_builder_requires_a_single_scalar() {
        let mut builder = LabelBuilder::new("host", DType::String);
        builder.append(Value::from("srv1")).expect("first");
        builder.set(4, Value::from("srv1")).expect("same value");
        let err = builder.append(Value::from("srv2")).expect_err("second scalar");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let column = builder.finish();
        assert!(column.is_label());
        assert_eq!(column.len(), 5);
        assert_eq!(column.string_at(4).expect("row"), "srv1");
    }
}
