//! Uniform, format-tagged value container.
//!
//! Every data source produces a [`DataHolder`] regardless of where the value
//! came from (client JSON, device attribute, database row set, decoder output).
//! The holder records the value's [`DataFormat`], its [`ElementType`] and its
//! shape, and converts to typed arrays on demand for the file backends.
//!
//! Values are stored flattened in row-major order. `shape` is empty for
//! `Scalar`, `[n]` for `Spectrum` and `[rows, cols]` for `Image`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Dimensionality class of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    /// Single element, empty shape
    Scalar,
    /// One-dimensional array
    Spectrum,
    /// Two-dimensional array
    Image,
}

impl DataFormat {
    /// Rank implied by the format.
    pub fn rank(&self) -> usize {
        match self {
            DataFormat::Scalar => 0,
            DataFormat::Spectrum => 1,
            DataFormat::Image => 2,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Scalar => write!(f, "SCALAR"),
            DataFormat::Spectrum => write!(f, "SPECTRUM"),
            DataFormat::Image => write!(f, "IMAGE"),
        }
    }
}

impl FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SCALAR" => Ok(DataFormat::Scalar),
            "SPECTRUM" => Ok(DataFormat::Spectrum),
            "IMAGE" => Ok(DataFormat::Image),
            other => Err(format!(
                "unknown data format '{other}', expected SCALAR, SPECTRUM or IMAGE"
            )),
        }
    }
}

/// Element type of the values inside a holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// `NX_BOOLEAN`
    Bool,
    /// `NX_INT*`
    Int64,
    /// `NX_UINT*` / `NX_POSINT`
    UInt64,
    /// `NX_FLOAT*` / `NX_NUMBER`
    Float64,
    /// `NX_CHAR` / `NX_DATE_TIME`
    Text,
}

impl ElementType {
    /// Map a NeXus type name onto an element type.
    pub fn from_nx_type(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        match upper.as_str() {
            "NX_BOOLEAN" => Some(ElementType::Bool),
            "NX_CHAR" | "NX_DATE_TIME" | "ISO8601" => Some(ElementType::Text),
            "NX_FLOAT" | "NX_FLOAT32" | "NX_FLOAT64" | "NX_NUMBER" => Some(ElementType::Float64),
            "NX_POSINT" => Some(ElementType::UInt64),
            _ if upper.starts_with("NX_UINT") => Some(ElementType::UInt64),
            _ if upper.starts_with("NX_INT") => Some(ElementType::Int64),
            _ => None,
        }
    }

    /// Canonical NeXus type name.
    pub fn nx_name(&self) -> &'static str {
        match self {
            ElementType::Bool => "NX_BOOLEAN",
            ElementType::Int64 => "NX_INT64",
            ElementType::UInt64 => "NX_UINT64",
            ElementType::Float64 => "NX_FLOAT64",
            ElementType::Text => "NX_CHAR",
        }
    }

    fn widen(self, other: ElementType) -> Option<ElementType> {
        use ElementType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Int64, UInt64) | (UInt64, Int64) => Some(Int64),
            (Int64 | UInt64, Float64) | (Float64, Int64 | UInt64) => Some(Float64),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nx_name())
    }
}

/// One element of a holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean element
    Bool(bool),
    /// Signed integer element
    Int(i64),
    /// Unsigned integer element that does not fit `i64`
    UInt(u64),
    /// Floating point element
    Float(f64),
    /// String element
    Text(String),
}

impl Value {
    /// Element type of this value.
    pub fn element_type(&self) -> ElementType {
        match self {
            Value::Bool(_) => ElementType::Bool,
            Value::Int(_) => ElementType::Int64,
            Value::UInt(_) => ElementType::UInt64,
            Value::Float(_) => ElementType::Float64,
            Value::Text(_) => ElementType::Text,
        }
    }

    /// Convert a JSON leaf into a value. Arrays, objects and `null` are rejected.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(Value::UInt(u))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            _ => None,
        }
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Signed integer view; floats are accepted only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::Float(_) => None,
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Unsigned integer view.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bool(b) => Some(u64::from(*b)),
            Value::Int(i) => u64::try_from(*i).ok(),
            Value::UInt(u) => Some(*u),
            Value::Float(f) if f.fract() == 0.0 && *f >= 0.0 && f.is_finite() => Some(*f as u64),
            Value::Float(_) => None,
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::UInt(u) => Some(*u != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
        }
    }

    /// Coerce into the requested element type.
    pub fn coerce(&self, target: ElementType) -> Option<Value> {
        match target {
            ElementType::Bool => self.as_bool().map(Value::Bool),
            ElementType::Int64 => self.as_i64().map(Value::Int),
            ElementType::UInt64 => self.as_u64().map(Value::UInt),
            ElementType::Float64 => self.as_f64().map(Value::Float),
            ElementType::Text => Some(Value::Text(self.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// Errors raised while building or converting a holder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    /// Array view requested on a scalar
    #[error("array conversion requested on a {0} value")]
    NotAnArray(DataFormat),

    /// Element cannot be represented in the target type
    #[error("element {index} ('{value}') cannot be represented as {target}")]
    Incompatible {
        /// Flat index of the element
        index: usize,
        /// Element as text
        value: String,
        /// Requested element type
        target: ElementType,
    },

    /// Array mixes element types that do not unify
    #[error("heterogeneous elements: {0} mixed with {1}")]
    Heterogeneous(ElementType, ElementType),

    /// Image rows of unequal length
    #[error("image rows have different lengths ({0} vs {1})")]
    RaggedImage(usize, usize),

    /// Payload with no holder representation
    #[error("unsupported payload: {0}")]
    Unsupported(String),
}

/// Format-tagged value produced by one data source read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataHolder {
    format: DataFormat,
    element_type: ElementType,
    shape: Vec<usize>,
    values: Vec<Value>,
}

impl DataHolder {
    /// Wrap a single value.
    pub fn scalar(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            format: DataFormat::Scalar,
            element_type: value.element_type(),
            shape: Vec::new(),
            values: vec![value],
        }
    }

    /// Build a one-dimensional holder. Elements must share a common type.
    pub fn spectrum(values: Vec<Value>) -> Result<Self, ConversionError> {
        let element_type = common_type(&values)?;
        Ok(Self {
            format: DataFormat::Spectrum,
            element_type,
            shape: vec![values.len()],
            values,
        })
    }

    /// Build a two-dimensional holder from rows of equal length.
    pub fn image(rows: Vec<Vec<Value>>) -> Result<Self, ConversionError> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|row| row.len() != cols) {
            return Err(ConversionError::RaggedImage(cols, bad.len()));
        }
        let n_rows = rows.len();
        let values: Vec<Value> = rows.into_iter().flatten().collect();
        let element_type = common_type(&values)?;
        Ok(Self {
            format: DataFormat::Image,
            element_type,
            shape: vec![n_rows, cols],
            values,
        })
    }

    /// Build a holder from flattened values and an explicit shape.
    pub fn from_parts(
        element_type: ElementType,
        shape: Vec<usize>,
        values: Vec<Value>,
    ) -> Result<Self, ConversionError> {
        let format = match shape.len() {
            0 => DataFormat::Scalar,
            1 => DataFormat::Spectrum,
            2 => DataFormat::Image,
            n => return Err(ConversionError::Unsupported(format!("rank {n} array"))),
        };
        let expected: usize = shape.iter().product();
        let expected = if format == DataFormat::Scalar { 1 } else { expected };
        if values.len() != expected {
            return Err(ConversionError::Unsupported(format!(
                "{} values do not fill shape {:?}",
                values.len(),
                shape
            )));
        }
        let observed = common_type(&values)?;
        Self {
            format,
            element_type: observed,
            shape,
            values,
        }
        .cast(element_type)
    }

    /// Classify a JSON value: leaf → SCALAR, flat array → SPECTRUM,
    /// array of equal-length arrays → IMAGE.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConversionError> {
        match value {
            serde_json::Value::Array(items) => {
                if !items.is_empty() && items.iter().all(serde_json::Value::is_array) {
                    let rows = items
                        .iter()
                        .map(|row| match row {
                            serde_json::Value::Array(cells) => json_leaves(cells),
                            _ => Err(ConversionError::Unsupported("mixed rows".into())),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Self::image(rows)
                } else {
                    Self::spectrum(json_leaves(items)?)
                }
            }
            other => Value::from_json(other)
                .map(Self::scalar)
                .ok_or_else(|| ConversionError::Unsupported(other.to_string())),
        }
    }

    /// Dimensionality class.
    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Element type of every value.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Shape, empty for scalars.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flattened values in row-major order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the holder carries no elements (an empty spectrum).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The single value of a scalar holder.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self.format {
            DataFormat::Scalar => self.values.first(),
            _ => None,
        }
    }

    /// Coerce every element into `target`.
    pub fn cast(self, target: ElementType) -> Result<Self, ConversionError> {
        if self.element_type == target {
            return Ok(self);
        }
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(index, v)| {
                v.coerce(target).ok_or_else(|| ConversionError::Incompatible {
                    index,
                    value: v.to_string(),
                    target,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            element_type: target,
            values,
            ..self
        })
    }

    /// Typed array view as `f64`. Defined for SPECTRUM and IMAGE only.
    pub fn to_f64_array(&self) -> Result<Vec<f64>, ConversionError> {
        self.typed_array(ElementType::Float64, Value::as_f64)
    }

    /// Typed array view as `i64`. Defined for SPECTRUM and IMAGE only.
    pub fn to_i64_array(&self) -> Result<Vec<i64>, ConversionError> {
        self.typed_array(ElementType::Int64, Value::as_i64)
    }

    /// Typed array view as `u64`. Defined for SPECTRUM and IMAGE only.
    pub fn to_u64_array(&self) -> Result<Vec<u64>, ConversionError> {
        self.typed_array(ElementType::UInt64, Value::as_u64)
    }

    /// Typed array view as `bool`. Defined for SPECTRUM and IMAGE only.
    pub fn to_bool_array(&self) -> Result<Vec<bool>, ConversionError> {
        self.typed_array(ElementType::Bool, Value::as_bool)
    }

    /// Typed array view as strings. Defined for SPECTRUM and IMAGE only.
    pub fn to_string_array(&self) -> Result<Vec<String>, ConversionError> {
        self.typed_array(ElementType::Text, |v| Some(v.to_string()))
    }

    fn typed_array<T>(
        &self,
        target: ElementType,
        convert: impl Fn(&Value) -> Option<T>,
    ) -> Result<Vec<T>, ConversionError> {
        if self.format == DataFormat::Scalar {
            return Err(ConversionError::NotAnArray(self.format));
        }
        self.values
            .iter()
            .enumerate()
            .map(|(index, v)| {
                convert(v).ok_or_else(|| ConversionError::Incompatible {
                    index,
                    value: v.to_string(),
                    target,
                })
            })
            .collect()
    }
}

fn json_leaves(items: &[serde_json::Value]) -> Result<Vec<Value>, ConversionError> {
    items
        .iter()
        .map(|item| {
            Value::from_json(item).ok_or_else(|| ConversionError::Unsupported(item.to_string()))
        })
        .collect()
}

fn common_type(values: &[Value]) -> Result<ElementType, ConversionError> {
    let mut iter = values.iter().map(Value::element_type);
    let Some(first) = iter.next() else {
        return Ok(ElementType::Float64);
    };
    iter.try_fold(first, |acc, next| {
        acc.widen(next)
            .ok_or(ConversionError::Heterogeneous(acc, next))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_json_payloads() {
        let scalar = DataHolder::from_json(&json!(1.5)).unwrap();
        assert_eq!(scalar.format(), DataFormat::Scalar);
        assert!(scalar.shape().is_empty());

        let spectrum = DataHolder::from_json(&json!([1, 2, 3])).unwrap();
        assert_eq!(spectrum.format(), DataFormat::Spectrum);
        assert_eq!(spectrum.shape(), &[3]);
        assert_eq!(spectrum.element_type(), ElementType::Int64);

        let image = DataHolder::from_json(&json!([[1, 2], [3, 4.5], [5, 6]])).unwrap();
        assert_eq!(image.format(), DataFormat::Image);
        assert_eq!(image.shape(), &[3, 2]);
        assert_eq!(image.element_type(), ElementType::Float64);
    }

    #[test]
    fn rejects_unclassifiable_payloads() {
        assert!(DataHolder::from_json(&json!({"a": 1})).is_err());
        assert!(DataHolder::from_json(&json!(null)).is_err());
        assert!(matches!(
            DataHolder::from_json(&json!([[1, 2], [3]])),
            Err(ConversionError::RaggedImage(2, 1))
        ));
        assert!(matches!(
            DataHolder::from_json(&json!([1, "two"])),
            Err(ConversionError::Heterogeneous(_, _))
        ));
    }

    #[test]
    fn array_views_require_arrays() {
        let scalar = DataHolder::scalar(3.0);
        assert_eq!(
            scalar.to_f64_array(),
            Err(ConversionError::NotAnArray(DataFormat::Scalar))
        );

        let spectrum = DataHolder::from_json(&json!([1, 2, 3])).unwrap();
        assert_eq!(spectrum.to_f64_array().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(
            spectrum.to_string_array().unwrap(),
            vec!["1".to_string(), "2".into(), "3".into()]
        );
    }

    #[test]
    fn cast_coerces_or_reports_index() {
        let holder = DataHolder::from_json(&json!([1, 2])).unwrap();
        let cast = holder.cast(ElementType::Float64).unwrap();
        assert_eq!(cast.values(), &[Value::Float(1.0), Value::Float(2.0)]);

        let text = DataHolder::from_json(&json!(["1", "x"])).unwrap();
        match text.cast(ElementType::Int64) {
            Err(ConversionError::Incompatible { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn nx_type_names_map_to_element_types() {
        assert_eq!(ElementType::from_nx_type("NX_FLOAT32"), Some(ElementType::Float64));
        assert_eq!(ElementType::from_nx_type("nx_int16"), Some(ElementType::Int64));
        assert_eq!(ElementType::from_nx_type("NX_UINT8"), Some(ElementType::UInt64));
        assert_eq!(ElementType::from_nx_type("NX_CHAR"), Some(ElementType::Text));
        assert_eq!(ElementType::from_nx_type("NX_COMPLEX"), None);
    }

    #[test]
    fn from_parts_checks_element_count() {
        let ok = DataHolder::from_parts(
            ElementType::UInt64,
            vec![2, 2],
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)],
        )
        .unwrap();
        assert_eq!(ok.format(), DataFormat::Image);
        assert_eq!(ok.element_type(), ElementType::UInt64);
        assert!(DataHolder::from_parts(ElementType::Int64, vec![3], vec![Value::Int(1)]).is_err());
    }
}
