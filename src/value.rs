//! Host-side values exchanged with the dispatcher.
//!
//! The host environment hands over loosely typed arguments (scalars, strings,
//! `single`/`int32` matrices, cell arrays) and receives the same kinds back,
//! plus struct arrays for tree introspection. The `to_*` conversions are the
//! only place where host values are turned into native types.

use ndarray::Array2;
use serde_json::{Map, Value as Json};

use crate::error::{DispatchError, Result};

/// One element of a struct array: ordered `(field, value)` pairs.
pub type Record = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Single(Array2<f32>),
    Int32(Array2<i32>),
    Cell(Vec<Value>),
    Struct(Vec<Record>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Bool(_) => "logical",
            Self::Int(_) => "integer",
            Self::Float(_) => "double",
            Self::Text(_) => "char",
            Self::Single(_) => "single matrix",
            Self::Int32(_) => "int32 matrix",
            Self::Cell(_) => "cell",
            Self::Struct(_) => "struct",
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn is_int32(&self) -> bool {
        matches!(self, Self::Int32(_))
    }

    fn scalar(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Single(m) if m.len() == 1 => m.iter().next().map(|&v| f64::from(v)),
            Self::Int32(m) if m.len() == 1 => m.iter().next().map(|&v| f64::from(v)),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &str) -> DispatchError {
        DispatchError::invalid(format!("expected {expected}, got {}", self.type_name()))
    }

    /// Integer conversion; fractional values are truncated.
    pub fn to_int(&self) -> Result<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            _ => match self.scalar() {
                Some(v) if v.is_finite() => Ok(v.trunc() as i64),
                _ => Err(self.mismatch("an integer scalar")),
            },
        }
    }

    pub fn to_i32(&self) -> Result<i32> {
        let v = self.to_int()?;
        i32::try_from(v).map_err(|_| DispatchError::invalid(format!("{v} is out of int32 range")))
    }

    pub fn to_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            _ => self
                .scalar()
                .map(|v| v != 0.0)
                .ok_or_else(|| self.mismatch("a logical scalar")),
        }
    }

    pub fn to_f64(&self) -> Result<f64> {
        self.scalar().ok_or_else(|| self.mismatch("a numeric scalar"))
    }

    pub fn as_text(&self) -> Result<&str> {
        match self {
            Self::Text(s) => Ok(s),
            _ => Err(self.mismatch("a string")),
        }
    }

    pub fn as_cell(&self) -> Result<&[Value]> {
        match self {
            Self::Cell(items) => Ok(items),
            Self::Empty => Ok(&[]),
            _ => Err(self.mismatch("a cell array")),
        }
    }

    /// Converts to a `single` matrix. Scalars become 1x1, empty becomes 0x0.
    pub fn to_single(&self) -> Result<Array2<f32>> {
        match self {
            Self::Single(m) => Ok(m.clone()),
            Self::Int32(m) => Ok(m.mapv(|v| v as f32)),
            Self::Empty => Ok(Array2::zeros((0, 0))),
            _ => self
                .scalar()
                .map(|v| Array2::from_elem((1, 1), v as f32))
                .ok_or_else(|| self.mismatch("a numeric matrix")),
        }
    }

    /// Converts to an `int32` matrix, rounding non-integral entries.
    pub fn to_int32(&self) -> Result<Array2<i32>> {
        match self {
            Self::Int32(m) => Ok(m.clone()),
            Self::Single(m) => Ok(m.mapv(|v| v.round() as i32)),
            Self::Empty => Ok(Array2::zeros((0, 0))),
            _ => match self.scalar() {
                Some(v) => Ok(Array2::from_elem((1, 1), v.round() as i32)),
                None => Err(self.mismatch("an integer matrix")),
            },
        }
    }

    /// Flattens a row or column vector (any matrix, row-major) to `f32`.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        Ok(self.to_single()?.iter().copied().collect())
    }

    /// Flattens to non-negative 0-based indices.
    pub fn to_index_vec(&self) -> Result<Vec<usize>> {
        self.to_int32()?
            .iter()
            .map(|&i| {
                usize::try_from(i).map_err(|_| DispatchError::invalid(format!("negative index {i}")))
            })
            .collect()
    }

    /// Reads a host value from its JSON form.
    ///
    /// `{"int32": rows}` and `{"single": rows}` force the matrix class; plain
    /// numeric arrays become `single` matrices, other arrays become cells.
    pub fn from_json(json: &Json) -> Result<Self> {
        match json {
            Json::Null => Ok(Self::Empty),
            Json::Bool(b) => Ok(Self::Bool(*b)),
            Json::Number(n) => Ok(match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Json::String(s) => Ok(Self::Text(s.clone())),
            Json::Object(map) => match map.iter().next() {
                Some((class, rows)) if map.len() == 1 && class == "int32" => {
                    let m = numeric_rows(rows)?;
                    Ok(Self::Int32(m.mapv(|v| v.round() as i32)))
                }
                Some((class, rows)) if map.len() == 1 && class == "single" => {
                    Ok(Self::Single(numeric_rows(rows)?.mapv(|v| v as f32)))
                }
                _ => Err(DispatchError::invalid(
                    "objects must be {\"int32\": ...} or {\"single\": ...}",
                )),
            },
            Json::Array(items) if items.is_empty() => Ok(Self::Empty),
            Json::Array(items) => match numeric_rows(json) {
                Ok(m) => Ok(Self::Single(m.mapv(|v| v as f32))),
                Err(_) => items.iter().map(Self::from_json).collect::<Result<_>>().map(Self::Cell),
            },
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Self::Empty => Json::Array(Vec::new()),
            Self::Bool(b) => Json::from(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => Json::from(*f),
            Self::Text(s) => Json::from(s.as_str()),
            Self::Single(m) => Json::Array(
                m.rows()
                    .into_iter()
                    .map(|row| row.iter().map(|&v| Json::from(v)).collect())
                    .collect(),
            ),
            Self::Int32(m) => Json::Array(
                m.rows()
                    .into_iter()
                    .map(|row| row.iter().map(|&v| Json::from(v)).collect())
                    .collect(),
            ),
            Self::Cell(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::Struct(records) => Json::Array(
                records
                    .iter()
                    .map(|record| {
                        let fields: Map<String, Json> = record
                            .iter()
                            .map(|(name, value)| (name.clone(), value.to_json()))
                            .collect();
                        Json::Object(fields)
                    })
                    .collect(),
            ),
        }
    }
}

/// Parses `[n, ...]` as a 1xN row or `[[n, ...], ...]` as rows.
fn numeric_rows(json: &Json) -> Result<Array2<f64>> {
    let bad = || DispatchError::invalid("matrix rows must be equal-length numeric arrays");
    let items = json.as_array().ok_or_else(bad)?;
    if items.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let rows: Vec<Vec<f64>> = if items.iter().all(Json::is_number) {
        vec![items.iter().filter_map(Json::as_f64).collect()]
    } else {
        items
            .iter()
            .map(|row| {
                row.as_array()
                    .filter(|r| r.iter().all(Json::is_number))
                    .map(|r| r.iter().filter_map(Json::as_f64).collect())
                    .ok_or_else(bad)
            })
            .collect::<Result<_>>()?
    };
    let cols = rows[0].len();
    if rows.iter().any(|r| r.len() != cols) {
        return Err(bad());
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), cols), flat).map_err(|_| bad())
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Self::Float(f64::from(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Array2<f32>> for Value {
    fn from(m: Array2<f32>) -> Self {
        Self::Single(m)
    }
}

impl From<Array2<i32>> for Value {
    fn from(m: Array2<i32>) -> Self {
        Self::Int32(m)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Cell(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(Value::Float(5.9).to_int().unwrap(), 5);
        assert!(Value::Int(2).to_bool().unwrap());
        assert!(!Value::Single(array![[0.0f32]]).to_bool().unwrap());
        assert!(Value::from("x").to_int().is_err());
    }

    #[test]
    fn test_json_matrices() {
        let v = Value::from_json(&json!({"int32": [[1], [0], [1]]})).unwrap();
        assert_eq!(v, Value::Int32(array![[1], [0], [1]]));

        let v = Value::from_json(&json!([[1.5, 2.0], [3.0, 4.0]])).unwrap();
        assert_eq!(v, Value::Single(array![[1.5f32, 2.0], [3.0, 4.0]]));

        let v = Value::from_json(&json!([1, 2, 3])).unwrap();
        assert_eq!(v, Value::Single(array![[1.0f32, 2.0, 3.0]]));
    }

    #[test]
    fn test_json_cells() {
        let v = Value::from_json(&json!(["Layout", "Row", "TrainTestSplitRatio", 0.5])).unwrap();
        let items = v.as_cell().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[3], Value::Float(0.5));
    }

    #[test]
    fn test_struct_to_json_keeps_field_order() {
        let v = Value::Struct(vec![vec![
            ("value".to_owned(), Value::Float(1.0)),
            ("left".to_owned(), Value::Int(-1)),
        ]]);
        assert_eq!(v.to_json().to_string(), r#"[{"value":1.0,"left":-1}]"#);
    }
}
