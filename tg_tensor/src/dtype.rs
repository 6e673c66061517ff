//! Element types and host-side tensor values.

use std::fmt;

use crate::error::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl DType {
    /// Width of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::I32 => "int32",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flat, row-major tensor values living in host memory.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
}

impl HostData {
    /// `len` copies of `value` converted to `dtype`.
    pub fn filled(dtype: DType, len: usize, value: f32) -> Self {
        match dtype {
            DType::F32 => HostData::F32(vec![value; len]),
            DType::I32 => HostData::I32(vec![value as i32; len]),
            DType::Bool => HostData::Bool(vec![value != 0.0; len]),
        }
    }

    /// Decode little-endian bytes. The byte count must be a whole number of elements.
    pub fn from_le_bytes(bytes: &[u8], dtype: DType) -> Result<Self> {
        let width = dtype.size_of();
        if bytes.len() % width != 0 {
            return Err(Error::DataLength {
                expected: bytes.len().div_ceil(width) * width,
                found: bytes.len(),
            });
        }
        let words = bytes.chunks_exact(width);
        Ok(match dtype {
            DType::F32 => HostData::F32(
                words
                    .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect(),
            ),
            DType::I32 => HostData::I32(
                words
                    .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect(),
            ),
            DType::Bool => HostData::Bool(bytes.iter().map(|&b| b != 0).collect()),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::I32(_) => DType::I32,
            HostData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::I32(v) => v.len(),
            HostData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the values when this is float data.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            HostData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            HostData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Values widened to `f32` (booleans become 0.0 / 1.0).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            HostData::F32(v) => v.clone(),
            HostData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            HostData::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Convert element type. Floats truncate toward zero when cast to int32.
    pub fn cast(&self, dtype: DType) -> HostData {
        match (self, dtype) {
            (HostData::F32(v), DType::I32) => HostData::I32(v.iter().map(|&x| x as i32).collect()),
            (HostData::F32(v), DType::Bool) => HostData::Bool(v.iter().map(|&x| x != 0.0).collect()),
            (HostData::I32(v), DType::Bool) => HostData::Bool(v.iter().map(|&x| x != 0).collect()),
            (HostData::Bool(v), DType::I32) => HostData::I32(v.iter().map(|&x| x as i32).collect()),
            (_, DType::F32) => HostData::F32(self.to_f32_vec()),
            _ => self.clone(),
        }
    }

    /// New data whose element `i` is `self[indices[i]]`.
    pub fn gather(&self, indices: &[usize]) -> HostData {
        match self {
            HostData::F32(v) => HostData::F32(indices.iter().map(|&i| v[i]).collect()),
            HostData::I32(v) => HostData::I32(indices.iter().map(|&i| v[i]).collect()),
            HostData::Bool(v) => HostData::Bool(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}

impl From<Vec<f32>> for HostData {
    fn from(v: Vec<f32>) -> Self {
        HostData::F32(v)
    }
}

impl From<Vec<i32>> for HostData {
    fn from(v: Vec<i32>) -> Self {
        HostData::I32(v)
    }
}

impl From<Vec<bool>> for HostData {
    fn from(v: Vec<bool>) -> Self {
        HostData::Bool(v)
    }
}

impl From<&[f32]> for HostData {
    fn from(v: &[f32]) -> Self {
        HostData::F32(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_widths() {
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::I32.size_of(), 4);
        assert_eq!(DType::Bool.size_of(), 1);
    }

    #[test]
    fn test_from_le_bytes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f32).to_le_bytes());
        let data = HostData::from_le_bytes(&bytes, DType::F32).unwrap();
        assert_eq!(data, HostData::F32(vec![1.5, -2.0]));

        let ints = HostData::from_le_bytes(&7i32.to_le_bytes(), DType::I32).unwrap();
        assert_eq!(ints, HostData::I32(vec![7]));
    }

    #[test]
    fn test_from_le_bytes_rejects_partial_element() {
        let err = HostData::from_le_bytes(&[0, 0, 0], DType::F32).unwrap_err();
        assert!(matches!(err, Error::DataLength { expected: 4, found: 3 }));
    }

    #[test]
    fn test_cast_and_gather() {
        let data = HostData::F32(vec![-1.7, 0.0, 2.9]);
        assert_eq!(data.cast(DType::I32), HostData::I32(vec![-1, 0, 2]));
        assert_eq!(data.cast(DType::Bool), HostData::Bool(vec![true, false, true]));
        assert_eq!(
            HostData::Bool(vec![true, false]).cast(DType::F32),
            HostData::F32(vec![1.0, 0.0])
        );
        assert_eq!(data.gather(&[2, 2, 0]), HostData::F32(vec![2.9, 2.9, -1.7]));
    }
}
