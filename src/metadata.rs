//! What the weight file parser hands over: named tensors and a flat metadata map.

use rustc_hash::FxHashMap;

use crate::{
    error::{Error, Result},
    quant::QuantKind,
};

/// A single metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U32(u32),
    I32(i32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Array(Vec<MetadataValue>),
}

impl MetadataValue {
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Self::U32(v) => Some(*v as usize),
            Self::U64(v) => usize::try_from(*v).ok(),
            Self::I32(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            Self::F64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Flat key-value model metadata
#[derive(Debug, Clone, Default)]
pub struct Metadata(pub FxHashMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Get a required integer entry
    pub fn usize(&self, key: &str) -> Result<usize> {
        self.optional_usize(key)?
            .ok_or_else(|| Error::format(key, "missing metadata entry"))
    }

    pub fn optional_usize(&self, key: &str) -> Result<Option<usize>> {
        self.get(key)
            .map(|v| {
                v.as_usize()
                    .ok_or_else(|| Error::format(key, "expected an unsigned integer"))
            })
            .transpose()
    }

    pub fn optional_f32(&self, key: &str) -> Result<Option<f32>> {
        self.get(key)
            .map(|v| {
                v.as_f32()
                    .ok_or_else(|| Error::format(key, "expected a float"))
            })
            .transpose()
    }

    pub fn string(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::format(key, "missing metadata entry"))?
            .as_str()
            .ok_or_else(|| Error::format(key, "expected a string"))
    }

    /// Length of an array entry, if present
    pub fn array_len(&self, key: &str) -> Option<usize> {
        match self.get(key) {
            Some(MetadataValue::Array(a)) => Some(a.len()),
            _ => None,
        }
    }
}

/// One named tensor as found in the weight file
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    /// Dimensions, innermost (contiguous) dimension first
    pub shape: Vec<usize>,
    pub kind: QuantKind,
    pub bytes: Vec<u8>,
}

impl TensorEntry {
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        kind: QuantKind,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            shape,
            kind,
            bytes,
        }
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }
}
