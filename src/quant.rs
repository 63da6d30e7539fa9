//! Block-quantized weight storage.
//!
//! Block kinds group 32 consecutive elements under one half precision scale. The packed
//! layouts match the weight file byte for byte:
//! - `Q8_0`: 34 bytes per block, the scale followed by 32 signed codes
//! - `Q4_0`: 18 bytes per block, the scale followed by 16 bytes holding two 4 bit codes each.
//!   Element `j` of a block lives in the low nibble of byte `j / 2` when `j` is even and in the
//!   high nibble otherwise, and decodes as `(code - 8) * scale`.

use half::f16;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::error::{Error, Result};

/// Number of elements sharing one scale
pub const BLOCK_SIZE: usize = 32;
/// Zero point of the 4 bit scheme
pub const Q4_OFFSET: i32 = 8;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum QuantKind {
    F32,
    F16,
    Q8_0,
    Q4_0,
}

impl QuantKind {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Q8_0 | Self::Q4_0)
    }

    /// Bytes taken by one block of 32 elements, or by one element for float kinds
    pub fn unit_bytes(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q8_0 => 2 + BLOCK_SIZE,
            Self::Q4_0 => 2 + BLOCK_SIZE / 2,
        }
    }

    /// Expected byte length of a tensor with `n_elements` elements
    pub fn packed_len(&self, n_elements: usize) -> Option<usize> {
        if self.is_block() {
            (n_elements % BLOCK_SIZE == 0).then(|| n_elements / BLOCK_SIZE * self.unit_bytes())
        } else {
            Some(n_elements * self.unit_bytes())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Q8_0 { scales: Vec<f16>, quants: Vec<i8> },
    /// Two codes per byte, see module docs for the nibble order
    Q4_0 { scales: Vec<f16>, packed: Vec<u8> },
}

/// An immutable weight matrix or vector
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    name: String,
    shape: Vec<usize>,
    n_elements: usize,
    storage: Storage,
}

impl QuantizedTensor {
    /// Decode a raw byte span as found in the weight file
    pub fn from_bytes(
        name: &str,
        shape: Vec<usize>,
        kind: QuantKind,
        bytes: &[u8],
    ) -> Result<Self> {
        let n_elements = shape.iter().product::<usize>();
        if kind.is_block() && n_elements % BLOCK_SIZE != 0 {
            return Err(Error::format(
                name,
                format!(
                    "{n_elements} elements is not a multiple of the {kind} block size {BLOCK_SIZE}"
                ),
            ));
        }
        let expected = kind.packed_len(n_elements).unwrap_or_default();
        if bytes.len() != expected {
            return Err(Error::format(
                name,
                format!(
                    "expected {expected} bytes for {n_elements} {kind} elements, got {}",
                    bytes.len()
                ),
            ));
        }

        let storage = match kind {
            QuantKind::F32 => Storage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            QuantKind::F16 => Storage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            QuantKind::Q8_0 => {
                let (mut scales, mut quants) = (vec![], Vec::with_capacity(n_elements));
                for block in bytes.chunks_exact(kind.unit_bytes()) {
                    scales.push(f16::from_le_bytes([block[0], block[1]]));
                    quants.extend(block[2..].iter().map(|b| *b as i8));
                }
                Storage::Q8_0 { scales, quants }
            }
            QuantKind::Q4_0 => {
                let (mut scales, mut packed) = (vec![], Vec::with_capacity(n_elements / 2));
                for block in bytes.chunks_exact(kind.unit_bytes()) {
                    scales.push(f16::from_le_bytes([block[0], block[1]]));
                    packed.extend_from_slice(&block[2..]);
                }
                Storage::Q4_0 { scales, packed }
            }
        };
        Ok(Self {
            name: name.to_string(),
            shape,
            n_elements,
            storage,
        })
    }

    pub fn from_f32(name: &str, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::check_len(name, &shape, data.len())?;
        Ok(Self {
            name: name.to_string(),
            n_elements: data.len(),
            shape,
            storage: Storage::F32(data),
        })
    }

    pub fn from_f16(name: &str, shape: Vec<usize>, data: Vec<f16>) -> Result<Self> {
        Self::check_len(name, &shape, data.len())?;
        Ok(Self {
            name: name.to_string(),
            n_elements: data.len(),
            shape,
            storage: Storage::F16(data),
        })
    }

    /// Quantize to 8 bit blocks, scale = max |x| / 127
    pub fn quantize_q8(name: &str, shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        Self::check_blocks(name, &shape, data.len())?;
        let (mut scales, mut quants) = (vec![], Vec::with_capacity(data.len()));
        for block in data.chunks_exact(BLOCK_SIZE) {
            let amax = block.iter().fold(0f32, |m, x| m.max(x.abs()));
            let scale = f16::from_f32(amax / 127.);
            scales.push(scale);
            quants.extend(block.iter().map(|x| q8_code(*x, scale.to_f32())));
        }
        Ok(Self {
            name: name.to_string(),
            n_elements: data.len(),
            shape,
            storage: Storage::Q8_0 { scales, quants },
        })
    }

    /// Quantize to 4 bit blocks, scale = (signed value with the largest magnitude) / -8
    pub fn quantize_q4(name: &str, shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        Self::check_blocks(name, &shape, data.len())?;
        let (mut scales, mut packed) = (vec![], Vec::with_capacity(data.len() / 2));
        for block in data.chunks_exact(BLOCK_SIZE) {
            let max = block
                .iter()
                .copied()
                .fold(0f32, |m, x| if x.abs() > m.abs() { x } else { m });
            let scale = f16::from_f32(max / -8.);
            scales.push(scale);
            packed.extend(
                block
                    .iter()
                    .map(|x| q4_code(*x, scale.to_f32()))
                    .tuples()
                    .map(|(lo, hi)| lo | (hi << 4)),
            );
        }
        Ok(Self {
            name: name.to_string(),
            n_elements: data.len(),
            shape,
            storage: Storage::Q4_0 { scales, packed },
        })
    }

    /// Re-pack dequantized values using this tensor's scales
    pub fn requantize(&self, values: &[f32]) -> Result<Self> {
        if values.len() != self.n_elements {
            return Err(Error::format(
                &self.name,
                format!("expected {} values, got {}", self.n_elements, values.len()),
            ));
        }
        let storage = match &self.storage {
            Storage::F32(_) => Storage::F32(values.to_vec()),
            Storage::F16(_) => Storage::F16(values.iter().map(|v| f16::from_f32(*v)).collect()),
            Storage::Q8_0 { scales, .. } => Storage::Q8_0 {
                scales: scales.clone(),
                quants: values
                    .chunks_exact(BLOCK_SIZE)
                    .zip(scales)
                    .flat_map(|(b, s)| b.iter().map(|v| q8_code(*v, s.to_f32())))
                    .collect(),
            },
            Storage::Q4_0 { scales, .. } => Storage::Q4_0 {
                scales: scales.clone(),
                packed: values
                    .chunks_exact(BLOCK_SIZE)
                    .zip(scales)
                    .flat_map(|(b, s)| b.iter().map(|v| q4_code(*v, s.to_f32())))
                    .tuples()
                    .map(|(lo, hi)| lo | (hi << 4))
                    .collect(),
            },
        };
        Ok(Self {
            name: self.name.clone(),
            shape: self.shape.clone(),
            n_elements: self.n_elements,
            storage,
        })
    }

    /// Serialize back into the weight file layout
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.storage {
            Storage::F32(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Storage::F16(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Storage::Q8_0 { scales, quants } => scales
                .iter()
                .zip(quants.chunks_exact(BLOCK_SIZE))
                .flat_map(|(s, q)| s.to_le_bytes().into_iter().chain(q.iter().map(|c| *c as u8)))
                .collect(),
            Storage::Q4_0 { scales, packed } => scales
                .iter()
                .zip(packed.chunks_exact(BLOCK_SIZE / 2))
                .flat_map(|(s, q)| s.to_le_bytes().into_iter().chain(q.iter().copied()))
                .collect(),
        }
    }

    fn check_len(name: &str, shape: &[usize], len: usize) -> Result<()> {
        let n = shape.iter().product::<usize>();
        if n != len {
            return Err(Error::format(
                name,
                format!("shape {shape:?} holds {n} elements but {len} were given"),
            ));
        }
        Ok(())
    }

    fn check_blocks(name: &str, shape: &[usize], len: usize) -> Result<()> {
        Self::check_len(name, shape, len)?;
        if len % BLOCK_SIZE != 0 {
            return Err(Error::format(
                name,
                format!("{len} elements is not a multiple of the block size {BLOCK_SIZE}"),
            ));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.n_elements
    }

    pub fn is_empty(&self) -> bool {
        self.n_elements == 0
    }

    pub fn kind(&self) -> QuantKind {
        match self.storage {
            Storage::F32(_) => QuantKind::F32,
            Storage::F16(_) => QuantKind::F16,
            Storage::Q8_0 { .. } => QuantKind::Q8_0,
            Storage::Q4_0 { .. } => QuantKind::Q4_0,
        }
    }

    /// Per-block scales (block kinds only)
    pub fn scales(&self) -> Option<&[f16]> {
        match &self.storage {
            Storage::Q8_0 { scales, .. } | Storage::Q4_0 { scales, .. } => Some(scales),
            _ => None,
        }
    }

    /// One signed code per element (`Q8_0` only)
    pub fn q8_codes(&self) -> Option<&[i8]> {
        match &self.storage {
            Storage::Q8_0 { quants, .. } => Some(quants),
            _ => None,
        }
    }

    /// Two codes per byte (`Q4_0` only)
    pub fn q4_packed(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Q4_0 { packed, .. } => Some(packed),
            _ => None,
        }
    }

    /// Signed code of element `i` before scaling (block kinds only)
    pub fn code(&self, i: usize) -> Option<i32> {
        match &self.storage {
            Storage::Q8_0 { quants, .. } => Some(quants[i] as i32),
            Storage::Q4_0 { packed, .. } => Some(q4_nibble(packed, i) as i32 - Q4_OFFSET),
            _ => None,
        }
    }

    /// Dequantize a single element. Panics if `i` is out of range, like slice indexing.
    pub fn value(&self, i: usize) -> f32 {
        match &self.storage {
            Storage::F32(d) => d[i],
            Storage::F16(d) => d[i].to_f32(),
            Storage::Q8_0 { scales, quants } => quants[i] as f32 * scales[i / BLOCK_SIZE].to_f32(),
            Storage::Q4_0 { scales, packed } => {
                (q4_nibble(packed, i) as i32 - Q4_OFFSET) as f32 * scales[i / BLOCK_SIZE].to_f32()
            }
        }
    }

    /// Dequantize `out.len()` elements starting at `start`
    pub fn dequantize_into(&self, start: usize, out: &mut [f32]) {
        match &self.storage {
            Storage::F32(d) => out.copy_from_slice(&d[start..start + out.len()]),
            Storage::F16(d) => {
                for (o, v) in out.iter_mut().zip(&d[start..]) {
                    *o = v.to_f32();
                }
            }
            _ => {
                for (i, o) in out.iter_mut().enumerate() {
                    *o = self.value(start + i);
                }
            }
        }
    }

    /// Dequantize row `row` of a matrix with `out.len()` columns, as for an embedding lookup
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) {
        self.dequantize_into(row * out.len(), out)
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.; self.n_elements];
        self.dequantize_into(0, &mut out);
        out
    }

    /// Dot product of row `row` (of width `x.len()`) with `x`, dequantizing a block at a time
    pub fn dot_row(&self, row: usize, x: &[f32]) -> f32 {
        let cols = x.len();
        let start = row * cols;
        match &self.storage {
            Storage::F32(d) => d[start..start + cols].iter().zip(x).map(|(a, b)| a * b).sum(),
            Storage::F16(d) => d[start..start + cols]
                .iter()
                .zip(x)
                .map(|(a, b)| a.to_f32() * b)
                .sum(),
            Storage::Q8_0 { scales, quants } if cols % BLOCK_SIZE == 0 => {
                let first = start / BLOCK_SIZE;
                quants[start..start + cols]
                    .chunks_exact(BLOCK_SIZE)
                    .zip(x.chunks_exact(BLOCK_SIZE))
                    .enumerate()
                    .map(|(b, (q, x))| {
                        let sum = q.iter().zip(x).map(|(q, x)| *q as f32 * x).sum::<f32>();
                        sum * scales[first + b].to_f32()
                    })
                    .sum()
            }
            Storage::Q4_0 { scales, packed } if cols % BLOCK_SIZE == 0 => {
                let first = start / BLOCK_SIZE;
                packed[start / 2..(start + cols) / 2]
                    .chunks_exact(BLOCK_SIZE / 2)
                    .zip(x.chunks_exact(BLOCK_SIZE))
                    .enumerate()
                    .map(|(b, (q, x))| {
                        let sum = q
                            .iter()
                            .zip(x.chunks_exact(2))
                            .map(|(byte, x)| {
                                ((byte & 0x0F) as i32 - Q4_OFFSET) as f32 * x[0]
                                    + ((byte >> 4) as i32 - Q4_OFFSET) as f32 * x[1]
                            })
                            .sum::<f32>();
                        sum * scales[first + b].to_f32()
                    })
                    .sum()
            }
            _ => x
                .iter()
                .enumerate()
                .map(|(i, x)| self.value(start + i) * x)
                .sum(),
        }
    }
}

fn q4_nibble(packed: &[u8], i: usize) -> u8 {
    let byte = packed[i / 2];
    if i % 2 == 0 {
        byte & 0x0F
    } else {
        byte >> 4
    }
}

fn q8_code(x: f32, scale: f32) -> i8 {
    if scale == 0. {
        return 0;
    }
    (x / scale).round().clamp(-128., 127.) as i8
}

fn q4_code(x: f32, scale: f32) -> u8 {
    if scale == 0. {
        return Q4_OFFSET as u8;
    }
    ((x / scale).round() as i32 + Q4_OFFSET).clamp(0, 15) as u8
}
