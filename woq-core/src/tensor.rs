use half::{bf16, f16};

use crate::dtype::{Element, ElemType};
use crate::error::{Result, WoqError};

/// Owned, contiguous, row-major element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
            TensorData::BF16(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> ElemType {
        match self {
            TensorData::F32(_) => ElemType::F32,
            TensorData::F16(_) => ElemType::F16,
            TensorData::BF16(_) => ElemType::BF16,
            TensorData::I8(_) => ElemType::I8,
            TensorData::U8(_) => ElemType::U8,
            TensorData::I32(_) => ElemType::I32,
        }
    }
}

/// A shaped buffer: contiguous row-major data, no strides or views. The
/// element count always equals the product of the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: impl Into<Vec<usize>>, data: TensorData) -> Result<Self> {
        let shape = shape.into();
        check_len(&shape, &data)?;
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: impl Into<Vec<usize>>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn from_elements<T: Element>(shape: impl Into<Vec<usize>>, values: Vec<T>) -> Result<Self> {
        Self::new(shape, T::wrap(values))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> ElemType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Replace the contents, keeping the shape. The new data may change
    /// element type but must hold the same number of elements.
    pub fn set_data(&mut self, data: TensorData) -> Result<()> {
        check_len(&self.shape, &data)?;
        self.data = data;
        Ok(())
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    /// Raw bytes of an 8-bit tensor (`U8` or `I8`), used for packed weights.
    pub fn packed_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            TensorData::I8(v) => Some(bytemuck::cast_slice(v)),
            _ => None,
        }
    }

    /// Widen every element to f32. Integer types convert by value.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::U8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }
}

fn check_len(shape: &[usize], data: &TensorData) -> Result<()> {
    let mut elements: usize = 1;
    for &dim in shape {
        elements = elements
            .checked_mul(dim)
            .ok_or_else(|| WoqError::InvalidShape {
                name: "tensor",
                reason: format!("shape overflow: dimension {dim} causes overflow"),
            })?;
    }
    if elements != data.len() {
        return Err(WoqError::InvalidShape {
            name: "tensor",
            reason: format!("shape {shape:?} holds {elements} elements, data has {}", data.len()),
        });
    }
    Ok(())
}
