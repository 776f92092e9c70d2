/// Tensor storage for the inference runtime.
///
/// Dense tensors are contiguous row-major f32 buffers. Quantized tensors are
/// 2-D weight matrices stored as fixed-size blocks (see `quantized`). Both
/// refuse shapes whose element count exceeds the platform index ceiling so a
/// single tensor stays addressable by a native signed machine word.
pub mod fp16;
pub mod quantized;

use crate::error::{NoctuaError, NoctuaResult};

/// Conservative per-tensor element ceiling: a 32-bit element-index budget.
pub const MAX_TENSOR_ELEMENTS: u64 = i32::MAX as u64;

/// Compute the element count of a shape with widened arithmetic, failing
/// with `TensorTooLarge` past the index ceiling.
pub fn checked_element_count(shape: &[usize]) -> NoctuaResult<usize> {
    let mut total: u64 = 1;
    for &dim in shape {
        total = total.saturating_mul(dim as u64);
        if total > MAX_TENSOR_ELEMENTS {
            return Err(NoctuaError::TensorTooLarge {
                elements: total,
                ceiling: MAX_TENSOR_ELEMENTS,
            });
        }
    }
    Ok(total as usize)
}

/// Dense row-major f32 tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> NoctuaResult<Self> {
        let count = checked_element_count(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![0.0; count],
        })
    }

    /// Wrap an existing buffer, validating it against the shape.
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> NoctuaResult<Self> {
        let count = checked_element_count(shape)?;
        if data.len() != count {
            return Err(NoctuaError::ShapeMismatch {
                op: "Tensor::from_data",
                expected: format!("{} elements", count),
                actual: format!("{} elements", data.len()),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Row `i` of a 2-D tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        debug_assert_eq!(self.shape.len(), 2);
        let cols = self.shape[1];
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Shape as a display string, e.g. "4096x32000".
    pub fn shape_str(&self) -> String {
        self.shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x")
    }
}
