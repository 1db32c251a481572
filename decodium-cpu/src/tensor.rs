//! CPU tensor implementation.

use std::fmt;
use std::sync::Arc;

use decodium::dtype::DType;
use decodium::tensor::Tensor;
use decodium::{Error, Result};

/// A CPU-resident tensor backed by shared word storage.
///
/// Storage is `Arc<Vec<u32>>` so clones and `slice_view` are cheap and every
/// 4-byte element is aligned. Mutation goes through `Arc::make_mut`, which
/// detaches a tensor from any views that still share its storage.
#[derive(Clone)]
pub struct CpuTensor {
    words: Arc<Vec<u32>>,
    /// Byte offset of the first element.
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
}

fn word_storage(num_bytes: usize) -> Vec<u32> {
    vec![0u32; num_bytes.div_ceil(4)]
}

impl CpuTensor {
    fn from_bytes(shape: &[usize], dtype: DType, bytes: &[u8]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            bytes.len(),
            numel * dtype.size_in_bytes(),
            "data len does not match shape {shape:?} of {dtype}"
        );
        let mut words = word_storage(bytes.len());
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        Self {
            words: Arc::new(words),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Create a tensor from an f32 slice.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        Self::from_bytes(shape, DType::F32, bytemuck::cast_slice(data))
    }

    /// Create an `I32` tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_i32(shape: &[usize], data: &[i32]) -> Self {
        Self::from_bytes(shape, DType::I32, bytemuck::cast_slice(data))
    }

    /// Create a `U8` tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_u8(shape: &[usize], data: &[u8]) -> Self {
        Self::from_bytes(shape, DType::U8, data)
    }

    /// Create an F16 tensor from f32 values.
    #[must_use]
    pub fn from_f32_as_f16(shape: &[usize], data: &[f32]) -> Self {
        let halves: Vec<half::f16> = data.iter().map(|&v| half::f16::from_f32(v)).collect();
        Self::from_bytes(shape, DType::F16, bytemuck::cast_slice(&halves))
    }

    /// Create a BF16 tensor from f32 values.
    #[must_use]
    pub fn from_f32_as_bf16(shape: &[usize], data: &[f32]) -> Self {
        let halves: Vec<half::bf16> = data.iter().map(|&v| half::bf16::from_f32(v)).collect();
        Self::from_bytes(shape, DType::BF16, bytemuck::cast_slice(&halves))
    }

    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            words: Arc::new(word_storage(numel * dtype.size_in_bytes())),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let bytes: &[u8] = bytemuck::cast_slice(&self.words);
        &bytes[self.offset..self.offset + self.size_in_bytes()]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let start = self.offset;
        let end = start + self.size_in_bytes();
        let words = Arc::make_mut(&mut self.words);
        &mut bytemuck::cast_slice_mut::<u32, u8>(words)[start..end]
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Get the data as a mutable f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    /// Get the data as an i32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not I32.
    #[must_use]
    pub fn as_i32_slice(&self) -> &[i32] {
        assert_eq!(self.dtype, DType::I32, "expected I32 tensor");
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Get the data as a mutable i32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not I32.
    pub fn as_i32_slice_mut(&mut self) -> &mut [i32] {
        assert_eq!(self.dtype, DType::I32, "expected I32 tensor");
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    /// Get the data as a u8 slice.
    ///
    /// # Panics
    /// Panics if dtype is not U8.
    #[must_use]
    pub fn as_u8_slice(&self) -> &[u8] {
        assert_eq!(self.dtype, DType::U8, "expected U8 tensor");
        self.as_bytes()
    }

    /// Get the data as a mutable u8 slice.
    ///
    /// # Panics
    /// Panics if dtype is not U8.
    pub fn as_u8_slice_mut(&mut self) -> &mut [u8] {
        assert_eq!(self.dtype, DType::U8, "expected U8 tensor");
        self.as_bytes_mut()
    }

    /// Convert to an f32 Vec, casting from bf16/f16 if necessary.
    ///
    /// # Errors
    /// Returns [`Error::DtypeMismatch`] for integer tensors.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DType::F32 => Ok(self.as_f32_slice().to_vec()),
            DType::BF16 => {
                let bf16s: &[half::bf16] = bytemuck::cast_slice(self.as_bytes());
                Ok(bf16s.iter().map(|v| v.to_f32()).collect())
            }
            DType::F16 => {
                let f16s: &[half::f16] = bytemuck::cast_slice(self.as_bytes());
                Ok(f16s.iter().map(|v| v.to_f32()).collect())
            }
            other => Err(Error::DtypeMismatch {
                expected: "float".into(),
                got: other.to_string(),
            }),
        }
    }

    /// Copy the float contents into `dst`, casting half types.
    ///
    /// # Errors
    /// Returns an error for integer tensors or a length mismatch.
    pub fn copy_to_f32(&self, dst: &mut [f32]) -> Result<()> {
        if dst.len() != self.numel() {
            return Err(Error::ShapeMismatch {
                expected: vec![dst.len()],
                got: self.shape.clone(),
            });
        }
        match self.dtype {
            DType::F32 => dst.copy_from_slice(self.as_f32_slice()),
            DType::BF16 => {
                let src: &[half::bf16] = bytemuck::cast_slice(self.as_bytes());
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = s.to_f32();
                }
            }
            DType::F16 => {
                let src: &[half::f16] = bytemuck::cast_slice(self.as_bytes());
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = s.to_f32();
                }
            }
            other => {
                return Err(Error::DtypeMismatch {
                    expected: "float".into(),
                    got: other.to_string(),
                })
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            words: Arc::clone(&self.words),
            offset: self.offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }

    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self {
        let elem_size = self.dtype.size_in_bytes();
        let byte_offset = self.offset + offset * elem_size;
        let new_numel: usize = shape.iter().product();
        assert!(
            byte_offset + new_numel * elem_size <= self.words.len() * 4,
            "slice_view out of bounds"
        );
        Self {
            words: Arc::clone(&self.words),
            offset: byte_offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_i32() {
        let t = CpuTensor::from_i32(&[2, 3], &[1, -2, 3, 4, 5, -1]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), DType::I32);
        assert_eq!(t.as_i32_slice(), &[1, -2, 3, 4, 5, -1]);
    }

    #[test]
    fn test_u8_odd_length() {
        let mut t = CpuTensor::from_u8(&[5], &[0, 1, 2, 3, 4]);
        t.as_u8_slice_mut()[4] = 9;
        assert_eq!(t.as_u8_slice(), &[0, 1, 2, 3, 9]);
        assert_eq!(t.size_in_bytes(), 5);
    }

    #[test]
    fn test_slice_view() {
        let t = CpuTensor::from_f32(&[6], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let s = t.slice_view(2, &[3]);
        assert_eq!(s.as_f32_slice(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_mutation_detaches_clone() {
        let t = CpuTensor::from_i32(&[3], &[1, 2, 3]);
        let mut c = t.clone();
        assert!(std::ptr::eq(t.words.as_ref(), c.words.as_ref()));
        c.as_i32_slice_mut()[0] = 7;
        assert_eq!(t.as_i32_slice(), &[1, 2, 3]);
        assert_eq!(c.as_i32_slice(), &[7, 2, 3]);
    }

    #[test]
    fn test_half_to_f32() {
        let t = CpuTensor::from_f32_as_bf16(&[2], &[0.5, -2.0]);
        assert_eq!(t.to_f32_vec().unwrap(), vec![0.5, -2.0]);
        let h = CpuTensor::from_f32_as_f16(&[2], &[0.25, 4.0]);
        let mut out = [0.0; 2];
        h.copy_to_f32(&mut out).unwrap();
        assert_eq!(out, [0.25, 4.0]);
    }

    #[test]
    fn test_int_to_f32_is_an_error() {
        let t = CpuTensor::from_i32(&[1], &[3]);
        assert!(t.to_f32_vec().is_err());
    }

    #[test]
    fn test_zeros() {
        let t = CpuTensor::zeros(&[2, 2], DType::F32);
        assert_eq!(t.as_f32_slice(), &[0.0; 4]);
    }
}
