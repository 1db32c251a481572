//! Tensor trait definition

use crate::dtype::DType;
use crate::{Error, Result};

/// Core tensor trait implemented by every backend's buffer type.
///
/// The decoding core only needs shape and dtype introspection plus cheap
/// views; element access goes through the backend's op traits.
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    fn reshape(&self, shape: &[usize]) -> Self;

    /// Create a zero-copy sub-slice view starting at element `offset` with the
    /// given `shape`.
    ///
    /// # Panics
    /// Panics if the view extends beyond the backing allocation.
    #[must_use]
    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Returns the stride for each dimension
    fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Returns the size of the tensor data in bytes
    fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Fails with [`Error::DtypeMismatch`] unless the tensor has `expected` dtype.
    fn check_dtype(&self, expected: DType) -> Result<()> {
        if self.dtype() == expected {
            Ok(())
        } else {
            Err(Error::DtypeMismatch {
                expected: expected.to_string(),
                got: self.dtype().to_string(),
            })
        }
    }

    /// Fails with [`Error::ShapeMismatch`] unless the shape equals `expected`.
    fn check_shape(&self, expected: &[usize]) -> Result<()> {
        if self.shape() == expected {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: expected.to_vec(),
                got: self.shape().to_vec(),
            })
        }
    }

    /// Fails unless the tensor holds at least `min` elements.
    fn check_min_numel(&self, min: usize, what: &str) -> Result<()> {
        if self.numel() >= min {
            Ok(())
        } else {
            Err(Error::InvalidShape(format!(
                "{what} holds {} elements, need at least {min}",
                self.numel()
            )))
        }
    }
}

/// Convert an index or length to its `I32` storage form.
///
/// # Errors
/// Returns [`Error::InvalidShape`] if `value` exceeds `i32::MAX`.
pub fn i32_from_index(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::InvalidShape(format!("{value} does not fit in i32")))
}

/// Read a stored `I32` id or length back as an index.
///
/// # Errors
/// Returns [`Error::InvalidShape`] if `value` is negative.
pub fn index_from_i32(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidShape(format!("negative {what}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[derive(Clone)]
    struct FakeTensor {
        shape: Vec<usize>,
        dtype: DType,
    }

    impl FakeTensor {
        fn new(shape: &[usize], dtype: DType) -> Self {
            Self {
                shape: shape.to_vec(),
                dtype,
            }
        }
    }

    impl Tensor for FakeTensor {
        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn dtype(&self) -> DType {
            self.dtype
        }

        fn reshape(&self, shape: &[usize]) -> Self {
            let new_numel: usize = shape.iter().product();
            assert_eq!(self.numel(), new_numel);
            Self::new(shape, self.dtype)
        }

        fn slice_view(&self, _offset: usize, shape: &[usize]) -> Self {
            Self::new(shape, self.dtype)
        }
    }

    #[test]
    fn test_numel_and_ndim() {
        let t = FakeTensor::new(&[6, 2, 9], DType::F32);
        assert_eq!(t.numel(), 108);
        assert_eq!(t.ndim(), 3);
        assert_eq!(FakeTensor::new(&[], DType::U8).numel(), 1);
    }

    #[test]
    fn test_strides_4d() {
        let t = FakeTensor::new(&[2, 3, 1, 4], DType::F32);
        assert_eq!(t.strides(), vec![12, 4, 4, 1]);
    }

    #[test]
    fn test_strides_empty() {
        let t = FakeTensor::new(&[], DType::I32);
        assert_eq!(t.strides(), Vec::<usize>::new());
    }

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(FakeTensor::new(&[2, 3], DType::I32).size_in_bytes(), 24);
        assert_eq!(FakeTensor::new(&[2, 3], DType::BF16).size_in_bytes(), 12);
        assert_eq!(FakeTensor::new(&[5], DType::U8).size_in_bytes(), 5);
    }

    #[test]
    fn test_check_dtype() {
        let t = FakeTensor::new(&[4], DType::I32);
        assert!(t.check_dtype(DType::I32).is_ok());
        let err = t.check_dtype(DType::F32).unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn test_check_shape() {
        let t = FakeTensor::new(&[6, 9], DType::F32);
        assert!(t.check_shape(&[6, 9]).is_ok());
        assert!(matches!(
            t.check_shape(&[6, 1, 9]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_index_conversions() {
        assert_eq!(i32_from_index(7).unwrap(), 7);
        assert!(i32_from_index(i32::MAX as usize + 1).is_err());
        assert_eq!(index_from_i32(3, "length").unwrap(), 3);
        let err = index_from_i32(-1, "sequence length").unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));
        assert!(err.to_string().contains("negative sequence length"));
    }

    #[test]
    fn test_check_min_numel() {
        let t = FakeTensor::new(&[3, 2], DType::I32);
        assert!(t.check_min_numel(6, "seq lens").is_ok());
        let err = t.check_min_numel(7, "seq lens").unwrap_err();
        assert!(err.to_string().contains("seq lens"));
    }
}
