//! Tensor construction and host transfers.

use decodium::backend::{TensorDataOps, TensorFactory};
use decodium::dtype::DType;
use decodium::tensor::Tensor;
use decodium::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

fn check_len(shape: &[usize], len: usize) -> Result<()> {
    let numel: usize = shape.iter().product();
    if numel == len {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![len],
        })
    }
}

fn check_range(tensor: &CpuTensor, offset: usize, len: usize) -> Result<()> {
    if offset + len <= tensor.numel() {
        Ok(())
    } else {
        Err(Error::InvalidShape(format!(
            "write of {len} elements at {offset} exceeds {} elements",
            tensor.numel()
        )))
    }
}

impl TensorFactory for CpuBackend {
    fn zeros(shape: &[usize], dtype: DType) -> Result<CpuTensor> {
        Ok(CpuTensor::zeros(shape, dtype))
    }

    fn from_f32_slice(shape: &[usize], data: &[f32]) -> Result<CpuTensor> {
        check_len(shape, data.len())?;
        Ok(CpuTensor::from_f32(shape, data))
    }

    fn from_i32_slice(shape: &[usize], data: &[i32]) -> Result<CpuTensor> {
        check_len(shape, data.len())?;
        Ok(CpuTensor::from_i32(shape, data))
    }

    fn from_u8_slice(shape: &[usize], data: &[u8]) -> Result<CpuTensor> {
        check_len(shape, data.len())?;
        Ok(CpuTensor::from_u8(shape, data))
    }
}

impl TensorDataOps for CpuBackend {
    fn to_f32_vec(tensor: &CpuTensor) -> Result<Vec<f32>> {
        tensor.to_f32_vec()
    }

    fn to_i32_vec(tensor: &CpuTensor) -> Result<Vec<i32>> {
        tensor.check_dtype(DType::I32)?;
        Ok(tensor.as_i32_slice().to_vec())
    }

    fn to_u8_vec(tensor: &CpuTensor) -> Result<Vec<u8>> {
        tensor.check_dtype(DType::U8)?;
        Ok(tensor.as_u8_slice().to_vec())
    }

    fn write_f32(tensor: &mut CpuTensor, offset: usize, data: &[f32]) -> Result<()> {
        tensor.check_dtype(DType::F32)?;
        check_range(tensor, offset, data.len())?;
        tensor.as_f32_slice_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_i32(tensor: &mut CpuTensor, offset: usize, data: &[i32]) -> Result<()> {
        tensor.check_dtype(DType::I32)?;
        check_range(tensor, offset, data.len())?;
        tensor.as_i32_slice_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_u8(tensor: &mut CpuTensor, offset: usize, data: &[u8]) -> Result<()> {
        tensor.check_dtype(DType::U8)?;
        check_range(tensor, offset, data.len())?;
        tensor.as_u8_slice_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
