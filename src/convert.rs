//! Conversions between ndarray arrays and tch tensors.

use crate::common::*;

pub fn array4_to_tensor(array: ArrayView4<f32>, device: Device) -> Tensor {
    let (b, c, h, w) = array.dim();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::of_slice(&data)
        .view([b as i64, c as i64, h as i64, w as i64])
        .to_device(device)
}

pub fn tensor_to_array4(tensor: &Tensor) -> Fallible<Array4<f32>> {
    let (b, c, h, w) = tensor.size4()?;
    let data = Vec::<f32>::from(&tensor.to_device(Device::Cpu).to_kind(Kind::Float).contiguous());
    let array = Array4::from_shape_vec((b as usize, c as usize, h as usize, w as usize), data)?;
    Ok(array)
}

pub fn tensor_to_array1(tensor: &Tensor) -> Fallible<Array1<f32>> {
    let data = Vec::<f32>::from(
        &tensor
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .flatten(0, -1),
    );
    Ok(Array1::from(data))
}
