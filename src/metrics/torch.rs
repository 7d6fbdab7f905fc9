//! Pretrained networks exported as TorchScript modules.

use super::{activation::FeatureExtractor, perceptual::PerceptualNet};
use crate::{
    common::*,
    convert::{array4_to_tensor, tensor_to_array1, tensor_to_array4},
};
use tch::CModule;

fn load_module(path: &Path, device: Device) -> Fallible<CModule> {
    let module = CModule::load_on_device(path, device)
        .with_context(|| format!("cannot load TorchScript module {}", path.display()))?;
    info!("loaded {} on {:?}", path.display(), device);
    Ok(module)
}

/// Inception-style feature extractor taking images in `[0, 1]`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TorchFeatureExtractor {
    #[derivative(Debug = "ignore")]
    module: CModule,
    device: Device,
}

impl TorchFeatureExtractor {
    pub fn load<P>(path: P, device: Device) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        Ok(Self {
            module: load_module(path.as_ref(), device)?,
            device,
        })
    }
}

impl FeatureExtractor for TorchFeatureExtractor {
    fn extract(&mut self, images: ArrayView4<f32>) -> Fallible<Array4<f32>> {
        let input = array4_to_tensor(images, self.device);
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        // (B, D) outputs are treated as 1x1 maps
        let output = match output.size().as_slice() {
            &[b, d] => output.view([b, d, 1, 1]),
            _ => output,
        };
        tensor_to_array4(&output)
    }
}

/// LPIPS-style network taking two image batches in `[-1, 1]`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TorchPerceptualNet {
    #[derivative(Debug = "ignore")]
    module: CModule,
    device: Device,
}

impl TorchPerceptualNet {
    pub fn load<P>(path: P, device: Device) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        Ok(Self {
            module: load_module(path.as_ref(), device)?,
            device,
        })
    }
}

impl PerceptualNet for TorchPerceptualNet {
    fn distance(&mut self, lhs: ArrayView4<f32>, rhs: ArrayView4<f32>) -> Fallible<Array1<f32>> {
        let lhs = array4_to_tensor(lhs, self.device);
        let rhs = array4_to_tensor(rhs, self.device);
        let output = tch::no_grad(|| self.module.forward_ts(&[lhs, rhs]))?;
        tensor_to_array1(&output)
    }
}
