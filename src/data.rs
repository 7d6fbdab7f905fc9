pub mod joints;
pub mod pose_pair;

pub use pose_pair::{PosePairDataset, Split};

use crate::common::*;

/// The order is defined by the source itself; consumers never reshuffle it.
pub trait DataSource {
    type Batch;

    fn batch_size(&self) -> usize;

    fn num_batches(&self) -> usize;

    /// Caps the number of samples a pass draws from.
    fn set_len(&mut self, num_samples: usize);

    fn batches(&mut self) -> Box<dyn Iterator<Item = Fallible<Self::Batch>> + '_>;
}

#[derive(Debug)]
pub struct PoseBatch {
    // images in [-1, 1], joint maps (B, J, H, W)
    pub img_1: Tensor,
    pub img_2: Tensor,
    pub joint_1: Tensor,
    pub joint_2: Tensor,
    pub ids: Vec<(String, String)>,
}

impl PoseBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            img_1: self.img_1.to_device(device),
            img_2: self.img_2.to_device(device),
            joint_1: self.joint_1.to_device(device),
            joint_2: self.joint_2.to_device(device),
            ids: self.ids.clone(),
        }
    }

    pub fn validate(&self) -> Fallible<()> {
        let batch_size = self.ids.len() as i64;
        let (b, c, h, w) = self.img_1.size4()?;
        ensure!(c == 3, "img_1 has {} channels, expect 3", c);
        ensure!(
            b == batch_size,
            "img_1 has {} samples but the batch has {} ids",
            b,
            batch_size
        );

        for (name, tensor) in [
            ("img_2", &self.img_2),
            ("joint_1", &self.joint_1),
            ("joint_2", &self.joint_2),
        ] {
            let (b_, _c, h_, w_) = tensor.size4()?;
            ensure!(
                (b_, h_, w_) == (b, h, w),
                "malformed batch: {} has shape {:?}, expect ({}, _, {}, {})",
                name,
                tensor.size(),
                b,
                h,
                w
            );
        }
        ensure!(
            self.joint_1.size()[1] == self.joint_2.size()[1],
            "malformed batch: joint_1 and joint_2 differ in joint count"
        );
        Ok(())
    }
}
