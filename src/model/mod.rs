mod gan;
pub mod measure;
pub mod networks;

pub use gan::GanPoseModel;

use crate::{
    checkpoint::CheckpointTag, common::*, convert::tensor_to_array4, loss_buffer::LossRecord,
    visualizer::GridVisuals,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

pub trait Visuals: Sized {
    /// Appends `other` after `self` along the sample axis.
    fn concat(self, other: Self) -> Fallible<Self>;
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub name: String,
    pub image: RgbImage,
}

/// Implementations own every sub-network together with its optimizer and
/// learning-rate schedule. Checkpoints persist all trainable sub-networks.
pub trait PoseTransferModel {
    type Batch;
    type Visuals: Visuals;

    fn set_input(&mut self, batch: Self::Batch) -> Fallible<()>;

    fn optimize_parameters(&mut self, check_grad: bool) -> Fallible<()>;

    /// Runs inference without gradients, optionally computing evaluation errors.
    fn test(&mut self, compute_loss: bool) -> Fallible<()>;

    fn current_errors(&self) -> LossRecord;

    fn current_visuals(&self) -> Fallible<Self::Visuals>;

    fn generated_images(&self) -> Fallible<Vec<GeneratedImage>>;

    fn set_mode(&mut self, mode: Mode);

    fn set_use_gan(&mut self, use_gan: bool);

    fn update_learning_rate(&mut self);

    fn learning_rate(&self) -> f64;

    /// Fast-forwards every schedule after resuming from `epochs` finished epochs.
    fn advance_schedule(&mut self, epochs: usize);

    fn save(&self, tag: CheckpointTag) -> Fallible<()>;

    fn load(&mut self, tag: CheckpointTag) -> Fallible<()>;
}

#[derive(Debug)]
pub struct VisualSet(pub Vec<(String, Tensor)>);

impl VisualSet {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn num_samples(&self) -> i64 {
        self.0.first().map(|(_, t)| t.size()[0]).unwrap_or(0)
    }
}

impl Visuals for VisualSet {
    fn concat(self, other: Self) -> Fallible<Self> {
        ensure!(
            self.names().eq(other.names()),
            "cannot concatenate visuals {:?} with {:?}",
            self.names().collect::<Vec<_>>(),
            other.names().collect::<Vec<_>>()
        );
        let merged = self
            .0
            .into_iter()
            .zip(other.0)
            .map(|((name, lhs), (_, rhs))| (name, Tensor::cat(&[lhs, rhs], 0)))
            .collect();
        Ok(Self(merged))
    }
}

impl GridVisuals for VisualSet {
    fn grid_columns(&self) -> Fallible<Vec<(String, Array4<f32>)>> {
        self.0
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor_to_array4(tensor)?)))
            .collect()
    }
}
