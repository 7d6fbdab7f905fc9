use super::files::{basename, check_pairs, read_batch, read_label_map};
use crate::{common::*, error::MetricError};

/// Frozen network scoring the distance of `(B, 3, H, W)` image pairs in `[-1, 1]`.
pub trait PerceptualNet {
    fn distance(&mut self, lhs: ArrayView4<f32>, rhs: ArrayView4<f32>) -> Fallible<Array1<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMode {
    Body,
    Face,
}

impl MaskMode {
    pub fn label(&self) -> u8 {
        match self {
            Self::Body => 0,
            Self::Face => 13,
        }
    }
}

impl std::str::FromStr for MaskMode {
    type Err = Error;

    fn from_str(text: &str) -> Fallible<Self> {
        Ok(match text {
            "body" => Self::Body,
            "face" => Self::Face,
            _ => bail!("invalid mask mode {:?}, expect body or face", text),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Masks<'a> {
    pub files: &'a [PathBuf],
    pub mode: MaskMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseDistance {
    pub mean: f64,
    pub per_pair: Array1<f64>,
    pub names: Vec<String>,
}

impl PairwiseDistance {
    /// Mean distance per subject, the basename prefix before the first `_`.
    pub fn grouped_means(&self) -> BTreeMap<String, f64> {
        self.names
            .iter()
            .zip(self.per_pair.iter())
            .map(|(name, &value)| {
                let subject = name.split('_').next().unwrap_or_default().to_owned();
                (subject, value)
            })
            .into_group_map()
            .into_iter()
            .map(|(subject, values)| {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                (subject, mean)
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct PerceptualDistance<N> {
    net: N,
    batch_size: usize,
}

impl<N> PerceptualDistance<N>
where
    N: PerceptualNet,
{
    pub fn new(net: N, batch_size: usize) -> Self {
        Self {
            net,
            batch_size: batch_size.max(1),
        }
    }

    /// The lists are validated before any image is read. A batch size larger than
    /// the number of pairs is clamped; a trailing partial batch is dropped.
    pub fn pairwise(
        &mut self,
        generated: &[PathBuf],
        reference: &[PathBuf],
        masks: Option<Masks>,
    ) -> Fallible<PairwiseDistance> {
        if let Some(masks) = &masks {
            if masks.files.len() != generated.len() {
                return Err(MetricError::LengthMismatch {
                    what: "images and masks",
                    left: generated.len(),
                    right: masks.files.len(),
                }
                .into());
            }
        }
        check_pairs(generated, reference)?;

        let n_pairs = generated.len();
        if n_pairs == 0 {
            return Err(MetricError::NotEnoughSamples {
                found: 0,
                required: 1,
            }
            .into());
        }
        let batch_size = if self.batch_size > n_pairs {
            warn!(
                "batch size {} is bigger than the data size {}, setting batch size to data size",
                self.batch_size, n_pairs
            );
            n_pairs
        } else {
            self.batch_size
        };

        let n_batches = n_pairs / batch_size;
        let n_used = n_batches * batch_size;
        let scale = |v: f32| v / 127.5 - 1.0;

        let bar = progress_bar(n_batches, "lpips");
        let mut distances = Vec::with_capacity(n_used);
        for index in 0..n_batches {
            let range = (index * batch_size)..((index + 1) * batch_size);
            let mut lhs = read_batch(&generated[range.clone()], scale)?;
            let mut rhs = read_batch(&reference[range.clone()], scale)?;
            if lhs.dim() != rhs.dim() {
                return Err(MetricError::ShapeMismatch {
                    what: "image batches",
                    left: lhs.shape().to_vec(),
                    right: rhs.shape().to_vec(),
                }
                .into());
            }

            if let Some(masks) = &masks {
                let label = masks.mode.label();
                for (offset, path) in masks.files[range].iter().enumerate() {
                    let labels = read_label_map(path)?;
                    apply_mask(&mut lhs, offset, &labels, label)?;
                    apply_mask(&mut rhs, offset, &labels, label)?;
                }
            }

            let result = self.net.distance(lhs.view(), rhs.view())?;
            ensure!(
                result.len() == batch_size,
                "perceptual network returned {} distances for {} pairs",
                result.len(),
                batch_size
            );
            distances.extend(result.iter().map(|&d| d as f64));
            bar.inc(1);
        }
        bar.finish_and_clear();

        let per_pair = Array1::from(distances);
        let mean = per_pair.mean().unwrap_or(0.0);
        let names = generated[..n_used].iter().map(|path| basename(path)).collect();
        Ok(PairwiseDistance {
            mean,
            per_pair,
            names,
        })
    }
}

fn apply_mask(
    images: &mut Array4<f32>,
    index: usize,
    labels: &Array2<u8>,
    label: u8,
) -> Result<(), MetricError> {
    let (_, _, h, w) = images.dim();
    if labels.dim() != (h, w) {
        return Err(MetricError::ShapeMismatch {
            what: "image and mask",
            left: vec![h, w],
            right: labels.shape().to_vec(),
        });
    }
    images
        .index_axis_mut(Axis(0), index)
        .outer_iter_mut()
        .for_each(|mut channel| {
            Zip::from(&mut channel).and(labels).for_each(|value, &l| {
                if l == label {
                    *value = 0.0;
                }
            });
        });
    Ok(())
}
