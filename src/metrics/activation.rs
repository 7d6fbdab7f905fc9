use super::files::read_batch;
use crate::{common::*, error::MetricError};

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Frozen network mapping `(B, 3, H, W)` images in `[0, 1]` to `(B, D, h, w)` features.
pub trait FeatureExtractor {
    fn extract(&mut self, images: ArrayView4<f32>) -> Fallible<Array4<f32>>;
}

#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Files(&'a [PathBuf]),
    /// `(3, H, W)` images already scaled to `[0, 1]`.
    Images(&'a [Array3<f32>]),
}

impl ImageSource<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Files(files) => files.len(),
            Self::Images(images) => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batch(&self, range: std::ops::Range<usize>) -> Fallible<Array4<f32>> {
        match self {
            Self::Files(files) => read_batch(&files[range], |v| v / 255.0),
            Self::Images(images) => {
                let views: Vec<_> = images[range].iter().map(|image| image.view()).collect();
                Ok(ndarray::stack(Axis(0), &views)?)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianStatistic {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl GaussianStatistic {
    /// `activations` holds one sample per row. The covariance is the unbiased
    /// estimate with variables along columns.
    pub fn from_activations(activations: ArrayView2<f64>) -> Result<Self, MetricError> {
        let (n_samples, _dims) = activations.dim();
        if n_samples < 2 {
            return Err(MetricError::NotEnoughSamples {
                found: n_samples,
                required: 2,
            });
        }

        let mean = activations
            .mean_axis(Axis(0))
            .ok_or(MetricError::NotEnoughSamples {
                found: 0,
                required: 2,
            })?;
        let centered = &activations - &mean;
        let covariance = centered.t().dot(&centered) / (n_samples - 1) as f64;
        Ok(Self { mean, covariance })
    }

    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    pub fn load<P>(path: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let stat: Self = serde_json::from_reader(reader)
            .with_context(|| format!("cannot parse statistics {}", path.display()))?;
        ensure!(
            stat.covariance.dim() == (stat.dims(), stat.dims()),
            "statistics {} have a {:?} covariance for {} dimensions",
            path.display(),
            stat.covariance.dim(),
            stat.dims()
        );
        Ok(stat)
    }

    pub fn save<P>(&self, path: P) -> Fallible<()>
    where
        P: AsRef<Path>,
    {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

/// A trailing batch smaller than the batch size is dropped.
#[derive(Debug)]
pub struct ActivationStatistics<E> {
    extractor: E,
    batch_size: usize,
}

impl<E> ActivationStatistics<E>
where
    E: FeatureExtractor,
{
    pub fn new(extractor: E, batch_size: usize) -> Self {
        Self {
            extractor,
            batch_size: batch_size.max(1),
        }
    }

    pub fn activations(&mut self, source: ImageSource) -> Fallible<Array2<f64>> {
        let n_batches = source.len() / self.batch_size;
        let n_used = n_batches * self.batch_size;
        if n_used < source.len() {
            debug!(
                "dropping the last {} of {} images",
                source.len() - n_used,
                source.len()
            );
        }

        let bar = progress_bar(n_batches, "activations");
        let mut rows = Vec::with_capacity(n_used);
        for index in 0..n_batches {
            let start = index * self.batch_size;
            let images = source.batch(start..(start + self.batch_size))?;
            let features = self.extractor.extract(images.view())?;
            let pooled = pool(features)?;
            ensure!(
                pooled.nrows() == self.batch_size,
                "feature extractor returned {} vectors for {} images",
                pooled.nrows(),
                self.batch_size
            );
            rows.extend(pooled.outer_iter().map(|row| row.to_owned()));
            bar.inc(1);
        }
        bar.finish_and_clear();

        if let Some(first) = rows.first() {
            let dims = first.len();
            if let Some(row) = rows.iter().find(|row| row.len() != dims) {
                return Err(MetricError::ShapeMismatch {
                    what: "feature vectors",
                    left: vec![dims],
                    right: vec![row.len()],
                }
                .into());
            }
        }
        let views: Vec<_> = rows.iter().map(|row| row.view()).collect();
        let activations = if views.is_empty() {
            Array2::zeros((0, 0))
        } else {
            ndarray::stack(Axis(0), &views)?
        };
        Ok(activations)
    }

    pub fn compute(&mut self, source: ImageSource) -> Fallible<GaussianStatistic> {
        let activations = self.activations(source)?;
        if activations.nrows() < 2 {
            return Err(MetricError::NotEnoughSamples {
                found: source.len(),
                required: self.batch_size.max(2),
            }
            .into());
        }
        Ok(GaussianStatistic::from_activations(activations.view())?)
    }
}

fn pool(features: Array4<f32>) -> Fallible<Array2<f64>> {
    let (b, d, h, w) = features.dim();
    let features = features.mapv(|v| v as f64);
    if h == 1 && w == 1 {
        return Ok(features.into_shape((b, d))?);
    }
    let pooled = features
        .mean_axis(Axis(3))
        .and_then(|f| f.mean_axis(Axis(2)))
        .ok_or_else(|| format_err!("empty feature maps of shape {:?}", (b, d, h, w)))?;
    Ok(pooled)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Channel means of each quadrant, so the spatial map is 2x2.
    struct QuadrantMeans;

    impl FeatureExtractor for QuadrantMeans {
        fn extract(&mut self, images: ArrayView4<f32>) -> Fallible<Array4<f32>> {
            let (b, c, h, w) = images.dim();
            let (hh, hw) = (h / 2, w / 2);
            Ok(Array4::from_shape_fn((b, c, 2, 2), |(i, ch, qy, qx)| {
                images
                    .slice(s![i, ch, qy * hh..(qy + 1) * hh, qx * hw..(qx + 1) * hw])
                    .mean()
                    .unwrap_or(0.0)
            }))
        }
    }

    fn image(seed: usize) -> Array3<f32> {
        Array3::from_shape_fn((3, 4, 4), |(c, y, x)| {
            ((seed * 31 + c * 7 + y * 5 + x * 3) % 17) as f32 / 17.0
        })
    }

    #[test]
    fn covariance_is_unbiased_with_variables_in_columns() {
        let activations = ndarray::arr2(&[[1.0, 2.0], [3.0, 6.0], [5.0, 4.0]]);
        let stat = GaussianStatistic::from_activations(activations.view()).unwrap();
        assert_eq!(stat.mean, ndarray::arr1(&[3.0, 4.0]));
        assert_eq!(stat.covariance, ndarray::arr2(&[[4.0, 2.0], [2.0, 4.0]]));

        let single = ndarray::arr2(&[[1.0, 2.0]]);
        assert!(matches!(
            GaussianStatistic::from_activations(single.view()),
            Err(MetricError::NotEnoughSamples { found: 1, .. })
        ));
    }

    #[test]
    fn trailing_images_are_dropped() {
        let images: Vec<_> = (0..4).map(image).collect();
        let mut padded = images.clone();
        padded.push(image(100));
        padded.push(image(101));

        let mut stats = ActivationStatistics::new(QuadrantMeans, 4);
        let exact = stats.compute(ImageSource::Images(&images)).unwrap();
        let with_padding = stats.compute(ImageSource::Images(&padded)).unwrap();
        assert_eq!(exact, with_padding);
        assert_eq!(exact.dims(), 3);
    }

    #[test]
    fn too_few_images_fail() {
        let images: Vec<_> = (0..3).map(image).collect();
        let mut stats = ActivationStatistics::new(QuadrantMeans, 4);
        let err = stats.compute(ImageSource::Images(&images)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MetricError>(),
            Some(MetricError::NotEnoughSamples {
                found: 3,
                required: 4
            })
        ));
    }

    #[test]
    fn files_are_scaled_to_unit_range() {
        let tmp = tempfile::tempdir().unwrap();
        let files: Vec<_> = (0..2u8)
            .map(|i| {
                let path = tmp.path().join(format!("{}.png", i));
                RgbImage::from_pixel(2, 2, Rgb([255 * i, 0, 0])).save(&path).unwrap();
                path
            })
            .collect();

        let mut stats = ActivationStatistics::new(QuadrantMeans, 1);
        let activations = stats.activations(ImageSource::Files(&files)).unwrap();
        assert_eq!(activations, ndarray::arr2(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]));
    }

    #[test]
    fn statistics_cache_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stats.json");
        let stat = GaussianStatistic {
            mean: ndarray::arr1(&[1.0, 2.0]),
            covariance: ndarray::arr2(&[[1.0, 0.5], [0.5, 2.0]]),
        };
        stat.save(&path).unwrap();
        assert_eq!(GaussianStatistic::load(&path).unwrap(), stat);
    }
}
