//! Offline FID and LPIPS evaluation of generated image sets.

pub mod activation;
pub mod files;
pub mod frechet;
pub mod perceptual;
pub mod torch;

pub use activation::{ActivationStatistics, FeatureExtractor, GaussianStatistic, ImageSource};
pub use frechet::frechet_distance;
pub use perceptual::{MaskMode, Masks, PairwiseDistance, PerceptualDistance, PerceptualNet};

use crate::common::*;
use files::image_list;

/// Image sets compared by [compute_metrics].
#[derive(Debug, Clone)]
pub struct MetricsInputs {
    pub gt_path: PathBuf,
    pub generated_path: PathBuf,
    /// Real images of the FID reference distribution, `gt_path` when absent.
    pub fid_real_path: Option<PathBuf>,
    pub seg_path: Option<PathBuf>,
    pub mask_mode: MaskMode,
    /// JSON file caching the statistics of the real images.
    pub fid_stats_cache: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub fid: f64,
    pub lpips: f64,
    pub masked_lpips: Option<f64>,
}

impl Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FID: {:.4}", self.fid)?;
        write!(f, "LPIPS: {:.4}", self.lpips)?;
        if let Some(masked) = self.masked_lpips {
            write!(f, "\nmasked LPIPS: {:.4}", masked)?;
        }
        Ok(())
    }
}

pub fn compute_metrics<E, N>(
    inputs: &MetricsInputs,
    statistics: &mut ActivationStatistics<E>,
    lpips: &mut PerceptualDistance<N>,
) -> Fallible<MetricsReport>
where
    E: FeatureExtractor,
    N: PerceptualNet,
{
    let fid_real_path = inputs.fid_real_path.as_ref().unwrap_or(&inputs.gt_path);
    let generated = image_list(&inputs.generated_path)?;
    let gt = image_list(&inputs.gt_path)?;
    let segs = inputs.seg_path.as_ref().map(image_list).transpose()?;

    info!("calculate fid metric...");
    let real_stat = match &inputs.fid_stats_cache {
        Some(cache) if cache.is_file() => {
            info!("load real statistics from {}", cache.display());
            GaussianStatistic::load(cache)?
        }
        cache => {
            let real = image_list(fid_real_path)?;
            let stat = statistics.compute(ImageSource::Files(&real))?;
            if let Some(cache) = cache {
                stat.save(cache)?;
                info!("saved real statistics to {}", cache.display());
            }
            stat
        }
    };
    let generated_stat = statistics.compute(ImageSource::Files(&generated))?;
    let fid = frechet_distance(&real_stat, &generated_stat, frechet::DEFAULT_EPS)?;
    info!("fid: {:.4}", fid);

    info!("calculate lpips metric...");
    let result = lpips.pairwise(&generated, &gt, None)?;
    info!("lpips: {:.4}", result.mean);
    for (subject, mean) in result.grouped_means() {
        debug!("id: {} lpips: {:.4}", subject, mean);
    }

    let masked_lpips = match &segs {
        Some(segs) => {
            info!("calculate masked lpips metric...");
            let masks = Masks {
                files: segs,
                mode: inputs.mask_mode,
            };
            let masked = lpips.pairwise(&generated, &gt, Some(masks))?;
            info!("masked lpips: {:.4}", masked.mean);
            Some(masked.mean)
        }
        None => None,
    };

    Ok(MetricsReport {
        fid,
        lpips: result.mean,
        masked_lpips,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetricError;

    /// Per-channel means as a 3-dimensional feature.
    struct ChannelMeans;

    impl FeatureExtractor for ChannelMeans {
        fn extract(&mut self, images: ArrayView4<f32>) -> Fallible<Array4<f32>> {
            let (b, c, _, _) = images.dim();
            Ok(Array4::from_shape_fn((b, c, 1, 1), |(i, ch, _, _)| {
                images.slice(s![i, ch, .., ..]).mean().unwrap_or(0.0)
            }))
        }
    }

    struct L1Net;

    impl PerceptualNet for L1Net {
        fn distance(&mut self, lhs: ArrayView4<f32>, rhs: ArrayView4<f32>) -> Fallible<Array1<f32>> {
            Ok(Array1::from_shape_fn(lhs.shape()[0], |i| {
                (&lhs.index_axis(Axis(0), i) - &rhs.index_axis(Axis(0), i))
                    .mapv(f32::abs)
                    .mean()
                    .unwrap_or(0.0)
            }))
        }
    }

    fn write_set(dir: &Path, names: &[String], shift: u8) {
        fs::create_dir_all(dir).unwrap();
        for (i, name) in names.iter().enumerate() {
            let v = (i as u8) * 40 + shift;
            RgbImage::from_pixel(4, 4, Rgb([v, 255 - v, v / 2]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    fn inputs(root: &Path) -> MetricsInputs {
        let names: Vec<_> = (0..4).map(|i| format!("{}_x__{}_y.png", i, i)).collect();
        write_set(&root.join("gt"), &names, 0);
        write_set(&root.join("generated"), &names, 0);
        MetricsInputs {
            gt_path: root.join("gt"),
            generated_path: root.join("generated"),
            fid_real_path: None,
            seg_path: None,
            mask_mode: MaskMode::Body,
            fid_stats_cache: Some(root.join("real_stats.json")),
        }
    }

    #[test]
    fn identical_sets_score_zero_and_cache_statistics() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = inputs(tmp.path());
        let mut statistics = ActivationStatistics::new(ChannelMeans, 2);
        let mut lpips = PerceptualDistance::new(L1Net, 2);

        let report = compute_metrics(&inputs, &mut statistics, &mut lpips).unwrap();
        assert!(report.fid.abs() < 1e-6);
        assert_eq!(report.lpips, 0.0);
        assert_eq!(report.masked_lpips, None);
        assert!(tmp.path().join("real_stats.json").is_file());

        let cached = compute_metrics(&inputs, &mut statistics, &mut lpips).unwrap();
        assert!((cached.fid - report.fid).abs() < 1e-9);
        assert_eq!(
            report.to_string(),
            format!("FID: {:.4}\nLPIPS: 0.0000", report.fid)
        );
    }

    #[test]
    fn missing_generated_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut inputs = inputs(tmp.path());
        inputs.generated_path = tmp.path().join("missing");
        let mut statistics = ActivationStatistics::new(ChannelMeans, 2);
        let mut lpips = PerceptualDistance::new(L1Net, 2);

        let err = compute_metrics(&inputs, &mut statistics, &mut lpips).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MetricError>(),
            Some(MetricError::InvalidPath(_))
        ));
    }

    #[test]
    fn masked_lpips_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut inputs = inputs(tmp.path());
        let seg_dir = tmp.path().join("seg");
        fs::create_dir_all(&seg_dir).unwrap();
        for i in 0..4 {
            ImageBuffer::from_pixel(4, 4, Luma([0u8]))
                .save(seg_dir.join(format!("{}_x__{}_y.png", i, i)))
                .unwrap();
        }
        inputs.seg_path = Some(seg_dir);
        inputs.fid_stats_cache = None;

        let mut statistics = ActivationStatistics::new(ChannelMeans, 2);
        let mut lpips = PerceptualDistance::new(L1Net, 2);
        let report = compute_metrics(&inputs, &mut statistics, &mut lpips).unwrap();
        assert_eq!(report.masked_lpips, Some(0.0));
        assert!(report.to_string().ends_with("masked LPIPS: 0.0000"));
    }
}
