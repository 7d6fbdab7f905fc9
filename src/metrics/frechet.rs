//! Frechet distance between two Gaussians.
//!
//! The trace of `sqrt(S1 S2)` is taken as the trace of `sqrt(A S2 A)` with
//! `A = sqrt(S1)`, which is similar to `S1 S2` and stays symmetric. Negative
//! eigenvalues of `A S2 A` contribute the imaginary part of the square root, and
//! the imaginary part is judged by its largest eigenvalue magnitude, which bounds
//! every diagonal entry and does not depend on the basis.

use super::activation::GaussianStatistic;
use crate::{common::*, error::MetricError};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

pub const DEFAULT_EPS: f64 = 1e-6;
const IMAGINARY_TOLERANCE: f64 = 1e-3;
/// Negative eigenvalues within this fraction of the spectral radius are roundoff.
const ROUNDOFF_TOLERANCE: f64 = 1e-10;

struct SqrtTrace {
    real: f64,
    imaginary: f64,
}

fn to_matrix(array: &Array2<f64>) -> DMatrix<f64> {
    let (rows, cols) = array.dim();
    DMatrix::from_row_iterator(rows, cols, array.iter().copied())
}

/// Returns `None` when the square root has non-finite entries.
fn sqrt_trace(sigma1: &DMatrix<f64>, sigma2: &DMatrix<f64>, clamp: bool) -> Option<SqrtTrace> {
    let eigen = SymmetricEigen::new(sigma1.clone());
    let radius = eigen.eigenvalues.amax();
    let floor = if clamp {
        f64::NEG_INFINITY
    } else {
        -ROUNDOFF_TOLERANCE * radius
    };
    let roots: DVector<f64> = eigen.eigenvalues.map(|lambda| {
        if lambda >= floor {
            lambda.max(0.0).sqrt()
        } else {
            f64::NAN
        }
    });
    if roots.iter().any(|root| !root.is_finite()) {
        return None;
    }
    let sqrt1 = &eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose();

    let product = &sqrt1 * sigma2 * &sqrt1;
    let product = (&product + product.transpose()) * 0.5;
    if product.iter().any(|value| !value.is_finite()) {
        return None;
    }

    let eigen = SymmetricEigen::new(product);
    let real = eigen
        .eigenvalues
        .iter()
        .map(|lambda| lambda.max(0.0).sqrt())
        .sum();
    let imaginary = eigen
        .eigenvalues
        .iter()
        .map(|lambda| (-lambda).max(0.0).sqrt())
        .fold(0.0, f64::max);

    Some(SqrtTrace { real, imaginary })
}

/// `|m1 - m2|^2 + tr(S1) + tr(S2) - 2 tr(sqrt(S1 S2))`, clamped at zero.
///
/// A singular product is retried once with `eps` added to both diagonals.
pub fn frechet_distance(
    stat1: &GaussianStatistic,
    stat2: &GaussianStatistic,
    eps: f64,
) -> Result<f64, MetricError> {
    if stat1.mean.len() != stat2.mean.len() {
        return Err(MetricError::ShapeMismatch {
            what: "mean vectors",
            left: stat1.mean.shape().to_vec(),
            right: stat2.mean.shape().to_vec(),
        });
    }
    if stat1.covariance.dim() != stat2.covariance.dim() {
        return Err(MetricError::ShapeMismatch {
            what: "covariance matrices",
            left: stat1.covariance.shape().to_vec(),
            right: stat2.covariance.shape().to_vec(),
        });
    }

    let finite = |array: &Array2<f64>| array.iter().all(|value| value.is_finite());
    if !finite(&stat1.covariance) || !finite(&stat2.covariance) {
        return Err(MetricError::NonFinite);
    }

    let diff = &stat1.mean - &stat2.mean;
    let sigma1 = to_matrix(&stat1.covariance);
    let sigma2 = to_matrix(&stat2.covariance);

    let covmean = match sqrt_trace(&sigma1, &sigma2, false) {
        Some(covmean) => covmean,
        None => {
            warn!(
                "fid calculation produces singular product; adding {} to diagonal of cov estimates",
                eps
            );
            let offset = DMatrix::<f64>::identity(sigma1.nrows(), sigma1.ncols()) * eps;
            sqrt_trace(&(&sigma1 + &offset), &(&sigma2 + &offset), true)
                .ok_or(MetricError::NonFinite)?
        }
    };

    if covmean.imaginary > IMAGINARY_TOLERANCE {
        return Err(MetricError::ImaginaryComponent(covmean.imaginary));
    }

    let distance =
        diff.dot(&diff) + sigma1.trace() + sigma2.trace() - 2.0 * covmean.real;
    if distance < 0.0 {
        debug!("negative frechet distance {} is treated as zero", distance);
    }
    Ok(distance.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_stat(seed: u64, n: usize, dims: usize, shift: f64) -> GaussianStatistic {
        let mut rng = StdRng::seed_from_u64(seed);
        let activations =
            Array2::from_shape_fn((n, dims), |(_, d)| rng.gen::<f64>() * (d + 1) as f64 + shift);
        GaussianStatistic::from_activations(activations.view()).unwrap()
    }

    fn diagonal(mean: &[f64], variances: &[f64]) -> GaussianStatistic {
        GaussianStatistic {
            mean: Array1::from(mean.to_vec()),
            covariance: Array2::from_diag(&Array1::from(variances.to_vec())),
        }
    }

    #[test]
    fn identical_statistics_have_zero_distance() {
        let stat = random_stat(1, 50, 6, 0.0);
        let distance = frechet_distance(&stat, &stat, DEFAULT_EPS).unwrap();
        assert!(distance.abs() < 1e-6, "distance {}", distance);
    }

    #[test]
    fn distance_is_symmetric() {
        let stat1 = random_stat(2, 40, 5, 0.0);
        let stat2 = random_stat(3, 60, 5, 0.5);
        let forward = frechet_distance(&stat1, &stat2, DEFAULT_EPS).unwrap();
        let backward = frechet_distance(&stat2, &stat1, DEFAULT_EPS).unwrap();
        assert!(forward > 0.0);
        assert!((forward - backward).abs() < 1e-6 * forward.max(1.0));
    }

    #[test]
    fn diagonal_gaussians_match_closed_form() {
        let stat1 = diagonal(&[0.0, 1.0], &[1.0, 4.0]);
        let stat2 = diagonal(&[1.0, 1.0], &[4.0, 9.0]);
        // |dm|^2 + sum (s1 - s2)^2 over standard deviations
        let expected = 1.0 + (1.0 - 2.0f64).powi(2) + (2.0 - 3.0f64).powi(2);
        let distance = frechet_distance(&stat1, &stat2, DEFAULT_EPS).unwrap();
        assert!((distance - expected).abs() < 1e-9);
    }

    #[test]
    fn shape_mismatch_fails() {
        let stat1 = diagonal(&[0.0, 0.0], &[1.0, 1.0]);
        let stat2 = diagonal(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]);
        assert!(matches!(
            frechet_distance(&stat1, &stat2, DEFAULT_EPS),
            Err(MetricError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn singular_product_is_regularized() {
        let stat1 = diagonal(&[0.0, 0.0], &[1.0, -1e-8]);
        let stat2 = diagonal(&[0.0, 0.0], &[1.0, 1.0]);
        let distance = frechet_distance(&stat1, &stat2, DEFAULT_EPS).unwrap();
        assert!(distance.is_finite());
        assert!((distance - 1.0).abs() < 1e-2);
    }

    #[test]
    fn rank_deficient_covariance_needs_no_regularization() {
        // fewer samples than dimensions gives a rank-2 covariance
        let stat1 = random_stat(4, 3, 6, 0.0);
        let stat2 = random_stat(5, 3, 6, 0.3);
        let sigma1 = to_matrix(&stat1.covariance);
        let sigma2 = to_matrix(&stat2.covariance);
        assert!(sqrt_trace(&sigma1, &sigma2, false).is_some());
        assert!(sqrt_trace(&sigma1, &sigma1, false).is_some());

        let distance = frechet_distance(&stat1, &stat1, DEFAULT_EPS).unwrap();
        assert!(distance.abs() < 1e-6, "distance {}", distance);
        assert!(frechet_distance(&stat1, &stat2, DEFAULT_EPS).unwrap() > 0.0);
    }

    #[test]
    fn clearly_negative_spectrum_is_retried() {
        let sigma1 = to_matrix(&Array2::from_diag(&ndarray::arr1(&[1.0, -1e-3])));
        let sigma2 = DMatrix::<f64>::identity(2, 2);
        assert!(sqrt_trace(&sigma1, &sigma2, false).is_none());
        assert!(sqrt_trace(&sigma1, &sigma2, true).is_some());
    }

    #[test]
    fn large_imaginary_component_fails() {
        let stat1 = diagonal(&[0.0, 0.0], &[1.0, 1.0]);
        let stat2 = diagonal(&[0.0, 0.0], &[1.0, -1.0]);
        assert!(matches!(
            frechet_distance(&stat1, &stat2, DEFAULT_EPS),
            Err(MetricError::ImaginaryComponent(value)) if (value - 1.0).abs() < 1e-9
        ));
    }

    #[test]
    fn non_finite_covariance_fails() {
        let stat1 = diagonal(&[0.0], &[f64::NAN]);
        let stat2 = diagonal(&[0.0], &[1.0]);
        assert!(matches!(
            frechet_distance(&stat1, &stat2, DEFAULT_EPS),
            Err(MetricError::NonFinite)
        ));
    }
}
