//! Full-reference image measures on `(C, H, W)` arrays with values in `[0, 255]`.

use crate::common::*;

const DATA_RANGE: f64 = 255.0;
const WINDOW_SIZE: usize = 11;
const WINDOW_SIGMA: f64 = 1.5;

/// Peak signal-to-noise ratio in dB; infinite for identical images.
pub fn psnr(lhs: ArrayView3<f32>, rhs: ArrayView3<f32>) -> f64 {
    let mse = Zip::from(&lhs)
        .and(&rhs)
        .fold(0.0, |acc, &a, &b| acc + (a as f64 - b as f64).powi(2))
        / lhs.len().max(1) as f64;
    10.0 * (DATA_RANGE * DATA_RANGE / mse).log10()
}

/// Mean structural similarity with a Gaussian window, averaged over channels.
pub fn ssim(lhs: ArrayView3<f32>, rhs: ArrayView3<f32>) -> f64 {
    let (channels, height, width) = lhs.dim();
    let size = WINDOW_SIZE.min(height).min(width);
    let size = if size % 2 == 0 { size - 1 } else { size }.max(1);
    let kernel = gaussian_kernel(size, WINDOW_SIGMA);

    let c1 = (0.01 * DATA_RANGE).powi(2);
    let c2 = (0.03 * DATA_RANGE).powi(2);

    let total: f64 = (0..channels)
        .map(|c| {
            let x = lhs.index_axis(Axis(0), c).mapv(|v| v as f64);
            let y = rhs.index_axis(Axis(0), c).mapv(|v| v as f64);

            let mu_x = filter(&x, &kernel);
            let mu_y = filter(&y, &kernel);
            let xx = filter(&(&x * &x), &kernel) - &mu_x * &mu_x;
            let yy = filter(&(&y * &y), &kernel) - &mu_y * &mu_y;
            let xy = filter(&(&x * &y), &kernel) - &mu_x * &mu_y;

            let numerator = (&mu_x * &mu_y * 2.0 + c1) * (xy * 2.0 + c2);
            let denominator = (&mu_x * &mu_x + &mu_y * &mu_y + c1) * (xx + yy + c2);
            (numerator / denominator).mean().unwrap_or(1.0)
        })
        .sum();

    total / channels.max(1) as f64
}

fn gaussian_kernel(size: usize, sigma: f64) -> Array1<f64> {
    let center = (size / 2) as f64;
    let kernel = Array1::from_shape_fn(size, |i| {
        let d = i as f64 - center;
        (-d * d / (2.0 * sigma * sigma)).exp()
    });
    let sum = kernel.sum();
    kernel / sum
}

/// Separable filtering keeping only the fully overlapped region.
fn filter(image: &Array2<f64>, kernel: &Array1<f64>) -> Array2<f64> {
    let k = kernel.len();
    let (h, w) = image.dim();
    let rows = Array2::from_shape_fn((h, w + 1 - k), |(y, x)| {
        (0..k).map(|i| image[[y, x + i]] * kernel[i]).sum::<f64>()
    });
    Array2::from_shape_fn((h + 1 - k, w + 1 - k), |(y, x)| {
        (0..k).map(|i| rows[[y + i, x]] * kernel[i]).sum::<f64>()
    })
}
