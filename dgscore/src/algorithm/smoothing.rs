use rayon::prelude::*;
use statrs::distribution::{Continuous, Normal};
use tracing::debug;

use crate::data::histogram::{BinnedPair, Histogram};
use crate::error::{Result, SliceError};

/// `FWHM = 2·sqrt(2·ln 2)·sigma`
const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_4;

/// Kernel cutoff in sigmas.
const TRUNCATE: f64 = 3.0;

/// Normalized Gaussian kernel for a full width at half maximum given in bins.
/// Returns an empty kernel when the width is zero.
pub fn gaussian_kernel_1d(fwhm: f64) -> Result<Vec<f64>> {
    if fwhm <= 0.0 {
        return Ok(Vec::new());
    }
    let sigma = fwhm / FWHM_PER_SIGMA;
    let normal = Normal::new(0.0, sigma).map_err(|e| SliceError::config(format!("invalid smoothing width {}: {}", fwhm, e)))?;
    let radius = (TRUNCATE * sigma).ceil() as i64;
    let mut w: Vec<f64> = (-radius..=radius).map(|dx| normal.pdf(dx as f64)).collect();
    let sum: f64 = w.iter().sum();
    for v in &mut w {
        *v /= sum;
    }
    Ok(w)
}

/// Widths per histogram dimension; a single value applies to every dimension.
fn widths_per_dimension(fwhm: &[f64], n_dims: usize) -> Result<Vec<f64>> {
    if fwhm.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(SliceError::config(format!("smoothing widths must be finite and non-negative, got {:?}", fwhm)));
    }
    match fwhm.len() {
        1 => Ok(vec![fwhm[0]; n_dims]),
        n if n == n_dims => Ok(fwhm.to_vec()),
        n => Err(SliceError::config(format!(
            "got {} smoothing widths for a histogram with {} dimensions",
            n, n_dims
        ))),
    }
}

/// True when `fwhm` asks for no smoothing at all.
pub fn is_identity(fwhm: Option<&[f64]>) -> bool {
    match fwhm {
        None => true,
        Some(w) => w.iter().all(|v| *v == 0.0),
    }
}

/// Smooths signal and normalization of a pair with a separable Gaussian.
///
/// Both arrays are smoothed on their own, before any division. Bins without
/// normalization neither contribute to their neighbours nor receive a value
/// (signal `NaN`, normalization `0`), and the kernel is renormalized over the
/// bins that do contribute, so sparse regions are not pulled towards zero.
pub fn smooth(pair: &BinnedPair, fwhm: Option<&[f64]>) -> Result<BinnedPair> {
    let fwhm = match fwhm {
        Some(w) if !is_identity(Some(w)) => w,
        _ => return Ok(pair.clone()),
    };

    let shape = pair.data.shape();
    let widths = widths_per_dimension(fwhm, shape.len())?;
    debug!(widths = ?widths, shape = ?shape, "smoothing signal and normalization");

    let mask: Vec<bool> = pair.norm.signal.iter().map(|n| *n != 0.0 && n.is_finite()).collect();

    let mut data = pair.data.clone();
    let mut norm = pair.norm.clone();
    for (dim, &width) in widths.iter().enumerate() {
        if shape[dim] < 2 {
            continue;
        }
        let kernel = gaussian_kernel_1d(width)?;
        if kernel.len() < 2 {
            continue;
        }
        smooth_axis(&mut data, &mask, dim, &kernel, f64::NAN);
        smooth_axis(&mut norm, &mask, dim, &kernel, 0.0);
    }
    Ok(BinnedPair::new(data, norm))
}

/// One separable pass along `dim`. Squared errors are carried as
/// `Σw²·e² / (Σw)²`.
fn smooth_axis(hist: &mut Histogram, mask: &[bool], dim: usize, kernel: &[f64], masked_value: f64) {
    let shape = hist.shape();
    let strides = hist.strides();
    let len = shape[dim];
    let stride = strides[dim];
    let radius = (kernel.len() / 2) as isize;

    let bases: Vec<usize> = (0..hist.n_bins()).filter(|i| (i / stride) % len == 0).collect();
    let signal = &hist.signal;
    let error_sq = &hist.error_sq;

    let lines: Vec<Vec<(f64, f64)>> = bases
        .par_iter()
        .map(|&base| {
            (0..len)
                .map(|j| {
                    let idx = base + j * stride;
                    if !mask[idx] {
                        return (masked_value, masked_value);
                    }
                    let mut acc = 0.0;
                    let mut acc_err = 0.0;
                    let mut wsum = 0.0;
                    for (off, &w) in kernel.iter().enumerate() {
                        let k = j as isize + off as isize - radius;
                        if k < 0 || k >= len as isize {
                            continue;
                        }
                        let src = base + k as usize * stride;
                        if !mask[src] {
                            continue;
                        }
                        acc += w * signal[src];
                        acc_err += w * w * error_sq[src];
                        wsum += w;
                    }
                    (acc / wsum, acc_err / (wsum * wsum))
                })
                .collect()
        })
        .collect();

    for (base, line) in bases.iter().zip(lines) {
        for (j, (value, err)) in line.into_iter().enumerate() {
            let idx = base + j * stride;
            hist.signal[idx] = value;
            hist.error_sq[idx] = err;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::histogram::Axis;

    fn pair_1d(signal: &[f64], norm: &[f64]) -> BinnedPair {
        let edges: Vec<f64> = (0..=signal.len()).map(|i| i as f64).collect();
        let mut data = Histogram::zeros(vec![Axis::new("x", edges.clone())]);
        data.signal = signal.to_vec();
        data.error_sq = signal.to_vec();
        let mut n = Histogram::zeros(vec![Axis::new("x", edges)]);
        n.signal = norm.to_vec();
        BinnedPair::new(data, n)
    }

    #[test]
    fn test_kernel_for_unit_fwhm() {
        // FWHM of one bin gives weights 2^(-4x²)
        let k = gaussian_kernel_1d(1.0).unwrap();
        assert_eq!(k.len(), 5);
        assert!((k[1] / k[2] - 0.0625).abs() < 1e-12);
        assert!((k[0] / k[2] - 2f64.powi(-16)).abs() < 1e-15);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_identity() {
        let pair = pair_1d(&[1.0, 5.0, 2.0], &[1.0, 1.0, 1.0]);
        assert_eq!(smooth(&pair, None).unwrap(), pair);
        assert_eq!(smooth(&pair, Some(&[0.0])).unwrap(), pair);
        assert_eq!(smooth(&pair, Some(&[])).unwrap(), pair);
    }

    #[test]
    fn test_constant_field_is_preserved() {
        let pair = pair_1d(&[3.0; 7], &[1.5; 7]);
        let smoothed = smooth(&pair, Some(&[2.0])).unwrap();
        for i in 0..7 {
            assert!((smoothed.data.signal[i] - 3.0).abs() < 1e-12);
            assert!((smoothed.norm.signal[i] - 1.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_masked_bins_do_not_contribute() {
        let pair = pair_1d(&[1.0, 100.0, 1.0, 1.0], &[1.0, 0.0, 1.0, 1.0]);
        let smoothed = smooth(&pair, Some(&[1.0])).unwrap();
        assert!(smoothed.data.signal[1].is_nan());
        assert_eq!(smoothed.norm.signal[1], 0.0);
        // bin 0 only sees itself and bin 2 through the far kernel tail
        assert!((smoothed.data.signal[0] - 1.0).abs() < 1e-12);
        let intensity = smoothed.intensity().unwrap();
        assert!(intensity.signal[1].is_nan());
        assert!(intensity.signal.iter().filter(|v| v.is_finite()).all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_error_propagation_shrinks() {
        let pair = pair_1d(&[4.0; 5], &[1.0; 5]);
        let smoothed = smooth(&pair, Some(&[2.0])).unwrap();
        assert!(smoothed.data.error_sq[2] < 4.0);
        assert!(smoothed.data.error_sq[2] > 0.0);
    }

    #[test]
    fn test_width_count_mismatch() {
        let pair = pair_1d(&[1.0, 2.0], &[1.0, 1.0]);
        assert!(smooth(&pair, Some(&[1.0, 1.0])).is_err());
        assert!(smooth(&pair, Some(&[-1.0])).is_err());
    }

    #[test]
    fn test_second_axis_only() {
        let mut data = Histogram::zeros(vec![Axis::new("a", vec![0.0, 1.0, 2.0]), Axis::new("b", vec![0.0, 1.0, 2.0, 3.0])]);
        data.signal = vec![0.0, 0.0, 6.0, 6.0, 0.0, 0.0];
        let mut norm = data.clone();
        norm.signal = vec![1.0; 6];
        let smoothed = smooth(&BinnedPair::new(data, norm), Some(&[0.0, 1.0])).unwrap();
        // rows along "a" stay independent
        assert_eq!(smoothed.data.signal[2], smoothed.data.signal[3]);
        assert!(smoothed.data.signal[0] > 0.0);
        assert!(smoothed.data.signal[2] < 6.0);
    }
}
