// statistics.rs - Statistical contrasts between two conditions
//
// All maps are [channel, bin] and are computed over the trial axis of
// power tensors [trial, channel, bin], pooling every trial of every run.

use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, Axis, Zip};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;

use crate::error::{PipelineError, PipelineResult};

/// Minimum trials per condition for any contrast
pub const MIN_TRIALS: usize = 2;

/// Variance below this is treated as zero
const VARIANCE_EPSILON: f64 = 1e-20;

// ============================================================================
// Input checks
// ============================================================================

fn check_pair(a: &Array3<f64>, b: &Array3<f64>) -> PipelineResult<()> {
    for (label, tensor) in [("condition A", a), ("condition B", b)] {
        let trials = tensor.len_of(Axis(0));
        if trials < MIN_TRIALS {
            return Err(PipelineError::InsufficientData {
                what: format!("{} trials", label),
                needed: MIN_TRIALS,
                got: trials,
            });
        }
    }
    if a.shape()[1..] != b.shape()[1..] {
        return Err(PipelineError::consistency(
            "channel x bin layout",
            format!("{:?}", &a.shape()[1..]),
            format!("{:?}", &b.shape()[1..]),
        ));
    }
    Ok(())
}

/// Apply `f` to every (channel, bin) pair of trial lanes
fn contrast_map<F>(a: &Array3<f64>, b: &Array3<f64>, mut f: F) -> Array2<f64>
where
    F: FnMut(ArrayView1<f64>, ArrayView1<f64>) -> f64,
{
    let (_, channels, bins) = a.dim();
    Array2::from_shape_fn((channels, bins), |(c, k)| {
        f(a.slice(ndarray::s![.., c, k]), b.slice(ndarray::s![.., c, k]))
    })
}

// ============================================================================
// Signed R²
// ============================================================================

/// Signed R² of one (channel, bin) pair of trial samples
///
/// r = sqrt(nA * nB) / (nA + nB) * (meanA - meanB) / std(pooled), with the
/// population standard deviation; the result keeps the sign of r.
pub fn signed_r_squared(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n_a = a.len() as f64;
    let n_b = b.len() as f64;
    let mean_a = a.iter().mean();
    let mean_b = b.iter().mean();
    let pooled_std = a.iter().chain(b.iter()).population_std_dev();

    if pooled_std * pooled_std < VARIANCE_EPSILON || !pooled_std.is_finite() {
        return 0.0;
    }

    let r = (n_a * n_b).sqrt() / (n_a + n_b) * (mean_a - mean_b) / pooled_std;
    r.signum() * r * r
}

/// Signed R² map: positive where condition A has higher mean power
pub fn r_squared_map(a: &Array3<f64>, b: &Array3<f64>) -> PipelineResult<Array2<f64>> {
    check_pair(a, b)?;
    Ok(contrast_map(a, b, signed_r_squared))
}

// ============================================================================
// Wilcoxon rank-sum
// ============================================================================

/// Average ranks (1-based) of `values`, plus the tie correction sum(t^3 - t)
fn average_ranks(values: &[f64]) -> (Vec<f64>, f64) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));

    let mut ranks = vec![0.0; values.len()];
    let mut tie_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end share the average of ranks start+1..=end
        let avg = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg;
        }
        let t = (end - start) as f64;
        tie_sum += t * t * t - t;
        start = end;
    }
    (ranks, tie_sum)
}

/// Rank-sum z statistic of one pair of samples; z > 0 when A ranks higher
pub fn rank_sum_z(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n_a = a.len();
    let n_b = b.len();
    let pooled: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    let (ranks, tie_sum) = average_ranks(&pooled);

    let n_a_f = n_a as f64;
    let n_b_f = n_b as f64;
    let n = n_a_f + n_b_f;

    let rank_sum_a: f64 = ranks[..n_a].iter().sum();
    let u_a = rank_sum_a - n_a_f * (n_a_f + 1.0) / 2.0;
    let mean_u = n_a_f * n_b_f / 2.0;
    let var_u = n_a_f * n_b_f / 12.0 * ((n + 1.0) - tie_sum / (n * (n - 1.0)));

    if var_u < VARIANCE_EPSILON {
        return 0.0;
    }
    (u_a - mean_u) / var_u.sqrt()
}

/// Wilcoxon rank-sum maps (z statistic, two-sided p-value)
pub fn wilcoxon_map(a: &Array3<f64>, b: &Array3<f64>) -> PipelineResult<(Array2<f64>, Array2<f64>)> {
    check_pair(a, b)?;
    let normal = Normal::new(0.0, 1.0).map_err(|e| PipelineError::InvalidData(e.to_string()))?;

    let z = contrast_map(a, b, rank_sum_z);
    let p = z.mapv(|v| (2.0 * (1.0 - normal.cdf(v.abs()))).min(1.0));
    Ok((z, p))
}

// ============================================================================
// Baseline normalisation
// ============================================================================

/// Reject a baseline containing zero (or non-finite) entries
pub fn check_baseline(baseline: &Array2<f64>) -> PipelineResult<()> {
    for ((channel, bin), &value) in baseline.indexed_iter() {
        if value == 0.0 || !value.is_finite() {
            return Err(PipelineError::InvalidData(format!(
                "baseline power is {} at channel {} bin {}",
                value, channel, bin
            )));
        }
    }
    Ok(())
}

/// ERD/ERS percentage: 100 * (power - baseline) / baseline
///
/// `power` is [channel, bin]; `baseline_mean` is the per-channel, per-bin
/// baseline average.
pub fn erd_ers(power: &Array2<f64>, baseline_mean: &Array2<f64>) -> PipelineResult<Array2<f64>> {
    if power.dim() != baseline_mean.dim() {
        return Err(PipelineError::consistency(
            "baseline shape",
            format!("{:?}", power.dim()),
            format!("{:?}", baseline_mean.dim()),
        ));
    }
    check_baseline(baseline_mean)?;
    Ok(Zip::from(power)
        .and(baseline_mean)
        .map_collect(|&p, &base| 100.0 * (p - base) / base))
}

/// ERD/ERS time-frequency map of one channel
///
/// # Arguments
/// * `timefreq` - [trial, channel, bin, window]
/// * `baseline_mean` - [channel, bin]
/// * `channel` - Channel index
///
/// # Returns
/// [bin, window] percentages, averaged over trials
pub fn erd_ers_timefreq(
    timefreq: &Array4<f64>,
    baseline_mean: &Array2<f64>,
    channel: usize,
) -> PipelineResult<Array2<f64>> {
    let trials = timefreq.len_of(Axis(0));
    if trials == 0 {
        return Err(PipelineError::InsufficientData {
            what: "trials for the time-frequency map".to_string(),
            needed: 1,
            got: 0,
        });
    }
    let base = baseline_mean.row(channel);
    if let Some((bin, &value)) = base.indexed_iter().find(|(_, v)| **v == 0.0 || !v.is_finite()) {
        return Err(PipelineError::InvalidData(format!(
            "baseline power is {} at channel {} bin {}",
            value, channel, bin
        )));
    }

    let mean_tf = timefreq
        .index_axis(Axis(1), channel)
        .mean_axis(Axis(0))
        .ok_or_else(|| PipelineError::InvalidData("empty trial axis".to_string()))?;

    let mut map = mean_tf;
    for (mut row, &b) in map.axis_iter_mut(Axis(0)).zip(base.iter()) {
        row.mapv_inplace(|p| 100.0 * (p - b) / b);
    }
    Ok(map)
}

// ============================================================================
// Power spectra
// ============================================================================

/// Power spectrum of one channel in dB: (mean, std) over trials per bin
pub fn psd_db(power: &Array3<f64>, channel: usize) -> PipelineResult<(Array1<f64>, Array1<f64>)> {
    let lanes = power.index_axis(Axis(1), channel);
    if let Some(((trial, bin), &value)) = lanes.indexed_iter().find(|(_, v)| **v <= 0.0) {
        return Err(PipelineError::InvalidData(format!(
            "non-positive power {} at trial {} bin {} cannot be expressed in dB",
            value, trial, bin
        )));
    }
    let db = lanes.mapv(|p| 10.0 * p.log10());
    let mean = db.map_axis(Axis(0), |lane| lane.iter().mean());
    let std = db.map_axis(Axis(0), |lane| lane.iter().population_std_dev());
    Ok((mean, std))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    /// [trials, 1 channel, 1 bin] tensor from raw values
    fn single_lane(values: &[f64]) -> Array3<f64> {
        Array3::from_shape_vec((values.len(), 1, 1), values.to_vec()).unwrap()
    }

    #[test]
    fn test_r_squared_is_antisymmetric() {
        let a = Array3::from_shape_fn((6, 2, 3), |(t, c, k)| 5.0 + t as f64 * 0.3 + c as f64 + k as f64);
        let b = Array3::from_shape_fn((5, 2, 3), |(t, c, k)| 4.0 + (t as f64 * 0.7).sin() + c as f64 * 0.5 + k as f64);

        let ab = r_squared_map(&a, &b).unwrap();
        let ba = r_squared_map(&b, &a).unwrap();
        for (x, y) in ab.iter().zip(ba.iter()) {
            assert_relative_eq!(*x, -*y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_r_squared_zero_on_equal_data() {
        let a = Array3::from_shape_fn((4, 3, 2), |(t, c, k)| (t * 7 + c * 3 + k) as f64);
        let r2 = r_squared_map(&a, &a.clone()).unwrap();
        assert!(r2.iter().all(|&v| v == 0.0));

        // constant data: zero pooled variance
        let flat = Array3::from_elem((3, 1, 1), 2.0);
        assert_eq!(r_squared_map(&flat, &flat).unwrap()[[0, 0]], 0.0);
    }

    #[test]
    fn test_r_squared_known_value() {
        // A = [2, 4], B = [0, 2]: means 3 and 1, pooled std of [2,4,0,2] = sqrt(2)
        // r = sqrt(4)/4 * 2 / sqrt(2) = 1/sqrt(2), r² = 0.5
        let r2 = r_squared_map(&single_lane(&[2.0, 4.0]), &single_lane(&[0.0, 2.0])).unwrap();
        assert_relative_eq!(r2[[0, 0]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_contrast_requires_two_trials() {
        let a = single_lane(&[1.0]);
        let b = single_lane(&[1.0, 2.0]);
        assert!(matches!(
            r_squared_map(&a, &b),
            Err(PipelineError::InsufficientData { needed: 2, got: 1, .. })
        ));
        assert!(matches!(
            wilcoxon_map(&b, &a),
            Err(PipelineError::InsufficientData { needed: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_average_ranks_with_ties() {
        let (ranks, tie_sum) = average_ranks(&[3.0, 1.0, 3.0, 2.0]);
        assert_eq!(ranks, vec![3.5, 1.0, 3.5, 2.0]);
        assert_relative_eq!(tie_sum, 6.0);
    }

    #[test]
    fn test_wilcoxon_direction_and_pvalue() {
        let a = single_lane(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let b = single_lane(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let (z, p) = wilcoxon_map(&a, &b).unwrap();
        // complete separation, n = 5 + 5: U = 25, mean 12.5, var 25*11/12
        let expected = 12.5 / (25.0f64 * 11.0 / 12.0).sqrt();
        assert_relative_eq!(z[[0, 0]], expected, epsilon = 1e-12);
        assert!(p[[0, 0]] < 0.05);

        let (z_rev, p_rev) = wilcoxon_map(&b, &a).unwrap();
        assert_relative_eq!(z_rev[[0, 0]], -expected, epsilon = 1e-12);
        assert_relative_eq!(p_rev[[0, 0]], p[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn test_wilcoxon_identical_samples() {
        let a = single_lane(&[1.0, 1.0, 1.0]);
        let (z, p) = wilcoxon_map(&a, &a.clone()).unwrap();
        assert_eq!(z[[0, 0]], 0.0);
        assert_relative_eq!(p[[0, 0]], 1.0);
    }

    #[test]
    fn test_erd_ers_percentages() {
        let power = array![[15.0, 5.0], [2.0, 4.0]];
        let base = array![[10.0, 10.0], [4.0, 4.0]];
        let erd = erd_ers(&power, &base).unwrap();
        let expected = array![[50.0, -50.0], [-50.0, 0.0]];
        for (got, want) in erd.iter().zip(expected.iter()) {
            assert_relative_eq!(*got, *want);
        }
    }

    #[test]
    fn test_zero_baseline_is_invalid_data() {
        let power = array![[1.0, 1.0]];
        let base = array![[1.0, 0.0]];
        assert!(matches!(erd_ers(&power, &base), Err(PipelineError::InvalidData(_))));

        let tf = Array4::from_elem((2, 1, 2, 3), 1.0);
        assert!(matches!(
            erd_ers_timefreq(&tf, &base, 0),
            Err(PipelineError::InvalidData(_))
        ));
    }

    #[test]
    fn test_erd_ers_timefreq_shape() {
        let tf = Array4::from_shape_fn((2, 2, 3, 4), |(t, _, _, w)| 2.0 + t as f64 + w as f64);
        let base = Array2::from_elem((2, 3), 2.0);
        let map = erd_ers_timefreq(&tf, &base, 1).unwrap();
        assert_eq!(map.dim(), (3, 4));
        // window 0: trial mean 2.5 -> +25 %
        assert_relative_eq!(map[[0, 0]], 25.0);
    }

    #[test]
    fn test_psd_db() {
        let power = Array3::from_shape_fn((2, 1, 2), |(t, _, _)| if t == 0 { 10.0 } else { 1000.0 });
        let (mean, std) = psd_db(&power, 0).unwrap();
        assert_relative_eq!(mean[0], 20.0, epsilon = 1e-12);
        assert_relative_eq!(std[1], 10.0, epsilon = 1e-12);

        let zero = Array3::zeros((2, 1, 2));
        assert!(matches!(psd_db(&zero, 0), Err(PipelineError::InvalidData(_))));
    }
}
