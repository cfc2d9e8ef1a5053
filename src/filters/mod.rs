/// Stateless transforms of a profile's data matrix
///
/// All functions return a new matrix of the same shape as the input. NaN is treated as
/// "no data" and propagates through the arithmetic instead of raising.
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;

use crate::error::{GprError, Result};

pub mod savgol;

/// Floor of the AGC energy, to avoid division by zero
const AGC_EPSILON: f32 = 1e-8;

/// The (clipped) bounds of a window of `half_width` on each side of `index`
fn window_bounds(index: usize, length: usize, half_width: usize) -> (usize, usize) {
    (
        index.saturating_sub(half_width),
        (index + half_width + 1).min(length),
    )
}

/// Apply a function to every window of a lane and return one value per sample
fn map_windows<F>(values: ArrayView1<f32>, half_width: usize, func: F) -> Array1<f32>
where
    F: Fn(ArrayView1<f32>) -> f32,
{
    Array1::from_iter((0..values.len()).map(|i| {
        let (start, end) = window_bounds(i, values.len(), half_width);
        func(values.slice(s![start..end]))
    }))
}

/// NaN-propagating mean (ndarray's sum propagates NaN)
fn nan_mean(values: ArrayView1<f32>) -> f32 {
    values.sum() / values.len() as f32
}

fn validate_window(window: usize, name: &str) -> Result<usize> {
    match window {
        0 => Err(GprError::Precondition(format!(
            "The {name} window must be at least 1"
        ))),
        w => Ok((w as f32 / 2.).ceil() as usize),
    }
}

/// Align all traces on their strongest return (a per-trace time-zero adjustment)
///
/// The peak absolute amplitude of each trace is found (NaNs skipped), and every trace is shifted
/// so that its peak lands on the rounded mean peak index. Rows that are shifted in are zero.
/// Traces without any valid value are left as they are.
pub fn align_traces(data: &Array2<f32>) -> Array2<f32> {
    let peaks: Vec<Option<usize>> = data
        .columns()
        .into_iter()
        .map(|col| col.mapv(f32::abs).argmax_skipnan().ok())
        .collect();

    let valid = peaks.iter().flatten().collect::<Vec<&usize>>();
    if valid.is_empty() {
        return data.clone();
    };
    let mean_peak =
        (valid.iter().map(|p| **p as f64).sum::<f64>() / valid.len() as f64).round() as isize;

    let height = data.nrows();
    let mut new_data = Array2::<f32>::zeros(data.raw_dim());

    new_data
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .zip(data.axis_iter(Axis(1)).into_par_iter())
        .zip(peaks.par_iter())
        .for_each(|((mut new_col, col), peak)| {
            let shift = match peak {
                Some(p) => mean_peak - *p as isize,
                None => 0,
            };
            let offset = shift.unsigned_abs().min(height);

            if shift >= 0 {
                new_col
                    .slice_mut(s![offset..])
                    .assign(&col.slice(s![..height - offset]));
            } else {
                new_col
                    .slice_mut(s![..height - offset])
                    .assign(&col.slice(s![offset..]));
            }
        });

    new_data
}

/// Remove low-frequency "wow" by subtracting a running vertical mean of each trace
///
/// The mean is taken in a window of `ceil(window / 2)` samples on each side, clipped at the
/// ends of the trace. A window at least as long as the trace subtracts the trace mean.
pub fn dewow(data: &Array2<f32>, window: usize) -> Result<Array2<f32>> {
    let half_width = validate_window(window, "dewow")?;
    let half_width = if window >= data.nrows() {
        data.nrows()
    } else {
        half_width
    };

    let mut new_data = data.clone();
    new_data
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .for_each(|mut col| {
            let means = map_windows(col.view(), half_width, nan_mean);
            col -= &means;
        });
    Ok(new_data)
}

/// Remove horizontal banding by subtracting a running mean trace along the profile
///
/// The mean trace is taken in a window of `ceil(ntraces / 2)` traces on each side, clipped at
/// the ends of the profile. A window at least as wide as the profile subtracts the mean trace.
pub fn rem_mean_trace(data: &Array2<f32>, ntraces: usize) -> Result<Array2<f32>> {
    let half_width = validate_window(ntraces, "mean trace")?;
    let half_width = if ntraces >= data.ncols() {
        data.ncols()
    } else {
        half_width
    };

    let mut new_data = data.clone();
    new_data
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let means = map_windows(row.view(), half_width, nan_mean);
            row -= &means;
        });
    Ok(new_data)
}

/// Multiply every sample by its travel time to the given power
///
/// For negative times (before time-zero), the real part of the complex power is used.
pub fn tpow_gain(data: &Array2<f32>, time_axis: &Array1<f64>, power: f64) -> Result<Array2<f32>> {
    if time_axis.len() != data.nrows() {
        return Err(GprError::ShapeMismatch(format!(
            "Time axis length {} != data height {}",
            time_axis.len(),
            data.nrows()
        )));
    };
    let factors = time_axis
        .iter()
        .map(|t| match *t < 0. {
            true => t.abs().powf(power) * (std::f64::consts::PI * power).cos(),
            false => t.powf(power),
        } as f32)
        .collect::<Vec<f32>>();

    let mut new_data = data.clone();
    new_data
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(factors.par_iter())
        .for_each(|(mut row, factor)| row *= *factor);
    Ok(new_data)
}

/// Automatic gain control: divide each sample by the energy of the surrounding window
///
/// The energy is the L2 norm of `ceil(window / 2)` samples on each side (clipped at the ends),
/// floored at a small epsilon. A NaN in the window gives a NaN energy.
pub fn agc_gain(data: &Array2<f32>, window: usize) -> Result<Array2<f32>> {
    let half_width = validate_window(window, "AGC")?;
    let half_width = if window > data.nrows() {
        data.nrows()
    } else {
        half_width
    };

    let energy = |values: ArrayView1<f32>| {
        let norm = values.mapv(|v| v.powi(2)).sum().sqrt();
        // f32::max would swallow the NaN
        match norm.is_nan() {
            true => norm,
            false => norm.max(AGC_EPSILON),
        }
    };

    let mut new_data = data.clone();
    new_data
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .for_each(|mut col| {
            let energies = map_windows(col.view(), half_width, energy);
            col /= &energies;
        });
    Ok(new_data)
}
