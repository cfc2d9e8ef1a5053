use rayon::prelude::*;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::linear_regression::{
    LinearRegression, LinearRegressionParameters, LinearRegressionSolverName,
};

use crate::error::{GprError, Result};

/// Fit a polynomial to a window of values by least squares and return the fitted values
///
/// The explanatory variable is the sample index, centered and scaled to [-1, 1] to keep the
/// regression well conditioned.
fn fit_window(values: &[f64], polyorder: usize) -> Result<Vec<f64>> {
    if polyorder == 0 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        return Ok(vec![mean; values.len()]);
    };

    let half = (values.len() / 2).max(1) as f64;
    let center = (values.len() as f64 - 1.) / 2.;

    let rows = (0..values.len())
        .map(|i| {
            let x = (i as f64 - center) / half;
            (1..=polyorder).map(|p| x.powi(p as i32)).collect::<Vec<f64>>()
        })
        .collect::<Vec<Vec<f64>>>();
    let xs = DenseMatrix::from_2d_vec(&rows);
    let ys = values.to_vec();

    let lr = LinearRegression::fit(
        &xs,
        &ys,
        LinearRegressionParameters::default().with_solver(LinearRegressionSolverName::QR),
    )
    .map_err(|e| GprError::Smoothing(e.to_string()))?;

    lr.predict(&xs)
        .map_err(|e| GprError::Smoothing(e.to_string()))
}

/// Smooth a sequence with a Savitzky-Golay (moving-window polynomial) filter
///
/// Each sample is replaced by the value of a `polyorder` polynomial fitted to the
/// `window_length` samples centered on it. The first and last half-windows are evaluated on the
/// polynomial fitted to the first and last full window, so the output has the same length as
/// the input.
///
/// # Arguments
/// - `values`: The sequence to smooth
/// - `window_length`: The (odd) window length
/// - `polyorder`: The polynomial order. Must be lower than the window length.
///
/// # Returns
/// The smoothed sequence, or an error if the parameters are invalid for the sequence.
pub fn savgol_smooth(values: &[f64], window_length: usize, polyorder: usize) -> Result<Vec<f64>> {
    if window_length % 2 == 0 {
        return Err(GprError::Precondition(format!(
            "The smoothing window length must be odd. Got {window_length}"
        )));
    };
    if polyorder >= window_length {
        return Err(GprError::Precondition(format!(
            "The polynomial order ({polyorder}) must be lower than the window length ({window_length})"
        )));
    };
    let n = values.len();
    if window_length > n {
        return Err(GprError::InsufficientData(format!(
            "The smoothing window ({window_length}) is longer than the sequence ({n})"
        )));
    };
    let half = window_length / 2;

    let mut smoothed = (half..(n - half))
        .into_par_iter()
        .map(|i| fit_window(&values[(i - half)..=(i + half)], polyorder).map(|fit| fit[half]))
        .collect::<Result<Vec<f64>>>()?;

    let first = fit_window(&values[..window_length], polyorder)?;
    let last = fit_window(&values[(n - window_length)..], polyorder)?;

    let mut output = first[..half].to_vec();
    output.append(&mut smoothed);
    output.extend_from_slice(&last[(window_length - half)..]);

    Ok(output)
}
