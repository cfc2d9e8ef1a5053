/// Topographic correction: re-registering traces onto a common elevation datum
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;

use crate::error::{GprError, Result};
use crate::gpr::Profile;
use crate::tools;

/// The largest allowed trace shift, as a multiple of the profile height
const MAX_SHIFT_HEIGHT_RATIO: usize = 1000;

/// One surface elevation measurement along the profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopoSample {
    /// Along-profile position (m)
    pub position: f64,
    /// Surface elevation (m)
    pub elevation: f64,
    /// Lateral (easting, northing) coordinates, if the source had them
    pub xy: Option<[f64; 2]>,
}

impl TopoSample {
    pub fn new(position: f64, elevation: f64) -> Self {
        Self {
            position,
            elevation,
            xy: None,
        }
    }
}

/// The result of a topographic correction
#[derive(Debug, Clone)]
pub struct TopoCorrection {
    /// The re-registered data, NaN where a trace has no data
    pub data: Array2<f32>,
    /// The extended time axis
    pub time_axis: Array1<f64>,
    /// The highest surface elevation, which is the datum of the corrected profile
    pub max_elevation: f64,
    /// The interpolated surface elevation of each trace
    pub elevations: Array1<f64>,
    /// The number of samples each trace was pushed down
    pub shifts: Vec<usize>,
    /// Whether the samples carried lateral coordinates
    pub is_3d: bool,
}

/// Interpolate the surface elevation at each position
///
/// Positions outside of the samples get the linear trend of the nearest boundary segment.
pub fn interpolate_elevations(
    samples: &[TopoSample],
    positions: &Array1<f64>,
) -> Result<Array1<f64>> {
    if samples.len() < 2 {
        return Err(GprError::InsufficientData(format!(
            "At least two topography samples are needed. Got {}",
            samples.len()
        )));
    };
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.position.total_cmp(&b.position));

    let known_x = sorted.iter().map(|s| s.position).collect::<Vec<f64>>();
    let known_y = sorted.iter().map(|s| s.elevation).collect::<Vec<f64>>();

    if let Some(w) = known_x.windows(2).find(|w| w[1] <= w[0]) {
        return Err(GprError::DegenerateAxis(format!(
            "Topography positions must be unique. Found {} twice",
            w[0]
        )));
    };

    Ok(positions.mapv(|p| tools::interpolate_linear(&known_x, &known_y, p)))
}

/// Correct a profile for surface topography
///
/// Every trace is pushed down by the two-way travel time from the highest surface point to its
/// own surface elevation, so that equal rows represent equal elevations. The time axis is
/// extended to fit the largest shift, and the samples that no trace covers are NaN.
///
/// # Arguments
/// - `profile`: The profile to correct. Its velocity must be set.
/// - `samples`: Surface elevation samples along the profile
///
/// # Returns
/// The corrected data, time axis, datum and per-trace elevations and shifts.
pub fn correct_topography(profile: &Profile, samples: &[TopoSample]) -> Result<TopoCorrection> {
    let velocity = profile
        .velocity()
        .ok_or_else(|| GprError::Precondition("velocity not set".into()))?;

    let positions = profile.position_axis();
    if positions.iter().all(|p| *p == positions[0]) {
        return Err(GprError::DegenerateAxis(
            "All traces have the same position, so there is no topography to correct for".into(),
        ));
    };
    let dt = profile.time_interval()?;

    let elevations = interpolate_elevations(samples, positions)?;
    let max_elevation = *elevations.max_skipnan();
    if !max_elevation.is_finite() {
        return Err(GprError::InsufficientData(
            "No finite elevation could be interpolated".into(),
        ));
    };

    let height = profile.height();
    let shift_limit = height.saturating_mul(MAX_SHIFT_HEIGHT_RATIO);
    let shifts = elevations
        .iter()
        .map(|elevation| {
            let shift_time = 2. * (max_elevation - elevation) / velocity;
            let shift = (shift_time / dt).round().max(0.);
            if !shift.is_finite() || (shift > shift_limit as f64) {
                return Err(GprError::Precondition(format!(
                    "A velocity of {velocity} m/ns shifts a trace by {shift} samples \
                    (limit: {shift_limit}). Is the velocity correct?"
                )));
            };
            Ok(shift as usize)
        })
        .collect::<Result<Vec<usize>>>()?;
    let max_shift = shifts.iter().copied().max().unwrap_or(0);

    let new_height = height.checked_add(max_shift).ok_or_else(|| {
        GprError::Precondition(format!("The corrected height overflows at a shift of {max_shift}"))
    })?;
    let mut data = Array2::<f32>::from_elem((new_height, profile.width()), f32::NAN);
    data.axis_iter_mut(Axis(1))
        .into_par_iter()
        .zip(profile.data().axis_iter(Axis(1)).into_par_iter())
        .zip(shifts.par_iter())
        .for_each(|((mut new_col, col), shift)| {
            new_col.slice_mut(s![*shift..*shift + height]).assign(&col);
        });

    let last_time = profile.time_axis()[height - 1];
    let time_axis = profile
        .time_axis()
        .iter()
        .copied()
        .chain((1..=max_shift).map(|j| last_time + j as f64 * dt))
        .collect::<Array1<f64>>();

    log::debug!(
        "Topographic correction with a datum of {:.2} m and a max shift of {} samples",
        max_elevation,
        max_shift
    );

    Ok(TopoCorrection {
        data,
        time_axis,
        max_elevation,
        elevations,
        shifts,
        is_3d: samples.iter().any(|s| s.xy.is_some()),
    })
}
