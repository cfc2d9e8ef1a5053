/// Ribbon meshes: the profile as a thin vertical curtain along its track
use std::path::{Path, PathBuf};

use ndarray::{s, Array3};
use ndarray_stats::QuantileExt;

use crate::error::{GprError, Result};
use crate::filters::savgol::savgol_smooth;
use crate::gpr::Profile;
use crate::tools;

pub const DEFAULT_MESH_THICKNESS: f64 = 0.1;
pub const DEFAULT_MESH_ASPECT: f64 = 1.;
pub const DEFAULT_SMOOTH: bool = true;
pub const DEFAULT_SMOOTH_WINDOW: usize = 51;
pub const DEFAULT_SMOOTH_ORDER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshParams {
    /// Horizontal width of the ribbon (m)
    pub thickness: f64,
    /// Vertical exaggeration
    pub aspect: f64,
    /// Smooth the track with a Savitzky-Golay filter (only applies to a given track)
    pub smooth: bool,
    pub win_length: usize,
    pub porder: usize,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            thickness: DEFAULT_MESH_THICKNESS,
            aspect: DEFAULT_MESH_ASPECT,
            smooth: DEFAULT_SMOOTH,
            win_length: DEFAULT_SMOOTH_WINDOW,
            porder: DEFAULT_SMOOTH_ORDER,
        }
    }
}

/// A structured grid of (3 lateral rows, n traces, nz vertical samples) points
#[derive(Debug, Clone)]
pub struct RibbonMesh {
    pub x: Array3<f64>,
    pub y: Array3<f64>,
    pub z: Array3<f64>,
    /// One amplitude per cell, with shape (2, n - 1, nz - 1)
    pub cells: Array3<f32>,
}

impl RibbonMesh {
    /// The point dimensions (lateral, traces, vertical)
    pub fn dimensions(&self) -> (usize, usize, usize) {
        self.x.dim()
    }
}

/// Something that can persist a ribbon mesh
pub trait MeshWriter {
    /// Write the mesh and return the path that was actually written
    fn write_mesh(&self, mesh: &RibbonMesh, path: &Path) -> Result<PathBuf>;
}

/// The (x, y, z) of every trace
///
/// Without a track, the profile is laid out along the x axis at zero elevation. A track with
/// one point per trace is used as is, otherwise the traces are placed along it by distance.
pub fn profile_track(
    profile: &Profile,
    track: Option<&[[f64; 3]]>,
    params: &MeshParams,
) -> Result<Vec<[f64; 3]>> {
    let positions = profile.position_axis();

    let points = match track {
        None => return Ok(positions.iter().map(|p| [*p, 0., 0.]).collect()),
        Some(points) if points.len() == positions.len() => points.to_vec(),
        Some(points) => {
            let min_position = *positions.min_skipnan();

            let mut known_x = Vec::<f64>::with_capacity(points.len());
            let mut known_y = Vec::<[f64; 3]>::with_capacity(points.len());
            for (distance, point) in tools::cumulative_distance(points).iter().zip(points) {
                let position = distance + min_position;
                // Repeated points would give a zero-length segment
                if known_x.last().map_or(true, |last| position > *last) {
                    known_x.push(position);
                    known_y.push(*point);
                };
            }
            if known_x.len() < 2 {
                return Err(GprError::InsufficientData(format!(
                    "The track needs at least two distinct points. Got {}",
                    known_x.len()
                )));
            };
            positions
                .iter()
                .map(|p| tools::interpolate_linear_values(&known_x, &known_y, *p))
                .collect()
        }
    };

    match params.smooth {
        true => smooth_track(points, params),
        false => Ok(points),
    }
}

/// Smooth the coordinates of a track, leaving it as it is if it is too short
fn smooth_track(mut track: Vec<[f64; 3]>, params: &MeshParams) -> Result<Vec<[f64; 3]>> {
    let n = track.len();
    let mut window = (n / 2).min(params.win_length);
    if window % 2 == 0 {
        window = window.saturating_sub(1);
    };
    let order = ((n as f64).sqrt().floor() as usize).min(params.porder);

    if (window < 3) | (order >= window) {
        log::warn!(
            "Track of {} points is too short to smooth (window: {}, order: {}). Skipping",
            n,
            window,
            order
        );
        return Ok(track);
    };

    for dim in 0..3 {
        let values = track.iter().map(|p| p[dim]).collect::<Vec<f64>>();
        let smoothed = savgol_smooth(&values, window, order)?;
        for (point, value) in track.iter_mut().zip(smoothed) {
            point[dim] = value;
        }
    }
    Ok(track)
}

/// Horizontal offsets from the track to the ribbon edges
///
/// Each offset is perpendicular to the segment toward the next point and half the thickness
/// long. The last point and points starting a zero-length segment reuse the previous offset.
pub fn perpendicular_offsets(track: &[[f64; 3]], thickness: f64) -> Vec<[f64; 2]> {
    let half = thickness / 2.;

    let mut offsets = Vec::<[f64; 2]>::with_capacity(track.len());
    for i in 0..track.len().saturating_sub(1) {
        let dx = track[i + 1][0] - track[i][0];
        let dy = track[i + 1][1] - track[i][1];

        let offset = match tools::normalize([-dy, dx]) {
            Some(unit) => [unit[0] * half, unit[1] * half],
            None => offsets.last().copied().unwrap_or([0., half]),
        };
        offsets.push(offset);
    }
    if let Some(last) = offsets.last().copied() {
        offsets.push(last);
    };
    offsets
}

/// Build the ribbon mesh of a profile
///
/// The amplitudes are taken from before any topographic correction, and the corrected datum
/// (if any) and the track elevation place them vertically.
///
/// # Arguments
/// - `profile`: The profile to build a mesh of
/// - `track`: Optional (x, y, z) coordinates of the profile
/// - `params`: Mesh thickness, vertical exaggeration and track smoothing parameters
pub fn build_ribbon_mesh(
    profile: &Profile,
    track: Option<&[[f64; 3]]>,
    params: &MeshParams,
) -> Result<RibbonMesh> {
    let amplitudes = profile.pre_correction_data().unwrap_or(profile.data());
    let (nz, n) = amplitudes.dim();
    if (n < 2) | (nz < 2) {
        return Err(GprError::InsufficientData(format!(
            "A mesh needs at least two traces and two vertical samples. Got {n} and {nz}"
        )));
    };
    if !(params.thickness.is_finite() & params.aspect.is_finite()) || params.thickness < 0. {
        return Err(GprError::Precondition(format!(
            "The mesh thickness and aspect must be finite (thickness >= 0). Got {} and {}",
            params.thickness, params.aspect
        )));
    };

    // After topographic correction, the first rows of the extended axis are the original ones
    let vertical = profile.vertical_axis().slice(s![..nz]);
    let datum = profile.max_elevation().unwrap_or(0.);

    let points = profile_track(profile, track, params)?;
    let offsets = perpendicular_offsets(&points, params.thickness);
    let side = [-1., 0., 1.];

    let x = Array3::from_shape_fn((3, n, nz), |(l, i, _)| {
        points[i][0] + side[l] * offsets[i][0]
    });
    let y = Array3::from_shape_fn((3, n, nz), |(l, i, _)| {
        points[i][1] + side[l] * offsets[i][1]
    });
    let z = Array3::from_shape_fn((3, n, nz), |(_, i, k)| {
        datum - vertical[k] * params.aspect + points[i][2] * params.aspect
    });
    let cells = Array3::from_shape_fn((2, n - 1, nz - 1), |(_, i, k)| amplitudes[[k, i]]);

    Ok(RibbonMesh { x, y, z, cells })
}
