use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ndarray::{s, Array1, Array2};
use ndarray_stats::QuantileExt;
use serde::{Deserialize, Serialize};

use crate::error::{GprError, Result};
use crate::history::{OperationRecord, Value};
use crate::io::{self, Delimiter};
use crate::mesh::{self, MeshParams, MeshWriter};
use crate::{filters, tools, topo};

pub const DEFAULT_DEWOW_WINDOW: usize = 5;
pub const DEFAULT_AGC_WINDOW: usize = 10;
pub const DEFAULT_TPOW_POWER: f64 = 0.;

/// The first statement of a replay script
pub const NEW_SESSION_STATEMENT: &str = "new_session()";

/// Header values from which the axes of a raw profile can be built
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileHeader {
    /// Position of the first trace (m)
    pub start_position: f64,
    /// Position of the last trace (m)
    pub final_position: f64,
    /// Two-way travel time of the first sample (ns)
    pub time_zero: f64,
    /// Two-way travel time of the last sample (ns)
    pub time_window: f64,
}

/// The axes of a raw profile, given explicitly or as a header
#[derive(Debug, Clone)]
pub enum RawAxes {
    Explicit {
        position_axis: Array1<f64>,
        time_axis: Array1<f64>,
    },
    Header(ProfileHeader),
}

/// A data matrix as read from an instrument file, before any processing
#[derive(Debug, Clone)]
pub struct RawProfile {
    pub data: Array2<f32>,
    pub axes: RawAxes,
}

/// A 2D GPR profile: amplitudes indexed by (travel-time sample, trace)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub(crate) data: Array2<f32>,
    pub(crate) time_axis: Array1<f64>,
    pub(crate) position_axis: Array1<f64>,
    pub(crate) velocity: Option<f64>,
    pub(crate) depth_axis: Option<Array1<f64>>,
    pub(crate) max_elevation: Option<f64>,
    pub(crate) pre_correction_data: Option<Array2<f32>>,
    pub(crate) is_3d: bool,
}

impl Profile {
    /// Create a profile from a raw data matrix and its axes
    ///
    /// # Arguments
    /// - `data`: Amplitudes with shape (time samples, traces)
    /// - `position_axis`: The along-profile position of each trace (m)
    /// - `time_axis`: The two-way travel time of each sample (ns). Must be strictly increasing.
    pub fn new(
        data: Array2<f32>,
        position_axis: Array1<f64>,
        time_axis: Array1<f64>,
    ) -> Result<Profile> {
        let profile = Profile {
            data,
            time_axis,
            position_axis,
            velocity: None,
            depth_axis: None,
            max_elevation: None,
            pre_correction_data: None,
            is_3d: false,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Create a profile from a raw data matrix and a header describing its extent
    ///
    /// The positions and times are spaced evenly between the header's start and end values.
    pub fn from_header(data: Array2<f32>, header: &ProfileHeader) -> Result<Profile> {
        let position_axis = Array1::linspace(
            header.start_position,
            header.final_position,
            data.ncols(),
        );
        let time_axis = Array1::linspace(header.time_zero, header.time_window, data.nrows());

        Profile::new(data, position_axis, time_axis)
    }

    /// Check that all fields are consistent with each other
    pub fn validate(&self) -> Result<()> {
        if (self.height() == 0) | (self.width() == 0) {
            return Err(GprError::InsufficientData(format!(
                "A profile needs at least one sample and one trace. Shape: {:?}",
                self.data.shape()
            )));
        };
        if self.time_axis.len() != self.height() {
            return Err(GprError::ShapeMismatch(format!(
                "Time axis length {} != data height {}",
                self.time_axis.len(),
                self.height()
            )));
        };
        if self.position_axis.len() != self.width() {
            return Err(GprError::ShapeMismatch(format!(
                "Position axis length {} != data width {}",
                self.position_axis.len(),
                self.width()
            )));
        };
        if self.time_axis.iter().any(|t| !t.is_finite())
            | self.time_axis.windows(2).into_iter().any(|w| w[1] <= w[0])
        {
            return Err(GprError::DegenerateAxis(
                "The time axis must be finite and strictly increasing".into(),
            ));
        };
        if self.position_axis.iter().any(|p| !p.is_finite()) {
            return Err(GprError::DegenerateAxis(
                "The position axis must be finite".into(),
            ));
        };

        match (&self.velocity, &self.depth_axis) {
            (Some(_), Some(depth)) if depth.len() == self.height() => (),
            (None, None) => (),
            _ => {
                return Err(GprError::InvalidState(
                    "The depth axis must exist (with the data height) iff a velocity is set".into(),
                ))
            }
        };
        match (&self.max_elevation, &self.pre_correction_data) {
            (Some(_), Some(pre))
                if (pre.ncols() == self.width()) & (pre.nrows() <= self.height()) => {}
            (None, None) => (),
            _ => {
                return Err(GprError::InvalidState(
                    "The pre-correction data must exist (and fit the data) iff a topographic correction has been applied".into(),
                ))
            }
        };
        Ok(())
    }

    pub fn height(&self) -> usize {
        self.data.shape()[0]
    }
    pub fn width(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }
    pub fn time_axis(&self) -> &Array1<f64> {
        &self.time_axis
    }
    pub fn position_axis(&self) -> &Array1<f64> {
        &self.position_axis
    }
    pub fn velocity(&self) -> Option<f64> {
        self.velocity
    }
    pub fn depth_axis(&self) -> Option<&Array1<f64>> {
        self.depth_axis.as_ref()
    }
    pub fn max_elevation(&self) -> Option<f64> {
        self.max_elevation
    }
    pub fn pre_correction_data(&self) -> Option<&Array2<f32>> {
        self.pre_correction_data.as_ref()
    }
    pub fn is_3d(&self) -> bool {
        self.is_3d
    }

    /// The depth axis if a velocity is set, otherwise the time axis
    pub fn vertical_axis(&self) -> &Array1<f64> {
        self.depth_axis.as_ref().unwrap_or(&self.time_axis)
    }

    pub fn is_topo_corrected(&self) -> bool {
        self.max_elevation.is_some()
    }

    /// The mean interval between two samples (ns)
    pub fn time_interval(&self) -> Result<f64> {
        if self.height() < 2 {
            return Err(GprError::InsufficientData(
                "At least two samples are needed to derive the time interval".into(),
            ));
        };
        Ok((self.time_axis[self.height() - 1] - self.time_axis[0]) / (self.height() - 1) as f64)
    }

    /// Recompute the depth axis from the time axis and velocity
    fn update_depth(&mut self) {
        self.depth_axis = self
            .velocity
            .map(|velocity| self.time_axis.mapv(|t| t * velocity / 2.));
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let velocity = match self.velocity {
            Some(v) => format!("{} m/ns", v),
            None => "Not set".to_string(),
        };
        let max_depth = match &self.depth_axis {
            Some(depth) => format!("{:.2} m", depth[depth.len() - 1]),
            None => "Unknown (no velocity)".to_string(),
        };
        let elevation = match self.max_elevation {
            Some(e) => format!("{:.2} m", e),
            None => "Not topographically corrected".to_string(),
        };

        write!(
            f,
            "
GPR Profile
-----------
Samples (height):\t{}
Traces (width):\t\t{}
Time range:\t\t{:.2}-{:.2} ns
Position range:\t\t{:.2}-{:.2} m
Medium velocity:\t{}
Max depth:\t\t{}
Elevation datum:\t{}
Lateral coordinates:\t{}
Amplitude range:\t{}-{}
",
            self.height(),
            self.width(),
            self.time_axis[0],
            self.time_axis[self.height() - 1],
            self.position_axis.min_skipnan(),
            self.position_axis.max_skipnan(),
            velocity,
            max_depth,
            elevation,
            self.is_3d,
            self.data.min_skipnan(),
            self.data.max_skipnan(),
        )
    }
}

/// The single retained previous state of a session
#[derive(Debug, Clone)]
struct Snapshot {
    profile: Profile,
    /// The log up to and including the operation that replaced this state
    log: Vec<OperationRecord>,
}

/// A processing session around one profile
///
/// Every mutating operation first computes the new profile, then moves the current profile into
/// the snapshot slot, installs the new one and appends a literal record of itself to the log.
/// Failing operations leave everything untouched.
#[derive(Debug)]
pub struct ProfileSession {
    profile: Profile,
    log: Vec<OperationRecord>,
    previous: Option<Snapshot>,
}

impl ProfileSession {
    /// Start a session from an imported profile
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            log: Vec::new(),
            previous: None,
        }
    }

    /// Start a session from a raw data matrix
    pub fn from_raw(raw: RawProfile) -> Result<Self> {
        let profile = match raw.axes {
            RawAxes::Explicit {
                position_axis,
                time_axis,
            } => Profile::new(raw.data, position_axis, time_axis)?,
            RawAxes::Header(header) => Profile::from_header(raw.data, &header)?,
        };
        Ok(Self::new(profile))
    }

    /// Open a saved session (".gpr") file
    pub fn open(filepath: &Path) -> Result<Self> {
        match filepath.extension().and_then(|e| e.to_str()) {
            Some("gpr") => {
                let (profile, log) = io::load_session(filepath)?;
                Ok(Self {
                    profile,
                    log,
                    previous: None,
                })
            }
            _ => Err(GprError::UnsupportedFormat(format!(
                "Can only read native .gpr session files: {:?}",
                filepath
            ))),
        }
    }

    /// Replace this session with a saved session file
    ///
    /// The session is left as it was if the file cannot be read.
    pub fn import_data(&mut self, filepath: &Path) -> Result<()> {
        *self = Self::open(filepath)?;
        log::info!("Imported {:?}", filepath);
        Ok(())
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn log(&self) -> &[OperationRecord] {
        &self.log
    }

    pub fn can_undo(&self) -> bool {
        self.previous.is_some()
    }

    /// The rendered statements of every logged operation
    pub fn history(&self) -> Vec<String> {
        self.log.iter().map(|r| r.to_string()).collect()
    }

    /// Render the log as a script that reproduces the current state from a fresh import
    pub fn replay_script(&self) -> String {
        let mut script = NEW_SESSION_STATEMENT.to_string() + "\n";
        for line in self.history() {
            script += &line;
            script += "\n";
        }
        script
    }

    /// Write the replay script to a file
    pub fn write_history(&self, filepath: &Path) -> Result<()> {
        std::fs::write(filepath, self.replay_script())?;
        Ok(())
    }

    fn log_event(&self, record: &OperationRecord, start_time: SystemTime) {
        log::info!(
            "{} (duration: {:.2}s)",
            record,
            SystemTime::now()
                .duration_since(start_time)
                .unwrap_or_default()
                .as_secs_f32()
        );
    }

    /// Install a new profile, keeping the current one as the undo snapshot
    fn commit(&mut self, profile: Profile, record: OperationRecord, start_time: SystemTime) {
        let old_profile = std::mem::replace(&mut self.profile, profile);
        self.log.push(record.clone());
        self.previous = Some(Snapshot {
            profile: old_profile,
            log: self.log.clone(),
        });
        self.log_event(&record, start_time);
    }

    /// Log an operation that does not change the profile
    fn commit_log_only(&mut self, record: OperationRecord, start_time: SystemTime) {
        self.log.push(record.clone());
        self.log_event(&record, start_time);
    }

    fn ensure_uncorrected(&self, step_name: &str) -> Result<()> {
        match self.profile.is_topo_corrected() {
            true => Err(GprError::InvalidState(format!(
                "{step_name} cannot be run after topographic correction. Undo the correction first."
            ))),
            false => Ok(()),
        }
    }

    /// Restore the state before the last mutating operation
    ///
    /// Only one level is kept: calling undo twice in a row restores the same state twice.
    pub fn undo(&mut self) -> Result<()> {
        let previous = self.previous.as_ref().ok_or(GprError::NothingToUndo)?;

        self.profile = previous.profile.clone();
        let mut log = previous.log.clone();
        log.pop();
        self.log = log;
        log::info!("undo");
        Ok(())
    }

    /// Set new evenly spaced trace positions, e.g. if the trigger wheel was not calibrated
    pub fn set_range(&mut self, min_pos: f64, max_pos: f64) -> Result<()> {
        let start_time = SystemTime::now();
        if !(min_pos.is_finite() & max_pos.is_finite()) {
            return Err(GprError::Precondition(format!(
                "The range must be finite. Got {min_pos}-{max_pos}"
            )));
        };
        let mut profile = self.profile.clone();
        profile.position_axis = Array1::linspace(min_pos, max_pos, profile.width());

        self.commit(
            profile,
            OperationRecord::new("set_range")
                .arg(Value::Float(min_pos))
                .arg(Value::Float(max_pos)),
            start_time,
        );
        Ok(())
    }

    /// Align the traces on their strongest return
    pub fn time_zero_adjust(&mut self) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("time_zero_adjust")?;

        let mut profile = self.profile.clone();
        profile.data = filters::align_traces(&self.profile.data);

        self.commit(profile, OperationRecord::new("time_zero_adjust"), start_time);
        Ok(())
    }

    /// Set a new time-zero, removing every sample before it
    pub fn set_zero_time(&mut self, new_zero_time: f64) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("set_zero_time")?;

        let zero_index = tools::nearest_index(self.profile.time_axis.view(), new_zero_time)?;

        let mut profile = self.profile.clone();
        profile.time_axis = self
            .profile
            .time_axis
            .slice(s![zero_index..])
            .mapv(|t| t - new_zero_time);
        profile.data = self.profile.data.slice(s![zero_index.., ..]).to_owned();
        profile.update_depth();

        self.commit(
            profile,
            OperationRecord::new("set_zero_time").arg(Value::Float(new_zero_time)),
            start_time,
        );
        Ok(())
    }

    pub fn dewow(&mut self, window: usize) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("dewow")?;

        let mut profile = self.profile.clone();
        profile.data = filters::dewow(&self.profile.data, window)?;

        self.commit(
            profile,
            OperationRecord::new("dewow").arg(Value::Int(window as i64)),
            start_time,
        );
        Ok(())
    }

    pub fn rem_mean_trace(&mut self, ntraces: usize) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("rem_mean_trace")?;

        let mut profile = self.profile.clone();
        profile.data = filters::rem_mean_trace(&self.profile.data, ntraces)?;

        self.commit(
            profile,
            OperationRecord::new("rem_mean_trace").arg(Value::Int(ntraces as i64)),
            start_time,
        );
        Ok(())
    }

    pub fn tpow_gain(&mut self, power: f64) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("tpow_gain")?;

        let mut profile = self.profile.clone();
        profile.data = filters::tpow_gain(&self.profile.data, &self.profile.time_axis, power)?;

        self.commit(
            profile,
            OperationRecord::new("tpow_gain").arg(Value::Float(power)),
            start_time,
        );
        Ok(())
    }

    pub fn agc_gain(&mut self, window: usize) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("agc_gain")?;

        let mut profile = self.profile.clone();
        profile.data = filters::agc_gain(&self.profile.data, window)?;

        self.commit(
            profile,
            OperationRecord::new("agc_gain").arg(Value::Int(window as i64)),
            start_time,
        );
        Ok(())
    }

    /// Set the medium velocity (m/ns), which enables the depth axis
    pub fn set_velocity(&mut self, velocity: f64) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("set_velocity")?;
        if !velocity.is_finite() || velocity <= 0. {
            return Err(GprError::Precondition(format!(
                "The velocity must be a positive number. Got {velocity}"
            )));
        };

        let mut profile = self.profile.clone();
        profile.velocity = Some(velocity);
        profile.update_depth();

        self.commit(
            profile,
            OperationRecord::new("set_velocity").arg(Value::Float(velocity)),
            start_time,
        );
        Ok(())
    }

    /// Remove every sample below the given maximum
    ///
    /// The maximum is a depth (m) if a velocity is set, otherwise a time (ns). The cut is made at
    /// the sample nearest to it, which is itself excluded.
    pub fn truncate_y(&mut self, max_y: f64) -> Result<()> {
        let start_time = SystemTime::now();
        self.ensure_uncorrected("truncate_y")?;

        let max_time = match self.profile.velocity {
            Some(velocity) => max_y * 2. / velocity,
            None => max_y,
        };
        let max_index = tools::nearest_index(self.profile.time_axis.view(), max_time)?;
        if max_index == 0 {
            return Err(GprError::Precondition(format!(
                "Truncating at {max_y} would remove every sample"
            )));
        };

        let mut profile = self.profile.clone();
        profile.time_axis = self.profile.time_axis.slice(s![..max_index]).to_owned();
        profile.data = self.profile.data.slice(s![..max_index, ..]).to_owned();
        profile.depth_axis = self
            .profile
            .depth_axis
            .as_ref()
            .map(|depth| depth.slice(s![..max_index]).to_owned());

        self.commit(
            profile,
            OperationRecord::new("truncate_y").arg(Value::Float(max_y)),
            start_time,
        );
        Ok(())
    }

    /// Correct the profile for surface topography read from a delimited file
    ///
    /// See [topo::correct_topography] for the algorithm.
    pub fn topo_correct(&mut self, topofile: &Path, delimiter: Delimiter) -> Result<()> {
        let start_time = SystemTime::now();
        if self.profile.velocity.is_none() {
            return Err(GprError::Precondition(
                "velocity not set. The velocity is needed to convert elevations to travel times"
                    .into(),
            ));
        };
        self.ensure_uncorrected("topo_correct")?;

        let samples = io::load_topography(topofile, delimiter)?;
        let correction = topo::correct_topography(&self.profile, &samples)?;

        let mut profile = self.profile.clone();
        profile.pre_correction_data = Some(std::mem::replace(&mut profile.data, correction.data));
        profile.time_axis = correction.time_axis;
        profile.max_elevation = Some(correction.max_elevation);
        profile.is_3d = correction.is_3d;
        profile.update_depth();

        self.commit(
            profile,
            OperationRecord::new("topo_correct")
                .arg(Value::Str(topofile.to_string_lossy().to_string()))
                .arg(Value::Word(delimiter.to_string())),
            start_time,
        );
        Ok(())
    }

    /// Build the ribbon mesh of the profile and hand it to a mesh writer
    ///
    /// # Arguments
    /// - `writer`: The writer to hand the mesh to
    /// - `outfile`: The output filepath given to the writer
    /// - `track_file`: Optional delimited file of x,y[,z] coordinates of the profile
    /// - `params`: Mesh thickness, vertical exaggeration and smoothing parameters
    ///
    /// # Returns
    /// The path that the writer wrote to
    pub fn export_mesh(
        &mut self,
        writer: &dyn MeshWriter,
        outfile: &Path,
        track_file: Option<(&Path, Delimiter)>,
        params: &MeshParams,
    ) -> Result<PathBuf> {
        let start_time = SystemTime::now();

        let track = match track_file {
            Some((filepath, delimiter)) => Some(io::load_track(filepath, delimiter)?),
            None => None,
        };
        let ribbon = mesh::build_ribbon_mesh(&self.profile, track.as_deref(), params)?;
        let written = writer.write_mesh(&ribbon, outfile)?;

        let mut record = OperationRecord::new("export_vtk")
            .arg(Value::Str(outfile.to_string_lossy().to_string()));
        if let Some((filepath, delimiter)) = track_file {
            record = record
                .kwarg("gpsfile", Value::Str(filepath.to_string_lossy().to_string()))
                .kwarg("delimiter", Value::Word(delimiter.to_string()));
        };
        record = record
            .kwarg("thickness", Value::Float(params.thickness))
            .kwarg("aspect", Value::Float(params.aspect))
            .kwarg("smooth", Value::Bool(params.smooth))
            .kwarg("win_length", Value::Int(params.win_length as i64))
            .kwarg("porder", Value::Int(params.porder as i64));

        self.commit_log_only(record, start_time);
        Ok(written)
    }

    /// Export the ribbon mesh as a VTK structured grid (".vts")
    pub fn export_vtk(
        &mut self,
        outfile: &Path,
        track_file: Option<(&Path, Delimiter)>,
        params: &MeshParams,
    ) -> Result<PathBuf> {
        self.export_mesh(&io::VtsWriter, outfile, track_file, params)
    }

    /// Save the session to a ".gpr" file (the extension is appended if missing)
    ///
    /// The save itself is logged after writing, so the saved log does not contain it.
    pub fn save(&mut self, filepath: &Path) -> Result<PathBuf> {
        let start_time = SystemTime::now();
        let filepath = match filepath.extension().and_then(|e| e.to_str()) {
            Some("gpr") => filepath.to_path_buf(),
            _ => {
                let mut name = filepath.as_os_str().to_owned();
                name.push(".gpr");
                PathBuf::from(name)
            }
        };

        io::save_session(&filepath, &self.profile, &self.log)?;
        self.commit_log_only(
            OperationRecord::new("save").arg(Value::Str(filepath.to_string_lossy().to_string())),
            start_time,
        );
        Ok(filepath)
    }

    /// Parse and run one step statement, e.g. "dewow(5)"
    pub fn process(&mut self, step: &str) -> Result<()> {
        let record = OperationRecord::parse(step)?;
        self.apply(&record)
    }

    /// Run every statement of a replay script or step file
    ///
    /// Blank lines and lines starting with '#' are skipped. The script must be run against a
    /// fresh import of the profile it was written from; its `new_session()` header is accepted
    /// as the first statement only.
    pub fn run_script(&mut self, script: &str) -> Result<()> {
        let statements = script
            .lines()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && !s.starts_with('#'));

        for (i, statement) in statements.enumerate() {
            if statement.replace(' ', "") == NEW_SESSION_STATEMENT {
                if i != 0 {
                    return Err(GprError::Parse(format!(
                        "{NEW_SESSION_STATEMENT} is only allowed as the first statement"
                    )));
                };
                continue;
            };
            self.process(statement)?;
        }
        Ok(())
    }

    fn apply(&mut self, record: &OperationRecord) -> Result<()> {
        match record.name.as_str() {
            "set_range" => self.set_range(
                required(float_arg(record, Some(0), "min_pos")?, record, "min_pos")?,
                required(float_arg(record, Some(1), "max_pos")?, record, "max_pos")?,
            ),
            "time_zero_adjust" => self.time_zero_adjust(),
            "set_zero_time" => self.set_zero_time(required(
                float_arg(record, Some(0), "new_zero_time")?,
                record,
                "new_zero_time",
            )?),
            "dewow" => self.dewow(
                usize_arg(record, Some(0), "window")?.unwrap_or(DEFAULT_DEWOW_WINDOW),
            ),
            "rem_mean_trace" => self.rem_mean_trace(required(
                usize_arg(record, Some(0), "ntraces")?,
                record,
                "ntraces",
            )?),
            "tpow_gain" => {
                self.tpow_gain(float_arg(record, Some(0), "power")?.unwrap_or(DEFAULT_TPOW_POWER))
            }
            "agc_gain" => {
                self.agc_gain(usize_arg(record, Some(0), "window")?.unwrap_or(DEFAULT_AGC_WINDOW))
            }
            "set_velocity" => self.set_velocity(required(
                float_arg(record, Some(0), "velocity")?,
                record,
                "velocity",
            )?),
            "truncate_y" => self.truncate_y(required(
                float_arg(record, Some(0), "max_y")?,
                record,
                "max_y",
            )?),
            "topo_correct" => {
                let topofile = required(str_arg(record, Some(0), "topofile")?, record, "topofile")?;
                let delimiter = delimiter_arg(record, Some(1))?;
                self.topo_correct(Path::new(topofile), delimiter)
            }
            "export_vtk" => {
                let outfile = required(str_arg(record, Some(0), "outfile")?, record, "outfile")?;
                let gpsfile = str_arg(record, None, "gpsfile")?;
                let delimiter = delimiter_arg(record, None)?;

                let defaults = MeshParams::default();
                let params = MeshParams {
                    thickness: float_arg(record, None, "thickness")?.unwrap_or(defaults.thickness),
                    aspect: float_arg(record, None, "aspect")?.unwrap_or(defaults.aspect),
                    smooth: bool_arg(record, None, "smooth")?.unwrap_or(defaults.smooth),
                    win_length: usize_arg(record, None, "win_length")?
                        .unwrap_or(defaults.win_length),
                    porder: usize_arg(record, None, "porder")?.unwrap_or(defaults.porder),
                };
                self.export_vtk(
                    Path::new(outfile),
                    gpsfile.map(|p| (Path::new(p), delimiter)),
                    &params,
                )
                .map(|_| ())
            }
            "save" => {
                let filepath = required(str_arg(record, Some(0), "filepath")?, record, "filepath")?;
                self.save(Path::new(filepath)).map(|_| ())
            }
            "undo" => self.undo(),
            name => Err(GprError::Parse(format!("Step name not recognized: {}", name))),
        }
    }
}

/// Find an argument by keyword, or else by its positional index
fn find_argument<'a>(
    record: &'a OperationRecord,
    index: Option<usize>,
    key: &str,
) -> Option<&'a Value> {
    record
        .keyword(key)
        .or_else(|| index.and_then(|i| record.positional(i)))
}

fn typed_argument<'a, T>(
    record: &'a OperationRecord,
    index: Option<usize>,
    key: &str,
    convert: fn(&'a Value) -> Option<T>,
    type_name: &str,
) -> Result<Option<T>> {
    match find_argument(record, index, key) {
        None => Ok(None),
        Some(value) => convert(value).map(Some).ok_or_else(|| {
            GprError::Parse(format!(
                "Argument '{key}' of {record} should be {type_name}. Got: {value}"
            ))
        }),
    }
}

fn float_arg(record: &OperationRecord, index: Option<usize>, key: &str) -> Result<Option<f64>> {
    typed_argument(record, index, key, Value::as_f64, "a number")
}

fn usize_arg(record: &OperationRecord, index: Option<usize>, key: &str) -> Result<Option<usize>> {
    typed_argument(record, index, key, Value::as_usize, "a positive integer")
}

fn bool_arg(record: &OperationRecord, index: Option<usize>, key: &str) -> Result<Option<bool>> {
    typed_argument(record, index, key, Value::as_bool, "true or false")
}

fn str_arg<'a>(
    record: &'a OperationRecord,
    index: Option<usize>,
    key: &str,
) -> Result<Option<&'a str>> {
    typed_argument(record, index, key, Value::as_str, "a string")
}

fn delimiter_arg(record: &OperationRecord, index: Option<usize>) -> Result<Delimiter> {
    match str_arg(record, index, "delimiter")? {
        Some(s) => s.parse(),
        None => Ok(Delimiter::default()),
    }
}

fn required<T>(value: Option<T>, record: &OperationRecord, key: &str) -> Result<T> {
    value.ok_or_else(|| GprError::Parse(format!("Argument '{key}' missing in {record}")))
}

/// Parameters of a command line run
#[derive(Debug)]
pub struct RunParams {
    pub filepath: PathBuf,
    pub steps: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub history_path: Option<PathBuf>,
    pub only_info: bool,
    pub quiet: bool,
}

/// Run a session from start to end with the given parameters
pub fn run(params: RunParams) -> Result<()> {
    let mut session = ProfileSession::open(&params.filepath)?;

    if params.only_info {
        println!("{}", session.profile());
        println!("History\n-------");
        for line in session.history() {
            println!("{}", line);
        }
        return Ok(());
    };

    if !params.quiet {
        println!("Processing {:?}", params.filepath);
    };
    session.run_script(&params.steps.join("\n"))?;

    if let Some(output_path) = &params.output_path {
        let written = session.save(output_path)?;
        if !params.quiet {
            println!("Saved {:?}", written);
        };
    };
    if let Some(history_path) = &params.history_path {
        session.write_history(history_path)?;
    };
    if !params.quiet {
        println!("{}", session.profile());
    };
    Ok(())
}

pub fn all_available_steps() -> Vec<[&'static str; 2]> {
    vec![
        ["set_range", "Set new evenly spaced trace positions between a start and end position, e.g. if the trigger wheel was not calibrated. Example: set_range(0 25.5). Can be run after topographic correction."],
        ["time_zero_adjust", "Align all traces on their strongest return. Each trace is shifted so that its peak amplitude lands on the mean peak sample."],
        ["set_zero_time", "Set a new time-zero (ns) and remove every sample before it. Example: set_zero_time(5.2)"],
        ["dewow", "Subtract the running vertical mean of each trace to remove low-frequency 'wow'. The window can be set, e.g. 'dewow(10)'. Default: 5"],
        ["rem_mean_trace", "Subtract the running mean trace along the profile to remove horizontal banding. The number of traces must be given, e.g. rem_mean_trace(20)."],
        ["tpow_gain", "Multiply each sample by its travel time to a power, e.g. tpow_gain(1.5). Default: 0"],
        ["agc_gain", "Automatic gain control: divide each sample by the energy of a window around it, e.g. agc_gain(20). Default: 10"],
        ["set_velocity", "Set the medium velocity in m/ns, which converts the vertical axis to depth. Example: set_velocity(0.1)"],
        ["truncate_y", "Remove every sample below a maximum depth (m), or time (ns) if no velocity is set. Example: truncate_y(5)"],
        ["topo_correct", "Correct for surface topography from a delimited file of position,elevation / x,y,elevation / position,x,y,elevation rows. A velocity must be set. Example: topo_correct('topo.csv' comma)"],
        ["export_vtk", "Export the profile as a 3D ribbon mesh (VTK structured grid). Example: export_vtk('profile' gpsfile='track.txt' delimiter=tab thickness=0.1 aspect=1.0 smooth=true win_length=51 porder=3)"],
        ["save", "Save the session to a .gpr file. Example: save('processed.gpr')"],
        ["undo", "Restore the state before the last processing step. Only one step can be undone."],
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use ndarray::{Array1, Array2};

    use super::Profile;

    /// A profile of `height` samples (1 ns apart) and `width` traces (1 m apart)
    pub fn synthetic_profile(height: usize, width: usize) -> Profile {
        let data = Array2::from_shape_fn((height, width), |(row, col)| {
            ((row as f32) * 0.3).sin() * (1. + col as f32 * 0.1) + 0.01 * row as f32
        });
        Profile::new(
            data,
            Array1::linspace(0., (width - 1) as f64, width),
            Array1::linspace(0., (height - 1) as f64, height),
        )
        .unwrap()
    }

    /// Check for equality, letting NaN equal NaN
    pub fn arrays_equal<'a, T, I>(first: I, second: I) -> bool
    where
        T: 'a + PartialEq + Copy + Into<f64>,
        I: IntoIterator<Item = &'a T>,
    {
        let first = first.into_iter().collect::<Vec<&T>>();
        let second = second.into_iter().collect::<Vec<&T>>();

        (first.len() == second.len())
            & first.iter().zip(second.iter()).all(|(a, b)| {
                let (a, b): (f64, f64) = ((**a).into(), (**b).into());
                (a == b) | (a.is_nan() & b.is_nan())
            })
    }

    pub fn assert_profiles_equal(first: &Profile, second: &Profile) {
        assert_eq!(first.data.shape(), second.data.shape());
        assert!(arrays_equal(&first.data, &second.data));
        assert_eq!(first.time_axis, second.time_axis);
        assert_eq!(first.position_axis, second.position_axis);
        assert_eq!(first.velocity, second.velocity);
        assert_eq!(first.depth_axis, second.depth_axis);
        assert_eq!(first.max_elevation, second.max_elevation);
        assert_eq!(
            first.pre_correction_data.is_some(),
            second.pre_correction_data.is_some()
        );
        if let (Some(a), Some(b)) = (&first.pre_correction_data, &second.pre_correction_data) {
            assert!(arrays_equal(a, b));
        };
        assert_eq!(first.is_3d, second.is_3d);
    }

    pub fn assert_shape_invariant(profile: &Profile) {
        assert_eq!(profile.data.nrows(), profile.time_axis.len());
        assert_eq!(profile.data.ncols(), profile.position_axis.len());
        if let Some(depth) = &profile.depth_axis {
            assert_eq!(depth.len(), profile.time_axis.len());
        };
        assert_eq!(profile.velocity.is_some(), profile.depth_axis.is_some());
        assert_eq!(
            profile.max_elevation.is_some(),
            profile.pre_correction_data.is_some()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ndarray::{array, Array1, Array2};

    use super::testing::{assert_profiles_equal, assert_shape_invariant, synthetic_profile};
    use super::{Profile, ProfileHeader, ProfileSession, RawAxes, RawProfile};
    use crate::error::GprError;
    use crate::io::Delimiter;
    use crate::mesh::{MeshParams, MeshWriter, RibbonMesh};

    fn write_topo(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("topo.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_profile_validation() {
        let data = Array2::<f32>::zeros((3, 2));

        assert!(Profile::new(data.clone(), array![0., 1.], array![0., 1., 2.]).is_ok());
        assert!(matches!(
            Profile::new(data.clone(), array![0., 1., 2.], array![0., 1., 2.]),
            Err(GprError::ShapeMismatch(_))
        ));
        assert!(matches!(
            Profile::new(data.clone(), array![0., 1.], array![0., 1.]),
            Err(GprError::ShapeMismatch(_))
        ));
        assert!(matches!(
            Profile::new(data.clone(), array![0., 1.], array![0., 2., 1.]),
            Err(GprError::DegenerateAxis(_))
        ));
        assert!(matches!(
            Profile::new(Array2::zeros((0, 2)), array![0., 1.], Array1::zeros(0)),
            Err(GprError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_from_header() {
        let header = ProfileHeader {
            start_position: 10.,
            final_position: 0.,
            time_zero: -2.,
            time_window: 8.,
        };
        let profile = Profile::from_header(Array2::zeros((6, 3)), &header).unwrap();

        assert_eq!(profile.position_axis(), &array![10., 5., 0.]);
        assert_eq!(profile.time_axis(), &array![-2., 0., 2., 4., 6., 8.]);
        assert_eq!(profile.time_interval().unwrap(), 2.);
        assert!(profile.to_string().contains("Traces (width):\t\t3"));

        let session = ProfileSession::from_raw(RawProfile {
            data: Array2::zeros((6, 3)),
            axes: RawAxes::Header(header),
        })
        .unwrap();
        assert_eq!(session.profile().time_axis(), profile.time_axis());
        assert!(session.log().is_empty());
        assert!(!session.can_undo());

        assert!(matches!(
            ProfileSession::from_raw(RawProfile {
                data: Array2::zeros((6, 3)),
                axes: RawAxes::Explicit {
                    position_axis: array![0., 1., 2.],
                    time_axis: array![0., 1.],
                },
            }),
            Err(GprError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_undo_single_level() {
        let mut session = ProfileSession::new(synthetic_profile(50, 8));
        assert!(matches!(session.undo(), Err(GprError::NothingToUndo)));

        let s0 = session.profile().clone();
        session.dewow(3).unwrap();
        let s1 = session.profile().clone();
        assert_ne!(s0.data(), s1.data());

        session.tpow_gain(1.).unwrap();
        assert_eq!(session.history(), vec!["dewow(3)", "tpow_gain(1.0)"]);

        session.undo().unwrap();
        assert_profiles_equal(session.profile(), &s1);
        assert_eq!(session.history(), vec!["dewow(3)"]);

        // A second undo restores the same state again, not s0
        session.undo().unwrap();
        assert_profiles_equal(session.profile(), &s1);
        assert_eq!(session.history(), vec!["dewow(3)"]);

        // A new operation replaces the snapshot
        session.set_velocity(0.1).unwrap();
        session.undo().unwrap();
        assert_profiles_equal(session.profile(), &s1);
        assert_eq!(session.profile().velocity(), None);
    }

    #[test]
    fn test_undo_first_operation() {
        let mut session = ProfileSession::new(synthetic_profile(20, 4));
        let s0 = session.profile().clone();

        session.rem_mean_trace(2).unwrap();
        session.undo().unwrap();

        assert_profiles_equal(session.profile(), &s0);
        assert!(session.log().is_empty());
    }

    #[test]
    fn test_failures_are_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let topo = write_topo(dir.path(), "0,10\n3,12\n");

        let mut session = ProfileSession::new(synthetic_profile(20, 4));
        let s0 = session.profile().clone();

        match session.topo_correct(&topo, Delimiter::Comma) {
            Err(GprError::Precondition(message)) => assert!(message.contains("velocity not set")),
            other => panic!("Expected a precondition error, got {other:?}"),
        };
        assert!(session.dewow(0).is_err());
        assert!(session.set_velocity(-1.).is_err());
        assert!(session.truncate_y(-100.).is_err());
        assert!(session.process("not_a_step(1)").is_err());
        assert!(session.process("dewow('five')").is_err());

        assert_profiles_equal(session.profile(), &s0);
        assert!(session.log().is_empty());
        assert!(!session.can_undo());

        // A failed operation does not replace the snapshot either
        session.dewow(2).unwrap();
        let s1 = session.profile().clone();
        assert!(session.topo_correct(&dir.path().join("missing.csv"), Delimiter::Comma).is_err());
        session.set_velocity(0.1).unwrap();
        assert!(session.topo_correct(&dir.path().join("missing.csv"), Delimiter::Comma).is_err());
        session.undo().unwrap();
        assert_profiles_equal(session.profile(), &s1);
    }

    #[test]
    fn test_failed_topo_correct_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let single_row = dir.path().join("single.csv");
        std::fs::write(&single_row, "0,10\n").unwrap();
        let duplicates = dir.path().join("duplicates.csv");
        std::fs::write(&duplicates, "0,10\n1,11\n1,12\n").unwrap();

        let mut session = ProfileSession::new(synthetic_profile(20, 4));
        session.set_velocity(0.1).unwrap();
        session.dewow(2).unwrap();
        let current = session.profile().clone();
        let log = session.history();

        let failures = [
            session.topo_correct(&single_row, Delimiter::Comma),
            session.topo_correct(&duplicates, Delimiter::Comma),
        ];
        assert!(matches!(failures[0], Err(GprError::InsufficientData(_))));
        assert!(matches!(failures[1], Err(GprError::DegenerateAxis(_))));

        // A velocity typo shifts the traces too far and is rejected as well
        session.set_velocity(1e-300).unwrap();
        let before_typo = session.profile().clone();
        let typo_log = session.history();
        assert!(matches!(
            session.topo_correct(&write_topo(dir.path(), "0,10\n3,12\n"), Delimiter::Comma),
            Err(GprError::Precondition(_))
        ));
        assert_profiles_equal(session.profile(), &before_typo);
        assert_eq!(session.history(), typo_log);

        // The snapshot is still the one taken before the velocity typo
        session.undo().unwrap();
        assert_profiles_equal(session.profile(), &current);
        assert_eq!(session.history(), log);
        assert!(!session.profile().is_topo_corrected());
    }

    #[test]
    fn test_truncate_y() {
        let mut session = ProfileSession::new(synthetic_profile(200, 3));

        session.set_velocity(0.1).unwrap();
        session.truncate_y(5.).unwrap();

        let profile = session.profile();
        // 5 m * 2 / 0.1 m/ns = 100 ns, which is at index 100 (excluded)
        assert_eq!(profile.height(), 100);
        assert_eq!(profile.time_axis()[99], 99.);
        assert_eq!(profile.depth_axis().unwrap().len(), 100);
        assert_shape_invariant(profile);

        // Without a velocity, the maximum is a time
        let mut session = ProfileSession::new(synthetic_profile(200, 3));
        session.truncate_y(50.).unwrap();
        assert_eq!(session.profile().height(), 50);
        assert_shape_invariant(session.profile());
    }

    #[test]
    fn test_set_zero_time() {
        let mut session = ProfileSession::new(synthetic_profile(10, 3));
        session.set_velocity(0.2).unwrap();
        let original = session.profile().data().clone();

        session.set_zero_time(3.).unwrap();

        let profile = session.profile();
        assert_eq!(profile.height(), 7);
        assert_eq!(profile.time_axis()[0], 0.);
        assert_eq!(profile.time_axis()[6], 6.);
        assert!((profile.depth_axis().unwrap()[6] - 0.6).abs() < 1e-12);
        assert_eq!(profile.data().row(0), original.row(3));
        assert_shape_invariant(profile);
        assert_eq!(session.history(), vec!["set_velocity(0.2)", "set_zero_time(3.0)"]);
    }

    #[test]
    fn test_set_range() {
        let mut session = ProfileSession::new(synthetic_profile(10, 5));
        session.set_range(8., 0.).unwrap();
        assert_eq!(session.profile().position_axis(), &array![8., 6., 4., 2., 0.]);
        assert!(session.set_range(f64::NAN, 1.).is_err());
    }

    #[test]
    fn test_topo_correct_state() {
        let dir = tempfile::tempdir().unwrap();
        let topo = write_topo(dir.path(), "0,10\n3,12\n");

        let mut session = ProfileSession::new(synthetic_profile(100, 4));
        session.set_velocity(0.1).unwrap();
        let before = session.profile().clone();
        session.topo_correct(&topo, Delimiter::Comma).unwrap();

        let profile = session.profile();
        assert_shape_invariant(profile);
        assert_eq!(profile.max_elevation(), Some(12.));
        assert_eq!(profile.pre_correction_data(), Some(before.data()));
        assert_eq!(profile.height(), 140);
        assert!(!profile.is_3d());
        assert_eq!(
            session.history().last().unwrap(),
            &format!("topo_correct('{}' comma)", topo.to_string_lossy())
        );

        // Data-changing steps are now refused, but the range can still be set
        for step in ["dewow(3)", "set_velocity(0.2)", "truncate_y(1)", "time_zero_adjust"] {
            assert!(matches!(session.process(step), Err(GprError::InvalidState(_))), "{step}");
        }
        match session.topo_correct(&topo, Delimiter::Comma) {
            Err(GprError::InvalidState(_)) => (),
            other => panic!("Expected an invalid state error, got {other:?}"),
        };
        session.set_range(0., 30.).unwrap();
        assert_eq!(session.profile().max_elevation(), Some(12.));

        session.undo().unwrap();
        session.undo().unwrap();
        assert_eq!(session.profile().max_elevation(), Some(12.));
        assert_eq!(session.profile().position_axis()[3], 3.);
    }

    #[test]
    fn test_shape_invariant_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let topo = write_topo(dir.path(), "pos,elev\n-1,5\n2,4.5\n5,7\n");

        let mut session = ProfileSession::new(synthetic_profile(120, 6));
        let steps = [
            "time_zero_adjust",
            "set_zero_time(4.5)",
            "dewow(7)",
            "rem_mean_trace(3)",
            "tpow_gain(1.2)",
            "agc_gain(15)",
            "set_velocity(0.12)",
            "truncate_y(5.4)",
            "set_range(0 5)",
        ];
        for step in steps {
            session.process(step).unwrap();
            assert_shape_invariant(session.profile());
        }
        session
            .process(&format!("topo_correct('{}')", topo.to_string_lossy()))
            .unwrap();
        assert_shape_invariant(session.profile());
        assert_eq!(session.log().len(), steps.len() + 1);
    }

    #[test]
    fn test_replay_reproduces_state() {
        let dir = tempfile::tempdir().unwrap();
        let topo = write_topo(dir.path(), "0\t10\n3\t12.5\n");

        let raw = synthetic_profile(80, 4);
        let mut session = ProfileSession::new(raw.clone());
        session.dewow(4).unwrap();
        session.tpow_gain(0.7).unwrap();
        session.agc_gain(9).unwrap();
        session.rem_mean_trace(1).unwrap();
        // This one is undone, so it should not be replayed
        session.set_velocity(0.3).unwrap();
        session.undo().unwrap();
        session.set_velocity(0.1 + 0.2).unwrap();
        session.topo_correct(&topo, Delimiter::Tab).unwrap();
        session.set_range(3., 0.).unwrap();

        let history_path = dir.path().join("history.txt");
        session.write_history(&history_path).unwrap();
        let script = std::fs::read_to_string(&history_path).unwrap();
        assert!(script.starts_with("new_session()\n"));
        assert_eq!(script.lines().count(), 8);

        let mut replayed = ProfileSession::new(raw);
        replayed.run_script(&script).unwrap();

        assert_profiles_equal(replayed.profile(), session.profile());
        assert_eq!(replayed.history(), session.history());

        // The header is only valid at the top
        let mut other = ProfileSession::new(synthetic_profile(10, 2));
        assert!(other.run_script("dewow(2)\nnew_session()\n").is_err());
    }

    #[test]
    fn test_save_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let topo = write_topo(dir.path(), "0,10\n3,12\n");

        let mut session = ProfileSession::new(synthetic_profile(30, 4));
        session.set_velocity(0.1).unwrap();
        session.topo_correct(&topo, Delimiter::Comma).unwrap();

        let saved = session.save(&dir.path().join("profile")).unwrap();
        assert_eq!(saved, dir.path().join("profile.gpr"));
        assert!(session.history().last().unwrap().starts_with("save("));

        let opened = ProfileSession::open(&saved).unwrap();
        assert_profiles_equal(opened.profile(), session.profile());
        // The save itself is logged after writing
        assert_eq!(opened.history().len(), session.history().len() - 1);
        assert!(!opened.can_undo());

        let mut other = ProfileSession::new(synthetic_profile(5, 2));
        let before = other.profile().clone();
        assert!(matches!(
            other.import_data(&dir.path().join("profile.DT1")),
            Err(GprError::UnsupportedFormat(_))
        ));
        assert_profiles_equal(other.profile(), &before);

        other.import_data(&saved).unwrap();
        assert_profiles_equal(other.profile(), session.profile());
    }

    struct CaptureWriter {
        dims: std::cell::RefCell<Option<(usize, usize, usize)>>,
    }

    impl MeshWriter for CaptureWriter {
        fn write_mesh(
            &self,
            mesh: &RibbonMesh,
            path: &Path,
        ) -> crate::error::Result<std::path::PathBuf> {
            *self.dims.borrow_mut() = Some(mesh.cells.dim());
            Ok(path.to_path_buf())
        }
    }

    #[test]
    fn test_export_mesh_is_logged() {
        let mut session = ProfileSession::new(synthetic_profile(30, 5));
        session.set_velocity(0.1).unwrap();
        let writer = CaptureWriter {
            dims: std::cell::RefCell::new(None),
        };

        let params = MeshParams {
            thickness: 0.2,
            ..Default::default()
        };
        session
            .export_mesh(&writer, Path::new("out/profile"), None, &params)
            .unwrap();

        assert_eq!(*writer.dims.borrow(), Some((2, 4, 29)));
        assert_eq!(
            session.history().last().unwrap(),
            "export_vtk('out/profile' thickness=0.2 aspect=1.0 smooth=true win_length=51 porder=3)"
        );
        // Exporting does not touch the undo snapshot
        session.undo().unwrap();
        assert_eq!(session.profile().velocity(), None);
        assert!(session.log().is_empty());
    }

    #[test]
    fn test_export_vtk_step() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("track.csv");
        std::fs::write(&track, "0,0,100\n1,1,101\n2,2,102\n3,3,103\n").unwrap();
        let outfile = dir.path().join("mesh");

        let mut session = ProfileSession::new(synthetic_profile(10, 4));
        session
            .process(&format!(
                "export_vtk('{}' gpsfile='{}' delimiter=comma smooth=false aspect=2)",
                outfile.to_string_lossy(),
                track.to_string_lossy()
            ))
            .unwrap();

        assert!(dir.path().join("mesh.vts").is_file());
        assert!(session
            .history()
            .last()
            .unwrap()
            .contains("delimiter=comma thickness=0.1 aspect=2.0 smooth=false"));
    }
}
