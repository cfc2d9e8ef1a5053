use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GprError, Result};
use crate::gpr::Profile;
use crate::history::OperationRecord;
use crate::mesh::{MeshWriter, RibbonMesh};
use crate::tools;
use crate::topo::TopoSample;

/// The column delimiter of a text file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delimiter {
    #[default]
    Comma,
    Tab,
}

impl Delimiter {
    pub fn as_char(&self) -> char {
        match self {
            Delimiter::Comma => ',',
            Delimiter::Tab => '\t',
        }
    }
}

impl std::fmt::Display for Delimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delimiter::Comma => write!(f, "comma"),
            Delimiter::Tab => write!(f, "tab"),
        }
    }
}

impl std::str::FromStr for Delimiter {
    type Err = GprError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "comma" | "," => Ok(Delimiter::Comma),
            "tab" | "\t" => Ok(Delimiter::Tab),
            other => Err(GprError::Parse(format!(
                "Unknown delimiter: '{other}'. Choices: comma, tab"
            ))),
        }
    }
}

/// Read the rows of a delimited text file of numbers
///
/// Blank lines and '#' comments are skipped. Rows that are not all finite numbers, or that have
/// another column count than the first valid row, are skipped with a warning.
fn read_delimited(
    filepath: &Path,
    delimiter: Delimiter,
    allowed_columns: &[usize],
) -> Result<Vec<Vec<f64>>> {
    let content = std::fs::read_to_string(filepath)?;

    let mut rows = Vec::<Vec<f64>>::new();
    let mut n_columns: Option<usize> = None;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        };

        let values = match line
            .split(delimiter.as_char())
            .map(|s| s.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
        {
            Ok(values) if values.iter().all(|v| v.is_finite()) => values,
            _ => {
                log::warn!("Skipping invalid row {} in {:?}: {:?}", i + 1, filepath, line);
                continue;
            }
        };

        match n_columns {
            None => {
                if !allowed_columns.contains(&values.len()) {
                    return Err(GprError::UnsupportedFormat(format!(
                        "{:?} has {} columns. Expected one of {:?}",
                        filepath,
                        values.len(),
                        allowed_columns
                    )));
                };
                n_columns = Some(values.len());
            }
            Some(n) if n != values.len() => {
                log::warn!(
                    "Skipping row {} in {:?}: {} columns instead of {}",
                    i + 1,
                    filepath,
                    values.len(),
                    n
                );
                continue;
            }
            Some(_) => (),
        };
        rows.push(values);
    }
    Ok(rows)
}

/// Load surface topography samples from a delimited text file
///
/// The rows can be `position,elevation`, `x,y,elevation` (where the position is the cumulative
/// horizontal distance along the points) or `position,x,y,elevation`.
pub fn load_topography(filepath: &Path, delimiter: Delimiter) -> Result<Vec<TopoSample>> {
    let rows = read_delimited(filepath, delimiter, &[2, 3, 4])?;

    let samples = match rows.first().map(|row| row.len()) {
        Some(3) => {
            let xy = rows.iter().map(|row| [row[0], row[1]]).collect::<Vec<[f64; 2]>>();
            tools::cumulative_distance(&xy)
                .into_iter()
                .zip(xy)
                .zip(&rows)
                .map(|((position, xy), row)| TopoSample {
                    position,
                    elevation: row[2],
                    xy: Some(xy),
                })
                .collect()
        }
        Some(4) => rows
            .iter()
            .map(|row| TopoSample {
                position: row[0],
                elevation: row[3],
                xy: Some([row[1], row[2]]),
            })
            .collect(),
        _ => rows
            .iter()
            .map(|row| TopoSample::new(row[0], row[1]))
            .collect::<Vec<TopoSample>>(),
    };
    log::debug!("Read {} topography samples from {:?}", samples.len(), filepath);
    Ok(samples)
}

/// Load the (x, y, z) track of a profile from a delimited text file of `x,y[,z]` rows
///
/// A missing z is set to zero.
pub fn load_track(filepath: &Path, delimiter: Delimiter) -> Result<Vec<[f64; 3]>> {
    let rows = read_delimited(filepath, delimiter, &[2, 3])?;

    Ok(rows
        .iter()
        .map(|row| [row[0], row[1], row.get(2).copied().unwrap_or(0.)])
        .collect())
}

#[derive(Serialize)]
struct SessionFileRef<'a> {
    program_version: String,
    processing_datetime: String,
    profile: &'a Profile,
    log: &'a [OperationRecord],
}

#[derive(Deserialize)]
struct SessionFile {
    program_version: String,
    processing_datetime: String,
    profile: Profile,
    log: Vec<OperationRecord>,
}

/// Save a profile and its operation log as a CBOR session file
pub fn save_session(filepath: &Path, profile: &Profile, log: &[OperationRecord]) -> Result<()> {
    let session = SessionFileRef {
        program_version: format!(
            "{} version {}, © {}",
            crate::PROGRAM_NAME,
            crate::PROGRAM_VERSION,
            crate::PROGRAM_AUTHORS
        ),
        processing_datetime: chrono::Local::now().to_rfc3339(),
        profile,
        log,
    };

    let mut writer = BufWriter::new(std::fs::File::create(filepath)?);
    ciborium::ser::into_writer(&session, &mut writer)
        .map_err(|e| GprError::Serialization(format!("{:?}", e)))?;
    writer.flush()?;
    Ok(())
}

/// Load a profile and its operation log from a CBOR session file
pub fn load_session(filepath: &Path) -> Result<(Profile, Vec<OperationRecord>)> {
    let reader = BufReader::new(std::fs::File::open(filepath)?);
    let session: SessionFile = ciborium::de::from_reader(reader)
        .map_err(|e| GprError::Serialization(format!("{:?}: {:?}", filepath, e)))?;

    session.profile.validate()?;
    log::debug!(
        "Loaded {:?} (written by {} at {})",
        filepath,
        session.program_version,
        session.processing_datetime
    );
    Ok((session.profile, session.log))
}

/// Writes ribbon meshes as ASCII VTK structured grids (".vts")
#[derive(Debug, Clone, Copy, Default)]
pub struct VtsWriter;

impl MeshWriter for VtsWriter {
    fn write_mesh(&self, mesh: &RibbonMesh, path: &Path) -> Result<PathBuf> {
        let filepath = match path.extension().and_then(|e| e.to_str()) {
            Some("vts") => path.to_path_buf(),
            _ => {
                let mut name = path.as_os_str().to_owned();
                name.push(".vts");
                PathBuf::from(name)
            }
        };
        let (nl, n, nz) = mesh.dimensions();
        let extent = format!("0 {} 0 {} 0 {}", nl - 1, n - 1, nz - 1);

        let mut file = BufWriter::new(std::fs::File::create(&filepath)?);
        writeln!(file, "<?xml version=\"1.0\"?>")?;
        writeln!(
            file,
            "<VTKFile type=\"StructuredGrid\" version=\"0.1\" byte_order=\"LittleEndian\">"
        )?;
        writeln!(file, "  <StructuredGrid WholeExtent=\"{}\">", extent)?;
        writeln!(file, "    <Piece Extent=\"{}\">", extent)?;

        // VTK wants the first index to vary fastest
        writeln!(file, "      <CellData Scalars=\"Amplitude\">")?;
        writeln!(
            file,
            "        <DataArray type=\"Float32\" Name=\"Amplitude\" format=\"ascii\">"
        )?;
        let (cl, cn, cz) = mesh.cells.dim();
        for k in 0..cz {
            for i in 0..cn {
                for l in 0..cl {
                    writeln!(file, "          {}", mesh.cells[[l, i, k]])?;
                }
            }
        }
        writeln!(file, "        </DataArray>")?;
        writeln!(file, "      </CellData>")?;

        writeln!(file, "      <Points>")?;
        writeln!(
            file,
            "        <DataArray type=\"Float64\" NumberOfComponents=\"3\" format=\"ascii\">"
        )?;
        for k in 0..nz {
            for i in 0..n {
                for l in 0..nl {
                    writeln!(
                        file,
                        "          {} {} {}",
                        mesh.x[[l, i, k]],
                        mesh.y[[l, i, k]],
                        mesh.z[[l, i, k]]
                    )?;
                }
            }
        }
        writeln!(file, "        </DataArray>")?;
        writeln!(file, "      </Points>")?;
        writeln!(file, "    </Piece>")?;
        writeln!(file, "  </StructuredGrid>")?;
        writeln!(file, "</VTKFile>")?;
        file.flush()?;

        log::debug!("Wrote a {}x{}x{} mesh to {:?}", nl, n, nz, filepath);
        Ok(filepath)
    }
}
