//! Processing of 2D ground-penetrating radar (GPR) profiles
//!
//! A [gpr::ProfileSession] wraps one profile and applies processing steps to it, keeping a
//! replayable log and a single-level undo. Profiles can be corrected for surface topography
//! ([topo]) and exported as 3D ribbon meshes ([mesh]).
pub mod cli;
pub mod error;
pub mod filters;
pub mod gpr;
pub mod history;
pub mod io;
pub mod mesh;
pub mod tools;
pub mod topo;

pub const PROGRAM_NAME: &str = env!("CARGO_PKG_NAME");
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROGRAM_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
