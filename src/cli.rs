/// Functions to handle the command line interface (CLI)
use std::path::PathBuf;

use clap::Parser;

use crate::{gpr, tools};

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(group(
        clap::ArgGroup::new("exit_choice")
        .required(false)
        .args(&["info", "show_all_steps"]),
    ))
]
pub struct Args {
    /// Filepath of a saved ".gpr" session
    #[clap(short, long)]
    filepath: Option<PathBuf>,

    /// Only show the profile summary and its processing history
    #[clap(short, long)]
    info: bool,

    /// Show the available steps
    #[clap(long)]
    show_all_steps: bool,

    /// Processing steps to run, separated by commas. Can be a filepath to a newline separated
    /// step file, such as a history file written with "--history".
    #[clap(long)]
    steps: Option<String>,

    /// Save the processed session to this path. The ".gpr" extension is appended if missing.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Write the processing history as a replayable step file
    #[clap(long)]
    history: Option<PathBuf>,

    /// Suppress progress messages
    #[clap(short, long)]
    quiet: bool,
}

enum ParsedArgs {
    Params(Box<gpr::RunParams>),
    Error(String),
    Done,
}

impl Args {
    fn to_params(&self) -> ParsedArgs {
        // If the user only wants to show the available steps, stop here.
        if self.show_all_steps {
            println!("Name\t\tDescription");

            for line in gpr::all_available_steps() {
                println!("{}\n{}\n{}\n", line[0], "-".repeat(line[0].len()), line[1]);
            }
            return ParsedArgs::Done;
        };

        let filepath = match &self.filepath {
            Some(fp) => fp.clone(),
            None => {
                return ParsedArgs::Error(
                    "No filepath given.\nUse the help text (\"-h\" or \"--help\") for assistance."
                        .to_string(),
                )
            }
        };

        let steps: Vec<String> = match self.info {
            true => Vec::new(),
            false => match &self.steps {
                Some(steps) => match tools::parse_step_list(steps) {
                    Ok(s) => s,
                    Err(e) => return ParsedArgs::Error(e),
                },
                None => {
                    if !self.quiet {
                        println!("No processing steps specified.");
                    };
                    vec![]
                }
            },
        };

        // Validate the step names before processing, so that a typo does not fail halfway
        let allowed_steps = gpr::all_available_steps()
            .iter()
            .map(|s| s[0])
            .chain([gpr::NEW_SESSION_STATEMENT.trim_end_matches("()")])
            .collect::<Vec<&str>>();
        for step in &steps {
            match tools::parse_statement(step) {
                Ok((name, _)) if allowed_steps.contains(&name.as_str()) => (),
                Ok((name, _)) => {
                    return ParsedArgs::Error(format!("Unrecognized step: {}", name))
                }
                Err(e) => return ParsedArgs::Error(e),
            };
        }

        ParsedArgs::Params(Box::new(gpr::RunParams {
            filepath,
            steps,
            output_path: self.output.clone(),
            history_path: self.history.clone(),
            only_info: self.info,
            quiet: self.quiet,
        }))
    }
}

/// Run the main CLI functionality based on the given arguments
///
/// # Arguments
/// - `arguments`: The Args object containing the parsed arguments.
///
/// # Returns
/// The appropriate exit code.
pub fn main(arguments: Args) -> i32 {
    let level = match arguments.quiet {
        true => "warn",
        false => "info",
    };
    // The logger may already be set, e.g. by an earlier call in tests
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();

    match arguments.to_params() {
        ParsedArgs::Params(params) => match gpr::run(*params) {
            Ok(_) => 0,
            Err(e) => error(&format!("Error: {e}"), 1),
        },
        ParsedArgs::Error(message) => error(&message, 1),
        ParsedArgs::Done => 0,
    }
}

/// Print an error to /dev/stderr and return an exit code
///
/// # Arguments
/// - `message`: The message to print to /dev/stderr
/// - `code`: The exit code
///
/// # Returns
/// The same exit code that was provided
fn error(message: &str, code: i32) -> i32 {
    eprintln!("{}", message);
    code
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{main, Args};
    use crate::gpr::testing::synthetic_profile;
    use crate::gpr::ProfileSession;

    #[test]
    fn test_run_steps() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("raw.gpr");
        ProfileSession::new(synthetic_profile(40, 5))
            .save(&input)
            .unwrap();

        let output = dir.path().join("processed");
        let history = dir.path().join("history.txt");
        let args = Args::parse_from([
            "gprtopo",
            "-f",
            input.to_str().unwrap(),
            "--steps",
            "dewow(4), set_velocity(0.1), truncate_y(1.5)",
            "-o",
            output.to_str().unwrap(),
            "--history",
            history.to_str().unwrap(),
            "-q",
        ]);
        assert_eq!(main(args), 0);

        let processed = ProfileSession::open(&dir.path().join("processed.gpr")).unwrap();
        assert_eq!(processed.profile().height(), 30);
        assert_eq!(
            processed.history(),
            vec!["dewow(4)", "set_velocity(0.1)", "truncate_y(1.5)"]
        );

        // The history file can be used as a step file on the raw session
        let replayed = dir.path().join("replayed");
        let args = Args::parse_from([
            "gprtopo",
            "-f",
            input.to_str().unwrap(),
            "--steps",
            history.to_str().unwrap(),
            "-o",
            replayed.to_str().unwrap(),
            "-q",
        ]);
        assert_eq!(main(args), 0);
        let replayed = ProfileSession::open(&dir.path().join("replayed.gpr")).unwrap();
        assert_eq!(replayed.profile().data(), processed.profile().data());
    }

    #[test]
    fn test_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("raw.gpr");
        ProfileSession::new(synthetic_profile(10, 3))
            .save(&input)
            .unwrap();

        assert_eq!(main(Args::parse_from(["gprtopo", "-q"])), 1);
        assert_eq!(
            main(Args::parse_from([
                "gprtopo",
                "-q",
                "-f",
                input.to_str().unwrap(),
                "--steps",
                "dewoww(4)"
            ])),
            1
        );
        // Fails when running: topographic correction needs a velocity
        assert_eq!(
            main(Args::parse_from([
                "gprtopo",
                "-q",
                "-f",
                input.to_str().unwrap(),
                "--steps",
                "topo_correct('topo.csv')"
            ])),
            1
        );
        assert_eq!(
            main(Args::parse_from([
                "gprtopo",
                "-f",
                input.to_str().unwrap(),
                "--info"
            ])),
            0
        );
    }
}
