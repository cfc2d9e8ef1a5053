use clap::Parser;

use gprtopo::cli;

fn main() {
    let args = cli::Args::parse();

    std::process::exit(cli::main(args));
}
