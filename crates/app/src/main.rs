mod cli;
mod thumb;

use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    thumb::init_tracing();
    let cli = cli::Cli::parse();
    cli::handle_commands(cli)
}
