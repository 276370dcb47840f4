use clap::Parser;

use indexdeck_lib::cli::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = indexdeck_lib::run(cli) {
        tracing::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
