use clap::Parser;

use stagecraft::{commands, logging, CliArgs};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    logging::init(cli.verbose);

    if let Err(err) = commands::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}
