use clap::Parser;

use gator::cli;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    let code = cli::run(args).await;
    std::process::exit(code);
}
