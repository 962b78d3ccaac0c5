use anyhow::Result;
use clap::Parser;
use sbconvert_rs_core::cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    sbconvert_rs_core::init_tracing(args.verbose);
    sbconvert_rs_core::run_cli(&args).await
}
