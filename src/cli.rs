use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sbconvert-rs",
    about = "Convert Scratch 3 (.sb3) projects to the legacy Scratch 2 (.sb2) format."
)]
pub struct Args {
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    #[arg(
        value_name = "OUTPUT",
        help = "Destination .sb2 archive. Defaults to INPUT with an .sb2 extension."
    )]
    pub output: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PNG",
        help = "Attach this image to the stage as its pen layer."
    )]
    pub pen_layer: Option<PathBuf>,

    #[arg(long, help = "Write the legacy project.json to this path.")]
    pub emit_json: Option<PathBuf>,

    #[arg(
        long,
        help = "Write the decoded intermediate representation as JSON to this path."
    )]
    pub emit_ir: Option<PathBuf>,

    #[arg(
        long,
        help = "Store sounds the legacy player cannot decode unchanged, without warning."
    )]
    pub keep_unsupported_sounds: bool,

    #[arg(short, long, help = "Log per-block diagnostics (overrides RUST_LOG).")]
    pub verbose: bool,
}

impl Args {
    /// An archive is written when OUTPUT is given, or when no other artifact was requested.
    pub fn archive_path(&self) -> Option<PathBuf> {
        match &self.output {
            Some(path) => Some(path.clone()),
            None if self.emit_json.is_none() && self.emit_ir.is_none() => {
                Some(self.input.with_extension("sb2"))
            }
            None => None,
        }
    }
}
