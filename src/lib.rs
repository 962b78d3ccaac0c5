pub mod archive;
pub mod cli;
pub mod ir;
pub mod opcodes;
pub mod sb2;
pub mod sb3;

use anyhow::{Context, Result};
use ir::{Costume, Sound};
use sb2::{encode_project, wav_sound_format, EncodeOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub use archive::{
    build_sb2_bytes, decode_sb3_bytes, decode_sb3_file, read_sb3, read_sb3_bytes, write_sb2,
    ArchiveAssets, Sb3Archive,
};
pub use ir::Project;
pub use sb2::{AssetSource, AssetTable, Sb2Output, SoundFormat};
pub use sb3::{decode_project, prune_unreferenced_data, AssetFetcher, AssetKind, AssetRequest};

/// Installs the stderr log subscriber. `RUST_LOG` applies unless `verbose` is set.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run_cli(args: &cli::Args) -> Result<()> {
    let archive_path = args.archive_path();
    let total_stages = 2
        + usize::from(args.emit_ir.is_some())
        + usize::from(args.emit_json.is_some())
        + usize::from(archive_path.is_some());
    let progress = CliProgress::new("Convert", total_stages);
    let mut stage = 0usize;

    stage += 1;
    progress.emit(stage, "Resolving input path");
    let input = canonicalize_file(&args.input)?;

    stage += 1;
    progress.emit(stage, "Decoding .sb3");
    let project = decode_sb3_file(&input).await?;

    if let Some(emit_path) = &args.emit_ir {
        stage += 1;
        progress.emit(stage, "Writing intermediate representation");
        let bytes = serde_json::to_vec_pretty(&project)?;
        fs::write(emit_path, bytes)
            .with_context(|| format!("Failed to write '{}'.", emit_path.display()))?;
    }

    let options = cli_encode_options(args)?;

    if let Some(emit_path) = &args.emit_json {
        stage += 1;
        progress.emit(stage, "Writing legacy project.json");
        let output = encode_project(&project, &options);
        let bytes = serde_json::to_vec_pretty(&output.project)?;
        fs::write(emit_path, bytes)
            .with_context(|| format!("Failed to write '{}'.", emit_path.display()))?;
    }

    if let Some(output) = &archive_path {
        stage += 1;
        let base = stage;
        let mut build_stage_cb = |step: usize, total: usize, label: &str| {
            progress.emit_with_total(base - 1 + step, base - 1 + total, label);
        };
        progress.emit(stage, "Building .sb2");
        archive::write_sb2_with_progress(&project, &options, output, Some(&mut build_stage_cb))?;
    }

    Ok(())
}

fn cli_encode_options(args: &cli::Args) -> Result<EncodeOptions<'static>> {
    let keep_unsupported = args.keep_unsupported_sounds;
    let convert = move |sound: &Sound| {
        if !keep_unsupported {
            warn!(
                sound = %sound.name,
                ext = %sound.ext,
                "legacy player cannot decode this sound format, storing it unchanged"
            );
        }
        sound.clone()
    };
    let mut options = EncodeOptions::new(convert, wav_sound_format);
    if let Some(path) = &args.pen_layer {
        options = options.with_pen_costume(load_pen_costume(path)?);
    }
    Ok(options)
}

/// Reads an image to use as the stage pen layer, keyed by the md5 of its bytes.
pub fn load_pen_costume(path: &Path) -> Result<Costume> {
    let asset = fs::read(path)
        .with_context(|| format!("Failed to read pen layer '{}'.", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "png".to_string());
    Ok(Costume {
        name: "pen layer".to_string(),
        md5: format!("{:x}", md5::compute(&asset)),
        asset,
        ext,
        bitmap_resolution: 1.0,
        center_x: None,
        center_y: None,
    })
}

pub fn canonicalize_file(path: &Path) -> Result<PathBuf> {
    if !path.exists() || !path.is_file() {
        return Err(anyhow::anyhow!("Input file not found: '{}'.", path.display()));
    }
    Ok(path.canonicalize()?)
}

struct CliProgress {
    prefix: &'static str,
    total: usize,
}

impl CliProgress {
    fn new(prefix: &'static str, total: usize) -> Self {
        Self {
            prefix,
            total: total.max(1),
        }
    }

    fn emit(&self, step: usize, label: &str) {
        self.emit_with_total(step, self.total, label);
    }

    fn emit_with_total(&self, step: usize, total: usize, label: &str) {
        let total = total.max(1);
        let step = step.clamp(1, total);
        let bar = render_progress_bar(step, total, 14);
        eprintln!(
            "[{}] {}... ({}/{}) {}",
            self.prefix, label, step, total, bar
        );
    }
}

fn render_progress_bar(step: usize, total: usize, width: usize) -> String {
    let width = width.max(1);
    let filled = ((step * width) + (total / 2)) / total;
    let mut s = String::with_capacity(width + 2);
    s.push('[');
    for i in 0..width {
        s.push(if i < filled { '=' } else { '-' });
    }
    s.push(']');
    s
}
