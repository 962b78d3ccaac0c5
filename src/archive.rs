use crate::ir::Project;
use crate::sb2::{encode_project, EncodeOptions};
use crate::sb3::{decode_project, AssetFetcher, AssetRequest};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

type ArchiveProgressCallback<'a> = dyn FnMut(usize, usize, &str) + 'a;

/// Contents of an `.sb3` archive: the parsed project document plus every other entry.
#[derive(Debug, Clone)]
pub struct Sb3Archive {
    pub project_json: Value,
    pub assets: ArchiveAssets,
}

/// Archive entries addressed by file name (`<md5>.<ext>`).
#[derive(Debug, Clone, Default)]
pub struct ArchiveAssets {
    entries: Arc<HashMap<String, Vec<u8>>>,
}

impl ArchiveAssets {
    pub fn new(entries: HashMap<String, Vec<u8>>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AssetFetcher for ArchiveAssets {
    async fn fetch(&self, request: AssetRequest) -> Result<Vec<u8>> {
        let name = request.md5ext();
        let bytes = self.get(&name).ok_or_else(|| {
            anyhow!(
                "Asset '{}' for {} '{}' of '{}' not found in archive.",
                name,
                request.kind.as_str(),
                request.name,
                request.sprite_name
            )
        })?;
        let digest = format!("{:x}", md5::compute(bytes));
        if digest != request.md5 {
            warn!(asset = %name, actual = %digest, "asset bytes do not match their md5");
        }
        Ok(bytes.to_vec())
    }
}

pub fn read_sb3(input: &Path) -> Result<Sb3Archive> {
    let file =
        fs::File::open(input).with_context(|| format!("Failed to open '{}'.", input.display()))?;
    read_sb3_from(file, &input.display().to_string())
}

pub fn read_sb3_bytes(bytes: &[u8]) -> Result<Sb3Archive> {
    read_sb3_from(Cursor::new(bytes), "<memory>")
}

fn read_sb3_from<R: Read + Seek>(reader: R, source: &str) -> Result<Sb3Archive> {
    let mut zip = ZipArchive::new(reader)
        .with_context(|| format!("'{}' is not a valid zip/.sb3 file.", source))?;

    let mut project_json_str = String::new();
    {
        let mut entry = zip
            .by_name("project.json")
            .map_err(|_| anyhow!("Missing project.json in '{}'.", source))?;
        entry
            .read_to_string(&mut project_json_str)
            .with_context(|| format!("Failed reading project.json from '{}'.", source))?;
    }
    let project_json: Value = serde_json::from_str(&project_json_str)
        .with_context(|| format!("Invalid project.json inside '{}'.", source))?;

    let mut assets = HashMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        if name == "project.json" || name.ends_with('/') {
            continue;
        }
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed reading '{}' from '{}'.", name, source))?;
        assets.insert(name, bytes);
    }
    debug!(source, assets = assets.len(), "read .sb3 archive");

    Ok(Sb3Archive {
        project_json,
        assets: ArchiveAssets::new(assets),
    })
}

pub async fn decode_sb3_bytes(bytes: &[u8]) -> Result<Project> {
    let archive = read_sb3_bytes(bytes)?;
    decode_project(&archive.project_json, Arc::new(archive.assets)).await
}

pub async fn decode_sb3_file(input: &Path) -> Result<Project> {
    let archive = read_sb3(input)?;
    decode_project(&archive.project_json, Arc::new(archive.assets))
        .await
        .with_context(|| format!("Failed to decode '{}'.", input.display()))
}

pub fn build_sb2_bytes(project: &Project, options: &EncodeOptions<'_>) -> Result<Vec<u8>> {
    build_sb2_bytes_with_progress(project, options, Option::<&mut fn(usize, usize, &str)>::None)
}

pub fn build_sb2_bytes_with_progress<F>(
    project: &Project,
    options: &EncodeOptions<'_>,
    progress: Option<&mut F>,
) -> Result<Vec<u8>>
where
    F: FnMut(usize, usize, &str),
{
    let mut progress = progress.map(|cb| cb as &mut ArchiveProgressCallback<'_>);
    report_progress(&mut progress, 1, 1, "Encoding legacy project");
    let output = encode_project(project, options);

    let mut buffer = Cursor::new(Vec::<u8>::new());
    let mut zip = zip::ZipWriter::new(&mut buffer);
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    report_progress(&mut progress, 1, 1, "Writing project.json");
    zip.start_file("project.json", opts)?;
    zip.write_all(&serde_json::to_vec(&output.project)?)?;

    let files = output.asset_files();
    let asset_total = files.len().max(1);
    if files.is_empty() {
        report_progress(&mut progress, 1, 1, "Packaging assets");
    }
    for (index, (name, bytes)) in files.into_iter().enumerate() {
        zip.start_file(name, opts)?;
        zip.write_all(bytes)?;
        report_progress(&mut progress, index + 1, asset_total, "Packaging assets");
    }
    zip.finish()?;
    Ok(buffer.into_inner())
}

pub fn write_sb2(project: &Project, options: &EncodeOptions<'_>, output_path: &Path) -> Result<()> {
    write_sb2_with_progress(
        project,
        options,
        output_path,
        Option::<&mut fn(usize, usize, &str)>::None,
    )
}

pub fn write_sb2_with_progress<F>(
    project: &Project,
    options: &EncodeOptions<'_>,
    output_path: &Path,
    progress: Option<&mut F>,
) -> Result<()>
where
    F: FnMut(usize, usize, &str),
{
    let bytes = build_sb2_bytes_with_progress(project, options, progress)?;
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_path, bytes)
        .with_context(|| format!("Failed to write '{}'.", output_path.display()))?;
    Ok(())
}

fn report_progress(
    progress: &mut Option<&mut ArchiveProgressCallback<'_>>,
    step: usize,
    total: usize,
    label: &str,
) {
    if let Some(cb) = progress.as_deref_mut() {
        cb(step, total, label);
    }
}
