use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

use minewarden_core::MiningStatus;

/// Write `status` as pretty JSON, replacing `path` atomically so readers
/// never see a partial file.
pub fn write_status(path: &Path, status: &MiningStatus) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut file, status)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

pub fn read_status(path: &Path) -> Result<MiningStatus> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading status file {}", path.display()))?;
    let status = serde_json::from_str(&contents)
        .with_context(|| format!("parsing status file {}", path.display()))?;
    Ok(status)
}
