//! tar.gz packing of a replica directory for upload to the remote store.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

/// Files that make up a snapshot. Anything else in an archive is ignored.
pub const SNAPSHOT_FILES: &[&str] = &["manifest.json", "vectors.bin"];

pub fn pack_snapshot<W: Write>(replica_dir: &Path, writer: W) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut archive = Builder::new(encoder);

    for filename in SNAPSHOT_FILES {
        let file_path = replica_dir.join(filename);
        archive
            .append_path_with_name(&file_path, filename)
            .with_context(|| format!("Failed to add {filename} to snapshot archive"))?;
    }

    let encoder = archive
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")
}

/// Extract the snapshot files of `archive_path` into `dest_dir`.
pub fn unpack_snapshot(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive at {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    std::fs::create_dir_all(dest_dir)?;

    let mut extracted = 0;
    for entry in archive
        .entries()
        .context("Failed to read archive entries")?
    {
        let mut entry = entry.context("Failed to read archive entry")?;
        let entry_path = entry
            .path()
            .context("Failed to get entry path")?
            .to_string_lossy()
            .to_string();

        if !is_whitelisted(&entry_path) {
            log::debug!("skipping {entry_path} in snapshot archive");
            continue;
        }

        entry
            .unpack(dest_dir.join(&entry_path))
            .with_context(|| format!("Failed to extract {entry_path}"))?;
        extracted += 1;
    }

    if extracted != SNAPSHOT_FILES.len() {
        anyhow::bail!(
            "snapshot archive is incomplete: expected {:?}, found {extracted} of them",
            SNAPSHOT_FILES
        );
    }

    Ok(())
}

fn is_whitelisted(entry_path: &str) -> bool {
    SNAPSHOT_FILES.contains(&entry_path)
}
