// src/catalog/archive.rs

//! Local `.deb` archive probing
//!
//! A .deb is an AR archive holding `control.tar.*` and `data.tar.*`. Probing
//! only reads the control file so the archive can be queued like any
//! repository package.

use crate::error::{Error, Result};
use crate::packages::{Origin, Package};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

/// Build a package record from a local archive's control file
pub fn probe_archive(path: &Path) -> Result<Package> {
    let control = extract_control_file(path)?;
    debug!("Probed control file of {}", path.display());
    Package::from_control(
        &control,
        Origin::Local {
            path: path.to_path_buf(),
        },
    )
}

/// Extract a member from an AR archive by name prefix
fn extract_ar_member(path: &Path, prefix: &str) -> Result<Option<Vec<u8>>> {
    let file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut archive = ar::Archive::new(file);

    while let Some(entry) = archive.next_entry() {
        let mut entry =
            entry.map_err(|e| Error::ParseError(format!("Failed to read AR entry: {}", e)))?;

        let entry_name = String::from_utf8_lossy(entry.header().identifier()).to_string();

        if entry_name.starts_with(prefix) {
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| Error::IoError(format!("Failed to read AR member: {}", e)))?;
            return Ok(Some(content));
        }
    }

    Ok(None)
}

/// Decompress control.tar.* and return the `control` file text
fn extract_control_file(path: &Path) -> Result<String> {
    for member in ["control.tar.gz", "control.tar.xz", "control.tar.zst", "control.tar"] {
        let Some(tar_data) = extract_ar_member(path, member)? else {
            continue;
        };

        let reader: Box<dyn Read> = if member.ends_with(".gz") {
            Box::new(GzDecoder::new(&tar_data[..]))
        } else if member.ends_with(".xz") {
            Box::new(XzDecoder::new(&tar_data[..]))
        } else if member.ends_with(".zst") {
            Box::new(zstd::Decoder::new(&tar_data[..]).map_err(|e| {
                Error::ParseError(format!("Failed to create zstd decoder: {}", e))
            })?)
        } else {
            Box::new(&tar_data[..])
        };

        let mut archive = Archive::new(reader);

        for entry in archive
            .entries()
            .map_err(|e| Error::ParseError(format!("Failed to read {}: {}", member, e)))?
        {
            let mut entry =
                entry.map_err(|e| Error::ParseError(format!("Failed to read entry: {}", e)))?;

            let entry_path = entry
                .path()
                .map_err(|e| Error::ParseError(format!("Failed to get entry path: {}", e)))?
                .to_string_lossy()
                .to_string();

            if entry_path == "./control" || entry_path == "control" {
                let mut content = String::new();
                entry
                    .read_to_string(&mut content)
                    .map_err(|e| Error::ParseError(format!("Failed to read control file: {}", e)))?;
                return Ok(content);
            }
        }
    }

    Err(Error::NotFoundError(format!(
        "control file in {}",
        path.display()
    )))
}
