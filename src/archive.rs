//! Symmetric tar+gzip codec for directory trees.
//!
//! Configuration versions are shipped as gzipped tarballs; `unpack` recreates
//! the tree in a run's working directory and `pack` is its inverse.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::anyhow;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType};
use walkdir::WalkDir;

use crate::error::EngineError;

/// Stream a gzipped tarball into `dst`, recreating directories, regular
/// files and symlinks.
///
/// Leading `/` is stripped from entry names, so an absolute-path archive
/// cannot escape `dst`. Duplicate entries follow tar's last-writer-wins
/// semantics: a file that already exists is overwritten, with a chmod and
/// retry if the earlier copy was read-only.
pub fn unpack(reader: impl Read, dst: &Path) -> Result<(), EngineError> {
    let decoder = GzDecoder::new(reader);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let rel = name.strip_prefix("/").unwrap_or(&name);
        let path = dst.join(rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&path)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("symlink entry {} has no target", rel.display()))?
                    .into_owned();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                match std::os::unix::fs::symlink(&target, &path) {
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        fs::remove_file(&path)?;
                        std::os::unix::fs::symlink(&target, &path)?;
                    }
                    other => other?,
                }
            }
            kind if kind.is_file() => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = match File::create(&path) {
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
                        File::create(&path)?
                    }
                    other => other?,
                };
                io::copy(&mut entry, &mut file)?;
                if let Ok(mode) = entry.header().mode() {
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                }
            }
            // hard links, fifos etc. have no business in a configuration
            // archive; skip them
            _ => {}
        }
    }
    Ok(())
}

/// Produce a gzipped tarball of the tree rooted at `src`, preserving regular
/// files, directories and symlinks (not followed).
pub fn pack(src: &Path) -> Result<Vec<u8>, EngineError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| anyhow!("walking {}: {e}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| anyhow!("{e}"))?;
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), rel)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}
