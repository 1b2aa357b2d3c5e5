//! Output file naming, atomic placement and password protection.

use crate::config::{ConflictPolicy, FileNamingPolicy};
use crate::error::{Result, TemplateError};
use chrono::{DateTime, Local};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const OUTPUT_EXTENSION: &str = "xlsx";

/// Resolve the output path for `base` in `dir` under the naming and conflict
/// policies.
pub fn output_path(
    dir: &Path,
    base: &str,
    naming: FileNamingPolicy,
    conflict: ConflictPolicy,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    let base = base
        .strip_suffix(".xlsx")
        .or_else(|| base.strip_suffix(".XLSX"))
        .unwrap_or(base);
    if base.trim().is_empty() || base.contains(['/', '\\']) {
        return Err(TemplateError::config(format!(
            "invalid output file name '{base}'"
        )));
    }
    let stem = match naming {
        FileNamingPolicy::Plain => base.to_string(),
        FileNamingPolicy::Timestamped => format!("{base}_{}", now.format("%Y%m%d_%H%M%S")),
    };
    let candidate = dir.join(format!("{stem}.{OUTPUT_EXTENSION}"));
    if !candidate.exists() {
        return Ok(candidate);
    }
    match conflict {
        ConflictPolicy::Error => Err(TemplateError::OutputExists { path: candidate }),
        ConflictPolicy::Sequence => (1u32..)
            .map(|n| dir.join(format!("{stem}_{n}.{OUTPUT_EXTENSION}")))
            .find(|path| !path.exists())
            .ok_or_else(|| TemplateError::Internal {
                message: "no free output file name".into(),
            }),
    }
}

/// Temporary file next to the final output. Dropping the guard without
/// [`OutputGuard::commit`] removes the temporary file.
pub struct OutputGuard {
    temp: NamedTempFile,
    target: PathBuf,
}

impl OutputGuard {
    pub fn create(target: PathBuf) -> Result<Self> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let temp = tempfile::Builder::new()
            .prefix(".xlsx-template-")
            .suffix(".part")
            .tempfile_in(dir)?;
        Ok(Self { temp, target })
    }

    pub fn file(&mut self) -> &mut File {
        self.temp.as_file_mut()
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Move the finished file into place without overwriting anything.
    pub fn commit(self) -> Result<PathBuf> {
        self.temp.as_file().sync_all()?;
        match self.temp.persist_noclobber(&self.target) {
            Ok(_) => {
                debug!(path = %self.target.display(), "output committed");
                Ok(self.target)
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(TemplateError::OutputExists { path: self.target })
            }
            Err(err) => Err(err.error.into()),
        }
    }
}

/// Protect the package at `path` with an open password, in place.
pub fn encrypt_in_place(path: &Path, password: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let encrypted = tempfile::Builder::new()
        .prefix(".xlsx-template-enc-")
        .tempfile_in(dir)?
        .into_temp_path();
    let target: &Path = &encrypted;
    umya_spreadsheet::writer::xlsx::set_password(path, target, password).map_err(
        |e| TemplateError::Encryption {
            message: e.to_string(),
        },
    )?;
    std::fs::rename(&encrypted, path)?;
    Ok(())
}

/// Password-protect an in-memory package.
pub fn encrypt_bytes(bytes: &[u8], password: &str) -> Result<Vec<u8>> {
    let plain = tempfile::Builder::new()
        .prefix(".xlsx-template-")
        .suffix(".xlsx")
        .tempfile()?;
    std::fs::write(plain.path(), bytes)?;
    encrypt_in_place(plain.path(), password)?;
    Ok(std::fs::read(plain.path())?)
}
