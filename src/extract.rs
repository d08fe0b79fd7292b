use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use crate::scan::Config;
use crate::section::{FileKind, SectionError, locate};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot extract from {}: {source}", path.display())]
    Locate { path: PathBuf, source: SectionError },
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// The sibling path that `extract_section` writes the code section of
/// `path` to, e.g. `game_1001.exe` -> `game_1001.text`.
pub fn extracted_path(path: &Path, config: &Config) -> PathBuf {
    path.with_extension(&config.section_extension)
}

/// Writes the configured code section of the PE image at `path` to its own
/// file next to it and returns the new file's path.
pub fn extract_section(path: &Path, config: &Config) -> Result<PathBuf, ExtractError> {
    let buffer =
        fs::read(path).map_err(|source| ExtractError::Read { path: path.into(), source })?;
    let section = locate(&buffer, FileKind::Container, &config.section_name)
        .map_err(|source| ExtractError::Locate { path: path.into(), source })?;

    let out_path = extracted_path(path, config);
    fs::write(&out_path, section.bytes)
        .map_err(|source| ExtractError::Write { path: out_path.clone(), source })?;

    info!(
        "Extracted {} bytes of {} from {} to {}",
        section.len(),
        config.section_name,
        path.display(),
        out_path.display()
    );
    Ok(out_path)
}
