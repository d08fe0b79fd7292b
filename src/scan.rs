use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::matcher::find_all;
use crate::pattern::{CompiledPattern, PatternError, compile};
use crate::section::{DEFAULT_SECTION_NAME, FileKind, SectionError, locate};

pub const DEFAULT_CONTAINER_EXTENSION: &str = "exe";
pub const DEFAULT_SECTION_EXTENSION: &str = "text";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),
    #[error("can't find the builds path at: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot list {}: {source}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },
}

/// Settings for a directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Extensions (without the dot) of PE images to scan.
    pub container_extensions: Vec<String>,
    /// Extension of files that hold an already-extracted code section.
    pub section_extension: String,
    /// Name of the section to search in PE images.
    pub section_name: String,
    /// Maximum number of files scanned at once.
    pub jobs: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            container_extensions: vec![DEFAULT_CONTAINER_EXTENSION.into()],
            section_extension: DEFAULT_SECTION_EXTENSION.into(),
            section_name: DEFAULT_SECTION_NAME.into(),
            jobs: default_jobs(),
        }
    }
}

/// The detected hardware parallelism, or 1 if it cannot be queried.
pub fn default_jobs() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

impl Config {
    /// Determines how a file should be scanned from its extension, or None if
    /// it should not be scanned at all.
    pub fn file_kind(&self, path: &Path) -> Option<FileKind> {
        let ext = path.extension().and_then(OsStr::to_str)?;
        if ext.eq_ignore_ascii_case(&self.section_extension) {
            return Some(FileKind::CodeSection);
        }
        self.container_extensions
            .iter()
            .any(|e| ext.eq_ignore_ascii_case(e))
            .then_some(FileKind::Container)
    }
}

/// Derives the display label of a build from its file name: the trailing run
/// of exactly four digits of the file stem, or the whole file name.
pub fn build_identifier(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();

    let digits = stem.bytes().rev().take_while(u8::is_ascii_digit).count();
    if digits == 4 {
        return stem[stem.len() - 4..].to_string();
    }
    file_name
}

/// The numeric ordering key of a build identifier. Identifiers that are not
/// purely digits sort first.
pub fn sort_key(build: &str) -> u64 {
    if build.is_empty() || !build.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    build.parse().unwrap_or(0)
}

/// A file picked up for scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub kind: FileKind,
}

/// The outcome of scanning one file whose code section was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub sort_key: u64,
    pub build: String,
    pub path: PathBuf,
    /// Match offsets relative to the start of the code section.
    pub offsets: Vec<usize>,
}

impl ScanResult {
    pub fn found(&self) -> bool {
        !self.offsets.is_empty()
    }
}

/// A file that did not contribute to the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Results ordered by build.
    pub results: Vec<ScanResult>,
    pub skipped: Vec<Skipped>,
    pub elapsed: Duration,
}

impl ScanReport {
    /// True if every file whose code section could be located matched.
    /// Skipped files do not count.
    pub fn all_matched(&self) -> bool {
        self.results.iter().all(ScanResult::found)
    }
}

enum Outcome {
    Scanned(ScanResult),
    Skipped(Skipped),
}

/// Lists the files directly under `dir` that `config` says should be scanned,
/// sorted by path.
pub fn collect_candidates(dir: &Path, config: &Config) -> Result<Vec<Candidate>, ScanError> {
    let read_dir_err = |source| ScanError::ReadDir { path: dir.to_path_buf(), source };

    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {e}", dir.display());
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        if let Some(kind) = config.file_kind(&path) {
            candidates.push(Candidate { path, kind });
        }
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(candidates)
}

/// Locates the code section of `bytes` and returns the match offsets within
/// it.
pub fn scan_bytes(
    bytes: &[u8],
    kind: FileKind,
    pattern: &CompiledPattern,
    section_name: &str,
) -> Result<Vec<usize>, SectionError> {
    let section = locate(bytes, kind, section_name)?;
    Ok(find_all(section.bytes, pattern))
}

/// Reads, locates and matches a single file. Runs on the blocking pool.
fn scan_file(candidate: Candidate, pattern: &CompiledPattern, config: &Config) -> Outcome {
    let Candidate { path, kind } = candidate;

    let buffer = match fs::read(&path) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!("Failed to read {}: {e}", path.display());
            return Outcome::Skipped(Skipped { path, reason: e.to_string() });
        }
    };

    let offsets = match scan_bytes(&buffer, kind, pattern, &config.section_name) {
        Ok(offsets) => offsets,
        Err(e) => {
            warn!("{} section not found in {}: {e}", config.section_name, path.display());
            return Outcome::Skipped(Skipped { path, reason: e.to_string() });
        }
    };
    debug!("{} ({kind}): {} matches", path.display(), offsets.len());

    let build = build_identifier(&path);
    Outcome::Scanned(ScanResult { sort_key: sort_key(&build), build, path, offsets })
}

/// Runs `unit` on every candidate on the blocking pool with at most `jobs`
/// running at once, and waits for all of them.
///
/// A unit that panics or is cancelled is reported as skipped.
async fn run_units<F>(
    candidates: Vec<Candidate>,
    jobs: NonZeroUsize,
    unit: Arc<F>,
) -> (Vec<ScanResult>, Vec<Skipped>)
where
    F: Fn(Candidate) -> Outcome + Send + Sync + 'static,
{
    let gate = Arc::new(Semaphore::new(jobs.get()));
    let mut pending: BTreeSet<PathBuf> = candidates.iter().map(|c| c.path.clone()).collect();
    let mut units = JoinSet::new();
    for candidate in candidates {
        let gate = gate.clone();
        let unit = unit.clone();
        units.spawn(async move {
            // The gate is never closed, so acquiring can't fail
            let permit = gate.acquire_owned().await.ok();
            tokio::task::spawn_blocking(move || {
                let outcome = unit(candidate);
                drop(permit);
                outcome
            })
            .await
        });
    }

    let mut results = Vec::new();
    let mut skipped = Vec::new();
    while let Some(joined) = units.join_next().await {
        match joined {
            Ok(Ok(Outcome::Scanned(result))) => {
                pending.remove(&result.path);
                results.push(result);
            }
            Ok(Ok(Outcome::Skipped(s))) => {
                pending.remove(&s.path);
                skipped.push(s);
            }
            Ok(Err(e)) | Err(e) => error!("Scan task failed: {e}"),
        }
    }

    for path in pending {
        error!("Scan of {} did not finish", path.display());
        skipped.push(Skipped { path, reason: "scan did not finish".into() });
    }
    (results, skipped)
}

/// Scans every candidate file in `dir` for `pattern`, at most `config.jobs`
/// files at a time.
///
/// Unreadable files and files without a locatable code section are left out
/// of the results and listed in `ScanReport::skipped` instead.
pub async fn scan_directory(
    dir: &Path,
    pattern: Arc<CompiledPattern>,
    config: Arc<Config>,
) -> Result<ScanReport, ScanError> {
    if !dir.exists() {
        return Err(ScanError::DirectoryNotFound(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let start = Instant::now();
    let candidates = collect_candidates(dir, &config)?;
    info!(
        "Scanning {} files in {} for `{pattern}` with {} jobs",
        candidates.len(),
        dir.display(),
        config.jobs
    );

    let unit_config = config.clone();
    let unit = Arc::new(move |candidate: Candidate| scan_file(candidate, &pattern, &unit_config));
    let (mut results, mut skipped) = run_units(candidates, config.jobs, unit).await;

    results.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.path.cmp(&b.path)));
    skipped.sort_by(|a, b| a.path.cmp(&b.path));

    let elapsed = start.elapsed();
    info!("Scan of {} took {elapsed:?}", dir.display());
    Ok(ScanReport { results, skipped, elapsed })
}

/// Compiles `pattern_text` and scans `dir` with it. An invalid pattern is
/// rejected before the filesystem is touched.
pub async fn scan(
    dir: &Path,
    pattern_text: &str,
    config: Arc<Config>,
) -> Result<ScanReport, ScanError> {
    let pattern = compile(pattern_text)?;
    scan_directory(dir, Arc::new(pattern), config).await
}
