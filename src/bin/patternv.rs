use std::io::{self, BufRead, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use simplelog::{LevelFilter, SimpleLogger};
use tokio::runtime::Runtime;

use patternv::scan::{DEFAULT_CONTAINER_EXTENSION, DEFAULT_SECTION_EXTENSION, default_jobs};
use patternv::section::DEFAULT_SECTION_NAME;
use patternv::{
    CompiledPattern, Config, ScanError, Style, compile, extract_section, render_report,
    scan_directory,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(default_value = "Builds/", help = "Directory holding the builds to scan")]
    path: PathBuf,

    #[arg(
        short,
        long,
        help = "Scan once for this pattern and exit instead of prompting, e.g. \"48 8B ?? 00\""
    )]
    pattern: Option<String>,

    #[arg(short, long, help = "Maximum number of files scanned at once [default: CPU count]")]
    jobs: Option<NonZeroUsize>,

    #[arg(
        long = "ext",
        default_value = DEFAULT_CONTAINER_EXTENSION,
        help = "Extension of executable images to scan. May be repeated."
    )]
    extensions: Vec<String>,

    #[arg(
        long,
        default_value = DEFAULT_SECTION_EXTENSION,
        help = "Extension of files holding an already-extracted code section"
    )]
    section_ext: String,

    #[arg(long, default_value = DEFAULT_SECTION_NAME, help = "Name of the code section")]
    section: String,

    #[arg(long, help = "Write the code section of this image next to it and exit")]
    extract: Option<PathBuf>,

    #[arg(long, help = "Disable colored output")]
    no_color: bool,

    #[arg(short, long, help = "Log per-file details")]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            container_extensions: self
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            section_extension: self.section_ext.trim_start_matches('.').to_string(),
            section_name: self.section.clone(),
            jobs: self.jobs.unwrap_or_else(default_jobs),
        }
    }
}

/// Runs one scan and prints the report. Returns whether every located build
/// matched.
fn scan_and_print(
    rt: &Runtime,
    dir: &Path,
    pattern: CompiledPattern,
    config: &Arc<Config>,
    style: Style,
) -> Result<bool, ScanError> {
    let report = rt.block_on(scan_directory(dir, Arc::new(pattern), config.clone()))?;

    for line in render_report(&report, style) {
        println!("{line}");
    }
    if !report.skipped.is_empty() {
        warn!("{} files were skipped", report.skipped.len());
    }
    info!("Scanned {} builds in {:?}", report.results.len(), report.elapsed);
    Ok(report.all_matched())
}

fn prompt_loop(rt: &Runtime, dir: &Path, config: &Arc<Config>, style: Style) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            return Ok(());
        };
        let line = line.context("failed to read from stdin")?;
        let input = line.trim();
        if input == "exit" || input == "quit" {
            return Ok(());
        }

        let pattern = match compile(input) {
            Ok(pattern) => pattern,
            Err(_) => {
                println!("Invalid pattern.");
                continue;
            }
        };
        info!("Scanning for `{pattern}`");

        if let Err(e) = scan_and_print(rt, dir, pattern, config, style) {
            error!("{e}");
        }
        println!();
    }
}

fn run(args: Args) -> Result<bool> {
    let config = Arc::new(args.config());
    let style = Style { color: !args.no_color };

    if let Some(image) = &args.extract {
        let out = extract_section(image, &config)?;
        println!("{}", out.display());
        return Ok(true);
    }

    // Reject a bad pattern before looking at the filesystem
    let pattern = args.pattern.as_deref().map(compile).transpose()?;

    if !args.path.is_dir() {
        return Err(ScanError::DirectoryNotFound(args.path).into());
    }

    let rt = Runtime::new()?;
    match pattern {
        Some(pattern) => Ok(scan_and_print(&rt, &args.path, pattern, &config, style)?),
        None => {
            info!("patternv v{} watching {}", patternv::VERSION, args.path.display());
            prompt_loop(&rt, &args.path, &config, style)?;
            Ok(true)
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    SimpleLogger::init(level, simplelog::Config::default())
        .context("failed to initialize logging")?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(args.verbose) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
