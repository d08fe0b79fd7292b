use std::{env, fs, path::Path, time::Instant};

use anyhow::{Context, Result, bail, format_err};
use log::info;
use patternv::{Config, FileKind, compile, find_all, locate};
use simplelog::{self, LevelFilter, SimpleLogger};

fn main() -> Result<()> {
    SimpleLogger::init(LevelFilter::Debug, simplelog::Config::default())?;

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        bail!("2 positional args are required. Usage: find_sig_matches <path_to_exe> <sig>");
    }

    let target_path = Path::new(&args[1]);
    let sig = &args[2];
    info!("Searching for sig {sig} in file {}", target_path.display());

    let config = Config::default();
    let kind = config.file_kind(target_path).unwrap_or(FileKind::Container);

    let start = Instant::now();
    let image = fs::read(target_path)
        .with_context(|| format!("Failed to read {}", target_path.display()))?;
    let section = locate(&image, kind, &config.section_name)
        .map_err(|e| format_err!("{} section not found: {e}", config.section_name))?;
    info!(
        "File load took {:?}; {} is 0x{:X} bytes at 0x{:X}",
        start.elapsed(),
        config.section_name,
        section.len(),
        section.offset
    );

    let start = Instant::now();
    let pat = compile(sig).context(format!("Invalid signature: \"{sig}\""))?;
    let offsets = find_all(section.bytes, &pat);
    info!("Pattern search took {:?}", start.elapsed());

    info!("Found offsets:");
    for offset in offsets {
        info!("{offset:x}");
    }
    Ok(())
}
