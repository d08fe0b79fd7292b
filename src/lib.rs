//! Locate a wildcard byte signature across a directory of builds.
//!
//! A scan compiles the signature once, then for every candidate file finds
//! the code section (parsing just enough of the PE headers) and reports every
//! offset within it where the signature matches. Results come back ordered by
//! the build number in each file name.

pub mod extract;
pub mod matcher;
pub mod pattern;
pub mod report;
pub mod scan;
pub mod section;

pub use extract::{ExtractError, extract_section};
pub use matcher::find_all;
pub use pattern::{CompiledPattern, PatternElement, PatternError, compile};
pub use report::{Style, render_report, render_result};
pub use scan::{Config, ScanError, ScanReport, ScanResult, scan, scan_directory};
pub use section::{CodeSection, FileKind, SectionError, locate};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
