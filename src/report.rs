use colored::Colorize;

use crate::scan::{ScanReport, ScanResult};

/// How report lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: bool,
}

impl Default for Style {
    fn default() -> Self {
        Style { color: true }
    }
}

impl Style {
    pub fn plain() -> Self {
        Style { color: false }
    }
}

fn format_offsets(offsets: &[usize]) -> String {
    offsets
        .iter()
        .map(|o| format!("0x{o:X}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders one line of the report.
pub fn render_result(result: &ScanResult, style: Style) -> String {
    if result.found() {
        let marker = if style.color { "[+]".green().bold().to_string() } else { "[+]".into() };
        format!(
            "{marker} Pattern found in v{} ({} matches): {}",
            result.build,
            result.offsets.len(),
            format_offsets(&result.offsets)
        )
    } else {
        let marker = if style.color { "[-]".red().bold().to_string() } else { "[-]".into() };
        format!("{marker} Pattern not found in v{}", result.build)
    }
}

/// Renders every result of the report, in build order.
pub fn render_report(report: &ScanReport, style: Style) -> Vec<String> {
    report
        .results
        .iter()
        .map(|result| render_result(result, style))
        .collect()
}
