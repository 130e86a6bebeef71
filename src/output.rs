//! CLI output formatting for generation runs.
//!
//! # Output Format
//!
//! ```text
//! favicon.png → public/favicons (cache hit 3f2a9c01)
//!     001 android-chrome-192x192.png   12.4 KB
//!     002 favicon.ico                   15.1 KB
//!     Preview: ~/.cache/rfgen/3f2a…/preview/preview.png
//!
//! HTML
//!     index.html
//!
//! Manifests
//!     site.webmanifest
//!
//! Failed
//!     about.html: Unbalanced markers
//!
//! Generated 2 files
//! ```
//!
//! Each output has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure.

use crate::generator::GenerationReport;
use std::path::Path;

/// Characters of the fingerprint shown in the header line.
const SHORT_FINGERPRINT: usize = 8;

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human readable byte count.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Path shown relative to `base` when possible.
fn relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(SHORT_FINGERPRINT)]
}

fn section(lines: &mut Vec<String>, title: &str, items: Vec<String>) {
    if items.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(title.to_string());
    for item in items {
        lines.push(format!("{}{}", indent(1), item));
    }
}

pub fn format_report(report: &GenerationReport) -> Vec<String> {
    let mut lines = Vec::new();
    let origin = if report.cache_hit {
        "cache hit"
    } else {
        "generated"
    };
    lines.push(format!(
        "{} → {} ({} {})",
        report.source,
        report.dest.display(),
        origin,
        short(&report.fingerprint)
    ));

    let names: Vec<String> = report
        .assets
        .iter()
        .map(|asset| relative(&asset.path, &report.dest))
        .collect();
    let width = names.iter().map(|n| n.chars().count()).max().unwrap_or(0);
    for (i, (name, asset)) in names.iter().zip(&report.assets).enumerate() {
        lines.push(format!(
            "{}{} {:<width$}  {:>9}",
            indent(1),
            format_index(i + 1),
            name,
            format_size(asset.size),
        ));
    }
    if let Some(preview) = &report.preview {
        lines.push(format!("{}Preview: {}", indent(1), preview.display()));
    }

    section(
        &mut lines,
        "HTML",
        report
            .html_files
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    );
    section(
        &mut lines,
        "Manifests",
        report
            .manifests
            .iter()
            .map(|p| relative(p, &report.dest))
            .collect(),
    );
    section(
        &mut lines,
        "Failed",
        report
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.path.display(), f.message))
            .collect(),
    );

    lines.push(String::new());
    let count = report.assets.len();
    let noun = if count == 1 { "file" } else { "files" };
    lines.push(format!("Generated {count} {noun}"));
    lines
}

pub fn print_report(report: &GenerationReport) {
    for line in format_report(report) {
        println!("{}", line);
    }
}

/// One line for the `fingerprint` command.
pub fn format_fingerprint(fingerprint: &str, cached: bool) -> String {
    if cached {
        format!("{fingerprint} (cached)")
    } else {
        fingerprint.to_string()
    }
}
