//! Source rules enforced at build time over `src/`.

use std::path::{Path, PathBuf};

/// Longest a source file may grow, counting non-empty lines.
pub const MAX_SOURCE_LINES: usize = 600;

pub struct SourceFile {
    pub rel: PathBuf,
    pub text: String,
    pub test_only: bool,
}

impl SourceFile {
    /// Numbered lines that ship in the binary. The item after each
    /// `#[cfg(test)]` is skipped, up to its `;` or its closing brace.
    fn production_lines(&self) -> Vec<(usize, &str)> {
        if self.test_only {
            return Vec::new();
        }
        let mut kept = Vec::new();
        let mut gated = false;
        let mut depth: i64 = 0;
        for (index, line) in self.text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed == "#[cfg(test)]" {
                gated = true;
                continue;
            }
            if !gated {
                kept.push((index + 1, line));
                continue;
            }
            let opens = trimmed.matches('{').count() as i64;
            let closes = trimmed.matches('}').count() as i64;
            depth += opens - closes;
            if depth <= 0 && (opens > 0 || closes > 0 || trimmed.ends_with(';')) {
                gated = false;
                depth = 0;
            }
        }
        kept
    }
}

#[derive(Debug)]
pub struct Violation {
    pub rule: &'static str,
    pub at: String,
}

/// Every rule violation in `source`.
pub fn check(source: &SourceFile) -> Vec<Violation> {
    let mut violations = Vec::new();
    check_length(source, &mut violations);
    check_dead_code_allows(source, &mut violations);
    check_production_panics(source, &mut violations);
    check_blocking_sleep(source, &mut violations);
    violations
}

/// Files of `mod x;` items declared directly under `#[cfg(test)]` in `path`.
pub fn test_gated_modules(path: &Path, text: &str) -> Vec<PathBuf> {
    let Some(parent) = path.parent() else {
        return Vec::new();
    };
    let module_dir = match path.file_stem().and_then(|s| s.to_str()) {
        Some("mod") | Some("lib") | Some("main") => parent.to_path_buf(),
        Some(stem) => parent.join(stem),
        None => return Vec::new(),
    };

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    lines
        .windows(2)
        .filter(|pair| pair[0] == "#[cfg(test)]")
        .filter_map(|pair| {
            let name = pair[1]
                .trim_start_matches("pub(crate) ")
                .strip_prefix("mod ")?
                .strip_suffix(';')?;
            Some(module_dir.join(format!("{}.rs", name)))
        })
        .collect()
}

fn check_length(source: &SourceFile, violations: &mut Vec<Violation>) {
    let lines = source.text.lines().filter(|l| !l.trim().is_empty()).count();
    if lines > MAX_SOURCE_LINES {
        violations.push(Violation {
            rule: "file-length",
            at: format!(
                "{} has {} lines (max {}); split the module",
                source.rel.display(),
                lines,
                MAX_SOURCE_LINES
            ),
        });
    }
}

fn check_dead_code_allows(source: &SourceFile, violations: &mut Vec<Violation>) {
    for (number, line) in source.text.lines().enumerate() {
        let line = line.trim();
        if line.starts_with('#') && line.contains("allow(") && line.contains("dead_code") {
            violations.push(Violation {
                rule: "dead-code",
                at: format!("{}:{}", source.rel.display(), number + 1),
            });
        }
    }
}

/// Session tasks must report failures through `Result`, not take the
/// process down.
fn check_production_panics(source: &SourceFile, violations: &mut Vec<Violation>) {
    for (number, line) in source.production_lines() {
        let code = line.split("//").next().unwrap_or("");
        if code.contains(".unwrap()") || code.contains(".expect(") {
            violations.push(Violation {
                rule: "no-panic",
                at: format!("{}:{}", source.rel.display(), number),
            });
        }
    }
}

/// A blocking sleep stalls every tenant sharing the worker thread.
fn check_blocking_sleep(source: &SourceFile, violations: &mut Vec<Violation>) {
    for (number, line) in source.text.lines().enumerate() {
        if line.contains("std::thread::sleep") || line.contains("thread::sleep(") {
            violations.push(Violation {
                rule: "blocking-sleep",
                at: format!("{}:{}", source.rel.display(), number + 1),
            });
        }
    }
}

#[cfg(test)]
#[path = "../src/tests/source_rules_tests.rs"]
mod tests;
