#[path = "build/source_rules.rs"]
mod source_rules;

use source_rules::{test_gated_modules, SourceFile, Violation};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=build");
    println!("cargo:rustc-env=SESSIONPOOL_GIT_SHA={}", git_sha());

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let root = PathBuf::from(manifest_dir);
    let sources = load_sources(&root);

    let violations: Vec<Violation> = sources.iter().flat_map(source_rules::check).collect();

    if !violations.is_empty() {
        eprintln!("\nsessionpool source rules failed:");
        for violation in &violations {
            eprintln!("  [{}] {}", violation.rule, violation.at);
        }
        eprintln!();
        panic!("{} source rule violation(s)", violations.len());
    }
}

fn git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Reads every `.rs` file under `src/`, marking the ones that only exist in
/// test builds: anything under a `tests/` directory, and modules declared
/// behind `#[cfg(test)]` without a `#[path]`.
fn load_sources(root: &Path) -> Vec<SourceFile> {
    let mut paths = Vec::new();
    collect_rust_files(&root.join("src"), &mut paths);

    let mut texts = Vec::new();
    for path in paths {
        if let Ok(text) = std::fs::read_to_string(&path) {
            texts.push((path, text));
        }
    }

    let gated: HashSet<PathBuf> = texts
        .iter()
        .flat_map(|(path, text)| test_gated_modules(path, text))
        .collect();

    texts
        .into_iter()
        .map(|(path, text)| {
            let in_tests_dir = path.components().any(|c| c.as_os_str() == "tests");
            let test_only = in_tests_dir || gated.contains(&path);
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            SourceFile {
                rel,
                text,
                test_only,
            }
        })
        .collect()
}

fn collect_rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}
