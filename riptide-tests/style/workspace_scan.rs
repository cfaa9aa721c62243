//! Workspace source discovery shared by the style checks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directories never scanned: build output and the read-only reference pack.
const SKIPPED_DIRS: &[&str] = &["target", "examples"];

/// A rule violation at one source line.
#[derive(Debug)]
pub struct Violation {
    pub file_path: String,
    pub line_number: usize,
    pub context: String,
}

impl Violation {
    pub fn new(path: &Path, line_number: usize, context: &str) -> Self {
        Self {
            file_path: path.to_string_lossy().into_owned(),
            line_number,
            context: context.trim().to_string(),
        }
    }
}

/// Every `.rs` file under `root`, skipping hidden and excluded directories.
pub fn rust_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect(root, &mut files, 0)?;
    files.sort();
    Ok(files)
}

fn collect(dir: &Path, files: &mut Vec<PathBuf>, depth: usize) -> io::Result<()> {
    if depth > 10 {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if path.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect(&path, files, depth + 1)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
    Ok(())
}

/// Lines of production code: everything before the first `#[cfg(test)]`.
pub fn production_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(index, line)| (index + 1, line))
}

/// Prints violations under `rule` and returns whether there were none.
pub fn report(rule: &str, files_checked: usize, violations: &[Violation]) -> bool {
    if violations.is_empty() {
        println!("{rule}: {files_checked} files checked, no violations found");
        return true;
    }

    println!("{rule} violations found:");
    for violation in violations {
        println!("{}:{}", violation.file_path, violation.line_number);
        println!("  {}", violation.context);
    }
    println!(
        "Found {} violation(s) in {} file(s) checked",
        violations.len(),
        files_checked
    );
    false
}
