//! Panic-Free Production Code
//!
//! Library code propagates errors instead of panicking on them. Backends
//! run on consumer threads where a panic would take the consumer down.

use std::fs;
use std::path::Path;

use crate::workspace_scan::{Violation, production_lines, report, rust_files};

const BANNED_CALLS: &[&str] = &[".unwrap()", ".expect("];

fn is_library_source(path: &Path) -> bool {
    let path_str = path.to_string_lossy().replace('\\', "/");
    path_str.contains("riptide-channel/src/") && !path_str.ends_with("test_fixtures.rs")
}

fn scan(path: &Path, content: &str, violations: &mut Vec<Violation>) {
    for (line_number, line) in production_lines(content) {
        let code = line.split("//").next().unwrap_or_default();
        if BANNED_CALLS.iter().any(|call| code.contains(call)) {
            violations.push(Violation::new(path, line_number, line));
        }
    }
}

#[test]
fn test_detects_unwrap_outside_tests() {
    let content = r#"
fn parse(value: &str) -> u32 {
    value.parse().unwrap()
}

fn fallback(value: Option<u32>) -> u32 {
    // callers never pass None, so .unwrap() would be fine here
    value.unwrap_or_default()
}

fn opened() -> std::fs::File {
    std::fs::File::open("x").expect("file")
}

#[cfg(test)]
mod tests {
    fn helper() {
        Some(1).unwrap();
    }
}
"#;
    let mut violations = Vec::new();
    scan(Path::new("src/lib.rs"), content, &mut violations);

    let lines: Vec<usize> = violations.iter().map(|v| v.line_number).collect();
    assert_eq!(lines, vec![3, 12]);
}

#[test]
fn test_only_library_sources_are_checked() {
    assert!(is_library_source(Path::new("../riptide-channel/src/channel/request.rs")));
    assert!(!is_library_source(Path::new("../riptide-channel/src/test_fixtures.rs")));
    assert!(!is_library_source(Path::new("../riptide-channel/benches/channel_throughput.rs")));
    assert!(!is_library_source(Path::new("../riptide-tests/integration/support.rs")));
}

#[test]
fn panic_free_production() {
    let mut violations = Vec::new();
    let mut files_checked = 0;
    for path in rust_files(Path::new("..")).expect("scan workspace") {
        if !is_library_source(&path) {
            continue;
        }
        let content = fs::read_to_string(&path).expect("read source file");
        scan(&path, &content, &mut violations);
        files_checked += 1;
    }

    assert!(
        report("Panic-free production", files_checked, &violations),
        "unwrap/expect found in library code - see output above"
    );
}
