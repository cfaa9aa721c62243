//! Dead Code Enforcement
//!
//! Production code must not silence the dead code lint. Test code and the
//! test-only fixtures module are exempt.

use std::fs;
use std::path::Path;

use crate::workspace_scan::{Violation, production_lines, report, rust_files};

fn is_exempt(path: &Path) -> bool {
    let path_str = path.to_string_lossy().replace('\\', "/");
    path_str.contains("/tests/")
        || path_str.contains("riptide-tests/")
        || path_str.contains("/benches/")
        || path_str.ends_with("test_fixtures.rs")
}

fn allows_dead_code(line: &str) -> bool {
    let trimmed = line.trim_start();
    (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
        && trimmed.contains("dead_code")
}

fn scan(path: &Path, content: &str, violations: &mut Vec<Violation>) {
    for (line_number, line) in production_lines(content) {
        if allows_dead_code(line) {
            violations.push(Violation::new(path, line_number, line));
        }
    }
}

#[test]
fn test_detects_allow_attributes() {
    let content = r#"
use std::collections::HashMap;

#[allow(dead_code)]
struct UnusedStruct {
    field: u32,
}

#[allow(clippy::missing_docs, dead_code)]
fn unused_function() {}

#[cfg(test)]
mod tests {
    #[allow(dead_code)]
    fn helper() {}
}
"#;
    let mut violations = Vec::new();
    scan(Path::new("src/lib.rs"), content, &mut violations);

    let lines: Vec<usize> = violations.iter().map(|v| v.line_number).collect();
    assert_eq!(lines, vec![4, 9]);
}

#[test]
fn test_exempt_paths() {
    assert!(is_exempt(Path::new("../riptide-tests/integration/support.rs")));
    assert!(is_exempt(Path::new("../riptide-channel/src/test_fixtures.rs")));
    assert!(is_exempt(Path::new("../riptide-channel/benches/channel_throughput.rs")));
    assert!(!is_exempt(Path::new("../riptide-channel/src/lib.rs")));
    assert!(!is_exempt(Path::new("../riptide-channel/src/backends/local.rs")));
}

#[test]
fn dead_code_enforcement() {
    let mut violations = Vec::new();
    let mut files_checked = 0;
    for path in rust_files(Path::new("..")).expect("scan workspace") {
        if is_exempt(&path) {
            continue;
        }
        let content = fs::read_to_string(&path).expect("read source file");
        scan(&path, &content, &mut violations);
        files_checked += 1;
    }

    assert!(
        report("Dead code enforcement", files_checked, &violations),
        "Dead code allowance violations found in production code - see output above"
    );
}
