//! Style Enforcement Tests
//!
//! Scans the workspace sources for patterns clippy does not catch on its own.
//!
//! - `dead_code_enforcement` - Prevents #[allow(dead_code)] in production code
//! - `panic_free_production` - Prevents `.unwrap()` and `.expect(` in library code

#[path = "style/workspace_scan.rs"]
mod workspace_scan;

#[path = "style/dead_code_enforcement.rs"]
mod dead_code_enforcement;

#[path = "style/panic_free_production.rs"]
mod panic_free_production;
