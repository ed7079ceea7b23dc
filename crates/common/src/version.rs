//! Build identity reported in status snapshots.

/// Crate version of this build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Human-readable build string, e.g. `termite 0.1.0`.
pub fn version_string() -> String {
    format!("termite {}", VERSION)
}
