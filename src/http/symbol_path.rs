//! Symbol path derivation.
//!
//! A symbol path is the request path with its leading slash removed.  Some
//! names that debuggers and load balancers probe for are never artifacts and
//! are rejected before any store or origin traffic.

/// API schema served by some symbol servers; never an artifact.
const SCHEMA_FILE: &str = "swagger.json";

/// File names rejected regardless of directory: the legacy index file and
/// the liveness probe.
const DENIED_FILE_NAMES: &[&str] = &["index2.txt", "pingme.txt"];

/// Normalised, non-empty relative identifier of a servable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolPath(String);

impl SymbolPath {
    /// Derive a symbol path from a request path, or `None` when the path
    /// does not name a servable artifact.
    pub fn parse(request_path: &str) -> Option<Self> {
        let path = request_path.trim_start_matches('/');
        if !is_servable(path) {
            return None;
        }
        Some(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SymbolPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_servable(path: &str) -> bool {
    if path.is_empty() || path == SCHEMA_FILE {
        return false;
    }
    if path.contains('\0') || path.split('/').any(|segment| segment == "..") {
        return false;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    !DENIED_FILE_NAMES.contains(&file_name)
}
