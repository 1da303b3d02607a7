//! Local secrets file handling.

use std::io;
use std::path::Path;

/// Read secrets from a plain-text file of `KEY=VALUE` lines. The
/// returned entries are injected verbatim into every container
/// environment of a local run. A missing file simply yields no secrets.
pub fn from_file(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}
