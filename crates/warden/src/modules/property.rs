//! System property lookup from `key=value` property files

use crate::error::WorkerError;
use std::path::PathBuf;
use tracing::debug;

/// Longest property value the platform stores, including the terminator.
pub const PROPERTY_VALUE_MAX: usize = 92;

/// Value of `key` in the first file that defines it.
///
/// Unreadable files are skipped. Values longer than the platform limit are
/// truncated the way the property service would.
pub fn lookup(files: &[PathBuf], key: &str) -> Result<String, WorkerError> {
    for path in files {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                debug!("Skipping property file {}: {}", path.display(), e);
                continue;
            }
        };
        if let Some(value) = find(&text, key) {
            return Ok(truncate(value, PROPERTY_VALUE_MAX - 1).to_string());
        }
    }
    Err(WorkerError::PropertyMissing(key.to_string()))
}

fn find<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
