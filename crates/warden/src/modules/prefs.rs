//! Shared-preferences XML lookup
//!
//! Preference files look like
//!
//! ```xml
//! <map>
//!     <string name="number">+15550100</string>
//!     <int name="count" value="3" />
//! </map>
//! ```
//!
//! The entry is the first element whose `name` attribute equals the key. Its
//! value is the `value` attribute when present, otherwise the text content.

use crate::error::WorkerError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::Read;
use std::path::Path;

/// Preference files larger than this are read only up to the limit.
pub const MAX_PREFS_SIZE: usize = 16 * 1024;

pub fn read_value(path: &Path, key: &str) -> Result<String, WorkerError> {
    let file = std::fs::File::open(path).map_err(|source| WorkerError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut raw = Vec::with_capacity(MAX_PREFS_SIZE);
    file.take(MAX_PREFS_SIZE as u64)
        .read_to_end(&mut raw)
        .map_err(|source| WorkerError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    find_value(&String::from_utf8_lossy(&raw), key)
}

fn find_value(xml: &str, key: &str) -> Result<String, WorkerError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Set while inside the matching element, waiting for its text.
    let mut in_match = false;

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) => {
                if name_matches(&e, key)? {
                    if let Some(value) = value_attribute(&e)? {
                        return Ok(value);
                    }
                }
            }
            Ok(Event::Start(e)) => {
                if name_matches(&e, key)? {
                    if let Some(value) = value_attribute(&e)? {
                        return Ok(value);
                    }
                    in_match = true;
                }
            }
            Ok(Event::Text(t)) if in_match => {
                let text = t
                    .unescape()
                    .map_err(|e| WorkerError::XmlParse(e.to_string()))?;
                if !text.is_empty() {
                    return Ok(text.into_owned());
                }
            }
            Ok(Event::End(_)) => in_match = false,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(WorkerError::XmlParse(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    Err(WorkerError::XmlParse(format!("no entry named '{key}'")))
}

fn name_matches(e: &BytesStart<'_>, key: &str) -> Result<bool, WorkerError> {
    Ok(attribute(e, "name")?.as_deref() == Some(key))
}

fn value_attribute(e: &BytesStart<'_>) -> Result<Option<String>, WorkerError> {
    attribute(e, "value")
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, WorkerError> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|err| WorkerError::XmlParse(err.to_string()))?;
    match attr {
        Some(a) => a
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|err| WorkerError::XmlParse(err.to_string())),
        None => Ok(None),
    }
}
