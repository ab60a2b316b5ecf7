//! Reader for shell-style `KEY=value` files.
//!
//! Both the installation inventory and the firstboot network data use this
//! format. Values may be wrapped in single or double quotes; blank lines and
//! `#` comments are ignored.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;

use crate::error::UpgradeError;

/// Parses `KEY=value` lines into an ordered map.
///
/// Lines without `=` are skipped. Later duplicates win.
pub fn parse_key_value(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Reads and parses a key-value file.
pub fn read_key_value_file(path: &Utf8Path) -> Result<BTreeMap<String, String>, UpgradeError> {
    let text = fs::read_to_string(path)
        .map_err(|e| UpgradeError::io(format!("failed to read {}", path), e))?;
    Ok(parse_key_value(&text))
}
