//! Minimal INI reader
//!
//! Splits a file into `[section]` blocks of `key = value` pairs. Keys are
//! case-insensitive and stored lowercased; section names keep their case.

use std::collections::HashMap;
use std::path::Path;

use super::ConfigError;

/// Parsed INI content: section name -> (lowercased key -> raw value)
pub type IniSections = HashMap<String, HashMap<String, String>>;

/// Parse INI text into sections
pub fn parse_ini(content: &str) -> Result<IniSections, ConfigError> {
    let mut sections: IniSections = HashMap::new();
    let mut current: Option<String> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line = strip_comment(raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::ParseError {
                line: idx + 1,
                message: format!("unterminated section header '{}'", line),
            })?;
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let (key, value) = parse_key_value(line).ok_or_else(|| ConfigError::ParseError {
            line: idx + 1,
            message: format!("expected 'key = value', got '{}'", line),
        })?;

        let section = current.as_ref().ok_or_else(|| ConfigError::ParseError {
            line: idx + 1,
            message: format!("key '{}' appears before any section header", key),
        })?;

        sections
            .entry(section.clone())
            .or_default()
            .insert(key.to_ascii_lowercase(), unquote(value).to_string());
    }

    Ok(sections)
}

/// Read and parse an INI file
pub fn read_ini_file(path: &Path) -> Result<IniSections, ConfigError> {
    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Err(e) => {
            return Err(ConfigError::IoError {
                path: path.display().to_string(),
                message: e.to_string(),
            });
        }
    };
    parse_ini(&content)
}

/// Strip `;` and `#` comments, ignoring markers inside double quotes
fn strip_comment(line: &str) -> String {
    let mut result = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
            result.push(ch);
        } else if (ch == ';' || ch == '#') && !in_quotes {
            break;
        } else {
            result.push(ch);
        }
    }

    result
}

/// Parse a `key = value` or `key: value` line
fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(['=', ':'])?;
    let key = line[..split_at].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, line[split_at + 1..].trim()))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
