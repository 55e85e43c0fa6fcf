use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::Result;

/// Parse a dotenv file. A missing file is a silent skip, not an error.
pub fn load(path: &Path) -> Result<Option<BTreeMap<String, String>>> {
    if !path.exists() {
        debug!(path = %path.display(), "env file not present, skipping");
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(parse(&raw)))
}

/// Dotenv grammar: `export KEY=val`, full-line and inline comments outside
/// quoted strings, double-quoted values with `\n \t \r \" \\` escapes,
/// single-quoted literal values. Malformed lines (no `=`) are skipped.
/// Later assignments win over earlier ones.
pub fn parse(raw: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some(eq) = line.find('=') else {
            continue;
        };
        let key = line[..eq].trim();
        if key.is_empty() {
            continue;
        }
        let value = parse_value(line[eq + 1..].trim_start());
        vars.insert(key.to_string(), value);
    }
    vars
}

fn parse_value(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some('"') => {
            let mut value = String::new();
            let mut escaped = false;
            for c in chars {
                if escaped {
                    value.push(match c {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '"' => '"',
                        '\\' => '\\',
                        other => other,
                    });
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    break;
                } else {
                    value.push(c);
                }
            }
            value
        }
        Some('\'') => {
            let rest: String = chars.collect();
            match rest.find('\'') {
                Some(end) => rest[..end].to_string(),
                None => rest,
            }
        }
        _ => strip_inline_comment(raw).trim().to_string(),
    }
}

/// Comments start at a `#` that opens the value or follows whitespace.
fn strip_inline_comment(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && (index == 0 || bytes[index - 1].is_ascii_whitespace()) {
            return &raw[..index];
        }
    }
    raw
}
