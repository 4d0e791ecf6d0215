//! Minimal `.env` loader. Variables already present in the process
//! environment are never overwritten.

use std::fs;
use std::path::Path;

/// Load `path` into the process environment. Returns how many variables were set.
pub fn load(path: &Path) -> Result<usize, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut set = 0;
    for (n, line) in content.lines().enumerate() {
        let Some((key, value)) = parse_line(line).map_err(|e| format!("{}:{}: {}", path.display(), n + 1, e))? else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // SAFETY: called from main before any other thread is spawned
            unsafe {
                std::env::set_var(&key, value);
            }
            set += 1;
        }
    }
    Ok(set)
}

/// `KEY=value`, `export KEY=value`, quoted values and trailing comments.
/// Blank lines and comment lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or("expected KEY=value")?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }
    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        let unquoted = raw.split('#').next().unwrap_or_default();
        return Ok(unquoted.trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quote == '"' => {
                let escaped = chars.next().ok_or("unterminated escape sequence")?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = chars.as_str().trim();
                if !rest.is_empty() && !rest.starts_with('#') {
                    return Err("unexpected text after closing quote".to_string());
                }
                return Ok(value);
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}
