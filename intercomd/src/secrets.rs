//! Reads secret material destined for an agent's stdin payload.
//!
//! Secrets never touch the agent's environment or disk beyond the operator's
//! own secrets file — they are read once, attached to the stdin JSON, and
//! zeroed out of this process's memory immediately after the write completes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use zeroize::Zeroize;

/// Parses a `KEY=VALUE` env-file. Blank lines and lines starting with `#` are
/// ignored. Values are not shell-quoted or expanded.
pub fn read_secrets(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read secrets file: {}", path.display()))?;
    Ok(parse_env_file(&raw))
}

fn parse_env_file(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim().to_string();
            if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
                || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
            {
                value = value[1..value.len() - 1].to_string();
            }
            if !key.is_empty() {
                out.insert(key.to_string(), value);
            }
        }
    }
    out
}

/// Overwrites every value's backing bytes with zeros before dropping the map.
/// `secrets` is left empty but callable again afterward.
pub fn zeroize_secrets(secrets: &mut HashMap<String, String>) {
    for value in secrets.values_mut() {
        value.zeroize();
    }
    secrets.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_simple_env_file() {
        let parsed = parse_env_file("API_KEY=abc123\n# comment\n\nOTHER=\"quoted value\"\n");
        assert_eq!(parsed.get("API_KEY").map(String::as_str), Some("abc123"));
        assert_eq!(parsed.get("OTHER").map(String::as_str), Some("quoted value"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn missing_file_returns_empty_map() {
        let result = read_secrets(Path::new("/nonexistent/secrets.env")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn reads_from_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.env");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "TOKEN=xyz").unwrap();
        let secrets = read_secrets(&path).unwrap();
        assert_eq!(secrets.get("TOKEN").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn zeroize_clears_map_and_scrubs_bytes() {
        let mut secrets = HashMap::new();
        secrets.insert("K".to_string(), "supersecret".to_string());
        zeroize_secrets(&mut secrets);
        assert!(secrets.is_empty());
    }
}
