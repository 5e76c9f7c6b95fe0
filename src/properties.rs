//! Key/value properties files
//!
//! Line-oriented `key=value` files with `#` comments, as used for
//! `replication.properties` and `index.properties`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;

/// Parse properties text. Blank lines and `#`/`!` comments are skipped.
pub fn parse(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let (key, value) = line.split_at(split);
            Some((key.trim().to_string(), value[1..].trim().to_string()))
        })
        .collect()
}

/// Render properties with a comment header and a timestamp line
pub fn render(comment: &str, props: &BTreeMap<String, String>) -> String {
    let mut out = format!("#{}\n#{}\n", comment, chrono::Utc::now().to_rfc2822());
    for (key, value) in props {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Load a properties file; a missing file yields `None`
pub fn load(path: &Path) -> Result<Option<BTreeMap<String, String>>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(parse(&content))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a properties file through a sibling temp file and a rename
pub fn store(path: &Path, comment: &str, props: &BTreeMap<String, String>) -> Result<()> {
    let tmp = path.with_extension("properties.tmp");
    std::fs::write(&tmp, render(comment, props))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
