//! Server manifest parsing
//!
//! The manifest is a pipe-separated catalog published next to the pack
//! archives. The first non-comment line is a typed header:
//!
//! ```text
//! Name!STRING:0|Arch!STRING:0|Size!DEC:4|Checksum!HEX:16|Deps!STRING:0
//! ```
//!
//! followed by one row per pack. Lines starting with `##` are comments.
//! The `Deps` column holds a space-separated list of pack names and may
//! be empty.

use crate::error::{Error, Result};
use std::str::FromStr;

/// Expected manifest header, field order is fixed
pub const HEADER: &str = "Name!STRING:0|Arch!STRING:0|Size!DEC:4|Checksum!HEX:16|Deps!STRING:0";

const FIELD_COUNT: usize = 5;

/// One row of the server manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Pack name, unique per architecture
    pub name: String,
    /// Target architecture the row applies to
    pub arch: String,
    /// Archive size in bytes
    pub size: u64,
    /// MD5 of the archive, lowercase hex
    pub checksum: String,
    /// Names of packs this one depends on
    pub dependencies: Vec<String>,
}

/// Parse a complete manifest document.
///
/// Returns every row regardless of architecture; callers filter for the
/// architecture they care about. Duplicate `(name, arch)` rows are an
/// error.
pub fn parse(text: &str) -> Result<Vec<ManifestEntry>> {
    let mut lines = text.lines().enumerate();

    let header = loop {
        match lines.next() {
            Some((_, line)) if is_skippable(line) => {}
            Some((idx, line)) => break (idx, line.trim()),
            None => return Err(Error::invalid_manifest(0, "empty manifest")),
        }
    };
    if header.1 != HEADER {
        return Err(Error::invalid_manifest(
            header.0 + 1,
            format!("unexpected header: {}", header.1),
        ));
    }

    let mut entries: Vec<ManifestEntry> = Vec::new();
    for (idx, line) in lines {
        if is_skippable(line) {
            continue;
        }
        let entry = parse_row(idx + 1, line.trim())?;
        if entries
            .iter()
            .any(|e| e.name == entry.name && e.arch == entry.arch)
        {
            return Err(Error::invalid_manifest(
                idx + 1,
                format!("duplicate pack {} for arch {}", entry.name, entry.arch),
            ));
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn is_skippable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("##")
}

fn parse_row(line_no: usize, line: &str) -> Result<ManifestEntry> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != FIELD_COUNT {
        return Err(Error::invalid_manifest(
            line_no,
            format!("expected {FIELD_COUNT} fields, found {}", fields.len()),
        ));
    }

    let name = fields[0].trim();
    if name.is_empty() {
        return Err(Error::invalid_manifest(line_no, "empty pack name"));
    }
    let arch = fields[1].trim();
    if arch.is_empty() {
        return Err(Error::invalid_manifest(line_no, "empty arch"));
    }

    let size = u64::from_str(fields[2].trim())
        .map_err(|e| Error::invalid_manifest(line_no, format!("bad size: {e}")))?;

    let checksum = fields[3].trim().to_ascii_lowercase();
    if checksum.len() != 32 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::invalid_manifest(
            line_no,
            format!("checksum is not 16 hex bytes: {checksum}"),
        ));
    }

    let dependencies = fields[4]
        .split_whitespace()
        .map(str::to_string)
        .collect();

    Ok(ManifestEntry {
        name: name.to_string(),
        arch: arch.to_string(),
        size,
        checksum,
        dependencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(rows: &[&str]) -> String {
        let mut text = String::from("## depot pack manifest\n");
        text.push_str(HEADER);
        text.push('\n');
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text
    }

    #[test]
    fn parses_rows_and_deps() {
        let text = doc(&[
            "gfx|x64|1024|0123456789abcdef0123456789abcdef|",
            "maps|x64|2048|fedcba9876543210fedcba9876543210|gfx sound",
        ]);
        let entries = parse(&text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "gfx");
        assert!(entries[0].dependencies.is_empty());
        assert_eq!(entries[1].dependencies, vec!["gfx", "sound"]);
        assert_eq!(entries[1].size, 2048);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let text = format!(
            "## generated 2026-01-10\n\n{HEADER}\n## row comment\ngfx|x64|10|00000000000000000000000000000000|\n"
        );
        let entries = parse(&text).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rejects_bad_header() {
        let err = parse("Name|Size\ngfx|10\n").unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { line: 1, .. }));
    }

    #[test]
    fn rejects_bad_size_with_line_number() {
        let text = doc(&[
            "gfx|x64|1024|0123456789abcdef0123456789abcdef|",
            "maps|x64|lots|fedcba9876543210fedcba9876543210|",
        ]);
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { line: 4, .. }));
    }

    #[test]
    fn rejects_short_checksum() {
        let text = doc(&["gfx|x64|1024|abcd|"]);
        assert!(matches!(
            parse(&text).unwrap_err(),
            Error::InvalidManifest { .. }
        ));
    }

    #[test]
    fn rejects_duplicate_name_arch() {
        let text = doc(&[
            "gfx|x64|1024|0123456789abcdef0123456789abcdef|",
            "gfx|x64|1024|0123456789abcdef0123456789abcdef|",
        ]);
        assert!(matches!(
            parse(&text).unwrap_err(),
            Error::InvalidManifest { line: 4, .. }
        ));
    }

    #[test]
    fn same_name_across_arch_is_allowed() {
        let text = doc(&[
            "gfx|x64|1024|0123456789abcdef0123456789abcdef|",
            "gfx|arm64|1100|0123456789abcdef0123456789abcdef|",
        ]);
        let entries = parse(&text).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn rejects_empty_manifest() {
        assert!(matches!(
            parse("## nothing here\n").unwrap_err(),
            Error::InvalidManifest { line: 0, .. }
        ));
    }
}
