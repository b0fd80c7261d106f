use anyhow::{Context, Result};
use std::{fs, path::Path};

use crate::portal::JobInput;

/// Parse a patient roster. One patient per line, comma/tab/semicolon
/// delimited: `subscriber_id, date_of_birth[, first_name, last_name]`.
/// Blank lines, `...` placeholder lines, and a leading header row are
/// skipped; dates arrive as either `MM/DD/YYYY` or `YYYY-MM-DD`.
pub fn parse_roster_text(text: &str) -> Vec<JobInput> {
    let mut patients = Vec::new();
    for (line_number, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("...") || trimmed.starts_with('#') {
            continue;
        }
        if line_number == 0 && looks_like_header(trimmed) {
            continue;
        }

        let parts: Vec<&str> = trimmed
            .split(['\t', ',', ';'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        if parts.len() < 2 {
            continue;
        }

        patients.push(JobInput {
            subscriber_id: parts[0].to_string(),
            date_of_birth: normalize_dob(parts[1]),
            first_name: parts.get(2).map(|s| s.to_string()).unwrap_or_default(),
            last_name: parts.get(3).map(|s| s.to_string()).unwrap_or_default(),
        });
    }
    patients
}

pub fn read_roster_file(path: &Path) -> Result<Vec<JobInput>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed reading roster {}", path.display()))?;
    Ok(parse_roster_text(&text))
}

fn looks_like_header(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    !line.chars().any(|c| c.is_ascii_digit())
        && (lowered.contains("subscriber") || lowered.contains("member") || lowered.contains("dob"))
}

/// Portals want ISO dates; rosters exported from practice management
/// systems usually carry `MM/DD/YYYY`.
fn normalize_dob(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() == 3 {
        let (month, day, year) = (parts[0], parts[1], parts[2]);
        format!("{year}-{month:0>2}-{day:0>2}")
    } else {
        raw.to_string()
    }
}
