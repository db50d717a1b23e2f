use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::{HashMap, HashSet};

const MAX_NAME_BYTES: usize = 200;
const MAX_EXTENSION_BYTES: usize = 16;

/// Replaces path separators, control and reserved characters so the name is a
/// single flat archive entry / download filename.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_control()
                || c == '/'
                || c == '\\'
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = sanitized.trim_start_matches('.').to_string();
    if sanitized.len() <= MAX_NAME_BYTES {
        return sanitized;
    }

    // Shorten the stem, keep a short extension intact
    let ext = match sanitized.rfind('.') {
        Some(i) if i > 0 && sanitized.len() - i <= MAX_EXTENSION_BYTES => &sanitized[i..],
        _ => "",
    };
    let stem = &sanitized[..sanitized.len() - ext.len()];
    format!("{}{}", truncate_on_char_boundary(stem, MAX_NAME_BYTES - ext.len()), ext)
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Appends `ext` (without dot) unless the name already ends with it.
pub fn ensure_extension(name: &str, ext: &str) -> String {
    let suffix = format!(".{}", ext);
    if name.to_lowercase().ends_with(&suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

/// Normalizes the requested download name, defaulting to a timestamped one.
pub fn resolve_zip_name(requested: Option<&str>) -> String {
    let cleaned = requested.map(sanitize_filename).unwrap_or_default();
    let base = if cleaned.is_empty() {
        format!("render-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
    } else {
        cleaned
    };
    ensure_extension(&base, "zip")
}

/// `Content-Disposition` for an attachment with an ASCII fallback and an
/// RFC 5987 encoded name.
pub fn attachment_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .take(64)
        .collect::<String>();
    let fallback_filename = if ascii_filename.is_empty() {
        "archive.zip"
    } else {
        &ascii_filename
    };

    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback_filename, encoded_filename
    )
}

/// Hands out unique archive entry names, suffixing repeats with ` (2)`, ` (3)`, ...
/// Uniqueness is case-insensitive and also holds against names that already
/// carry such a suffix.
#[derive(Debug, Default)]
pub struct EntryNamer {
    counters: HashMap<String, u32>,
    issued: HashSet<String>,
}

impl EntryNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self, raw: &str) -> String {
        let name = sanitize_filename(raw);
        let (stem, ext) = match name.rfind('.') {
            Some(i) if i > 0 => (&name[..i], &name[i..]),
            _ => (name.as_str(), ""),
        };
        let stem = if stem.trim().is_empty() { "page" } else { stem };

        let key = format!("{}{}", stem, ext).to_lowercase();
        let count = self.counters.entry(key).or_insert(0);
        let name = loop {
            *count += 1;
            let candidate = if *count == 1 {
                format!("{}{}", stem, ext)
            } else {
                format!("{} ({}){}", stem, count, ext)
            };
            if !self.issued.contains(&candidate.to_lowercase()) {
                break candidate;
            }
        };
        self.issued.insert(name.to_lowercase());
        name
    }
}
