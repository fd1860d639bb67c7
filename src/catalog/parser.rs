//! Parser for the catalog tool's `search` table.
//!
//! The grammar is anchored on the header row:
//!
//! ```text
//! Name      Id          Version  [Match]  Source
//! ------------------------------------------------
//! <row sliced at the character offset of each header label>
//! ```
//!
//! Column widths change from one invocation to the next, so boundaries are
//! recomputed from the header every time. Offsets are counted in characters,
//! not bytes, because names routinely contain non-ASCII text and the tool
//! truncates long names with `…`.

use crate::model::CatalogEntry;
use crate::traits::ParseError;
use tracing::debug;

const NO_RESULTS_MARKER: &str = "No package found";

#[derive(Debug, Clone, Copy)]
struct Columns {
    id: usize,
    version: usize,
    /// Start of the `Match` column when present, otherwise `source`.
    version_end: usize,
    source: usize,
}

/// Parses raw `search` output into catalog entries.
///
/// Empty output and the tool's "no package found" answer both yield an empty
/// list. Anything else without a recognisable table is a [`ParseError`].
pub fn parse_search_output(output: &str) -> Result<Vec<CatalogEntry>, ParseError> {
    let lines: Vec<&str> = output.lines().map(visible_text).collect();

    let Some((header_index, columns)) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| header_columns(line).map(|c| (i, c)))
    else {
        if lines.iter().all(|l| l.trim().is_empty()) || output.contains(NO_RESULTS_MARKER) {
            return Ok(Vec::new());
        }
        return Err(ParseError::MissingHeader);
    };

    match lines.get(header_index + 1) {
        Some(line) if is_separator(line) => {}
        _ => return Err(ParseError::MissingSeparator),
    }

    let mut entries = Vec::new();
    let mut rows = 0;
    for line in &lines[header_index + 2..] {
        if line.trim().is_empty() || is_separator(line) || line.trim_start().starts_with('<') {
            continue;
        }
        rows += 1;
        match parse_row(line, columns) {
            Some(entry) => entries.push(entry),
            None => debug!(row = %line, "Skipping row without an id"),
        }
    }

    if rows > 0 && entries.is_empty() {
        return Err(ParseError::NoParsableRows { rows });
    }
    Ok(entries)
}

/// Strips progress-spinner residue: only text after the last `\r` is shown
/// on a terminal, so only that text belongs to the table.
fn visible_text(line: &str) -> &str {
    line.rsplit('\r').next().unwrap_or(line)
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '-' || c == '─')
}

/// Recognises the header row and returns the character offset of each label.
fn header_columns(line: &str) -> Option<Columns> {
    let labels = word_starts(line);
    let names: Vec<&str> = labels.iter().map(|(_, w)| *w).collect();

    // `Match` only appears when the query matched a moniker or tag.
    let has_match = match names.as_slice() {
        ["Name", "Id", "Version", "Source"] => false,
        ["Name", "Id", "Version", "Match", "Source"] => true,
        _ => return None,
    };

    let id = labels[1].0;
    let version = labels[2].0;
    let source = labels[labels.len() - 1].0;
    let version_end = if has_match { labels[3].0 } else { source };

    Some(Columns {
        id,
        version,
        version_end,
        source,
    })
}

/// Whitespace-separated words with their starting character offsets.
fn word_starts(line: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start: Option<(usize, usize)> = None; // (char offset, byte offset)

    for (char_idx, (byte_idx, c)) in line.char_indices().enumerate() {
        match (c.is_whitespace(), start) {
            (false, None) => start = Some((char_idx, byte_idx)),
            (true, Some((char_start, byte_start))) => {
                words.push((char_start, &line[byte_start..byte_idx]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some((char_start, byte_start)) = start {
        words.push((char_start, &line[byte_start..]));
    }
    words
}

fn parse_row(line: &str, columns: Columns) -> Option<CatalogEntry> {
    let chars: Vec<char> = line.chars().collect();
    let field = |from: usize, to: usize| -> String {
        let from = from.min(chars.len());
        let to = to.min(chars.len()).max(from);
        chars[from..to].iter().collect::<String>().trim().to_string()
    };

    let name = field(0, columns.id);
    let id = field(columns.id, columns.version);
    let version = field(columns.version, columns.version_end);
    let source = field(columns.source, chars.len());

    if id.is_empty() || id.contains(char::is_whitespace) {
        return None;
    }

    Some(CatalogEntry {
        name,
        id,
        version,
        source,
    })
}
