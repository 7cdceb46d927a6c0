//! Timing-file layouts: separator inference and the three parsers

use super::{EventsContent, ParsedEvents};
use crate::error::{EngineError, EngineResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

const HEADER_START: &str = "Header Start";
const HEADER_END: &str = "Header End";
const LOGFRAME_START: &str = "LogFrame Start";
const LOGFRAME_END: &str = "LogFrame End";

/// Spreadsheet rows following the header that hold template boilerplate
const SPREADSHEET_SKIPPED_ROWS: usize = 2;

/// Field separator of a delimited file; runs of separators count as one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    TabOrSpace,
    CommaOrSpace,
}

impl Separator {
    /// Infer the separator from the extension; `.txt` files are resolved from
    /// their first line in [`parse`]
    pub fn for_path(path: &str) -> EngineResult<Option<Separator>> {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "tsv" => Ok(Some(Separator::TabOrSpace)),
            "csv" | "out" | "xlsx" => Ok(Some(Separator::CommaOrSpace)),
            "txt" => Ok(None),
            _ => Err(EngineError::UnknownExtension(path.to_string())),
        }
    }

    /// Separator of a `.txt` file, from its first line
    pub fn sniff(first_line: &str) -> Separator {
        if first_line.contains(',') {
            Separator::CommaOrSpace
        } else {
            Separator::TabOrSpace
        }
    }

    fn is_separator(self, c: char) -> bool {
        match self {
            Separator::TabOrSpace => c == '\t' || c == ' ',
            Separator::CommaOrSpace => c == ',' || c == ' ',
        }
    }

    pub fn split(self, line: &str) -> Vec<String> {
        line.split(|c: char| self.is_separator(c))
            .filter(|field| !field.is_empty())
            .map(strip_quotes)
            .collect()
    }
}

/// Parse any supported content into rows
pub fn parse(content: &EventsContent, separator: Option<Separator>) -> ParsedEvents {
    match content {
        EventsContent::Cells(cells) => parse_cells(cells),
        EventsContent::Text(text) if is_legacy_log(text) => parse_legacy(text),
        EventsContent::Text(text) => {
            let separator = separator.unwrap_or_else(|| {
                Separator::sniff(text.lines().next().unwrap_or_default())
            });
            parse_delimited(text, separator)
        }
    }
}

fn is_legacy_log(text: &str) -> bool {
    text.contains(HEADER_START) && text.contains(LOGFRAME_START)
}

/// Line-oriented log of `key: value` pairs in header and logframe blocks
///
/// Each logframe block becomes one row. Header values fill any key a row does
/// not set itself, so identity fields recorded once in the header are visible
/// on every row.
pub fn parse_legacy(text: &str) -> ParsedEvents {
    #[derive(PartialEq)]
    enum Block {
        None,
        Header,
        Frame,
    }

    let mut header: BTreeMap<String, String> = BTreeMap::new();
    let mut frames: Vec<BTreeMap<String, String>> = Vec::new();
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    let mut headers: Vec<String> = Vec::new();
    let mut block = Block::None;

    for line in text.lines() {
        let line = line.trim();
        if line.contains(HEADER_START) {
            block = Block::Header;
        } else if line.contains(HEADER_END) {
            block = Block::None;
        } else if line.contains(LOGFRAME_START) {
            block = Block::Frame;
            current.clear();
        } else if line.contains(LOGFRAME_END) {
            frames.push(std::mem::take(&mut current));
            block = Block::None;
        } else if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            if key.is_empty() || block == Block::None {
                continue;
            }
            if !headers.contains(&key) {
                headers.push(key.clone());
            }
            let value = value.trim().to_string();
            if block == Block::Header {
                header.insert(key, value);
            } else {
                current.insert(key, value);
            }
        }
    }

    let rows = frames
        .into_iter()
        .map(|mut row| {
            for (key, value) in &header {
                row.entry(key.clone()).or_insert_with(|| value.clone());
            }
            row
        })
        .collect();

    ParsedEvents { headers, rows }
}

/// Header row plus data rows split by `separator`
///
/// Header names are lower-cased with quotes removed. Rows with fewer than two
/// fields (unless the table itself has a single column), or no alphanumeric
/// content at all, are skipped.
pub fn parse_delimited(text: &str, separator: Separator) -> ParsedEvents {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let headers: Vec<String> = match lines.next() {
        Some(line) => separator
            .split(line.trim())
            .into_iter()
            .map(|h| h.to_lowercase())
            .collect(),
        None => return ParsedEvents::default(),
    };

    let rows = lines
        .map(|line| separator.split(line.trim()))
        .filter(|fields| fields.len() >= 2 || (headers.len() < 2 && !fields.is_empty()))
        .filter(|fields| fields.iter().any(|f| f.chars().any(char::is_alphanumeric)))
        .map(|fields| headers.iter().cloned().zip(fields).collect())
        .collect();

    ParsedEvents { headers, rows }
}

/// Rows rebuilt from a sparse `"B3" -> value` cell map
pub fn parse_cells(cells: &BTreeMap<String, Value>) -> ParsedEvents {
    let mut grid: BTreeMap<u32, BTreeMap<u32, String>> = BTreeMap::new();
    for (reference, value) in cells {
        if let Some((column, row)) = cell_position(reference) {
            grid.entry(row).or_default().insert(column, cell_text(value));
        }
    }

    let mut rows_iter = grid.into_iter();
    let Some((_, header_cells)) = rows_iter.next() else {
        return ParsedEvents::default();
    };

    let columns: Vec<(u32, String)> = header_cells
        .into_iter()
        .map(|(column, name)| (column, strip_quotes(&name).to_lowercase()))
        .filter(|(_, name)| !name.is_empty())
        .collect();
    let headers = columns.iter().map(|(_, name)| name.clone()).collect();

    let rows = rows_iter
        .skip(SPREADSHEET_SKIPPED_ROWS)
        .map(|(_, values)| {
            columns
                .iter()
                .filter_map(|(column, name)| values.get(column).map(|v| (name.clone(), v.clone())))
                .collect::<BTreeMap<String, String>>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    ParsedEvents { headers, rows }
}

/// Parse an A1-style reference into (column, row), both 1-based
fn cell_position(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let column = letters
        .chars()
        .fold(0u32, |acc, c| acc * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1));
    let row = digits.parse().ok()?;
    Some((column, row))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn strip_quotes(field: &str) -> String {
    field.chars().filter(|c| *c != '"' && *c != '\'').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_separator_by_extension() {
        assert_eq!(Separator::for_path("a.tsv").unwrap(), Some(Separator::TabOrSpace));
        assert_eq!(Separator::for_path("a.CSV").unwrap(), Some(Separator::CommaOrSpace));
        assert_eq!(Separator::for_path("a.out").unwrap(), Some(Separator::CommaOrSpace));
        assert_eq!(Separator::for_path("a.xlsx").unwrap(), Some(Separator::CommaOrSpace));
        assert_eq!(Separator::for_path("a.txt").unwrap(), None);
        assert!(matches!(
            Separator::for_path("a.mat"),
            Err(EngineError::UnknownExtension(_))
        ));
    }

    #[test]
    fn test_txt_separator_sniffed_from_first_line() {
        let parsed = parse(&EventsContent::Text("Onset,Dur\n1,2\n".to_string()), None);
        assert_eq!(parsed.headers, vec!["onset", "dur"]);
        assert_eq!(parsed.rows[0]["dur"], "2");

        let parsed = parse(&EventsContent::Text("Onset\tDur\n1\t2\n".to_string()), None);
        assert_eq!(parsed.rows[0]["onset"], "1");
    }

    #[test]
    fn test_delimited_skips_short_and_empty_rows() {
        let text = "\"Onset\"\t'Trial Type'\n1.0\tgo\n---\t---\nonly\n2.0  stop\n";
        let parsed = parse_delimited(text, Separator::TabOrSpace);
        assert_eq!(parsed.headers, vec!["onset", "trial", "type"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[1]["trial"], "stop");
    }

    #[test]
    fn test_legacy_blocks_merge_header_into_rows() {
        let text = "*** Header Start ***\nSubject: 7\nSession: 1\n*** Header End ***\n\
            Level: 2\n*** LogFrame Start ***\nProcedure: Trial\nStim.OnsetTime: 1500\n*** LogFrame End ***\n\
            *** LogFrame Start ***\nProcedure: Trial\nStim.OnsetTime: 3500\nSession: 2\n*** LogFrame End ***\n";
        let parsed = parse(&EventsContent::Text(text.to_string()), Some(Separator::TabOrSpace));

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0]["Subject"], "7");
        assert_eq!(parsed.rows[0]["Stim.OnsetTime"], "1500");
        assert_eq!(parsed.rows[1]["Session"], "2");
        assert!(parsed.headers.contains(&"Procedure".to_string()));
    }

    #[test]
    fn test_cells_skip_boilerplate_rows() {
        let cells: BTreeMap<String, Value> = [
            ("A1", json!("Onset")),
            ("B1", json!("Trial")),
            ("A2", json!("template")),
            ("A3", json!("template")),
            ("A4", json!(1.5)),
            ("B4", json!("go")),
            ("A5", json!(3)),
            ("AA5", json!("ignored")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let parsed = parse_cells(&cells);
        assert_eq!(parsed.headers, vec!["onset", "trial"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0]["onset"], "1.5");
        assert_eq!(parsed.rows[1]["onset"], "3");
        assert!(!parsed.rows[1].contains_key("trial"));
    }

    #[test]
    fn test_cell_reference_parsing() {
        assert_eq!(cell_position("A1"), Some((1, 1)));
        assert_eq!(cell_position("AB12"), Some((28, 12)));
        assert_eq!(cell_position("12"), None);
    }
}
