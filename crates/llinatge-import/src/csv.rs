//! RFC 4180 CSV reader.
//!
//! Handles quoted fields with doubled quotes and embedded newlines, CRLF or
//! bare LF line endings, a leading UTF-8 BOM, and picks the delimiter (`,`,
//! `;` or tab) from the header line. Short rows are padded with empty cells.

use crate::error::{Error, Result};

/// A parsed CSV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvTable {
  pub headers: Vec<String>,
  pub rows:    Vec<CsvRow>,
}

/// One data record and the (1-based) line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
  pub line:  usize,
  pub cells: Vec<String>,
}

impl CsvTable {
  pub fn column(&self, header: &str) -> Option<usize> {
    self.headers.iter().position(|h| h.eq_ignore_ascii_case(header.trim()))
  }
}

/// Count delimiter candidates outside quotes on the first line.
fn detect_delimiter(input: &str) -> char {
  let mut in_quotes = false;
  let (mut commas, mut semis, mut tabs) = (0usize, 0usize, 0usize);
  for c in input.chars() {
    match c {
      '"' => in_quotes = !in_quotes,
      '\n' if !in_quotes => break,
      ',' if !in_quotes => commas += 1,
      ';' if !in_quotes => semis += 1,
      '\t' if !in_quotes => tabs += 1,
      _ => {}
    }
  }
  if semis > commas && semis >= tabs {
    ';'
  } else if tabs > commas {
    '\t'
  } else {
    ','
  }
}

/// Split `input` into records of raw cells.
fn records(input: &str, delimiter: char) -> Result<Vec<CsvRow>> {
  let mut out = Vec::new();
  let mut cells: Vec<String> = Vec::new();
  let mut cell = String::new();
  let mut in_quotes = false;
  let mut line = 1usize;
  let mut record_line = 1usize;
  let mut quote_line = 0usize;
  let mut chars = input.chars().peekable();

  while let Some(c) = chars.next() {
    if in_quotes {
      match c {
        '"' if chars.peek() == Some(&'"') => {
          chars.next();
          cell.push('"');
        }
        '"' => in_quotes = false,
        '\n' => {
          line += 1;
          cell.push('\n');
        }
        '\r' if chars.peek() == Some(&'\n') => {}
        _ => cell.push(c),
      }
      continue;
    }
    match c {
      '"' if cell.trim().is_empty() => {
        cell.clear();
        in_quotes = true;
        quote_line = line;
      }
      '\r' if chars.peek() == Some(&'\n') => {}
      '\n' => {
        cells.push(std::mem::take(&mut cell));
        if !(cells.len() == 1 && cells[0].trim().is_empty()) {
          out.push(CsvRow { line: record_line, cells: std::mem::take(&mut cells) });
        }
        cells.clear();
        line += 1;
        record_line = line;
      }
      c if c == delimiter => cells.push(std::mem::take(&mut cell)),
      _ => cell.push(c),
    }
  }

  if in_quotes {
    return Err(Error::UnterminatedQuote(quote_line));
  }
  if !cell.is_empty() || !cells.is_empty() {
    cells.push(cell);
    if !(cells.len() == 1 && cells[0].trim().is_empty()) {
      out.push(CsvRow { line: record_line, cells });
    }
  }
  Ok(out)
}

/// Parse a whole CSV document whose first record is the header.
pub fn parse(input: &str) -> Result<CsvTable> {
  let input = input.strip_prefix('\u{feff}').unwrap_or(input);
  let delimiter = detect_delimiter(input);
  let mut recs = records(input, delimiter)?.into_iter();

  let header = recs.next().ok_or(Error::EmptyInput)?;
  let headers: Vec<String> = header.cells.iter().map(|h| h.trim().to_owned()).collect();
  let width = headers.len();

  let rows = recs
    .map(|mut r| {
      r.cells.resize(width, String::new());
      r
    })
    .collect();
  Ok(CsvTable { headers, rows })
}
