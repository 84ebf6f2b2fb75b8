//! Incremental, header-keyed CSV parsing over chunked response bodies.

use std::collections::BTreeMap;

use cardsync_storage::{BodyStream, TransportError};
use futures::StreamExt;
use memchr::memchr;
use thiserror::Error;

/// One data row keyed by normalized header name. Cells are raw strings.
pub type CsvRow = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum CsvError {
    #[error("malformed csv line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("csv body stream failed: {0}")]
    Transport(#[from] TransportError),
}

/// Lower-cases, strips quotes and converts camelCase / spaced names to
/// snake_case so `GroupId`, `groupId`, `group id` and `group_id` collide.
pub fn normalize_header(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_start_matches('\u{feff}')
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();

    let mut out = String::with_capacity(trimmed.len() + 4);
    let mut prev: Option<char> = None;
    for ch in trimmed.chars() {
        if ch.is_ascii_uppercase() {
            if matches!(prev, Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
        prev = Some(ch);
    }
    out.trim_matches('_').to_string()
}

/// Line-oriented parser that tolerates lines split across chunks.
///
/// The first non-blank line is the header row. Short rows leave trailing
/// columns absent; cells beyond the header count are dropped.
#[derive(Debug)]
pub struct CsvStreamParser {
    delimiter: u8,
    buffer: Vec<u8>,
    scan_from: usize,
    headers: Option<Vec<String>>,
    line_no: usize,
}

impl Default for CsvStreamParser {
    fn default() -> Self {
        Self::new(b',')
    }
}

impl CsvStreamParser {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buffer: Vec::new(),
            scan_from: 0,
            headers: None,
            line_no: 0,
        }
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    /// Appends a chunk and returns the rows it completed. Rows are split
    /// lazily as the iterator advances.
    pub fn feed(&mut self, chunk: &[u8]) -> CompletedRows<'_> {
        self.buffer.extend_from_slice(chunk);
        CompletedRows { parser: self }
    }

    /// Flushes the stream once it has ended: any complete rows not yet
    /// drained, then the trailing partial line if it is non-blank.
    pub fn finalize(mut self) -> Result<Vec<CsvRow>, CsvError> {
        let mut rows = self.feed(&[]).collect::<Result<Vec<_>, _>>()?;
        let rest = std::mem::take(&mut self.buffer);
        if !rest.iter().all(|b| b.is_ascii_whitespace()) {
            if let Some(row) = self.process_line(&rest)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = memchr(b'\n', &self.buffer[self.scan_from..])? + self.scan_from;
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        self.scan_from = 0;
        Some(line)
    }

    fn process_line(&mut self, raw: &[u8]) -> Result<Option<CsvRow>, CsvError> {
        self.line_no += 1;
        let line = trim_line_ending(raw);
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }

        let cells = self.split_line(line)?;
        let Some(headers) = &self.headers else {
            self.headers = Some(cells.iter().map(|c| normalize_header(c)).collect());
            return Ok(None);
        };

        let row = headers
            .iter()
            .zip(cells)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, cell)| (name.clone(), cell))
            .collect();
        Ok(Some(row))
    }

    fn split_line(&self, line: &[u8]) -> Result<Vec<String>, CsvError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(line);
        let mut record = csv::ByteRecord::new();
        reader
            .read_byte_record(&mut record)
            .map_err(|e| CsvError::Malformed {
                line: self.line_no,
                reason: e.to_string(),
            })?;
        Ok(record
            .iter()
            .map(|cell| {
                String::from_utf8_lossy(cell)
                    .trim_matches('"')
                    .trim()
                    .to_string()
            })
            .collect())
    }

    fn mark_scanned(&mut self) {
        self.scan_from = self.buffer.len();
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

pub struct CompletedRows<'a> {
    parser: &'a mut CsvStreamParser,
}

impl Iterator for CompletedRows<'_> {
    type Item = Result<CsvRow, CsvError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(line) = self.parser.take_line() else {
                self.parser.mark_scanned();
                return None;
            };
            match self.parser.process_line(&line) {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Drives a parser over a streamed body, handing each row to `on_row` along
/// with the header row. Returns the number of data rows seen.
pub async fn read_rows<F>(mut body: BodyStream, delimiter: u8, mut on_row: F) -> Result<usize, CsvError>
where
    F: FnMut(&[String], CsvRow),
{
    let mut parser = CsvStreamParser::new(delimiter);
    let mut count = 0usize;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let rows = parser.feed(&chunk).collect::<Result<Vec<_>, _>>()?;
        let headers = parser.headers().unwrap_or_default().to_vec();
        for row in rows {
            count += 1;
            on_row(&headers, row);
        }
    }
    let headers = parser.headers().unwrap_or_default().to_vec();
    for row in parser.finalize()? {
        count += 1;
        on_row(&headers, row);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    fn chunks_stream(parts: Vec<&'static str>) -> BodyStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes())))).boxed()
    }

    fn parse_chunks(chunks: &[&[u8]]) -> Vec<CsvRow> {
        let mut parser = CsvStreamParser::default();
        let mut rows = Vec::new();
        for chunk in chunks {
            for row in parser.feed(chunk) {
                rows.push(row.unwrap());
            }
        }
        rows.extend(parser.finalize().unwrap());
        rows
    }

    fn row(pairs: &[(&str, &str)]) -> CsvRow {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn header_names_normalize_to_snake_case() {
        assert_eq!(normalize_header("GroupId"), "group_id");
        assert_eq!(normalize_header(" \"groupId\" "), "group_id");
        assert_eq!(normalize_header("group_id"), "group_id");
        assert_eq!(normalize_header("Group ID"), "group_id");
        assert_eq!(normalize_header("productID"), "product_id");
        assert_eq!(normalize_header("Name"), "name");
    }

    #[test]
    fn rows_split_between_chunks_parse_like_a_single_chunk() {
        let rows = parse_chunks(&[b"GroupId,Name\n1,Base Set\n", b"2,Jungle\n"]);
        assert_eq!(
            rows,
            vec![
                row(&[("group_id", "1"), ("name", "Base Set")]),
                row(&[("group_id", "2"), ("name", "Jungle")]),
            ]
        );
    }

    #[test]
    fn every_split_offset_matches_the_unsplit_parse() {
        let payload: &[u8] =
            b"productId,name,\"Clean Name\",groupId\r\n10,\"Charizard, Holo\",Charizard Holo,1\r\n11,Blastoise,Blastoise,1\r\n12,Venusaur,Venusaur,1";
        let whole = parse_chunks(&[payload]);
        assert_eq!(whole.len(), 3);
        assert_eq!(whole[0].get("name").map(String::as_str), Some("Charizard, Holo"));
        for cut in 0..=payload.len() {
            let (a, b) = payload.split_at(cut);
            assert_eq!(parse_chunks(&[a, b]), whole, "split at byte {cut}");
        }
    }

    #[test]
    fn short_and_long_rows_do_not_fail() {
        let rows = parse_chunks(&[b"a,b,c\n1\n1,2,3,4,5\n"]);
        assert_eq!(rows[0], row(&[("a", "1")]));
        assert_eq!(rows[1], row(&[("a", "1"), ("b", "2"), ("c", "3")]));
    }

    #[test]
    fn finalize_ignores_blank_trailing_input() {
        let mut parser = CsvStreamParser::default();
        assert_eq!(parser.feed(b"a,b\n1,2\n  ").count(), 1);
        assert!(parser.finalize().unwrap().is_empty());
    }

    #[test]
    fn custom_delimiter_is_honored() {
        let mut parser = CsvStreamParser::new(b'\t');
        let rows: Vec<_> = parser.feed(b"id\tname\n7\tGym Heroes\n").collect();
        assert_eq!(rows[0].as_ref().unwrap(), &row(&[("id", "7"), ("name", "Gym Heroes")]));
    }

    #[tokio::test]
    async fn read_rows_walks_a_body_stream() {
        let body = chunks_stream(vec!["GroupId,Name\n", "1,Base Set\n2,Jun", "gle"]);
        let mut names = Vec::new();
        let count = read_rows(body, b',', |headers, row| {
            assert_eq!(headers, ["group_id".to_string(), "name".to_string()]);
            names.push(row["name"].clone());
        })
        .await
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(names, vec!["Base Set", "Jungle"]);
    }
}
