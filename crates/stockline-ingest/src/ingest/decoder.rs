//! Record decoder
//!
//! Turns an uploaded byte stream into a lazy, single-pass sequence of
//! `(line_number, fields | decode error)`. Newline-delimited JSON is the
//! primary format; CSV with a header row and gzip-compressed variants of
//! both are accepted as well. Malformed lines are yielded as errors and the
//! stream continues; an I/O failure ends the stream with a fatal error.

use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader, Read};

use super::types::EntityKind;
use crate::error::IngestError;

/// Parsed field map of one input line
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Ndjson,
    Csv,
}

/// How to read a named source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub format: SourceFormat,
    pub gzip: bool,
}

impl SourceDescriptor {
    /// Derive format and compression from the file extension.
    pub fn from_file_name(name: &str) -> Result<Self, IngestError> {
        let lower = name.to_ascii_lowercase();
        let (stem, gzip) = match lower.strip_suffix(".gz") {
            Some(stem) => (stem, true),
            None => (lower.as_str(), false),
        };

        let format = if stem.ends_with(".ndjson") || stem.ends_with(".jsonl") {
            SourceFormat::Ndjson
        } else if stem.ends_with(".csv") {
            SourceFormat::Csv
        } else {
            return Err(IngestError::Structural(format!(
                "unsupported file type '{}' (expected .ndjson, .jsonl or .csv, optionally .gz)",
                name
            )));
        };

        Ok(Self { format, gzip })
    }
}

/// Resolve the entity kind of a source: an explicit hint wins, otherwise the
/// file name must follow the `{kind}_*` convention.
pub fn infer_kind(file_name: &str, hint: Option<EntityKind>) -> Result<EntityKind, IngestError> {
    hint.or_else(|| EntityKind::from_file_name(file_name))
        .ok_or_else(|| {
            IngestError::Structural(format!(
                "cannot determine entity kind for '{}'; expected customers_*, products_*, orders_* or order_items_*",
                file_name
            ))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub message: String,
    /// The stream cannot continue past this point
    pub fatal: bool,
}

impl DecodeError {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// One non-blank input line
#[derive(Debug, Clone)]
pub struct DecodedLine {
    /// 1-based physical line number in the decompressed stream
    pub line_number: u64,
    pub result: Result<Fields, DecodeError>,
}

/// Build a decoder over `reader` for the given source description.
pub fn decode<'a, R>(reader: R, descriptor: SourceDescriptor) -> Box<dyn Iterator<Item = DecodedLine> + Send + 'a>
where
    R: Read + Send + 'a,
{
    let reader: Box<dyn Read + Send + 'a> = if descriptor.gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    match descriptor.format {
        SourceFormat::Ndjson => Box::new(NdjsonLines::new(reader)),
        SourceFormat::Csv => Box::new(CsvLines::new(reader)),
    }
}

/// Newline-delimited JSON, one object per line
pub struct NdjsonLines<R> {
    reader: BufReader<R>,
    line_number: u64,
    buf: Vec<u8>,
    finished: bool,
}

impl<R: Read> NdjsonLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line_number: 0,
            buf: Vec::with_capacity(1024),
            finished: false,
        }
    }

    fn parse_line(bytes: &[u8]) -> Option<Result<Fields, DecodeError>> {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text.trim(),
            Err(e) => return Some(Err(DecodeError::malformed(format!("invalid UTF-8: {}", e)))),
        };

        if text.is_empty() {
            return None;
        }

        Some(match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(other) => Err(DecodeError::malformed(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
            Err(e) => Err(DecodeError::malformed(format!("invalid JSON: {}", e))),
        })
    }
}

impl<R: Read> Iterator for NdjsonLines<R> {
    type Item = DecodedLine;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.finished = true,
                Ok(_) => {
                    self.line_number += 1;
                    if let Some(result) = Self::parse_line(&self.buf) {
                        return Some(DecodedLine {
                            line_number: self.line_number,
                            result,
                        });
                    }
                },
                Err(e) => {
                    self.finished = true;
                    return Some(DecodedLine {
                        line_number: self.line_number + 1,
                        result: Err(DecodeError::fatal(format!("read failed: {}", e))),
                    });
                },
            }
        }
        None
    }
}

/// CSV with a header row; every non-empty cell becomes a string field
pub struct CsvLines<R> {
    headers: Option<csv::StringRecord>,
    records: csv::StringRecordsIntoIter<R>,
    header_error: Option<DecodeError>,
    finished: bool,
}

impl<R: Read> CsvLines<R> {
    pub fn new(reader: R) -> Self {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let (headers, header_error) = match csv_reader.headers() {
            Ok(headers) => (Some(headers.clone()), None),
            Err(e) => (None, Some(DecodeError::fatal(format!("unreadable CSV header: {}", e)))),
        };

        Self {
            headers,
            records: csv_reader.into_records(),
            header_error,
            finished: false,
        }
    }
}

impl<R: Read> Iterator for CsvLines<R> {
    type Item = DecodedLine;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if let Some(err) = self.header_error.take() {
            self.finished = true;
            return Some(DecodedLine {
                line_number: 1,
                result: Err(err),
            });
        }

        let headers = self.headers.as_ref()?;

        loop {
            let record = match self.records.next() {
                Some(record) => record,
                None => {
                    self.finished = true;
                    return None;
                },
            };

            return Some(match record {
                Ok(record) => {
                    let line_number = record.position().map(|p| p.line()).unwrap_or(0);
                    if record.iter().all(str::is_empty) {
                        continue;
                    }
                    let fields = headers
                        .iter()
                        .zip(record.iter())
                        .filter(|(_, cell)| !cell.is_empty())
                        .map(|(name, cell)| (name.to_string(), Value::String(cell.to_string())))
                        .collect();
                    DecodedLine {
                        line_number,
                        result: Ok(fields),
                    }
                },
                Err(e) => {
                    let line_number = e.position().map(|p| p.line()).unwrap_or(0);
                    let fatal = e.is_io_error();
                    if fatal {
                        self.finished = true;
                    }
                    DecodedLine {
                        line_number,
                        result: Err(DecodeError {
                            message: format!("malformed CSV row: {}", e),
                            fatal,
                        }),
                    }
                },
            });
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    const NDJSON: SourceDescriptor = SourceDescriptor {
        format: SourceFormat::Ndjson,
        gzip: false,
    };

    #[test]
    fn test_ndjson_skips_blank_lines_and_reports_malformed() {
        let input = "{\"a\":1}\n\n   \n{not json}\n[1,2]\n{\"b\":2}";
        let lines: Vec<_> = decode(Cursor::new(input), NDJSON).collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].line_number, 1);
        assert_eq!(lines[0].result.as_ref().unwrap()["a"], 1);
        assert_eq!(lines[1].line_number, 4);
        assert!(lines[1].result.is_err());
        assert!(!lines[1].result.as_ref().unwrap_err().fatal);
        assert!(lines[2].result.as_ref().unwrap_err().message.contains("array"));
        assert_eq!(lines[3].line_number, 6);
        assert_eq!(lines[3].result.as_ref().unwrap()["b"], 2);
    }

    #[test]
    fn test_ndjson_invalid_utf8_is_not_fatal() {
        let mut input = b"{\"a\":1}\n".to_vec();
        input.extend_from_slice(&[0xff, 0xfe, b'\n']);
        input.extend_from_slice(b"{\"a\":2}\n");

        let lines: Vec<_> = decode(Cursor::new(input), NDJSON).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].result.is_err());
        assert!(lines[2].result.is_ok());
    }

    #[test]
    fn test_gzip_ndjson() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"{\"sku\":\"A-1\"}\n{\"sku\":\"A-2\"}\n")
            .unwrap();
        let compressed = encoder.finish().unwrap();

        let descriptor = SourceDescriptor::from_file_name("products_1.ndjson.gz").unwrap();
        assert!(descriptor.gzip);

        let skus: Vec<String> = decode(Cursor::new(compressed), descriptor)
            .map(|line| line.result.unwrap()["sku"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(skus, vec!["A-1", "A-2"]);
    }

    #[test]
    fn test_corrupt_gzip_is_fatal() {
        let descriptor = SourceDescriptor::from_file_name("products_1.ndjson.gz").unwrap();
        let lines: Vec<_> = decode(Cursor::new(b"definitely not gzip".to_vec()), descriptor).collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].result.as_ref().unwrap_err().fatal);
    }

    #[test]
    fn test_csv_rows_become_string_fields() {
        let input = "sku,name,price\nA-1,Widget,9.99\n\nA-2,,1\nA-3,Broken\n";
        let descriptor = SourceDescriptor::from_file_name("products_1.csv").unwrap();
        let lines: Vec<_> = decode(Cursor::new(input), descriptor).collect();

        assert_eq!(lines.len(), 3);
        let first = lines[0].result.as_ref().unwrap();
        assert_eq!(lines[0].line_number, 2);
        assert_eq!(first["price"], "9.99");

        let second = lines[1].result.as_ref().unwrap();
        assert!(second.get("name").is_none());

        let broken = lines[2].result.as_ref().unwrap_err();
        assert!(!broken.fatal);
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(SourceDescriptor::from_file_name("customers_1.xml").is_err());
        assert!(SourceDescriptor::from_file_name("customers_1.JSONL").is_ok());
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(infer_kind("orders_1.ndjson", None).unwrap(), EntityKind::Order);
        assert_eq!(
            infer_kind("upload.ndjson", Some(EntityKind::Product)).unwrap(),
            EntityKind::Product
        );
        assert!(matches!(
            infer_kind("upload.ndjson", None),
            Err(IngestError::Structural(_))
        ));
    }
}
