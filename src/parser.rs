//! Turns a downloaded report body into rows.
//!
//! Platform exports arrive gzip- or zip-wrapped, in several encodings, and
//! sometimes with report metadata lines ahead of the real header. The parser
//! finds the header by looking for a known date column and drops summary,
//! repeated-header and footer rows.

use crate::error::Error;
use encoding_rs::{Encoding, SHIFT_JIS, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252};
use flate2::read::GzDecoder;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

/// Column names that identify the header row of a report.
pub const DATE_COLUMNS: [&str; 3] = ["Day", "Daily", "TimePeriod"];

/// Name of the normalized date column added to every row.
pub const DATE_KEY: &str = "date";

const TOTAL_MARKERS: [&str; 2] = ["Total", "合計"];
const FOOTER_MARKERS: [&str; 1] = ["Microsoft Corporation"];

pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    /// Header order of the CSV followed by the normalized `date` column.
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ParsedReport {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Default)]
struct SkipCounts {
    empty: usize,
    header: usize,
    total: usize,
    no_date: usize,
    footer: usize,
}

#[derive(Debug, Clone)]
pub struct ReportParser {
    date_columns: Vec<String>,
}

impl Default for ReportParser {
    fn default() -> Self {
        Self::new(DATE_COLUMNS.iter().map(|c| c.to_string()).collect())
    }
}

impl ReportParser {
    pub fn new(date_columns: Vec<String>) -> Self {
        Self { date_columns }
    }

    /// Parses a report body. An empty body or a header without data rows is
    /// "no data for the period" and yields an empty report, not an error.
    pub fn parse(&self, body: &[u8]) -> Result<ParsedReport, Error> {
        let raw = unwrap_container(body)?;
        let text = decode_text(&raw);

        let lines: Vec<&str> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();
        if lines.is_empty() {
            debug!("report body is empty");
            return Ok(ParsedReport::default());
        }

        let header_idx = match lines.iter().position(|line| self.is_header(line)) {
            Some(idx) => idx,
            None => {
                warn!(
                    "no header with a date column found; using first line: {}",
                    lines[0].chars().take(200).collect::<String>()
                );
                0
            }
        };

        let csv_text = lines[header_idx..].join("\n");
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(csv_text.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let date_column = self
            .date_columns
            .iter()
            .find(|c| headers.iter().any(|h| h == *c))
            .cloned();

        let mut counts = SkipCounts::default();
        let mut rows = Vec::new();

        for record in reader.records() {
            let record = record?;
            let mut row = Row::new();
            for (idx, name) in headers.iter().enumerate() {
                row.insert(name.clone(), record.get(idx).unwrap_or("").to_string());
            }

            if row.values().all(|v| v.trim().is_empty()) {
                counts.empty += 1;
                continue;
            }
            if row
                .values()
                .any(|v| FOOTER_MARKERS.iter().any(|m| v.contains(m)))
            {
                counts.footer += 1;
                continue;
            }

            let Some(column) = date_column.as_deref() else {
                counts.no_date += 1;
                continue;
            };
            let date = row.get(column).map(|v| v.trim()).unwrap_or("");
            if date.is_empty() {
                counts.no_date += 1;
                continue;
            }
            if self.date_columns.iter().any(|c| c == date) {
                counts.header += 1;
                continue;
            }
            if TOTAL_MARKERS.contains(&date) {
                counts.total += 1;
                continue;
            }

            let date = date.to_string();
            row.insert(DATE_KEY.to_string(), date);
            rows.push(row);
        }

        debug!(
            "parsed {} rows (skipped empty={} header={} total={} no_date={} footer={})",
            rows.len(),
            counts.empty,
            counts.header,
            counts.total,
            counts.no_date,
            counts.footer
        );

        let mut columns = headers;
        if !columns.iter().any(|c| c == DATE_KEY) {
            columns.push(DATE_KEY.to_string());
        }
        Ok(ParsedReport { columns, rows })
    }

    fn is_header(&self, line: &str) -> bool {
        line.split(',')
            .map(|token| token.trim().trim_matches('"').trim())
            .any(|token| self.date_columns.iter().any(|c| c == token))
    }
}

/// Strips gzip or zip framing; anything else is returned as-is.
fn unwrap_container(body: &[u8]) -> Result<Vec<u8>, Error> {
    if body.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| Error::ReportParse(format!("invalid gzip body: {}", e)))?;
        return Ok(out);
    }

    if body.starts_with(b"PK") {
        let mut archive = zip::ZipArchive::new(Cursor::new(body))?;
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx)?;
            if entry.is_dir() {
                continue;
            }
            let mut out = Vec::new();
            entry.read_to_end(&mut out)?;
            return Ok(out);
        }
        debug!("zip archive has no files");
        return Ok(Vec::new());
    }

    Ok(body.to_vec())
}

fn detect_encoding(sample: &[u8]) -> &'static Encoding {
    if sample.starts_with(&[0xef, 0xbb, 0xbf]) {
        return UTF_8;
    }
    if sample.starts_with(&[0xff, 0xfe]) {
        return UTF_16LE;
    }
    if sample.starts_with(&[0xfe, 0xff]) {
        return UTF_16BE;
    }
    let nulls = sample.iter().filter(|b| **b == 0).count();
    if nulls > (sample.len() / 20).max(1) {
        return UTF_16LE;
    }
    if std::str::from_utf8(sample).is_ok() || valid_utf8_prefix(sample) {
        return UTF_8;
    }
    if SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(sample)
        .is_some()
    {
        return SHIFT_JIS;
    }
    WINDOWS_1252
}

/// The sample may end in the middle of a multi-byte character.
fn valid_utf8_prefix(sample: &[u8]) -> bool {
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > sample.len(),
    }
}

fn decode_text(raw: &[u8]) -> String {
    let sample = &raw[..raw.len().min(4096)];
    let encoding = detect_encoding(sample);
    // `decode` strips a matching BOM and replaces malformed sequences.
    let (text, used, had_errors) = encoding.decode(raw);
    if had_errors {
        warn!("report body had malformed {} sequences", used.name());
    }
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_metadata_line_and_total_row_are_dropped() {
        let body = b"ReportMetadataLine\nDay,Clicks\n20240101,5\nTotal,5\n";
        let report = ReportParser::default().parse(body).unwrap();

        assert_eq!(
            report.rows,
            vec![row(&[("Day", "20240101"), ("Clicks", "5"), ("date", "20240101")])]
        );
        assert_eq!(report.columns, vec!["Day", "Clicks", "date"]);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let body = b"Day,Clicks\n20240101,5\n20240102,7\n";
        let parser = ReportParser::default();
        assert_eq!(parser.parse(body).unwrap(), parser.parse(body).unwrap());
    }

    #[test]
    fn test_header_only_is_no_data() {
        let report = ReportParser::default().parse(b"Day,Clicks\n").unwrap();
        assert!(report.is_empty());
        assert!(ReportParser::default().parse(b"").unwrap().is_empty());
    }

    #[test]
    fn test_repeated_header_empty_and_japanese_total_rows_are_skipped() {
        let body = "Daily,Imps\nDaily,Imps\n,\n2024-01-01,10\n合計,10\n".as_bytes();
        let report = ReportParser::default().parse(body).unwrap();
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0]["date"], "2024-01-01");
    }

    #[test]
    fn test_missing_date_column_yields_no_rows() {
        let report = ReportParser::default().parse(b"Clicks,Imps\n5,10\n").unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_gzip_body_with_bom() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"\xef\xbb\xbfDay,Cost\r\n20240105,120\r\n")
            .unwrap();
        let body = encoder.finish().unwrap();

        let report = ReportParser::default().parse(&body).unwrap();
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0]["Day"], "20240105");
        assert_eq!(report.rows[0]["Cost"], "120");
    }

    #[test]
    fn test_zip_wrapped_microsoft_export() {
        let csv = "\u{feff}\"Report Name: Account\"\n\"Report Time: 1/1/2024\"\n\n\
                   \"TimePeriod\",\"AccountId\",\"Clicks\"\n\
                   \"2024-01-01\",\"42\",\"3\"\n\
                   \"2024-01-02\",\"42\",\"4\"\n\n\
                   \"©2024 Microsoft Corporation. All rights reserved. \"\n";

        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("report.csv", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(csv.as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let report = ReportParser::default().parse(buf.get_ref()).unwrap();
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[1]["date"], "2024-01-02");
        assert_eq!(report.rows[0]["AccountId"], "42");
    }

    #[test]
    fn test_shift_jis_body_is_decoded() {
        let (encoded, _, _) = SHIFT_JIS.encode("Day,キャンペーン名\n20240101,春のセール\n");
        let report = ReportParser::default().parse(&encoded).unwrap();
        assert_eq!(report.rows[0]["キャンペーン名"], "春のセール");
    }

    #[test]
    fn test_utf16_body_is_decoded() {
        let mut body = vec![0xff, 0xfe];
        for unit in "TimePeriod,Clicks\n2024-01-01,9\n".encode_utf16() {
            body.extend_from_slice(&unit.to_le_bytes());
        }
        let report = ReportParser::default().parse(&body).unwrap();
        assert_eq!(report.rows[0]["Clicks"], "9");
    }

    #[test]
    fn test_corrupt_zip_is_an_error() {
        assert!(ReportParser::default().parse(b"PK\x03\x04garbage").is_err());
    }
}
