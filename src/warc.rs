//! Streaming reader for WARC (Web ARChive) files.
//!
//! A WARC file is a sequence of records. Each record is a version line
//! (`WARC/1.0`), a block of `Name: value` headers terminated by an empty
//! line, then exactly `Content-Length` bytes of content followed by two
//! CRLFs. CC-NEWS publishes them gzip-compressed, one gzip member per
//! record, so the file is read through a multi-member decoder.
//!
//! For `response` records the content block is itself an HTTP response,
//! which [`WarcRecord::http_response`] splits into status, headers and body.

use crate::error::ParseError;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const INITIAL_CONTENT_CAPACITY: usize = 1 << 20;

/// Case-insensitive header list, kept in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn push_line(&mut self, line: &str) -> bool {
        if line.starts_with([' ', '\t']) {
            // folded continuation of the previous header
            if let Some((_, value)) = self.0.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
                return true;
            }
            return false;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                self.0.push((name.trim().to_string(), value.trim().to_string()));
                true
            }
            None => false,
        }
    }
}

/// One record of a WARC file.
#[derive(Debug, Clone)]
pub struct WarcRecord {
    pub version: String,
    pub headers: Headers,
    pub content: Vec<u8>,
}

impl WarcRecord {
    /// `WARC-Type`, e.g. `response`, `request`, `warcinfo`.
    pub fn record_type(&self) -> Option<&str> {
        self.headers.get("WARC-Type")
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.headers.get("WARC-Target-URI")
    }

    /// Parse the content block as an HTTP response.
    ///
    /// Returns `None` when the block has no status line or header terminator.
    pub fn http_response(&self) -> Option<HttpResponse<'_>> {
        HttpResponse::parse(&self.content)
    }
}

/// HTTP response carried in a `response` record.
#[derive(Debug)]
pub struct HttpResponse<'a> {
    pub status: u16,
    pub headers: Headers,
    pub body: &'a [u8],
}

impl<'a> HttpResponse<'a> {
    fn parse(block: &'a [u8]) -> Option<Self> {
        let (head_end, body_start) = find_header_end(block)?;
        let head = String::from_utf8_lossy(&block[..head_end]);
        let mut lines = head.lines();

        let status_line = lines.next()?;
        if !status_line.starts_with("HTTP/") {
            return None;
        }
        let status = status_line.split_whitespace().nth(1)?.parse().ok()?;

        let mut headers = Headers::default();
        for line in lines {
            if !line.is_empty() {
                headers.push_line(line);
            }
        }

        Some(HttpResponse {
            status,
            headers,
            body: &block[body_start..],
        })
    }
}

fn find_header_end(block: &[u8]) -> Option<(usize, usize)> {
    if let Some(i) = block.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((i, i + 4));
    }
    block
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| (i, i + 2))
}

/// Reader wrapper that publishes how many raw bytes have been consumed.
///
/// Used for progress reporting against the on-disk (compressed) file size.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> (Self, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        (
            CountingReader {
                inner,
                count: Arc::clone(&count),
            },
            count,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Iterates over the records of a WARC stream.
pub struct WarcReader<R> {
    inner: R,
    /// Decompressed bytes consumed so far.
    position: u64,
    line: String,
    line_len: u64,
}

impl<R: BufRead> WarcReader<R> {
    pub fn new(inner: R) -> Self {
        WarcReader {
            inner,
            position: 0,
            line: String::new(),
            line_len: 0,
        }
    }

    /// Read the next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<WarcRecord>, ParseError> {
        // skip the CRLF pairs separating records
        let version = loop {
            if !self.read_line()? {
                return Ok(None);
            }
            let trimmed = self.line.trim_end_matches(['\r', '\n']);
            if !trimmed.is_empty() {
                break trimmed.to_string();
            }
        };

        let record_start = self.position - self.line_len;
        if !version.starts_with("WARC/") {
            return Err(ParseError::Malformed {
                offset: record_start,
                reason: format!("expected WARC version line, found {:?}", truncate(&version, 40)),
            });
        }

        let mut headers = Headers::default();
        loop {
            if !self.read_line()? {
                return Err(ParseError::Malformed {
                    offset: record_start,
                    reason: "stream ended inside record headers".into(),
                });
            }
            let line = self.line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if !headers.push_line(line) {
                return Err(ParseError::Malformed {
                    offset: record_start,
                    reason: format!("invalid header line {:?}", truncate(line, 40)),
                });
            }
        }

        let length: usize = headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ParseError::Malformed {
                offset: record_start,
                reason: "missing or invalid Content-Length".into(),
            })?;

        // The length is untrusted until that many bytes actually arrive.
        let mut content = Vec::with_capacity(length.min(INITIAL_CONTENT_CAPACITY));
        (&mut self.inner).take(length as u64).read_to_end(&mut content)?;
        if content.len() < length {
            return Err(ParseError::Malformed {
                offset: record_start,
                reason: format!(
                    "content block truncated (expected {length} bytes, found {})",
                    content.len()
                ),
            });
        }
        self.position += length as u64;

        Ok(Some(WarcRecord {
            version,
            headers,
            content,
        }))
    }

    fn read_line(&mut self) -> Result<bool, ParseError> {
        self.line.clear();
        let mut raw = Vec::new();
        let n = self.inner.read_until(b'\n', &mut raw)?;
        if n == 0 {
            return Ok(false);
        }
        self.position += n as u64;
        self.line_len = n as u64;
        self.line = String::from_utf8_lossy(&raw).into_owned();
        Ok(true)
    }
}

impl<R: BufRead> Iterator for WarcReader<R> {
    type Item = Result<WarcRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Boxed reader over a plain or gzip-compressed WARC.
pub type WarcStream = WarcReader<Box<dyn BufRead + Send>>;

/// Open a WARC file, transparently decompressing gzip.
///
/// Also returns a counter of raw (on-disk) bytes read, for progress reports.
pub fn open_warc(path: &Path) -> io::Result<(WarcStream, Arc<AtomicU64>)> {
    let (counting, consumed) = CountingReader::new(File::open(path)?);
    let mut buffered = BufReader::new(counting);
    let is_gzip = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);

    let stream: Box<dyn BufRead + Send> = if is_gzip {
        Box::new(BufReader::new(MultiGzDecoder::new(buffered)))
    } else {
        Box::new(buffered)
    };
    Ok((WarcReader::new(stream), consumed))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Cursor, Write};

    /// Build one WARC record as bytes.
    pub(crate) fn record(kind: &str, uri: Option<&str>, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"WARC/1.0\r\n");
        out.extend_from_slice(format!("WARC-Type: {kind}\r\n").as_bytes());
        if let Some(uri) = uri {
            out.extend_from_slice(format!("WARC-Target-URI: {uri}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", content.len()).as_bytes());
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n\r\n");
        out
    }

    /// Build an HTTP response block.
    pub(crate) fn http(content_type: &str, body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    /// Gzip each record as its own member, the way CC-NEWS does.
    pub(crate) fn gzip_members(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for record in records {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(record).unwrap();
            out.extend(enc.finish().unwrap());
        }
        out
    }

    #[test]
    fn test_reads_consecutive_records() {
        let mut data = record("warcinfo", None, b"software: test\r\n");
        data.extend(record(
            "response",
            Some("https://example.com/a"),
            &http("text/html; charset=utf-8", "<p>hi</p>"),
        ));

        let reader = WarcReader::new(Cursor::new(data));
        let records: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type(), Some("warcinfo"));
        assert_eq!(records[1].target_uri(), Some("https://example.com/a"));

        let response = records[1].http_response().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("content-type"), Some("text/html; charset=utf-8"));
        assert_eq!(response.body, b"<p>hi</p>");
    }

    #[test]
    fn test_empty_stream_has_no_records() {
        let mut reader = WarcReader::new(Cursor::new(Vec::new()));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_truncated_content_is_malformed() {
        let mut data = record("response", Some("https://example.com"), b"0123456789");
        data.truncate(data.len() - 10);
        let mut reader = WarcReader::new(Cursor::new(data));
        match reader.next_record() {
            Err(ParseError::Malformed { reason, .. }) => assert!(reason.contains("truncated")),
            other => panic!("expected malformed record, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_content_length_is_malformed() {
        let data = b"WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 1099511627776\r\n\r\n0123456789".to_vec();
        let mut reader = WarcReader::new(Cursor::new(data));
        match reader.next_record() {
            Err(ParseError::Malformed { offset, reason }) => {
                assert_eq!(offset, 0);
                assert!(reason.contains("found 10"), "{reason}");
            }
            other => panic!("expected malformed record, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_malformed() {
        let mut reader = WarcReader::new(Cursor::new(b"<html>not a warc</html>\n".to_vec()));
        assert!(matches!(reader.next_record(), Err(ParseError::Malformed { offset: 0, .. })));
    }

    #[test]
    fn test_missing_content_length_is_malformed() {
        let data = b"WARC/1.0\r\nWARC-Type: response\r\n\r\n".to_vec();
        let mut reader = WarcReader::new(Cursor::new(data));
        assert!(matches!(reader.next_record(), Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn test_non_http_block_has_no_response() {
        let rec = WarcReader::new(Cursor::new(record("metadata", None, b"fetchTimeMs: 12\r\n")))
            .next_record()
            .unwrap()
            .unwrap();
        assert!(rec.http_response().is_none());
    }

    #[test]
    fn test_folded_header_lines() {
        let mut headers = Headers::default();
        assert!(headers.push_line("X-Long: first"));
        assert!(headers.push_line("  second"));
        assert_eq!(headers.get("x-long"), Some("first second"));
        assert!(!headers.push_line("no colon here"));
    }

    #[test]
    fn test_open_warc_gzip_and_plain() {
        let records = vec![
            record("warcinfo", None, b"a: b\r\n"),
            record("response", Some("https://example.com/x"), &http("text/html; charset=UTF-8", "x")),
        ];
        let dir = tempfile::tempdir().unwrap();

        let gz_path = dir.path().join("sample.warc.gz");
        std::fs::write(&gz_path, gzip_members(&records)).unwrap();
        let (reader, consumed) = open_warc(&gz_path).unwrap();
        assert_eq!(reader.count(), 2);
        assert_eq!(
            consumed.load(Ordering::Relaxed),
            std::fs::metadata(&gz_path).unwrap().len()
        );

        let plain_path = dir.path().join("sample.warc");
        std::fs::write(&plain_path, records.concat()).unwrap();
        let (reader, _) = open_warc(&plain_path).unwrap();
        assert_eq!(reader.count(), 2);
    }
}
