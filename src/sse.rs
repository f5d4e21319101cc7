//! Line framing for streamed chat replies.
//!
//! The backend flushes newline-delimited JSON records, optionally prefixed with `data: ` in
//! the manner of server-sent events.  A flushed fragment may contain any number of records
//! and may end in the middle of one, or in the middle of a UTF-8 sequence, so framing is done
//! on raw bytes and a line is only decoded once its terminating newline has arrived.

use crate::observability::{STREAM_RECORDS, STREAM_RECORDS_SKIPPED};
use crate::types::ResponseRecord;

/// Splits a byte stream into records.
#[derive(Debug, Default)]
pub struct RecordFramer {
    buffer: Vec<u8>,
}

impl RecordFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns every record completed by it, in order.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<ResponseRecord> {
        self.buffer.extend_from_slice(fragment);
        let mut records = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(newline + 1);
            let line = std::mem::replace(&mut self.buffer, rest);
            if let Some(record) = decode_line(&line[..newline]) {
                records.push(record);
            }
        }
        records
    }

    /// Decodes whatever is left in the buffer as a final, unterminated line.
    pub fn finish(&mut self) -> Option<ResponseRecord> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Returns true if a partial line is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn decode_line(line: &[u8]) -> Option<ResponseRecord> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(err) => {
            STREAM_RECORDS_SKIPPED.click();
            tracing::debug!(error = %err, "skipping record with invalid UTF-8");
            return None;
        }
    };
    if text.trim().is_empty() {
        return None;
    }
    let record = parse_line(text);
    if record.is_some() {
        STREAM_RECORDS.click();
    } else {
        STREAM_RECORDS_SKIPPED.click();
        tracing::debug!(line = text, "skipping malformed record");
    }
    record
}

/// Parse a single record line, stripping an optional `data:` prefix.
pub fn parse_line(line: &str) -> Option<ResponseRecord> {
    let line = line.trim();
    let json = line
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(line);
    ResponseRecord::from_json(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefixed_and_bare_lines() {
        assert_eq!(
            parse_line(r#"data: {"type":"a","content":"Hi"}"#),
            Some(ResponseRecord::content("a", "Hi"))
        );
        assert_eq!(
            parse_line(r#"{"type":"a","content":"Hi"}"#),
            Some(ResponseRecord::content("a", "Hi"))
        );
        assert_eq!(parse_line("data: {\"type\":\"done\"}\r"), Some(ResponseRecord::Done));
    }

    #[test]
    fn many_records_in_one_fragment() {
        let mut framer = RecordFramer::new();
        let records = framer.push(
            b"data: {\"type\":\"a\",\"content\":\"1\"}\n\n{\"type\":\"b\",\"content\":\"2\"}\ndata: {\"type\":\"done\"}\n",
        );
        assert_eq!(
            records,
            vec![
                ResponseRecord::content("a", "1"),
                ResponseRecord::content("b", "2"),
                ResponseRecord::Done,
            ]
        );
        assert!(!framer.has_pending());
    }

    #[test]
    fn record_split_across_fragments() {
        let mut framer = RecordFramer::new();
        assert!(framer.push(b"data: {\"type\":\"a\",").is_empty());
        assert!(framer.has_pending());
        assert_eq!(
            framer.push(b"\"content\":\"Hi\"}\n"),
            vec![ResponseRecord::content("a", "Hi")]
        );
    }

    #[test]
    fn utf8_sequence_split_across_fragments() {
        let line = "{\"type\":\"a\",\"content\":\"caf\u{e9}\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut framer = RecordFramer::new();
        assert!(framer.push(&line[..split]).is_empty());
        assert_eq!(
            framer.push(&line[split..]),
            vec![ResponseRecord::content("a", "caf\u{e9}")]
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut framer = RecordFramer::new();
        let records = framer.push(b"garbage\n{\"type\":\"a\",\"content\":\"ok\"}\n{broken\n");
        assert_eq!(records, vec![ResponseRecord::content("a", "ok")]);
    }

    #[test]
    fn finish_decodes_unterminated_tail() {
        let mut framer = RecordFramer::new();
        assert!(framer.push(b"{\"type\":\"done\"}").is_empty());
        assert_eq!(framer.finish(), Some(ResponseRecord::Done));
        assert_eq!(framer.finish(), None);
    }
}
