//! Assembles streamed records into the growing text of one reply.
//!
//! Records are grouped into actions by their `type` tag.  Consecutive records of one action
//! are concatenated; when the tag changes, the finished action is closed off with a blank
//! line so that distinct reasoning or tool segments read as separate paragraphs.  Every
//! increment produces the full text so far, never just the delta.

use crate::sse::RecordFramer;
use crate::types::ResponseRecord;

/// Separator appended after an action that is closed by a change of type.
const ACTION_SEPARATOR: &str = "\n\n";

/// Separator appended after the last action when the reply finishes.
const FINAL_SEPARATOR: &str = "\n";

/// The text of a reply at one point in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    /// Full trimmed text received so far.
    pub text: String,
    /// True for the single final update of the stream.
    pub done: bool,
}

impl StreamUpdate {
    fn partial(text: String) -> Self {
        Self { text, done: false }
    }

    fn done(text: String) -> Self {
        Self { text, done: true }
    }
}

/// Decodes raw fragments of a streamed reply into [`StreamUpdate`]s.
///
/// Once finished, whether by a `done` record, end of input, or an explicit call to
/// [`StreamDecoder::finish`], the decoder ignores all further input.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    framer: RecordFramer,
    response_text: String,
    current_message: String,
    last_action_type: Option<String>,
    finished: bool,
}

impl StreamDecoder {
    /// Creates a decoder for a new reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw fragment and returns the updates it produced, in order.
    ///
    /// The last update is final if the fragment contained a `done` record.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<StreamUpdate> {
        if self.finished {
            return Vec::new();
        }
        let mut updates = Vec::new();
        for record in self.framer.push(fragment) {
            if let Some(update) = self.push_record(record) {
                updates.push(update);
            }
            if self.finished {
                break;
            }
        }
        updates
    }

    /// Applies one already-framed record.
    pub fn push_record(&mut self, record: ResponseRecord) -> Option<StreamUpdate> {
        if self.finished {
            return None;
        }
        match record {
            ResponseRecord::Done => self.finish(),
            ResponseRecord::Content { action, content } => {
                let changed = self.last_action_type.as_deref() != Some(action.as_str());
                if changed && !self.current_message.is_empty() {
                    self.response_text.push_str(&self.current_message);
                    self.response_text.push_str(ACTION_SEPARATOR);
                    self.current_message.clear();
                }
                self.current_message.push_str(&content);
                let text = format!("{}{}", self.response_text, self.current_message);
                self.last_action_type = Some(action);
                Some(StreamUpdate::partial(text.trim().to_string()))
            }
        }
    }

    /// Signals end of input: decodes a trailing unterminated line, then finishes.
    pub fn end_of_input(&mut self) -> Vec<StreamUpdate> {
        if self.finished {
            return Vec::new();
        }
        let mut updates = Vec::new();
        if let Some(record) = self.framer.finish()
            && let Some(update) = self.push_record(record)
        {
            updates.push(update);
        }
        if let Some(update) = self.finish() {
            updates.push(update);
        }
        updates
    }

    /// Closes the reply and returns its final text.
    ///
    /// Returns `None` if the decoder had already finished.
    pub fn finish(&mut self) -> Option<StreamUpdate> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if !self.current_message.is_empty() {
            self.response_text.push_str(&self.current_message);
            self.response_text.push_str(FINAL_SEPARATOR);
            self.current_message.clear();
        }
        Some(StreamUpdate::done(self.response_text.trim().to_string()))
    }

    /// Returns true once the final update has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &str, content: &str) -> String {
        format!(
            "data: {}\n",
            ResponseRecord::content(action, content).to_json()
        )
    }

    const DONE: &str = "data: {\"type\":\"done\"}\n";

    fn decode_all(fragments: &[&[u8]]) -> Vec<StreamUpdate> {
        let mut decoder = StreamDecoder::new();
        let mut updates = Vec::new();
        for fragment in fragments {
            updates.extend(decoder.push(fragment));
        }
        updates.extend(decoder.end_of_input());
        updates
    }

    fn final_text(updates: &[StreamUpdate]) -> String {
        let finals: Vec<_> = updates.iter().filter(|u| u.done).collect();
        assert_eq!(finals.len(), 1, "exactly one final update");
        assert!(updates.last().unwrap().done, "final update comes last");
        finals[0].text.clone()
    }

    #[test]
    fn two_fragments_with_done() {
        let mut decoder = StreamDecoder::new();
        let first = decoder.push(b"data: {\"type\":\"a\",\"content\":\"Hi\"}\n");
        assert_eq!(first, vec![StreamUpdate::partial("Hi".to_string())]);

        let second = decoder.push(b"data: {\"type\":\"a\",\"content\":\" there\"}\n");
        let third = decoder.push(DONE.as_bytes());
        assert_eq!(second, vec![StreamUpdate::partial("Hi there".to_string())]);
        assert_eq!(third, vec![StreamUpdate::done("Hi there".to_string())]);
        assert!(decoder.is_finished());
        assert!(decoder.end_of_input().is_empty());
    }

    #[test]
    fn same_type_never_separates() {
        let stream = [record("a", "one"), record("a", " two"), record("a", " three")].concat();
        let updates = decode_all(&[stream.as_bytes()]);
        assert_eq!(final_text(&updates), "one two three");
    }

    #[test]
    fn type_change_inserts_one_blank_line() {
        let stream = [
            record("think", "plan"),
            record("think", " more"),
            record("answer", "result"),
            record("tool", "call"),
        ]
        .concat();
        let updates = decode_all(&[stream.as_bytes()]);
        assert_eq!(updates[1].text, "plan more");
        assert_eq!(updates[2].text, "plan more\n\nresult");
        assert_eq!(final_text(&updates), "plan more\n\nresult\n\ncall");
    }

    #[test]
    fn empty_content_does_not_close_an_action() {
        let stream = [record("a", ""), record("b", "x"), record("b", "y")].concat();
        let updates = decode_all(&[stream.as_bytes()]);
        assert_eq!(final_text(&updates), "xy");
    }

    #[test]
    fn rechunking_preserves_final_text() {
        let stream = [
            record("think", "caf\u{e9} \u{1f600}"),
            "not json at all\n".to_string(),
            record("answer", "line one\nline two"),
            record("answer", "!"),
            record("tool", "done soon"),
            DONE.to_string(),
        ]
        .concat();
        let bytes = stream.as_bytes();
        let whole = final_text(&decode_all(&[bytes]));
        assert_eq!(whole, "caf\u{e9} \u{1f600}\n\nline one\nline two!\n\ndone soon");

        for size in 1..=bytes.len() {
            let fragments: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(final_text(&decode_all(&fragments)), whole, "chunk size {size}");
        }
        for split in 0..=bytes.len() {
            let (left, right) = bytes.split_at(split);
            assert_eq!(final_text(&decode_all(&[left, right])), whole, "split at {split}");
        }
    }

    #[test]
    fn finish_is_idempotent() {
        let mut decoder = StreamDecoder::new();
        decoder.push(record("a", "partial").as_bytes());
        assert_eq!(
            decoder.finish(),
            Some(StreamUpdate::done("partial".to_string()))
        );
        assert_eq!(decoder.finish(), None);
        assert!(decoder.push(record("a", " more").as_bytes()).is_empty());
        assert!(decoder.push(DONE.as_bytes()).is_empty());
        assert!(decoder.end_of_input().is_empty());
    }

    #[test]
    fn input_after_done_is_ignored() {
        let stream = [record("a", "x"), DONE.to_string(), record("a", "y")].concat();
        let mut decoder = StreamDecoder::new();
        let updates = decoder.push(stream.as_bytes());
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1], StreamUpdate::done("x".to_string()));
        assert!(decoder.end_of_input().is_empty());
    }

    #[test]
    fn end_of_input_decodes_trailing_record() {
        let mut decoder = StreamDecoder::new();
        decoder.push(b"{\"type\":\"a\",\"content\":\"tail\"}");
        let updates = decoder.end_of_input();
        assert_eq!(
            updates,
            vec![
                StreamUpdate::partial("tail".to_string()),
                StreamUpdate::done("tail".to_string()),
            ]
        );
    }

    #[test]
    fn empty_stream_finishes_with_empty_text() {
        let updates = decode_all(&[]);
        assert_eq!(updates, vec![StreamUpdate::done(String::new())]);
    }
}
