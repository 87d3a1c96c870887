//! AMI wire codec: `key: value` lines, records terminated by a blank line

use crate::{
    buffer::AmiBuffer,
    constants::{END_COMMAND, FIELD_SEPARATOR, LINE_TERMINATOR, RESPONSE_FOLLOWS},
    error::AmiResult,
    headers::AmiHeader,
    record::Record,
};

/// Split a line on its first colon.
///
/// The name loses trailing spaces, the value loses leading spaces and tabs.
/// A line without a colon has an empty name.
fn split_field(line: &str) -> (&str, &str) {
    match line.find(':') {
        Some(colon_pos) => (
            line[..colon_pos].trim_end_matches(' '),
            line[colon_pos + 1..].trim_start_matches(&[' ', '\t'][..]),
        ),
        None => ("", line),
    }
}

/// Record under construction.
#[derive(Debug, Default)]
struct RecordState {
    record: Record,
    /// Set once `Response: Follows` has been seen.
    follows: bool,
    output_seen: bool,
}

impl RecordState {
    fn feed(&mut self, line: &str) {
        let (name, value) = split_field(line);

        if self.follows
            && name != AmiHeader::Privilege.as_str()
            && name != AmiHeader::ActionId.as_str()
        {
            if line != END_COMMAND {
                self.append_output(line);
            }
            return;
        }

        if name.is_empty() {
            return;
        }

        if name == AmiHeader::Response.as_str() && value == RESPONSE_FOLLOWS {
            self.follows = true;
        }

        if name == AmiHeader::Output.as_str() {
            if !self.output_seen {
                self.record
                    .set(AmiHeader::RealOutput, value);
                self.output_seen = true;
            }
            return;
        }

        self.record
            .set(name, value);
    }

    fn append_output(&mut self, line: &str) {
        let joined = match self
            .record
            .command_response()
        {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, line),
            _ => line.to_string(),
        };
        self.record
            .set(AmiHeader::CommandResponse, joined);
    }
}

/// Incremental AMI record parser.
///
/// Feed raw socket bytes with [`add_data`](Self::add_data) and pull complete
/// records with [`parse_record`](Self::parse_record). State survives between
/// calls, so records may arrive split across any number of reads.
///
/// ```
/// use asterisk_ami_tokio::AmiParser;
///
/// let mut parser = AmiParser::new();
/// parser.add_data(b"Response: Follows\r\nline one\r\nline two\r\n--END COMMAND--\r\n\r\n").unwrap();
/// let record = parser.parse_record().unwrap().unwrap();
/// assert_eq!(record.command_response(), Some("line one\nline two"));
/// ```
#[derive(Debug, Default)]
pub struct AmiParser {
    buffer: AmiBuffer,
    current: RecordState,
}

impl AmiParser {
    /// Create new parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Try to parse a complete record from the buffer.
    ///
    /// Blank lines with no fields before them are skipped rather than
    /// yielding empty records.
    pub fn parse_record(&mut self) -> AmiResult<Option<Record>> {
        loop {
            let Some(line) = self
                .buffer
                .extract_line()?
            else {
                self.buffer
                    .compact();
                return Ok(None);
            };

            if line.is_empty() {
                let state = std::mem::take(&mut self.current);
                if state
                    .record
                    .is_empty()
                {
                    continue;
                }
                return Ok(Some(state.record));
            }

            self.current
                .feed(&String::from_utf8_lossy(&line));
        }
    }

    /// Whether a record has been started but not terminated.
    pub fn has_partial(&self) -> bool {
        !self
            .current
            .record
            .is_empty()
            || !self
                .buffer
                .is_empty()
    }

    /// Flush the record cut short by end of stream.
    ///
    /// An unterminated trailing line counts as the record's last line.
    /// Returns `None` if the stream closed before a record started.
    pub fn finish(&mut self) -> Option<Record> {
        let mut rest = self
            .buffer
            .take_remaining();
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        if !rest.is_empty() {
            self.current
                .feed(&String::from_utf8_lossy(&rest));
        }

        let state = std::mem::take(&mut self.current);
        if state
            .record
            .is_empty()
        {
            None
        } else {
            Some(state.record)
        }
    }
}

impl Record {
    /// Serialize to AMI wire format.
    ///
    /// `Action` is emitted first, remaining fields are sorted for deterministic
    /// output. The record is closed by an empty line. Nothing is escaped; see
    /// [`Record::validate`].
    pub fn to_wire_format(&self) -> String {
        let mut out = String::new();
        let mut push_field = |name: &str, value: &str| {
            out.push_str(name);
            out.push_str(FIELD_SEPARATOR);
            out.push_str(value);
            out.push_str(LINE_TERMINATOR);
        };

        if let Some(action) = self.action_name() {
            push_field(AmiHeader::Action.as_str(), action);
        }

        let mut rest: Vec<_> = self
            .iter()
            .filter(|(name, _)| *name != AmiHeader::Action.as_str())
            .collect();
        rest.sort_by_key(|(name, _)| *name);
        for (name, value) in rest {
            push_field(name, value);
        }

        out.push_str(LINE_TERMINATOR);
        out
    }
}
