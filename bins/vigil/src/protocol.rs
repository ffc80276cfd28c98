//! Line protocol spoken with the shell helper.
//!
//! Requests are `<key> <output path>: <command>`, responses are
//! `<key> <field> <value>`. Keys are Job start times in milliseconds.

use std::path::Path;

use thiserror::Error;
use vigil_core::job::JobUpdate;

/// Why a helper line was not applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line does not split into exactly three tokens.
    #[error("expected 3 fields, got {0}")]
    FieldCount(usize),
    /// First token is not a millisecond key.
    #[error("bad job key {0:?}")]
    BadKey(String),
    /// Known field with an unparsable value.
    #[error("bad value {value:?} for {field}")]
    BadValue {
        /// Field name.
        field: String,
        /// Raw value.
        value: String,
    },
}

/// One parsed response line.
#[derive(Debug, PartialEq)]
pub struct Response {
    /// Registry key of the Job.
    pub key: u64,
    /// Field update to merge.
    pub update: JobUpdate,
}

/// Encode a request. Line breaks inside `command` become spaces so a
/// request always occupies exactly one line.
pub fn format_request(key: u64, output: &Path, command: &str) -> String {
    let command: String = command
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("{} {}: {}\n", key, output.display(), command)
}

/// Decode a response line.
pub fn parse_response(line: &str) -> Result<Response, ProtocolError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [key, field, value] = tokens.as_slice() else {
        return Err(ProtocolError::FieldCount(tokens.len()));
    };
    let key = key.parse().map_err(|_| ProtocolError::BadKey(key.to_string()))?;
    let update = JobUpdate::from_field(field, value).ok_or_else(|| ProtocolError::BadValue {
        field: field.to_string(),
        value: value.to_string(),
    })?;
    Ok(Response { key, update })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn request_is_one_line() {
        let line = format_request(1700000000123, &PathBuf::from("/tmp/out.x"), "echo a\necho b");
        assert_eq!(line, "1700000000123 /tmp/out.x: echo a echo b\n");
    }

    #[test]
    fn parses_pid_and_return_code() {
        let r = parse_response("1700000000123 pid 4242").unwrap();
        assert_eq!(r.key, 1700000000123);
        assert_eq!(r.update, JobUpdate::pid(4242));

        let r = parse_response("1700000000123 return_code 2\n").unwrap();
        assert_eq!(r.update, JobUpdate::return_code(2));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_response(""), Err(ProtocolError::FieldCount(0)));
        assert_eq!(parse_response("bash: line 1: oops: command not found").unwrap_err(), ProtocolError::FieldCount(7));
        assert!(matches!(parse_response("abc pid 1"), Err(ProtocolError::BadKey(_))));
        assert!(matches!(parse_response("12 pid x"), Err(ProtocolError::BadValue { .. })));
    }

    #[test]
    fn unknown_fields_pass_through() {
        let r = parse_response("12 signal TERM").unwrap();
        assert_eq!(r.update.extra, vec![("signal".to_string(), "TERM".to_string())]);
    }
}
