//! Response segment headers.
//!
//! The server formats `status=`, `file=` and `len=` lines with the helpers
//! below; the client parses them back one line at a time.

use super::Status;

const STATUS_KEY: &str = "status";
const FILE_KEY: &str = "file";
const LEN_KEY: &str = "len";

/// Format the status line, including the trailing newline.
pub fn status_line(status: Status) -> String {
    format!("{STATUS_KEY}={}\n", status.code())
}

/// Header announcing one file segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    /// Declared payload length in bytes.
    pub len: u64,
}

impl FileHeader {
    pub fn new(name: impl Into<String>, len: u64) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }

    /// Format the `file=` and `len=` lines, including trailing newlines.
    pub fn encode(&self) -> String {
        format!("{FILE_KEY}={}\n{LEN_KEY}={}\n", self.name, self.len)
    }
}

/// Malformed response line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected '{expected}=' from server, received '{found}'")]
    UnexpectedKey { expected: &'static str, found: String },

    #[error("line with keyword '{0}' is not newline terminated")]
    MissingNewline(&'static str),

    #[error("invalid value '{value}' for keyword '{key}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("server did not send a status line")]
    MissingStatus,
}

/// Parse a `status=<int>` line.
pub fn parse_status(line: &[u8]) -> Result<i32, ProtocolError> {
    let value = parse_field(line, STATUS_KEY)?;
    value.parse().map_err(|_| ProtocolError::InvalidValue {
        key: STATUS_KEY,
        value: value.to_string(),
    })
}

/// Parse a `file=<name>` line.
pub fn parse_file_name(line: &[u8]) -> Result<String, ProtocolError> {
    let value = parse_field(line, FILE_KEY)?;
    if value.is_empty() {
        return Err(ProtocolError::InvalidValue {
            key: FILE_KEY,
            value: String::new(),
        });
    }
    Ok(value.to_string())
}

/// Parse a `len=<n>` line.
pub fn parse_len(line: &[u8]) -> Result<u64, ProtocolError> {
    let value = parse_field(line, LEN_KEY)?;
    value.parse().map_err(|_| ProtocolError::InvalidValue {
        key: LEN_KEY,
        value: value.to_string(),
    })
}

/// Split `<key>=<value>\n` and return the value.
fn parse_field<'a>(line: &'a [u8], key: &'static str) -> Result<&'a str, ProtocolError> {
    let text = String::from_utf8_lossy(line);
    let found = || text.split('=').next().unwrap_or_default().trim_end().to_string();

    let rest = line
        .strip_prefix(key.as_bytes())
        .and_then(|rest| rest.strip_prefix(b"="))
        .ok_or_else(|| ProtocolError::UnexpectedKey {
            expected: key,
            found: found(),
        })?;
    let value = rest
        .strip_suffix(b"\n")
        .ok_or(ProtocolError::MissingNewline(key))?;

    std::str::from_utf8(value).map_err(|_| ProtocolError::InvalidValue {
        key,
        value: String::from_utf8_lossy(value).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_headers() {
        assert_eq!(status_line(Status::Ok), "status=0\n");
        assert_eq!(status_line(Status::Failed), "status=-1\n");
        assert_eq!(
            FileHeader::new("ok.png", 310).encode(),
            "file=ok.png\nlen=310\n"
        );
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!(parse_status(b"status=0\n"), Ok(0));
        assert_eq!(parse_status(b"status=-1\n"), Ok(-1));
        assert_eq!(parse_file_name(b"file=ok.png\n"), Ok("ok.png".to_string()));
        assert_eq!(parse_len(b"len=1024\n"), Ok(1024));
        assert_eq!(parse_len(b"len=0\n"), Ok(0));
    }

    #[test]
    fn test_parse_unexpected_key() {
        assert_eq!(
            parse_status(b"stats=0\n"),
            Err(ProtocolError::UnexpectedKey {
                expected: "status",
                found: "stats".to_string()
            })
        );
        assert!(matches!(
            parse_file_name(b"   <html>\n"),
            Err(ProtocolError::UnexpectedKey { expected: "file", .. })
        ));
    }

    #[test]
    fn test_parse_missing_newline() {
        assert_eq!(
            parse_len(b"len=12"),
            Err(ProtocolError::MissingNewline("len"))
        );
    }

    #[test]
    fn test_parse_invalid_numbers() {
        assert!(matches!(
            parse_status(b"status=ok\n"),
            Err(ProtocolError::InvalidValue { key: "status", .. })
        ));
        assert!(matches!(
            parse_len(b"len=-5\n"),
            Err(ProtocolError::InvalidValue { key: "len", .. })
        ));
        assert!(matches!(
            parse_file_name(b"file=\n"),
            Err(ProtocolError::InvalidValue { key: "file", .. })
        ));
    }
}
