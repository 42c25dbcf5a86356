//! Bulletin board wire protocol.
//!
//! Requests are line based and terminated by the client's half-close:
//!
//! ```text
//! user=<username>\n
//! img=<url>\n          (optional)
//! <message>            (everything up to EOF)
//! ```
//!
//! Responses are a status line followed by any number of named files, each
//! announced by a `file=` and a `len=` line and followed by exactly `len`
//! payload bytes:
//!
//! ```text
//! status=0\n
//! file=bulletin_board_response.html\n
//! len=412\n
//! <412 bytes>
//! file=ok.png\n
//! len=310\n
//! <310 bytes>
//! ```

pub mod request;
pub mod response;

pub use request::{validate, Post, Rejection};
pub use response::{FileHeader, ProtocolError};

use std::fmt;

/// Name of the rendered html page in every response.
pub const RESPONSE_PAGE_NAME: &str = "bulletin_board_response.html";

/// Name of the image sent with an accepted post.
pub const OK_IMAGE_NAME: &str = "ok.png";

/// Name of the image sent with a rejected post.
pub const ERROR_IMAGE_NAME: &str = "error.png";

/// Name of the filler file injected by the huge file fault mode.
pub const FILLER_NAME: &str = "/dev/null";

/// Outcome reported in the `status=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The post was accepted and stored.
    Ok,
    /// A server side precondition failed.
    Failed,
    /// The request was empty, malformed or could not be stored.
    Invalid,
    /// The request exceeded the server's input limit.
    Overflow,
}

impl Status {
    /// Numeric value sent on the wire.
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Failed => -1,
            Status::Invalid => 1,
            Status::Overflow => 2,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::Failed.code(), -1);
        assert_eq!(Status::Invalid.code(), 1);
        assert_eq!(Status::Overflow.code(), 2);
        assert!(Status::Ok.is_ok());
        assert!(!Status::Overflow.is_ok());
    }
}
