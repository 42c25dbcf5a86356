//! Fault injection modes.
//!
//! A server process runs with exactly one [`FaultMode`], chosen through the
//! `BULLETIN_FAULT_MODE` environment variable at startup. Each mode bends the
//! otherwise deterministic response behaviour so that clients can be tested
//! against short reads, broken length prefixes, slow peers and huge payloads.

use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the fault mode.
pub const FAULT_MODE_ENV: &str = "BULLETIN_FAULT_MODE";

/// Test scenario applied to every connection handled by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// Regular operation.
    #[default]
    None,
    /// Verify that the worker was started with a well-formed identity.
    CheckInvocationIdentity,
    /// Verify that the connection handle cannot leak into spawned programs.
    CheckNoStrayDescriptors,
    /// Keep the connection open forever after the response was sent.
    PostponeCompletion,
    /// Send only half of the ok image, then close the connection.
    PrematureClose,
    /// Declare file lengths smaller than the number of bytes sent.
    SmallerDeclaredLength,
    /// Sleep between two consecutive output chunks.
    WriteDelay,
    /// Send the html page only, without the trailing image.
    HtmlOnlyReply,
    /// Insert a huge filler file between the html page and the image.
    HugeFile,
}

impl FaultMode {
    /// All modes, ordered by their numeric code.
    pub const ALL: [FaultMode; 9] = [
        FaultMode::None,
        FaultMode::CheckInvocationIdentity,
        FaultMode::CheckNoStrayDescriptors,
        FaultMode::PostponeCompletion,
        FaultMode::PrematureClose,
        FaultMode::SmallerDeclaredLength,
        FaultMode::WriteDelay,
        FaultMode::HtmlOnlyReply,
        FaultMode::HugeFile,
    ];

    /// Numeric code used in the environment variable.
    pub fn code(self) -> u8 {
        match self {
            FaultMode::None => 0,
            FaultMode::CheckInvocationIdentity => 1,
            FaultMode::CheckNoStrayDescriptors => 2,
            FaultMode::PostponeCompletion => 3,
            FaultMode::PrematureClose => 4,
            FaultMode::SmallerDeclaredLength => 5,
            FaultMode::WriteDelay => 6,
            FaultMode::HtmlOnlyReply => 7,
            FaultMode::HugeFile => 8,
        }
    }

    /// One-line description shown in the server's help output.
    pub fn description(self) -> &'static str {
        match self {
            FaultMode::None => "no test",
            FaultMode::CheckInvocationIdentity => "check that the worker identity is set",
            FaultMode::CheckNoStrayDescriptors => {
                "check that connection handles are not inherited"
            }
            FaultMode::PostponeCompletion => "delayed close to check multiple connections",
            FaultMode::PrematureClose => "simulate network problems (connection closed by peer)",
            FaultMode::SmallerDeclaredLength => "give a smaller file length than transmitted",
            FaultMode::WriteDelay => "add a delay between writes",
            FaultMode::HtmlOnlyReply => "send the html part of the response only",
            FaultMode::HugeFile => "send a really huge file as part of the response",
        }
    }

    /// Read the mode from [`FAULT_MODE_ENV`].
    ///
    /// An unset or empty variable selects [`FaultMode::None`].
    pub fn from_env() -> Result<Self, InvalidFaultMode> {
        match std::env::var(FAULT_MODE_ENV) {
            Ok(value) => value.parse(),
            Err(std::env::VarError::NotPresent) => Ok(FaultMode::None),
            Err(std::env::VarError::NotUnicode(raw)) => {
                Err(InvalidFaultMode(raw.to_string_lossy().into_owned()))
            }
        }
    }

    /// Help text listing every mode with its code.
    pub fn help_text() -> String {
        let mut text = format!(
            "The server can run several tests, selected with the environment variable {}:\n",
            FAULT_MODE_ENV
        );
        for mode in FaultMode::ALL {
            text.push_str(&format!("  {} - {}\n", mode.code(), mode.description()));
        }
        text
    }
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// The fault mode value is not an integer in the supported range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fault mode '{0}', expected an integer between 0 and 8")]
pub struct InvalidFaultMode(pub String);

impl FromStr for FaultMode {
    type Err = InvalidFaultMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_start();
        if trimmed.is_empty() {
            return Ok(FaultMode::None);
        }

        let code: i64 = trimmed.parse().map_err(|_| InvalidFaultMode(s.to_string()))?;
        FaultMode::ALL
            .into_iter()
            .find(|mode| i64::from(mode.code()) == code)
            .ok_or_else(|| InvalidFaultMode(s.to_string()))
    }
}
