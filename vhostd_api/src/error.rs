use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// Stable error codes carried through network setup. The numeric values are
/// part of the management API and must never change.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, IntoStaticStr, PartialEq, Serialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    LostConnection,
    BadParams,
    BadAddr,
    BadNic,
    UsedNic,
    BadBonding,
    UsedBond,
    UsedBridge,
    BadBridge,
    FailedIfup,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::LostConnection => 10,
            ErrorCode::BadParams => 21,
            ErrorCode::BadAddr => 22,
            ErrorCode::BadNic => 23,
            ErrorCode::UsedNic => 24,
            ErrorCode::BadBonding => 25,
            ErrorCode::UsedBond => 26,
            ErrorCode::UsedBridge => 27,
            ErrorCode::BadBridge => 28,
            ErrorCode::FailedIfup => 29,
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Error carrier for the network setup engine. Wraps a stable [`ErrorCode`]
/// with a human-readable message and an optional underlying cause.
pub struct NetError {
    code: ErrorCode,
    message: String,
    source: Option<anyhow::Error>,
}

pub type NetResult<T> = Result<T, NetError>;

impl NetError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        NetError {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(code: ErrorCode, message: impl Into<String>, source: anyhow::Error) -> Self {
        NetError {
            code,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Flattens the carrier into an unstructured error for callers that do
    /// not speak the code taxonomy.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self.source {
            Some(source) => source.context(format!("{}: {}", self.code, self.message)),
            None => anyhow::anyhow!("{}: {}", self.code, self.message),
        }
    }
}

impl Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Debug for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(source) = &self.source {
            write!(f, "\nCaused by: {source:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(AsRef::<dyn std::error::Error + 'static>::as_ref)
    }
}

/// Attaches a stable error code to a fallible result, in the style of the
/// usual `context()` extension.
pub trait ReportNetError<T> {
    fn structured(self, code: ErrorCode, message: impl Into<String>) -> NetResult<T>;
}

impl<T, E> ReportNetError<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn structured(self, code: ErrorCode, message: impl Into<String>) -> NetResult<T> {
        self.map_err(|e| NetError::with_source(code, message, e.into()))
    }
}

impl<T> ReportNetError<T> for Option<T> {
    fn structured(self, code: ErrorCode, message: impl Into<String>) -> NetResult<T> {
        self.ok_or_else(|| NetError::new(code, message))
    }
}
