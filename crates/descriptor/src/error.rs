use thiserror::Error;

/// Errors produced while parsing a connection target.
///
/// Every variant carries the offending part of the input so callers can
/// point the user at what to fix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("connection target is empty")]
    Empty,

    #[error("missing host in '{0}'")]
    EmptyHost(String),

    #[error("unbalanced IPv6 brackets in '{0}'")]
    UnbalancedBracket(String),

    #[error("invalid port in '{0}' (expected 1-65535)")]
    InvalidPort(String),

    #[error("malformed percent escape in host '{0}'")]
    MalformedEscape(String),

    #[error("invalid IPv6 address '{0}'")]
    InvalidIpv6(String),

    #[error("invalid host '{0}'")]
    InvalidHost(String),

    #[error("invalid subsystem '{0}'")]
    InvalidSubsystem(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;
