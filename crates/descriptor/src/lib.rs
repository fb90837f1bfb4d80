//! Connection target parsing.
//!
//! A target is written as `[user@]host[:port][ subsystem]`, where the host
//! may be a bracketed IPv6 literal such as `[::1]`. The user part may itself
//! contain `@` (UPN-style names), so the *rightmost* `@` separates it from
//! the host.

mod error;

pub use error::{ParseError, Result};

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

/// Port used when the target does not name one.
pub const DEFAULT_PORT: u16 = 22;

/// Structured form of a connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    host: String,
    port: u16,
    user: Option<String>,
    subsystem: Option<String>,
}

impl ConnectionDescriptor {
    /// Build a descriptor for `host:port` with no user or subsystem.
    ///
    /// The host is held to the same rules as a parsed target; an IPv6
    /// literal is given without brackets.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        check_host(&host)?;
        if port == 0 {
            return Err(ParseError::InvalidPort(port.to_string()));
        }
        Ok(Self {
            host,
            port,
            user: None,
            subsystem: None,
        })
    }

    /// Host exactly as the caller wrote it (IPv6 without brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Remote command or channel-type selector, if any.
    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    pub fn with_port(self, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(ParseError::InvalidPort(port.to_string()));
        }
        Ok(Self { port, ..self })
    }

    pub fn with_user(self, user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            user: (!user.is_empty()).then_some(user),
            ..self
        }
    }

    /// A subsystem is a single word: no whitespace, control characters or
    /// `@`. An empty one clears it.
    pub fn with_subsystem(self, subsystem: impl Into<String>) -> Result<Self> {
        let subsystem = subsystem.into();
        if !subsystem.is_empty() {
            check_subsystem(&subsystem)?;
        }
        Ok(Self {
            subsystem: (!subsystem.is_empty()).then_some(subsystem),
            ..self
        })
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.is_ipv6() {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if self.port != DEFAULT_PORT {
            write!(f, ":{}", self.port)?;
        }
        if let Some(subsystem) = &self.subsystem {
            write!(f, " {subsystem}")?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Parse a `[user@]host[:port][ subsystem]` target.
pub fn parse(raw: &str) -> Result<ConnectionDescriptor> {
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }

    // Hostnames never contain '@', user names may.
    let (user, remainder) = match raw.rfind('@') {
        Some(idx) => (Some(&raw[..idx]), &raw[idx + 1..]),
        None => (None, raw),
    };

    let (host_port, subsystem) = match remainder.rfind(' ') {
        Some(idx) => (&remainder[..idx], Some(&remainder[idx + 1..])),
        None => (remainder, None),
    };

    // A space inside "[...]" must not be taken as the subsystem separator;
    // checking the balance of what precedes it catches that case.
    check_brackets(host_port)?;

    let (host, port) = parse_host_port(host_port)?;
    let subsystem = subsystem.filter(|s| !s.is_empty());
    if let Some(subsystem) = subsystem {
        check_subsystem(subsystem)?;
    }

    Ok(ConnectionDescriptor {
        host: host.to_string(),
        port,
        user: user.filter(|u| !u.is_empty()).map(str::to_string),
        subsystem: subsystem.map(str::to_string),
    })
}

/// A bare host must survive being written out and parsed back.
fn check_host(host: &str) -> Result<()> {
    let host_port = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    check_brackets(&host_port)?;
    match parse_host_port(&host_port)? {
        (literal, _) if literal == host => Ok(()),
        _ => Err(ParseError::InvalidHost(host.to_string())),
    }
}

fn check_subsystem(subsystem: &str) -> Result<()> {
    let bad = |c: char| c.is_ascii_whitespace() || c.is_control() || c == '@';
    if subsystem.contains(bad) {
        return Err(ParseError::InvalidSubsystem(subsystem.to_string()));
    }
    Ok(())
}

fn check_brackets(host_port: &str) -> Result<()> {
    let opens = host_port.matches('[').count();
    let closes = host_port.matches(']').count();
    if opens == 0 && closes == 0 {
        return Ok(());
    }

    let well_formed = opens == 1
        && closes == 1
        && host_port.starts_with('[')
        && host_port.find(']').is_some_and(|close| close > 0);
    if well_formed {
        Ok(())
    } else {
        Err(ParseError::UnbalancedBracket(host_port.to_string()))
    }
}

/// Validate `host[:port]` and return the host as written plus the port.
///
/// The URI parser is used for validation only: it may re-encode the host,
/// so the returned host is sliced from `host_port` itself. It also silently
/// strips whitespace, which is why that is rejected up front.
fn parse_host_port(host_port: &str) -> Result<(&str, u16)> {
    let literal = literal_host(host_port);
    if literal.is_empty() {
        return Err(ParseError::EmptyHost(host_port.to_string()));
    }
    if host_port.contains(|c: char| c.is_ascii_whitespace() || c.is_control())
        || host_port.contains(['/', '?', '#', '\\', '@'])
    {
        return Err(ParseError::InvalidHost(host_port.to_string()));
    }
    check_escapes(literal)?;

    let uri = Url::parse(&format!("ssh://{host_port}")).map_err(|e| match e {
        url::ParseError::EmptyHost => ParseError::EmptyHost(host_port.to_string()),
        url::ParseError::InvalidPort => ParseError::InvalidPort(host_port.to_string()),
        url::ParseError::InvalidIpv6Address => ParseError::InvalidIpv6(literal.to_string()),
        _ => ParseError::InvalidHost(literal.to_string()),
    })?;

    let port = match uri.port() {
        Some(0) => return Err(ParseError::InvalidPort(host_port.to_string())),
        Some(port) => port,
        None => DEFAULT_PORT,
    };

    match uri.host() {
        Some(Host::Ipv6(_)) => Ok((literal, port)),
        Some(_) if !host_port.starts_with('[') => Ok((literal, port)),
        Some(_) => Err(ParseError::InvalidIpv6(literal.to_string())),
        None => Err(ParseError::EmptyHost(host_port.to_string())),
    }
}

/// The host text of `host[:port]`, without IPv6 brackets.
fn literal_host(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(inner, _)| inner);
    }
    host_port.split_once(':').map_or(host_port, |(host, _)| host)
}

fn check_escapes(host: &str) -> Result<()> {
    let bytes = host.as_bytes();
    for (idx, _) in host.match_indices('%') {
        let valid = bytes
            .get(idx + 1..idx + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !valid {
            return Err(ParseError::MalformedEscape(host.to_string()));
        }
    }
    Ok(())
}
