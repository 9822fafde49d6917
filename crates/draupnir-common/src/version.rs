//! Semantic version handling for the `Draupnir-Version` header.

/// Header carrying the client's or server's version.
pub const VERSION_HEADER: &str = "Draupnir-Version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Semver {
    /// Parse a strict `MAJOR.MINOR.PATCH` string.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.split('.');
        let major = parse_component(parts.next()?)?;
        let minor = parse_component(parts.next()?)?;
        let patch = parse_component(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor, patch })
    }
}

fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A client is compatible when it shares the server's major version and does
/// not expect a newer minor version than the server provides.
///
/// An unparseable server version accepts everything.
pub fn is_compatible(server: &str, client: &str) -> bool {
    let Some(server) = Semver::parse(server) else {
        return true;
    };
    match Semver::parse(client) {
        Some(client) => client.major == server.major && client.minor <= server.minor,
        None => false,
    }
}
