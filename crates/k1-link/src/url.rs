//! Device endpoint validation. Runs before any I/O.

use std::fmt;

use crate::error::LinkError;

/// A validated `ws://` or `wss://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUrl {
    raw: String,
    secure: bool,
    host: String,
    port: Option<u16>,
}

impl DeviceUrl {
    pub fn parse(input: &str) -> Result<Self, LinkError> {
        let raw = input.trim();
        let invalid = || LinkError::InvalidUrl(input.to_string());

        let (secure, rest) = if has_scheme(raw, "ws://") {
            (false, &raw[5..])
        } else if has_scheme(raw, "wss://") {
            (true, &raw[6..])
        } else {
            return Err(invalid());
        };

        let authority = rest
            .split(&['/', '?', '#'][..])
            .next()
            .unwrap_or_default();
        let host_port = authority.rsplit('@').next().unwrap_or_default();

        let (host, port) = if let Some(v6) = host_port.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| invalid())?),
                None if tail.is_empty() => None,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, p)) => (host, Some(p.parse::<u16>().map_err(|_| invalid())?)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            raw: raw.to_string(),
            secure,
            host: host.to_string(),
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, else the scheme default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

fn has_scheme(raw: &str, scheme: &str) -> bool {
    raw.get(..scheme.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(scheme))
}

impl fmt::Display for DeviceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for DeviceUrl {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
