//! Channel URL parsing.
//!
//! Grammar: `scheme "://" host ":" port ["?" scope-id]` where scheme is
//! `tcp` or `tcp6`. An empty host with the `tcp` scheme selects bind mode
//! (listen for the controller); the `tcp6` scheme dials out and carries an
//! optional interface scope id after the `?`.

use std::fmt;

use crate::SessionError;

/// URL scheme selecting the address family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// IPv4 (or bind-any dual-stack when the host is empty)
    Tcp,
    /// IPv6
    Tcp6,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tcp => write!(f, "tcp"),
            Scheme::Tcp6 => write!(f, "tcp6"),
        }
    }
}

/// A parsed channel URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUrl {
    /// Address family
    pub scheme: Scheme,
    /// Controller host; `None` selects bind mode
    pub host: Option<String>,
    /// Controller (or listen) port
    pub port: u16,
    /// IPv6 interface scope id
    pub scope_id: Option<u32>,
}

impl ChannelUrl {
    /// Parse a channel URL
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let bad = || SessionError::Url(raw.to_string());

        let (scheme_str, rest) = raw.split_once("://").ok_or_else(bad)?;
        let scheme = match scheme_str {
            "tcp" => Scheme::Tcp,
            "tcp6" => Scheme::Tcp6,
            _ => return Err(bad()),
        };

        let (rest, scope_id) = match rest.split_once('?') {
            Some((rest, scope)) => (rest, Some(scope.parse::<u32>().map_err(|_| bad())?)),
            None => (rest, None),
        };
        if scope_id.is_some() && scheme != Scheme::Tcp6 {
            return Err(bad());
        }

        let (host_part, port_str) = rest.rsplit_once(':').ok_or_else(bad)?;
        let port: u16 = port_str.parse().map_err(|_| bad())?;

        let host = host_part
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let host = (!host.is_empty()).then_some(host);

        // The v6 path always dials out; there is no bind branch for it.
        if host.is_none() && scheme == Scheme::Tcp6 {
            return Err(bad());
        }

        Ok(Self {
            scheme,
            host,
            port,
            scope_id,
        })
    }

    /// Whether this URL selects bind mode
    pub fn is_bind(&self) -> bool {
        self.host.is_none()
    }
}

impl fmt::Display for ChannelUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        match (&self.host, self.scheme) {
            (Some(host), Scheme::Tcp6) => write!(f, "[{host}]")?,
            (Some(host), Scheme::Tcp) => write!(f, "{host}")?,
            (None, _) => {}
        }
        write!(f, ":{}", self.port)?;
        if let Some(scope) = self.scope_id {
            write!(f, "?{scope}")?;
        }
        Ok(())
    }
}
