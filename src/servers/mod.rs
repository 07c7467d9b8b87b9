//! Server-list model: endpoints, the baked-in fallback pool and the in-band
//! `/ServerList/` announcement format.

pub mod store;

use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Fallback pool used on first run or when the persisted list is unusable.
pub const DEFAULT_SERVERS: &[&str] = &[
    "emwin.weathermessage.com:2211",
    "master.weathermessage.com:2211",
    "emwin.interweather.net:1000",
    "wxmesg.upstateweather.com:2211",
];

/// No satellite relays ship as defaults; they only arrive in-band.
pub const DEFAULT_SAT_SERVERS: &[&str] = &[];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerEndpoint {
    type Err = ServerListParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| ServerListParseError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(ServerListParseError::InvalidEndpoint(s.to_string()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| ServerListParseError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(ServerListParseError::InvalidPort(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Primary and satellite endpoint pools as announced by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    pub servers: Vec<ServerEndpoint>,
    pub sat_servers: Vec<ServerEndpoint>,
    pub received_at: DateTime<Utc>,
}

impl ServerList {
    pub fn defaults() -> Self {
        let parse_all = |entries: &[&str]| {
            entries
                .iter()
                .map(|s| s.parse().expect("baked-in server entry must parse"))
                .collect()
        };
        Self {
            servers: parse_all(DEFAULT_SERVERS),
            sat_servers: parse_all(DEFAULT_SAT_SERVERS),
            received_at: Utc::now(),
        }
    }

    /// Parse a `/ServerList/` announcement.
    ///
    /// Grammar as broadcast: primary entries `|`-separated up to a
    /// `\ServerList\` end marker, then an optional `/SatServers/` section with
    /// `+`-separated entries up to `\SatServers\`. Both separators are
    /// accepted in both sections; unparseable entries are skipped. A
    /// degenerate announcement carrying no usable endpoint is still a valid
    /// announcement: it parses to the built-in default pool, so it can never
    /// wipe the rotation.
    pub fn from_frame(content: &str) -> Result<Self, ServerListParseError> {
        let body = content
            .strip_prefix("/ServerList/")
            .ok_or(ServerListParseError::MissingPrefix)?;

        let (primary_part, rest) = match body.split_once("\\ServerList\\") {
            Some((p, rest)) => (p, rest),
            None => match body.split_once("/SatServers/") {
                Some((p, sat)) => (p, sat),
                None => (body, ""),
            },
        };
        let sat_part = rest
            .split_once("/SatServers/")
            .map(|(_, sat)| sat)
            .unwrap_or(rest);
        let sat_part = sat_part
            .split_once("\\SatServers\\")
            .map_or(sat_part, |(sat, _)| sat);

        let servers = parse_entries(primary_part);
        let sat_servers = parse_entries(sat_part);
        if servers.is_empty() && sat_servers.is_empty() {
            tracing::warn!("server list announcement carries no endpoints; using defaults");
            return Ok(Self::defaults());
        }

        Ok(Self {
            servers,
            sat_servers,
            received_at: Utc::now(),
        })
    }

    pub fn all(&self) -> impl Iterator<Item = &ServerEndpoint> {
        self.servers.iter().chain(self.sat_servers.iter())
    }

    pub fn len(&self) -> usize {
        self.servers.len() + self.sat_servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_entries(part: &str) -> Vec<ServerEndpoint> {
    part.split(['|', '+'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<ServerEndpoint>() {
            Ok(endpoint) => Some(endpoint),
            Err(err) => {
                tracing::debug!(entry = s, error = %err, "skipping unparseable server entry");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerListParseError {
    MissingPrefix,
    InvalidEndpoint(String),
    InvalidPort(String),
}

impl std::fmt::Display for ServerListParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPrefix => write!(f, "server list frame lacks /ServerList/ prefix"),
            Self::InvalidEndpoint(s) => write!(f, "invalid server entry '{s}': expected host:port"),
            Self::InvalidPort(s) => write!(f, "invalid port in server entry '{s}'"),
        }
    }
}

impl std::error::Error for ServerListParseError {}
