//! Listen prefixes such as `http://*:80/` or `http://+:8080/relay/`.

use std::fmt;
use std::str::FromStr;

use crate::RelayError;

const DEFAULT_PORT: u16 = 80;

/// Where the relay listens and which path it serves under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenPrefix {
    /// `None` listens on every interface (`*` or `+`).
    pub host: Option<String>,
    pub port: u16,
    /// Always starts and ends with `/`.
    pub base_path: String,
}

impl ListenPrefix {
    /// Parses `http://host:port/path/`, or the same without a scheme.
    ///
    /// `https` is rejected; TLS belongs to a fronting proxy.
    pub fn parse(prefix: &str) -> Result<Self, RelayError> {
        let invalid = || RelayError::InvalidPrefix(prefix.to_string());
        let trimmed = prefix.trim();

        let rest = match trimmed.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
            Some(_) => return Err(invalid()),
            None => trimmed,
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                None => (authority, DEFAULT_PORT),
            }
        };

        let host = match host {
            "" | "*" | "+" => None,
            h if h.contains(['/', ' ']) => return Err(invalid()),
            h => Some(h.to_string()),
        };

        let mut base_path = path.trim().to_string();
        if !base_path.starts_with('/') {
            base_path.insert(0, '/');
        }
        if !base_path.ends_with('/') {
            base_path.push('/');
        }

        Ok(Self {
            host,
            port,
            base_path,
        })
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        match &self.host {
            None => format!("0.0.0.0:{}", self.port),
            Some(h) if h.contains(':') => format!("[{h}]:{}", self.port),
            Some(h) => format!("{h}:{}", self.port),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Public base URL, substituting `hostname` for wildcard hosts.
    pub fn url_base(&self, hostname: &str) -> String {
        let host = self.host.as_deref().unwrap_or(hostname);
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        if self.port == DEFAULT_PORT {
            format!("http://{host}{}", self.base_path)
        } else {
            format!("http://{host}:{}{}", self.port, self.base_path)
        }
    }

    /// WebSocket URL for tunneling into a relay listening here.
    pub fn ws_url(&self, hostname: &str) -> String {
        format!("ws{}", &self.url_base(hostname)["http".len()..])
    }
}

impl fmt::Display for ListenPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            None => write!(f, "http://*:{}{}", self.port, self.base_path),
            Some(h) if h.contains(':') => write!(f, "http://[{h}]:{}{}", self.port, self.base_path),
            Some(h) => write!(f, "http://{h}:{}{}", self.port, self.base_path),
        }
    }
}

impl FromStr for ListenPrefix {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_hosts() {
        let p = ListenPrefix::parse("http://*:80/").unwrap();
        assert_eq!(p.host, None);
        assert_eq!(p.port, 80);
        assert_eq!(p.base_path, "/");
        assert_eq!(p.bind_addr(), "0.0.0.0:80");

        let p = ListenPrefix::parse("http://+:8080/relay").unwrap();
        assert_eq!(p.host, None);
        assert_eq!(p.port, 8080);
        assert_eq!(p.base_path, "/relay/");
    }

    #[test]
    fn defaults_and_bare_authorities() {
        let p = ListenPrefix::parse("http://example.com").unwrap();
        assert_eq!(p.host.as_deref(), Some("example.com"));
        assert_eq!(p.port, 80);
        assert_eq!(p.base_path, "/");

        let p = ListenPrefix::parse("127.0.0.1:9000").unwrap();
        assert_eq!(p.bind_addr(), "127.0.0.1:9000");

        let p = ListenPrefix::parse("http://[::1]:8081/").unwrap();
        assert_eq!(p.host.as_deref(), Some("::1"));
        assert_eq!(p.bind_addr(), "[::1]:8081");
    }

    #[test]
    fn rejects_bad_prefixes() {
        assert!(ListenPrefix::parse("https://*:443/").is_err());
        assert!(ListenPrefix::parse("ftp://host/").is_err());
        assert!(ListenPrefix::parse("http://*:port/").is_err());
        assert!(ListenPrefix::parse("http://[::1/").is_err());
    }

    #[test]
    fn public_urls() {
        let p = ListenPrefix::parse("http://*:80/").unwrap();
        assert_eq!(p.url_base("box"), "http://box/");
        assert_eq!(p.ws_url("box"), "ws://box/");

        let p = ListenPrefix::parse("http://*:8080/relay/").unwrap();
        assert_eq!(p.url_base("box"), "http://box:8080/relay/");
        assert_eq!(p.to_string(), "http://*:8080/relay/");
    }
}
