//! TCP endpoint addresses in `tcp://host:port` form.

use std::fmt;

use url::Url;

use crate::errors::ConfigurationError;

/// A parsed `tcp://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEndpoint {
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// Port number. `0` asks the OS for a free port when binding.
    pub port: u16,
}

impl TcpEndpoint {
    /// Parses an endpoint string.
    ///
    /// # Errors
    /// `MalformedEndpoint` for any scheme other than `tcp`, a missing host or a missing port.
    pub fn parse(address: &str) -> Result<Self, ConfigurationError> {
        let malformed = |reason: &str| ConfigurationError::MalformedEndpoint {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(address).map_err(|e| malformed(&e.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(malformed("only tcp:// endpoints are supported"));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| malformed("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().ok_or_else(|| malformed("missing port"))?;
        Ok(Self { host, port })
    }

    /// `host:port` string suitable for `TcpListener::bind` / `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_endpoints() {
        let ep = TcpEndpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 5555);
        assert_eq!(ep.socket_addr(), "127.0.0.1:5555");

        let ep = TcpEndpoint::parse("tcp://[::1]:6000").unwrap();
        assert_eq!(ep.socket_addr(), "[::1]:6000");
        assert_eq!(ep.to_string(), "tcp://[::1]:6000");
    }

    #[test]
    fn test_reject_malformed_endpoints() {
        for bad in ["http://127.0.0.1:5555", "tcp://127.0.0.1", "127.0.0.1:5555", "tcp://:80", ""] {
            assert!(
                matches!(
                    TcpEndpoint::parse(bad),
                    Err(ConfigurationError::MalformedEndpoint { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }
}
