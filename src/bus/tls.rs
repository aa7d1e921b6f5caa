//! Broker address parsing and transport selection.
//!
//! Accepted broker addresses:
//! - `host:port` (TLS only when forced by configuration)
//! - `mqtt://host:port`, `tcp://host:port`
//! - `mqtts://host:port`, `ssl://host:port` (always TLS)
//! - `[ipv6]:port`

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// Where the broker lives and whether to speak TLS to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl BrokerEndpoint {
    pub fn parse(addr: &str, force_tls: bool) -> Result<Self> {
        let mut use_tls = force_tls;
        let mut remainder = addr.trim();

        if let Some((scheme, rest)) = remainder.split_once("://") {
            match scheme {
                "mqtt" | "tcp" => {}
                "mqtts" | "ssl" => use_tls = true,
                other => return Err(anyhow!("unsupported broker scheme '{}'", other)),
            }
            remainder = rest;
        }

        let (host, port) = split_host_port(remainder)?;
        if host.is_empty() {
            return Err(anyhow!("broker address {} has no host", addr));
        }
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }

    pub fn is_loopback(&self) -> bool {
        if self.host == "localhost" {
            return true;
        }
        self.host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    /// Refuse non-loopback brokers. Frames are raw camera images.
    pub fn require_loopback(&self) -> Result<()> {
        if self.is_loopback() {
            return Ok(());
        }
        Err(anyhow!(
            "broker {}:{} is not loopback; set allow_remote (or --allow-remote-mqtt) to publish camera frames off-host",
            self.host,
            self.port
        ))
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 broker address {}", addr))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
            (host, port)
        }
        None => addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing broker port in {}", addr))?,
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid broker port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// PEM material read from disk for a TLS connection.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA bundle. `None` means the default webpki roots.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path.map(|path| read_pem(path, "CA")).transpose()?;
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client certificate")?,
                read_pem(key, "client key")?,
            )),
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("TLS client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("TLS client key provided without certificate")),
        };
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read TLS {} '{}'", what, path.display()))
}

pub fn build_transport(endpoint: &BrokerEndpoint, materials: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if materials.is_configured() {
            return Err(anyhow!(
                "TLS files are configured but {} is plain TCP; use mqtts:// or set use_tls",
                endpoint
            ));
        }
        return Ok(Transport::tcp());
    }
    if !materials.is_configured() {
        return Ok(Transport::tls_with_default_config());
    }
    let ca = materials
        .ca
        .clone()
        .ok_or_else(|| anyhow!("a TLS CA certificate is required alongside a client certificate"))?;
    Ok(Transport::tls(ca, materials.client_auth.clone(), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_plain_and_tls_addresses() -> Result<()> {
        let plain = BrokerEndpoint::parse("127.0.0.1:1883", false)?;
        assert_eq!(plain.host, "127.0.0.1");
        assert_eq!(plain.port, 1883);
        assert!(!plain.use_tls);

        let tls = BrokerEndpoint::parse("mqtts://broker.lan:8883", false)?;
        assert_eq!(tls.host, "broker.lan");
        assert!(tls.use_tls);

        assert!(BrokerEndpoint::parse("localhost:8883", true)?.use_tls);
        Ok(())
    }

    #[test]
    fn parses_bracketed_ipv6() -> Result<()> {
        let ep = BrokerEndpoint::parse("[::1]:1883", false)?;
        assert_eq!(ep.host, "::1");
        assert!(ep.is_loopback());
        assert_eq!(ep.to_string(), "mqtt://[::1]:1883");
        Ok(())
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(BrokerEndpoint::parse("localhost", false).is_err());
        assert!(BrokerEndpoint::parse("localhost:port", false).is_err());
        assert!(BrokerEndpoint::parse("ws://localhost:80", false).is_err());
        assert!(BrokerEndpoint::parse(":1883", false).is_err());
    }

    #[test]
    fn loopback_check() -> Result<()> {
        assert!(BrokerEndpoint::parse("localhost:1883", false)?
            .require_loopback()
            .is_ok());
        assert!(BrokerEndpoint::parse("127.0.0.2:1883", false)?.is_loopback());
        let err = BrokerEndpoint::parse("192.168.43.1:1883", false)?
            .require_loopback()
            .unwrap_err();
        assert!(err.to_string().contains("allow_remote"));
        Ok(())
    }

    #[test]
    fn client_cert_needs_key() {
        let cert = PathBuf::from("/nonexistent/cert.pem");
        let err = TlsMaterials::load(None, Some(cert.as_path()), None).unwrap_err();
        assert!(err.to_string().contains("without key"));
    }

    #[test]
    fn plain_transport_rejects_tls_files() -> Result<()> {
        let ep = BrokerEndpoint::parse("127.0.0.1:1883", false)?;
        let materials = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_auth: None,
        };
        assert!(build_transport(&ep, &materials).is_err());
        assert!(build_transport(&ep, &TlsMaterials::default()).is_ok());
        Ok(())
    }
}
