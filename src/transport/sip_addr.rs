use crate::{Error, Result};
use rsip::{host_with_port, HostWithPort};
use std::{fmt, hash::Hash, net::SocketAddr};

/// A network address paired with the SIP transport it is reached over.
///
/// `r#type` is `None` when the transport is not known yet, e.g. for an
/// address parsed out of a Request-URI without a `transport` parameter.
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct SipAddr {
    pub r#type: Option<rsip::transport::Transport>,
    pub addr: HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.r#type {
            Some(r#type) => write!(f, "{} {}", r#type, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        match self.addr.host {
            host_with_port::Host::Domain(ref domain) => domain.hash(state),
            host_with_port::Host::IpAddr(ref ip_addr) => ip_addr.hash(state),
        }
        if let Some(port) = self.addr.port {
            port.value().hash(state);
        }
    }
}

impl SipAddr {
    pub fn new(transport: rsip::transport::Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self.r#type, None | Some(rsip::transport::Transport::Udp))
    }

    fn port_or_default(&self) -> u16 {
        self.addr.port.map_or(5060, |p| p.value().to_owned())
    }

    /// Converts to a socket address without touching DNS; fails for
    /// domain names.
    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => Err(Error::Error(format!(
                "cannot convert domain {} to SocketAddr",
                domain
            ))),
            host_with_port::Host::IpAddr(ip_addr) => {
                Ok(SocketAddr::new(ip_addr.to_owned(), self.port_or_default()))
            }
        }
    }

    /// Resolves the address, looking domain names up with the system
    /// resolver. The first record wins.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.get_socketaddr() {
            return Ok(addr);
        }
        let host = self.addr.host.to_string();
        let mut addrs = tokio::net::lookup_host((host.as_str(), self.port_or_default()))
            .await
            .map_err(|e| Error::TransportFailure(e.to_string(), self.clone()))?;
        addrs.next().ok_or_else(|| {
            Error::TransportFailure(format!("no address for {}", host), self.clone())
        })
    }
}

impl From<&SipAddr> for rsip::Uri {
    fn from(addr: &SipAddr) -> Self {
        let scheme = match addr.r#type {
            Some(rsip::transport::Transport::Wss) | Some(rsip::transport::Transport::Tls) => {
                rsip::Scheme::Sips
            }
            _ => rsip::Scheme::Sip,
        };
        let mut params = vec![];
        if let Some(transport) = &addr.r#type {
            if *transport != rsip::transport::Transport::Udp {
                params.push(rsip::Param::Transport(transport.clone()));
            }
        }
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: addr.addr.clone(),
            params,
            ..Default::default()
        }
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: addr.into(),
        }
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(host_with_port: HostWithPort) -> Self {
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let transport = uri.transport().cloned().or_else(|| match uri.scheme {
            Some(rsip::Scheme::Sips) => Some(rsip::transport::Transport::Tls),
            _ => None,
        });
        Ok(SipAddr {
            r#type: transport,
            addr: uri.host_with_port.clone(),
        })
    }
}
