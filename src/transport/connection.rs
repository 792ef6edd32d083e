use super::{channel::ChannelConnection, tcp::TcpConnection, udp::UdpConnection, SipAddr};
use crate::{rsip_ext::destination_from_request, Error, Result};
use rsip::{
    param::{OtherParam, OtherParamValue, Received},
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Param, SipMessage,
};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A parsed message, the connection it arrived on and the peer address.
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

#[derive(Clone, Debug)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
            SipConnection::Tcp(_) => true,
            SipConnection::Channel(transport) => transport.is_reliable(),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(transport) => transport.get_addr(),
            SipConnection::Tcp(transport) => transport.get_addr(),
            SipConnection::Channel(transport) => transport.get_addr(),
        }
    }

    /// Sends one message. `destination` only matters for datagram
    /// connections; stream and channel connections have a fixed peer.
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.send(msg, destination).await,
            SipConnection::Tcp(transport) => transport.send_message(msg).await,
            SipConnection::Channel(transport) => transport.send(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.serve_loop(sender).await,
            SipConnection::Tcp(transport) => transport.serve_loop(sender).await,
            SipConnection::Channel(transport) => transport.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.close().await,
            _ => Ok(()),
        }
    }
}

impl SipConnection {
    /// Stamps `received`/`rport` on the top Via of an inbound request so the
    /// response finds its way back through NATs.
    pub fn update_msg_received(
        msg: SipMessage,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr, transport)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(
        via: &mut rsip::headers::Via,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<()> {
        let received: HostWithPort = addr.into();
        let mut typed_via = via.typed()?;
        if typed_via.uri.host_with_port == received && typed_via.transport == transport {
            return Ok(());
        }
        typed_via.params.retain(|param| match param {
            Param::Other(key, _) => !key.value().eq_ignore_ascii_case("rport"),
            Param::Received(_) => false,
            _ => true,
        });
        *via = typed_via
            .with_param(Param::Received(Received::new(received.host.to_string())))
            .with_param(Param::Other(
                OtherParam::new("rport"),
                Some(OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    /// Reads the address a response must be sent to out of a Via,
    /// honouring `received` and `rport`.
    pub fn parse_target_from_via(
        via: &rsip::headers::untyped::Via,
    ) -> Result<(rsip::transport::Transport, HostWithPort)> {
        let typed_via = via.typed()?;
        let mut host_with_port = typed_via.uri.host_with_port;
        for param in typed_via.params.iter() {
            match param {
                Param::Received(v) => {
                    if let Ok(addr) = v.parse() {
                        host_with_port.host = addr.into();
                    }
                }
                Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                    if let Ok(port) = value.value().parse::<u16>() {
                        host_with_port.port = Some(port.into());
                    }
                }
                _ => {}
            }
        }
        Ok((typed_via.transport, host_with_port))
    }

    pub fn get_destination(msg: &SipMessage) -> Result<SipAddr> {
        match msg {
            SipMessage::Request(req) => destination_from_request(req).ok_or_else(|| {
                Error::Error(format!("no destination for request {}", req.uri))
            }),
            SipMessage::Response(resp) => {
                let (transport, host_with_port) =
                    Self::parse_target_from_via(resp.via_header()?)?;
                Ok(SipAddr::new(transport, host_with_port))
            }
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "{}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
