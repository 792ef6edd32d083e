use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM_SIZE: usize = 65535;

struct UdpConnectionInner {
    conn: UdpSocket,
    addr: SipAddr,
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpConnectionInner>,
}

impl UdpConnection {
    /// Binds a datagram socket. `external` replaces the advertised address
    /// when the socket sits behind a NAT.
    pub async fn create_connection(local: SocketAddr, external: Option<SocketAddr>) -> Result<Self> {
        let conn = UdpSocket::bind(local).await.map_err(|e| {
            Error::BindFailed(
                e.to_string(),
                SipAddr::new(rsip::transport::Transport::Udp, local.into()),
            )
        })?;
        let bound = conn.local_addr()?;
        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: external.unwrap_or(bound).into(),
        };

        let t = UdpConnection {
            inner: Arc::new(UdpConnectionInner { addr, conn }),
        };
        info!(addr = %t.get_addr(), ?external, "created UDP connection");
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(addr = %self.get_addr(), "error receiving UDP packet: {}", e);
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                data if data.iter().all(|b| b.is_ascii_whitespace()) => continue,
                _ => {}
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!(%addr, "dropping datagram, invalid utf-8: {}", e);
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!(%addr, "dropping malformed datagram: {}", e);
                    continue;
                }
            };

            let msg = match SipConnection::update_msg_received(
                msg,
                addr,
                rsip::transport::Transport::Udp,
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    info!(%addr, "dropping datagram without usable Via: {}", e);
                    continue;
                }
            };

            debug!(len, %addr, local = %self.get_addr(), "received datagram");
            trace!("{}", undecoded);

            let from = SipAddr {
                r#type: Some(rsip::transport::Transport::Udp),
                addr: addr.into(),
            };
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                from,
            ))?;
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.clone(),
            None => SipConnection::get_destination(&msg)?,
        };
        let buf = msg.to_string();
        trace!(len = buf.len(), %target, "sending datagram\n{}", buf);
        self.send_raw(buf.as_bytes(), &target).await
    }

    /// One `send_to` per message, a datagram is never split or interleaved.
    pub async fn send_raw(&self, buf: &[u8], target: &SipAddr) -> Result<()> {
        let socket_addr = target.resolve().await?;
        self.inner
            .conn
            .send_to(buf, socket_addr)
            .await
            .map_err(|e| Error::TransportFailure(e.to_string(), target.to_owned()))
            .map(|_| ())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.conn.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
