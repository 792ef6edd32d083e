use super::{
    connection::TransportSender, tcp::TcpConnection, tcp_listener::TcpListenerConnection,
    udp::UdpConnection, SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use rsip::transport::Transport;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    /// Datagram sockets and channels, in the order they were added.
    listens: Mutex<Vec<SipConnection>>,
    listeners: Mutex<Vec<TcpListenerConnection>>,
    /// Stream connections keyed by remote address.
    connections: Mutex<HashMap<SipAddr, SipConnection>>,
    sender: Mutex<Option<TransportSender>>,
}
pub type TransportLayerInnerRef = Arc<TransportLayerInner>;

/// Owns every socket of an endpoint and picks the connection a message
/// leaves through.
pub struct TransportLayer {
    pub outbound: Option<SipAddr>,
    pub inner: TransportLayerInnerRef,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let inner = TransportLayerInner {
            cancel_token,
            listens: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            sender: Mutex::new(None),
        };
        Self {
            outbound: None,
            inner: Arc::new(inner),
        }
    }

    pub fn add_transport(&self, transport: SipConnection) {
        self.inner.listens.lock().push(transport.clone());
        self.inner.spawn_serve(transport);
    }

    /// Binds a new socket. Fails with [`Error::BindFailed`] when the address
    /// is taken or the protocol is not supported.
    pub async fn listen(&self, protocol: Transport, addr: SocketAddr) -> Result<SipAddr> {
        match protocol {
            Transport::Udp => {
                let connection = UdpConnection::create_connection(addr, None).await?;
                let local = connection.get_addr().clone();
                self.add_transport(connection.into());
                Ok(local)
            }
            Transport::Tcp => {
                let listener = TcpListenerConnection::bind(addr, None).await?;
                let local = listener.get_addr().clone();
                self.inner.listeners.lock().push(listener.clone());
                self.inner.spawn_listener(listener);
                Ok(local)
            }
            other => Err(Error::BindFailed(
                format!("unsupported transport {}", other),
                SipAddr::new(other, addr.into()),
            )),
        }
    }

    pub fn add_connection(&self, connection: SipConnection) {
        self.inner.add_connection(connection)
    }

    pub fn del_connection(&self, connection: &SipConnection) {
        self.inner.del_connection(connection)
    }

    pub async fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        self.inner.lookup(self.outbound.as_ref().unwrap_or(target)).await
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.inner.sender.lock().replace(sender);
        let listens = self.inner.listens.lock().clone();
        for transport in listens {
            self.inner.spawn_serve(transport);
        }
        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            self.inner.spawn_listener(listener);
        }
        Ok(())
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        let mut addrs = self
            .inner
            .listens
            .lock()
            .iter()
            .map(|t| t.get_addr().to_owned())
            .collect::<Vec<_>>();
        addrs.extend(
            self.inner
                .listeners
                .lock()
                .iter()
                .map(|l| l.get_addr().to_owned()),
        );
        addrs
    }
}

impl TransportLayerInner {
    fn sender(&self) -> Option<TransportSender> {
        self.sender.lock().clone()
    }

    fn spawn_serve(&self, transport: SipConnection) {
        let Some(sender) = self.sender() else {
            return;
        };
        let token = self.cancel_token.child_token();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                r = transport.serve_loop(sender.clone()) => {
                    if let Err(e) = r {
                        warn!(addr = %transport.get_addr(), "serve loop error: {}", e);
                    }
                }
            }
            debug!(addr = %transport.get_addr(), "serve loop exited");
            sender.send(TransportEvent::Closed(transport)).ok();
        });
    }

    fn spawn_listener(&self, listener: TcpListenerConnection) {
        let Some(sender) = self.sender() else {
            return;
        };
        let token = self.cancel_token.child_token();
        tokio::spawn(async move {
            if let Err(e) = listener.serve_listener(token, sender).await {
                warn!(%listener, "listener exited: {}", e);
            }
        });
    }

    fn add_connection(&self, connection: SipConnection) {
        if let SipConnection::Tcp(tcp) = &connection {
            self.connections
                .lock()
                .insert(tcp.get_remote_addr().clone(), connection.clone());
        }
    }

    fn del_connection(&self, connection: &SipConnection) {
        match connection {
            SipConnection::Tcp(tcp) => {
                self.connections.lock().remove(tcp.get_remote_addr());
            }
            _ => {
                let addr = connection.get_addr();
                self.listens.lock().retain(|t| t.get_addr() != addr);
            }
        }
    }

    async fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        let r#type = target.r#type.clone().unwrap_or(Transport::Udp);
        debug!(%target, "lookup connection");

        match r#type {
            Transport::Udp => {
                let listens = self.listens.lock();
                if let Some(t) = listens.iter().find(|t| t.get_addr() == target) {
                    return Ok(t.clone());
                }
                let udp = listens
                    .iter()
                    .find(|t| matches!(t, SipConnection::Udp(_)))
                    .or_else(|| listens.iter().find(|t| matches!(t, SipConnection::Channel(_))));
                if let Some(t) = udp {
                    return Ok(t.clone());
                }
            }
            Transport::Tcp => {
                if let Some(t) = self
                    .listens
                    .lock()
                    .iter()
                    .find(|t| matches!(t, SipConnection::Channel(c) if c.is_reliable()))
                {
                    return Ok(t.clone());
                }
                let remote = SipAddr::new(Transport::Tcp, target.resolve().await?.into());
                if let Some(t) = self.connections.lock().get(&remote) {
                    return Ok(t.clone());
                }
                let connection: SipConnection = TcpConnection::connect(&remote).await?.into();
                info!(%connection, "new outbound connection");
                self.add_connection(connection.clone());
                if let Some(sender) = self.sender() {
                    sender.send(TransportEvent::New(connection.clone())).ok();
                }
                self.spawn_serve(connection.clone());
                return Ok(connection);
            }
            _ => {}
        }
        Err(Error::TransportFailure(
            format!("no connection for transport {}", r#type),
            target.to_owned(),
        ))
    }
}
