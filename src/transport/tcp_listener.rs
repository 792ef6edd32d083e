use crate::transport::tcp::TcpConnection;
use crate::transport::{connection::TransportSender, SipAddr};
use crate::transport::{SipConnection, TransportEvent};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct TcpListenerConnectionInner {
    pub local_addr: SipAddr,
    pub external: Option<SipAddr>,
    listener: Mutex<Option<TcpListener>>,
}

/// A bound TCP listener. Every accepted stream is announced with
/// [`TransportEvent::New`], served on its own task and reported with
/// [`TransportEvent::Closed`] when it ends.
#[derive(Clone)]
pub struct TcpListenerConnection {
    pub inner: Arc<TcpListenerConnectionInner>,
}

impl TcpListenerConnection {
    pub async fn bind(local: SocketAddr, external: Option<SocketAddr>) -> Result<Self> {
        let listener = TcpListener::bind(local).await.map_err(|e| {
            Error::BindFailed(
                e.to_string(),
                SipAddr::new(rsip::transport::Transport::Tcp, local.into()),
            )
        })?;
        let local_addr = SipAddr::new(
            rsip::transport::Transport::Tcp,
            listener.local_addr()?.into(),
        );
        info!(addr = %local_addr, "TCP listening");
        Ok(TcpListenerConnection {
            inner: Arc::new(TcpListenerConnectionInner {
                local_addr,
                external: external
                    .map(|addr| SipAddr::new(rsip::transport::Transport::Tcp, addr.into())),
                listener: Mutex::new(Some(listener)),
            }),
        })
    }

    pub async fn serve_listener(
        &self,
        cancel_token: CancellationToken,
        sender: TransportSender,
    ) -> Result<()> {
        let listener = self.inner.listener.lock().take().ok_or_else(|| {
            Error::Error(format!("listener {} already served", self.get_addr()))
        })?;
        let local_addr = self.get_addr().clone();

        loop {
            let (stream, remote_addr) = select! {
                _ = cancel_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(addr = %local_addr, "failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            let tcp_connection = match TcpConnection::from_stream(stream, local_addr.clone()) {
                Ok(tcp_connection) => tcp_connection,
                Err(e) => {
                    warn!(%remote_addr, "failed to set up TCP connection: {}", e);
                    continue;
                }
            };

            let sip_connection = SipConnection::Tcp(tcp_connection.clone());
            let sender = sender.clone();
            let cancel_token = cancel_token.child_token();
            tokio::spawn(async move {
                if sender
                    .send(TransportEvent::New(sip_connection.clone()))
                    .is_err()
                {
                    return;
                }
                select! {
                    _ = cancel_token.cancelled() => {}
                    r = tcp_connection.serve_loop(sender.clone()) => {
                        if let Err(e) = r {
                            info!(%remote_addr, "TCP serve loop ended: {}", e);
                        }
                    }
                }
                sender.send(TransportEvent::Closed(sip_connection)).ok();
            });
        }
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        self.inner
            .external
            .as_ref()
            .unwrap_or(&self.inner.local_addr)
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP listener {}", self.get_addr())
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
