use crate::{
    transport::{
        connection::TransportSender, sip_addr::SipAddr, stream::StreamConnectionInner,
        SipConnection,
    },
    Error, Result,
};
use rsip::SipMessage;
use std::{fmt, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

type TcpInner =
    StreamConnectionInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

#[derive(Clone)]
pub struct TcpConnection {
    pub inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let socket_addr = remote.resolve().await?;
        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| Error::TransportFailure(e.to_string(), remote.clone()))?;

        let local_addr = SipAddr::new(rsip::transport::Transport::Tcp, stream.local_addr()?.into());
        let remote_addr = SipAddr::new(rsip::transport::Transport::Tcp, socket_addr.into());
        let (read_half, write_half) = tokio::io::split(stream);

        let connection = TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            )),
        };
        info!(%connection, "connected TCP");
        Ok(connection)
    }

    pub fn from_stream(stream: TcpStream, local_addr: SipAddr) -> Result<Self> {
        let remote_addr = SipAddr::new(rsip::transport::Transport::Tcp, stream.peer_addr()?.into());
        let (read_half, write_half) = tokio::io::split(stream);

        let connection = TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            )),
        };
        info!(%connection, "accepted TCP");
        Ok(connection)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn get_remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let sip_connection = SipConnection::Tcp(self.clone());
        self.inner.serve_loop(sender, sip_connection).await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP {} -> {}",
            self.inner.local_addr, self.inner.remote_addr
        )
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
