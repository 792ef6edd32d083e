use super::{
    connection::{TransportReceiver, TransportSender},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

struct ChannelConnectionInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
    reliable: bool,
}

/// In-process connection backed by two unbounded channels.
///
/// Everything sent is pushed to `outgoing` as a [`TransportEvent::Incoming`]
/// carrying this connection, so whoever drains `outgoing` can answer through
/// it. `reliable` decides whether transactions retransmit over it.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelConnectionInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
        reliable: bool,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelConnectionInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
                reliable,
            }),
        })
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    pub async fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        let connection = SipConnection::Channel(self.clone());
        let source = self.get_addr().clone();
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(msg, connection, source.clone()))
            .map_err(|e| Error::TransportFailure(e.to_string(), source))
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut incoming = match self.inner.incoming.lock().take() {
            Some(incoming) => incoming,
            None => {
                return Err(Error::Error(
                    "ChannelConnection::serve_loop called twice".to_string(),
                ))
            }
        };
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
