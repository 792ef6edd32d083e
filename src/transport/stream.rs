use crate::{
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent,
    },
    Error, Result,
};
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use rsip::SipMessage;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages on a byte stream using Content-Length.
#[derive(Default)]
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    /// A complete frame that did not parse; the bytes are consumed.
    Invalid(String),
    KeepaliveRequest,
    KeepaliveResponse,
}

fn content_length(headers: &str) -> Result<usize> {
    for line in headers.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|e| Error::Error(format!("invalid Content-Length: {}", e)));
        }
    }
    Ok(0)
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.starts_with(KEEPALIVE_REQUEST) {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }
        if src.starts_with(KEEPALIVE_RESPONSE) {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = std::str::from_utf8(&src[..headers_end + 4])
                .map_err(|e| Error::Error(format!("invalid UTF-8 in headers: {}", e)))?;
            let total_len = headers_end + 4 + content_length(headers)?;
            if total_len > MAX_SIP_MESSAGE_SIZE {
                return Err(Error::Error("SIP message too large".to_string()));
            }
            if src.len() >= total_len {
                let frame = src.split_to(total_len);
                return Ok(Some(match SipMessage::try_from(&frame[..]) {
                    Ok(msg) => SipCodecType::Message(msg),
                    Err(e) => SipCodecType::Invalid(e.to_string()),
                }));
            }
        }

        if src.len() > MAX_SIP_MESSAGE_SIZE {
            return Err(Error::Error("SIP message too large".to_string()));
        }
        Ok(None)
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

/// Shared plumbing of a byte-stream connection. The write half sits behind
/// an async mutex so concurrent senders queue whole messages.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.send_raw(msg.to_string().as_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        let written = async {
            lock.write_all(data).await?;
            lock.flush().await
        }
        .await;
        written.map_err(|e| Error::TransportFailure(e.to_string(), self.remote_addr.clone()))
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!(addr = %self.local_addr, "stream already being served");
                return Ok(());
            }
        };
        let remote_socket_addr = self.remote_addr.get_socketaddr()?;
        let transport = self
            .remote_addr
            .r#type
            .clone()
            .unwrap_or(rsip::transport::Transport::Tcp);
        let mut frames = FramedRead::new(read_half, SipCodec::new());

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(SipCodecType::Message(msg)) => {
                    let msg = match SipConnection::update_msg_received(
                        msg,
                        remote_socket_addr,
                        transport.clone(),
                    ) {
                        Ok(msg) => msg,
                        Err(e) => {
                            info!(remote = %self.remote_addr, "dropping message without usable Via: {}", e);
                            continue;
                        }
                    };
                    debug!(remote = %self.remote_addr, "received stream message");
                    sender.send(TransportEvent::Incoming(
                        msg,
                        connection.clone(),
                        self.remote_addr.clone(),
                    ))?;
                }
                Ok(SipCodecType::Invalid(reason)) => {
                    info!(remote = %self.remote_addr, "dropping malformed message: {}", reason);
                }
                Ok(SipCodecType::KeepaliveRequest) => {
                    self.send_raw(KEEPALIVE_RESPONSE).await?;
                }
                Ok(SipCodecType::KeepaliveResponse) => {}
                Err(e) => {
                    warn!(remote = %self.remote_addr, "stream framing error, closing: {}", e);
                    break;
                }
            }
        }
        info!(local = %self.local_addr, remote = %self.remote_addr, "stream closed");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half
            .shutdown()
            .await
            .map_err(|e| Error::Error(format!("failed to shutdown write half: {}", e)))
    }
}
