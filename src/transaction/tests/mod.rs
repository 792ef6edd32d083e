use super::{endpoint::Endpoint, make_tag, make_via_branch, EndpointBuilder, EndpointOption};
use crate::{
    transport::{channel::ChannelConnection, SipAddr, SipConnection, TransportEvent, TransportLayer},
    Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Header, Request, Response, SipMessage, StatusCode,
};
use std::{net::SocketAddr, time::Duration};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

mod test_fsm;

/// An endpoint wired to an in-memory connection. Whatever the endpoint
/// sends shows up on `wire`; `inject` feeds it messages from the peer.
pub(crate) struct TestEndpoint {
    pub endpoint: Endpoint,
    pub inject: UnboundedSender<TransportEvent>,
    pub wire: UnboundedReceiver<TransportEvent>,
    pub connection: SipConnection,
    pub peer: SipAddr,
    pub cancel_token: CancellationToken,
}

impl TestEndpoint {
    pub fn inject(&self, msg: impl Into<SipMessage>) {
        self.inject
            .send(TransportEvent::Incoming(
                msg.into(),
                self.connection.clone(),
                self.peer.clone(),
            ))
            .expect("inject");
    }

    pub async fn next_wire(&mut self) -> SipMessage {
        match tokio::time::timeout(Duration::from_secs(2), self.wire.recv()).await {
            Ok(Some(TransportEvent::Incoming(msg, _, _))) => msg,
            other => panic!("expected a message on the wire, got {:?}", other),
        }
    }

    pub fn drain_wire(&mut self) -> Vec<SipMessage> {
        let mut messages = vec![];
        while let Ok(event) = self.wire.try_recv() {
            if let TransportEvent::Incoming(msg, _, _) = event {
                messages.push(msg);
            }
        }
        messages
    }
}

impl Drop for TestEndpoint {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

pub(crate) fn test_option(t1_ms: u64) -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(t1_ms),
        t2: Duration::from_millis(t1_ms * 8),
        t4: Duration::from_millis(t1_ms * 10),
        timer_interval: Duration::from_millis(2),
        callid_suffix: Some("test.local".to_string()),
    }
}

pub(crate) async fn create_channel_endpoint(
    option: EndpointOption,
    reliable: bool,
) -> Result<TestEndpoint> {
    let cancel_token = CancellationToken::new();
    let transport_layer = TransportLayer::new(cancel_token.child_token());
    let (inject, incoming) = unbounded_channel();
    let (outgoing, wire) = unbounded_channel();
    let transport = match reliable {
        true => rsip::transport::Transport::Tcp,
        false => rsip::transport::Transport::Udp,
    };
    let local_addr: SocketAddr = "127.0.0.1:5060".parse()?;
    let peer_addr: SocketAddr = "127.0.0.1:5070".parse()?;
    let local = SipAddr::new(transport.clone(), local_addr.into());
    let peer = SipAddr::new(transport, peer_addr.into());
    let connection: SipConnection =
        ChannelConnection::create_connection(incoming, outgoing, local, reliable)
            .await?
            .into();
    transport_layer.add_transport(connection.clone());

    let endpoint = EndpointBuilder::new()
        .with_user_agent("rsipua-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(cancel_token.clone())
        .with_option(option)
        .build();
    let serving = endpoint.clone();
    tokio::spawn(async move { serving.serve().await });
    tokio::task::yield_now().await;

    Ok(TestEndpoint {
        endpoint,
        inject,
        wire,
        connection,
        peer,
        cancel_token,
    })
}

/// A request as the peer at 127.0.0.1:5070 would send it.
pub(crate) fn peer_request(method: rsip::Method, call_id: &str, cseq: u32) -> Request {
    let text = format!(
        "{method} sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5070;{branch}\r\n\
         From: <sip:bob@127.0.0.1:5070>;tag={tag}\r\n\
         To: <sip:alice@127.0.0.1:5060>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Contact: <sip:bob@127.0.0.1:5070>\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        branch = make_via_branch(),
        tag = make_tag(),
    );
    match SipMessage::try_from(text.as_str()) {
        Ok(SipMessage::Request(req)) => req,
        other => panic!("bad test request: {:?}", other),
    }
}

/// A request as the endpoint would send it to the peer.
pub(crate) fn local_request(method: rsip::Method) -> Request {
    let text = format!(
        "{method} sip:bob@127.0.0.1:5070 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;{branch}\r\n\
         From: <sip:alice@127.0.0.1:5060>;tag={tag}\r\n\
         To: <sip:bob@127.0.0.1:5070>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 {method}\r\n\
         Contact: <sip:alice@127.0.0.1:5060>\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        branch = make_via_branch(),
        tag = make_tag(),
        call_id = super::random_text(16),
    );
    match SipMessage::try_from(text.as_str()) {
        Ok(SipMessage::Request(req)) => req,
        other => panic!("bad test request: {:?}", other),
    }
}

/// The peer's answer to `req`, with a To tag for anything above 100.
pub(crate) fn peer_response(req: &Request, status_code: StatusCode) -> Response {
    peer_response_tagged(req, status_code, "peer-tag")
}

pub(crate) fn peer_response_tagged(req: &Request, status_code: StatusCode, tag: &str) -> Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
        )
    });
    if status_code != StatusCode::Trying {
        if let Ok(to) = req.to_header() {
            if let Ok(to) = to.typed() {
                if to.params.iter().all(|p| !matches!(p, rsip::Param::Tag(_))) {
                    headers.unique_push(Header::To(to.with_tag(rsip::param::Tag::new(tag)).into()));
                }
            }
        }
        headers.push(Header::Contact("<sip:bob@127.0.0.1:5070>".into()));
    }
    headers.push(Header::ContentLength(0.into()));
    Response {
        status_code,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    }
}

pub(crate) fn as_request(msg: SipMessage) -> Request {
    match msg {
        SipMessage::Request(req) => req,
        other => panic!("expected request, got {}", other),
    }
}

pub(crate) fn as_response(msg: SipMessage) -> Response {
    match msg {
        SipMessage::Response(resp) => resp,
        other => panic!("expected response, got {}", other),
    }
}
