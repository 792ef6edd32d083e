use super::{
    dialog::{DialogStateChange, DialogStateReceiver},
    invitation::InviteOption,
};
use crate::transaction::{
    make_via_branch,
    tests::TestEndpoint,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Header, Request, SipMessage,
};
use std::time::Duration;

mod test_server_dialog;

pub(crate) const OFFER: &[u8] = b"v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\n";
pub(crate) const ANSWER: &[u8] = b"v=0\r\no=bob 1 1 IN IP4 127.0.0.1\r\n";

pub(crate) fn invite_option() -> InviteOption {
    InviteOption {
        caller: rsip::Uri::try_from("sip:alice@127.0.0.1:5060").expect("caller"),
        callee: rsip::Uri::try_from("sip:bob@127.0.0.1:5070").expect("callee"),
        contact: rsip::Uri::try_from("sip:alice@127.0.0.1:5060").expect("contact"),
        offer: Some(OFFER.to_vec()),
        ..Default::default()
    }
}

pub(crate) async fn next_change(changes: &mut DialogStateReceiver) -> DialogStateChange {
    match tokio::time::timeout(Duration::from_secs(5), changes.recv()).await {
        Ok(Some(change)) => change,
        other => panic!("expected a dialog state change, got {:?}", other),
    }
}

/// Skips whatever else is on the wire until a request with `method`.
pub(crate) async fn next_request(te: &mut TestEndpoint, method: rsip::Method) -> Request {
    loop {
        if let SipMessage::Request(req) = te.next_wire().await {
            if req.method == method {
                return req;
            }
        }
    }
}

pub(crate) async fn next_status(te: &mut TestEndpoint, status: rsip::StatusCode) -> rsip::Response {
    loop {
        if let SipMessage::Response(resp) = te.next_wire().await {
            if resp.status_code == status {
                return resp;
            }
        }
    }
}

/// A request from the peer inside the dialog `invite` set up, with `to`
/// naming both tags.
pub(crate) fn peer_in_dialog(
    invite: &Request,
    to: &rsip::headers::To,
    method: rsip::Method,
    cseq: u32,
) -> Request {
    let mut req = invite.clone();
    req.method = method;
    let mut via = req.via_header().and_then(|v| v.typed()).expect("via");
    via.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
    via.params.push(make_via_branch());
    req.headers.unique_push(Header::Via(via.into()));
    req.headers.unique_push(Header::To(to.clone()));
    req.headers
        .unique_push(Header::CSeq(rsip::typed::CSeq { seq: cseq, method }.into()));
    req
}

pub(crate) fn with_body(mut resp: rsip::Response, body: &[u8]) -> rsip::Response {
    resp.headers
        .unique_push(Header::ContentType("application/sdp".into()));
    resp.headers
        .unique_push(Header::ContentLength((body.len() as u32).into()));
    resp.body = body.to_vec();
    resp
}
