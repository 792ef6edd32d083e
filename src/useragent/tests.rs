use super::{Profile, UserAgent, UserAgentBuilder, UserAgentEvent, UserAgentEventReceiver};
use crate::{
    dialog::{
        dialog::{DialogState, TerminatedReason},
        tests::{next_request, next_status, peer_in_dialog, with_body, ANSWER, OFFER},
        DialogId,
    },
    rsip_ext::HeaderList,
    transaction::tests::{peer_request, peer_response, test_option, TestEndpoint},
    transport::{channel::ChannelConnection, SipAddr, SipConnection, TransportLayer},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    transport::Transport,
    Header, Method, Request, Response, StatusCode,
};
use std::{net::SocketAddr, time::Duration};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

async fn create_agent() -> Result<(TestEndpoint, UserAgent, UserAgentEventReceiver)> {
    let cancel_token = CancellationToken::new();
    let transport_layer = TransportLayer::new(cancel_token.child_token());
    let (inject, incoming) = unbounded_channel();
    let (outgoing, wire) = unbounded_channel();
    let local_addr: SocketAddr = "127.0.0.1:5060".parse()?;
    let peer_addr: SocketAddr = "127.0.0.1:5070".parse()?;
    let local = SipAddr::new(Transport::Udp, local_addr.into());
    let peer = SipAddr::new(Transport::Udp, peer_addr.into());
    let connection: SipConnection =
        ChannelConnection::create_connection(incoming, outgoing, local, false)
            .await?
            .into();
    transport_layer.add_transport(connection.clone());

    let ua = UserAgentBuilder::new()
        .with_user_agent("rsipua-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(cancel_token.clone())
        .with_option(test_option(20))
        .with_shutdown_grace(Duration::from_secs(1))
        .build();
    let events = ua.take_event_receiver().expect("event receiver");
    let serving = ua.clone();
    tokio::spawn(async move { serving.serve().await });
    tokio::task::yield_now().await;

    let te = TestEndpoint {
        endpoint: ua.endpoint().clone(),
        inject,
        wire,
        connection,
        peer,
        cancel_token,
    };
    Ok((te, ua, events))
}

async fn next_event(events: &mut UserAgentEventReceiver) -> UserAgentEvent {
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(event)) => event,
        other => panic!("expected a user agent event, got {:?}", other),
    }
}

async fn next_state(events: &mut UserAgentEventReceiver) -> (DialogId, DialogState) {
    loop {
        if let UserAgentEvent::StateChanged(change) = next_event(events).await {
            return (change.id, change.current);
        }
    }
}

fn alice() -> Profile {
    Profile::new("alice@127.0.0.1", Some("Alice"), None, 1800).expect("profile")
}

/// An inbound call answered and ACKed; returns the INVITE and our 200.
async fn confirmed_incoming(
    te: &mut TestEndpoint,
    ua: &UserAgent,
    events: &mut UserAgentEventReceiver,
    call_id: &str,
) -> Result<(DialogId, Request, Response)> {
    let invite = peer_request(Method::Invite, call_id, 1);
    te.inject(invite.clone());
    let id = match next_event(events).await {
        UserAgentEvent::IncomingCall { id, invite: seen } => {
            assert_eq!(seen.call_id_header()?.value(), call_id);
            id
        }
        other => panic!("expected an incoming call, got {:?}", other),
    };
    ua.accept(&id, Some(ANSWER.to_vec())).await?;
    let ok = next_status(te, StatusCode::OK).await;
    te.inject(peer_in_dialog(&invite, ok.to_header()?, Method::Ack, 1));
    assert_eq!(next_state(events).await, (id.clone(), DialogState::Confirmed));
    te.drain_wire();
    Ok((id, invite, ok))
}

#[tokio::test]
async fn test_invalid_targets_send_nothing() -> Result<()> {
    let (mut te, ua, _events) = create_agent().await?;
    for target in ["not a uri", "tel:+15551234567", "http://example.com/bob"] {
        let r = ua.invite(&alice(), target, None, HeaderList::new()).await;
        assert!(
            matches!(r, Err(Error::InvalidTarget(_))),
            "{} gave {:?}",
            target,
            r
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(te.drain_wire().is_empty());
    assert!(ua.dialog_layer().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invite_merges_custom_headers() -> Result<()> {
    let (mut te, ua, mut events) = create_agent().await?;
    let headers = HeaderList::new()
        .with("X-Branded-CallReason", "Whatever reason")
        .with("Call-ID", "hijacked")
        .with("max-forwards", "1")
        .with("Content-Type", "text/plain")
        .with("Session-Expires", "90");
    let id = ua
        .invite(
            &alice(),
            "sip:bob@127.0.0.1:5070;transport=udp",
            Some(OFFER.to_vec()),
            headers,
        )
        .await?;

    let invite = next_request(&mut te, Method::Invite).await;
    assert_eq!(invite.call_id_header()?.value(), id.call_id);
    assert_ne!(id.call_id, "hijacked");
    assert_eq!(invite.max_forwards_header()?.value(), "70");
    assert!(invite.headers.iter().any(|h| matches!(
        h,
        Header::Other(name, value) if name == "X-Branded-CallReason" && value == "Whatever reason"
    )));
    let text = invite.to_string();
    let lines = |prefix: &str| {
        text.lines()
            .filter(|line| line.to_ascii_lowercase().starts_with(prefix))
            .count()
    };
    assert_eq!(lines("content-type:"), 1);
    assert_eq!(lines("session-expires:"), 1);
    assert!(text.contains("Session-Expires: 1800"));
    assert!(text.contains("Content-Type: application/sdp"));
    assert_eq!(
        invite.contact_header()?.value(),
        "<sip:alice@127.0.0.1:5060>"
    );
    assert!(invite.from_header()?.value().contains("Alice"));
    assert_eq!(invite.body, OFFER);

    te.inject(with_body(peer_response(&invite, StatusCode::OK), ANSWER));
    let (confirmed, state) = next_state(&mut events).await;
    assert_eq!(state, DialogState::Confirmed);
    assert_eq!(confirmed.remote_tag, "peer-tag");
    next_request(&mut te, Method::Ack).await;
    Ok(())
}

#[tokio::test]
async fn test_out_of_dialog_requests() -> Result<()> {
    let (mut te, _ua, _events) = create_agent().await?;

    te.inject(peer_request(Method::Options, "options-call", 1));
    next_status(&mut te, StatusCode::OK).await;

    te.inject(peer_request(Method::Message, "message-call", 1));
    next_status(&mut te, StatusCode::MethodNotAllowed).await;

    let stray = peer_request(Method::Bye, "stray-call", 2);
    let to = peer_response(&stray, StatusCode::OK).to_header()?.clone();
    te.inject(peer_in_dialog(&stray, &to, Method::Bye, 2));
    next_status(&mut te, StatusCode::CallTransactionDoesNotExist).await;
    Ok(())
}

#[tokio::test]
async fn test_incoming_call_then_remote_bye() -> Result<()> {
    let (mut te, ua, mut events) = create_agent().await?;
    let invite = peer_request(Method::Invite, "incoming-call", 1);
    te.inject(invite.clone());
    let id = match next_event(&mut events).await {
        UserAgentEvent::IncomingCall { id, .. } => id,
        other => panic!("expected an incoming call, got {:?}", other),
    };
    assert_eq!(id.call_id, "incoming-call");

    ua.ringing(&id).await?;
    next_status(&mut te, StatusCode::Ringing).await;
    assert!(matches!(
        ua.cancel(&id).await,
        Err(Error::DialogError(_, _))
    ));
    ua.accept(&id, Some(ANSWER.to_vec())).await?;
    let ok = next_status(&mut te, StatusCode::OK).await;
    assert_eq!(ok.body, ANSWER);
    te.inject(peer_in_dialog(&invite, ok.to_header()?, Method::Ack, 1));
    assert_eq!(next_state(&mut events).await, (id.clone(), DialogState::Confirmed));

    te.inject(peer_in_dialog(&invite, ok.to_header()?, Method::Bye, 2));
    next_status(&mut te, StatusCode::OK).await;
    assert_eq!(
        next_state(&mut events).await,
        (id.clone(), DialogState::Terminated(TerminatedReason::RemoteBye))
    );
    assert!(ua.dialog_layer().is_empty());
    assert!(matches!(
        ua.hangup(&id).await,
        Err(Error::AlreadyCompleted(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_hangs_up_calls() -> Result<()> {
    let (mut te, ua, mut events) = create_agent().await?;
    let (id, _invite, _ok) = confirmed_incoming(&mut te, &ua, &mut events, "shutdown-call").await?;

    let closing = ua.clone();
    let shutdown = tokio::spawn(async move { closing.shutdown().await });
    let bye = next_request(&mut te, Method::Bye).await;
    assert_eq!(bye.call_id_header()?.value(), "shutdown-call");
    te.inject(peer_response(&bye, StatusCode::OK));
    shutdown.await.expect("shutdown task");

    assert_eq!(
        next_state(&mut events).await,
        (id, DialogState::Terminated(TerminatedReason::LocalBye))
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_right_after_invite() -> Result<()> {
    let (mut te, ua, mut events) = create_agent().await?;
    let id = ua
        .invite(
            &alice(),
            "sip:bob@127.0.0.1:5070;transport=udp",
            Some(OFFER.to_vec()),
            HeaderList::new(),
        )
        .await?;
    ua.cancel(&id).await?;

    let invite = next_request(&mut te, Method::Invite).await;
    te.inject(peer_response(&invite, StatusCode::Ringing));
    let cancel = next_request(&mut te, Method::Cancel).await;
    te.inject(peer_response(&cancel, StatusCode::OK));
    te.inject(peer_response(&invite, StatusCode::RequestTerminated));

    let (ringing, state) = next_state(&mut events).await;
    assert_eq!(state, DialogState::Early);
    assert_eq!(ringing.remote_tag, "peer-tag");
    assert_eq!(
        next_state(&mut events).await,
        (ringing, DialogState::Terminated(TerminatedReason::LocalCancel))
    );
    assert!(matches!(
        ua.cancel(&id).await,
        Err(Error::AlreadyCompleted(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancel_after_rejection() -> Result<()> {
    let (mut te, ua, mut events) = create_agent().await?;
    let id = ua
        .invite(
            &alice(),
            "sip:bob@127.0.0.1:5070;transport=udp",
            None,
            HeaderList::new(),
        )
        .await?;
    let invite = next_request(&mut te, Method::Invite).await;
    te.inject(peer_response(&invite, StatusCode::BusyHere));
    assert_eq!(
        next_state(&mut events).await,
        (
            id.clone(),
            DialogState::Terminated(TerminatedReason::Rejected(StatusCode::BusyHere))
        )
    );
    assert!(matches!(
        ua.cancel(&id).await,
        Err(Error::AlreadyCompleted(_))
    ));

    let mut unknown = id;
    unknown.call_id = "never-placed".to_string();
    assert!(matches!(
        ua.cancel(&unknown).await,
        Err(Error::DialogError(_, _))
    ));
    Ok(())
}
