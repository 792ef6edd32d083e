use super::{next_change, next_request, next_status, peer_in_dialog, ANSWER};
use crate::{
    dialog::{
        dialog::{Dialog, DialogState, DialogStateReceiver, TerminatedReason},
        dialog_layer::DialogLayer,
        server_dialog::ServerInviteDialog,
    },
    transaction::{
        make_via_branch,
        tests::{create_channel_endpoint, peer_request, peer_response, test_option, TestEndpoint},
        Transaction,
    },
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Request, Response, StatusCode,
};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

struct IncomingCall {
    dialog: ServerInviteDialog,
    invite: Request,
    changes: DialogStateReceiver,
    incoming: UnboundedReceiver<Transaction>,
}

async fn receive_call(te: &mut TestEndpoint, layer: &DialogLayer, call_id: &str) -> Result<IncomingCall> {
    let mut incoming = te.endpoint.incoming_transactions()?;
    let invite = peer_request(Method::Invite, call_id, 1);
    te.inject(invite.clone());
    let mut tx = incoming.recv().await.expect("incoming INVITE");
    next_status(te, StatusCode::Trying).await;

    let (sender, changes) = unbounded_channel();
    let contact = rsip::Uri::try_from("sip:alice@127.0.0.1:5060")?;
    let dialog = layer
        .create_server_invite(&mut tx, sender, Some(contact))
        .await?;
    tokio::spawn(dialog.clone().handle_invite(tx));
    Ok(IncomingCall {
        dialog,
        invite,
        changes,
        incoming,
    })
}

fn ack_for(invite: &Request, ok: &Response) -> Result<Request> {
    Ok(peer_in_dialog(invite, ok.to_header()?, Method::Ack, 1))
}

async fn confirmed_call(te: &mut TestEndpoint, layer: &DialogLayer, call_id: &str) -> Result<(IncomingCall, Response)> {
    let mut call = receive_call(te, layer, call_id).await?;
    call.dialog.accept(None, Some(ANSWER.to_vec())).await?;
    let ok = next_status(te, StatusCode::OK).await;
    te.inject(ack_for(&call.invite, &ok)?);
    let change = next_change(&mut call.changes).await;
    assert_eq!(change.current, DialogState::Confirmed);
    // 200 retransmissions sent before the ACK landed
    te.drain_wire();
    Ok((call, ok))
}

async fn dispatch(layer: &DialogLayer, call: &mut IncomingCall) -> Result<()> {
    let tx = call.incoming.recv().await.expect("in-dialog request");
    match layer.match_dialog(&tx.original) {
        Some(dialog) => dialog.handle(tx).await,
        None => panic!("no dialog for {}", tx.original.method),
    }
}

#[tokio::test]
async fn test_accept_then_ack_confirms() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let mut call = receive_call(&mut te, &layer, "accept-call").await?;
    assert_eq!(call.dialog.state(), DialogState::Early);
    assert_eq!(layer.len(), 1);

    call.dialog.ringing().await?;
    let ringing = next_status(&mut te, StatusCode::Ringing).await;
    let local_tag = call.dialog.id().local_tag;
    assert_eq!(
        ringing.to_header()?.tag()?.map(|t| t.to_string()),
        Some(local_tag.clone())
    );

    call.dialog.accept(None, Some(ANSWER.to_vec())).await?;
    let ok = next_status(&mut te, StatusCode::OK).await;
    assert_eq!(ok.body, ANSWER);
    assert_eq!(ok.to_header()?.tag()?.map(|t| t.to_string()), Some(local_tag));
    assert_eq!(ok.contact_header()?.value(), "<sip:alice@127.0.0.1:5060>");
    assert!(ok
        .headers
        .iter()
        .any(|h| matches!(h, Header::ContentType(ct) if ct.value() == "application/sdp")));
    assert_eq!(call.dialog.state(), DialogState::Early);

    te.inject(ack_for(&call.invite, &ok)?);
    let change = next_change(&mut call.changes).await;
    assert_eq!(change.previous, DialogState::Early);
    assert_eq!(change.current, DialogState::Confirmed);
    Ok(())
}

#[tokio::test]
async fn test_reject() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let mut call = receive_call(&mut te, &layer, "reject-call").await?;

    assert!(matches!(
        call.dialog.reject(StatusCode::OK).await,
        Err(Error::DialogError(_, _))
    ));
    call.dialog.reject(StatusCode::BusyHere).await?;
    let busy = next_status(&mut te, StatusCode::BusyHere).await;
    assert!(busy.to_header()?.tag()?.is_some());
    let change = next_change(&mut call.changes).await;
    assert_eq!(
        change.current,
        DialogState::Terminated(TerminatedReason::LocalReject(StatusCode::BusyHere))
    );
    assert!(matches!(
        call.dialog.accept(None, None).await,
        Err(Error::AlreadyCompleted(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_caller_cancels() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let mut call = receive_call(&mut te, &layer, "cancel-call").await?;

    let mut cancel = call.invite.clone();
    cancel.method = Method::Cancel;
    cancel.headers.unique_push(Header::CSeq(
        rsip::typed::CSeq {
            seq: 1,
            method: Method::Cancel,
        }
        .into(),
    ));
    te.inject(cancel);

    let cancel_ok = next_status(&mut te, StatusCode::OK).await;
    assert_eq!(cancel_ok.cseq_header()?.typed()?.method, Method::Cancel);
    let terminated = next_status(&mut te, StatusCode::RequestTerminated).await;
    assert_eq!(terminated.cseq_header()?.typed()?.method, Method::Invite);

    let change = next_change(&mut call.changes).await;
    assert_eq!(
        change.current,
        DialogState::Terminated(TerminatedReason::RemoteCancel)
    );
    Ok(())
}

#[tokio::test]
async fn test_remote_bye() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let (mut call, ok) = confirmed_call(&mut te, &layer, "bye-call").await?;

    te.inject(peer_in_dialog(&call.invite, ok.to_header()?, Method::Bye, 2));
    dispatch(&layer, &mut call).await?;
    let resp = next_status(&mut te, StatusCode::OK).await;
    assert_eq!(resp.cseq_header()?.typed()?.method, Method::Bye);
    let change = next_change(&mut call.changes).await;
    assert_eq!(
        change.current,
        DialogState::Terminated(TerminatedReason::RemoteBye)
    );
    Ok(())
}

#[tokio::test]
async fn test_stale_cseq_refused() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let (mut call, ok) = confirmed_call(&mut te, &layer, "stale-call").await?;

    te.inject(peer_in_dialog(&call.invite, ok.to_header()?, Method::Info, 3));
    dispatch(&layer, &mut call).await?;
    next_status(&mut te, StatusCode::OK).await;

    te.inject(peer_in_dialog(&call.invite, ok.to_header()?, Method::Info, 2));
    assert!(matches!(
        dispatch(&layer, &mut call).await,
        Err(Error::ProtocolViolation(_))
    ));
    next_status(&mut te, StatusCode::ServerInternalError).await;
    assert_eq!(call.dialog.state(), DialogState::Confirmed);
    Ok(())
}

#[tokio::test]
async fn test_in_dialog_methods() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let (mut call, ok) = confirmed_call(&mut te, &layer, "methods-call").await?;

    te.inject(peer_in_dialog(&call.invite, ok.to_header()?, Method::Options, 2));
    dispatch(&layer, &mut call).await?;
    next_status(&mut te, StatusCode::OK).await;

    te.inject(peer_in_dialog(&call.invite, ok.to_header()?, Method::Message, 3));
    dispatch(&layer, &mut call).await?;
    next_status(&mut te, StatusCode::MethodNotAllowed).await;

    // re-INVITE is answered with the current answer and waits for its ACK
    te.inject(peer_in_dialog(&call.invite, ok.to_header()?, Method::Invite, 4));
    let tx = call.incoming.recv().await.expect("re-INVITE");
    let dialog = layer.match_dialog(&tx.original).expect("dialog");
    let handled = tokio::spawn(async move { dialog.handle(tx).await });
    let reinvite_ok = next_status(&mut te, StatusCode::OK).await;
    assert_eq!(reinvite_ok.body, ANSWER);
    assert_eq!(reinvite_ok.cseq_header()?.seq()?, 4);
    te.inject(peer_in_dialog(
        &call.invite,
        ok.to_header()?,
        Method::Ack,
        4,
    ));
    handled.await.expect("re-INVITE task")?;
    let change = next_change(&mut call.changes).await;
    assert_eq!(change.previous, DialogState::Confirmed);
    assert_eq!(change.current, DialogState::Confirmed);
    Ok(())
}

#[tokio::test]
async fn test_local_bye() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let (mut call, _ok) = confirmed_call(&mut te, &layer, "local-bye-call").await?;

    let dialog = Dialog::ServerInvite(call.dialog.clone());
    let hangup = tokio::spawn(async move { dialog.hangup().await });
    let bye = next_request(&mut te, Method::Bye).await;
    assert_eq!(bye.uri.to_string(), "sip:bob@127.0.0.1:5070");
    assert_eq!(bye.cseq_header()?.seq()?, 1);
    assert_eq!(
        bye.from_header()?.tag()?.map(|t| t.to_string()),
        Some(call.dialog.id().local_tag)
    );
    assert_eq!(
        bye.to_header()?.tag()?.map(|t| t.to_string()),
        call.invite.from_header()?.tag()?.map(|t| t.to_string())
    );

    te.inject(peer_response(&bye, StatusCode::OK));
    hangup.await.expect("hangup task")?;
    let change = next_change(&mut call.changes).await;
    assert_eq!(
        change.current,
        DialogState::Terminated(TerminatedReason::LocalBye)
    );
    Ok(())
}

#[tokio::test]
async fn test_merged_invite_refused() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(50), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let mut call = receive_call(&mut te, &layer, "merged-call").await?;

    let mut merged = call.invite.clone();
    let mut via = merged.via_header()?.typed()?;
    via.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
    via.params.push(make_via_branch());
    merged.headers.unique_push(Header::Via(via.into()));
    te.inject(merged);

    let mut tx = call.incoming.recv().await.expect("merged INVITE");
    let (sender, _changes) = unbounded_channel();
    let result = layer.create_server_invite(&mut tx, sender, None).await;
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    next_status(&mut te, StatusCode::LoopDetected).await;
    assert_eq!(layer.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_ack_hangs_up() -> Result<()> {
    let mut te = create_channel_endpoint(test_option(10), false).await?;
    let layer = DialogLayer::new(te.endpoint.inner.clone());
    let mut call = receive_call(&mut te, &layer, "no-ack-call").await?;
    call.dialog.accept(None, Some(ANSWER.to_vec())).await?;

    let change = tokio::time::timeout(Duration::from_secs(5), call.changes.recv())
        .await
        .expect("dialog should end")
        .expect("state channel open");
    assert_eq!(
        change.current,
        DialogState::Terminated(TerminatedReason::Timeout)
    );
    let byes = te
        .drain_wire()
        .into_iter()
        .filter(|m| matches!(m, rsip::SipMessage::Request(r) if r.method == Method::Bye))
        .count();
    assert!(byes >= 1);
    Ok(())
}
