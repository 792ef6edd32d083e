use super::{
    dialog::{DialogInnerRef, DialogState, TerminatedReason},
    DialogId,
};
use crate::{
    transaction::{Transaction, TransactionOutcome},
    Error, Result,
};
use rsip::{Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use tracing::{debug, info};

/// Our side of a call we received. Answer it with [`accept`], [`reject`] or
/// [`ringing`]; [`handle_invite`] must be running to see the ACK or a CANCEL.
///
/// [`accept`]: Self::accept
/// [`reject`]: Self::reject
/// [`ringing`]: Self::ringing
/// [`handle_invite`]: Self::handle_invite
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state()
    }

    pub fn initial_request(&self) -> Request {
        self.inner.initial_request.lock().clone()
    }

    async fn respond_invite(
        &self,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let key = self.inner.invite_key.lock().clone().ok_or_else(|| {
            Error::DialogError("no INVITE to answer".to_string(), self.id())
        })?;
        let request = self.initial_request();
        let resp = self.inner.make_response(&request, status, headers, body);
        self.inner.endpoint_inner.respond(&key, resp).await
    }

    pub async fn ringing(&self) -> Result<()> {
        self.respond_invite(StatusCode::Ringing, None, None).await
    }

    /// Answers 200 with `body` as the answer. The dialog is confirmed by the
    /// ACK; the server transaction retransmits the 200 until it arrives.
    pub async fn accept(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        let mut headers = headers.unwrap_or_default();
        if body.is_some() && !headers.iter().any(|h| matches!(h, Header::ContentType(_))) {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        self.respond_invite(StatusCode::OK, Some(headers), body.clone())
            .await?;
        info!(id = %self.id(), "call accepted");
        *self.inner.local_body.lock() = body;
        Ok(())
    }

    pub async fn reject(&self, status: StatusCode) -> Result<()> {
        if status.kind() == StatusCodeKind::Provisional
            || status.kind() == StatusCodeKind::Successful
        {
            return Err(Error::DialogError(
                format!("{} does not reject a call", status),
                self.id(),
            ));
        }
        self.respond_invite(status.clone(), None, None).await?;
        info!(id = %self.id(), %status, "call rejected");
        self.inner
            .transition(DialogState::Terminated(TerminatedReason::LocalReject(status)), None)
    }

    pub async fn bye(&self) -> Result<()> {
        self.inner.bye().await
    }

    /// BYE once confirmed, 603 while unanswered. A call answered but not
    /// yet ACKed is ended with BYE.
    pub async fn hangup(&self) -> Result<()> {
        match self.state() {
            DialogState::Confirmed => self.inner.bye().await,
            DialogState::Early => match self.reject(StatusCode::Decline).await {
                Err(Error::AlreadyCompleted(_)) => {
                    self.inner.send_bye(TerminatedReason::LocalBye).await
                }
                other => other,
            },
            DialogState::Terminated(_) => Ok(()),
        }
    }

    pub async fn reinvite(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<Response>> {
        self.inner.reinvite(headers, body).await
    }

    pub async fn info(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<Response>> {
        self.inner.request(Method::Info, headers, body).await
    }

    /// Follows the INVITE server transaction: ACK confirms the dialog, a
    /// CANCEL before any final response ends it with 487.
    pub async fn handle_invite(self, mut tx: Transaction) {
        while let Some(msg) = tx.receive().await {
            let SipMessage::Request(req) = msg else {
                continue;
            };
            match req.method {
                Method::Ack => {
                    debug!(id = %self.id(), "ACK received");
                    self.inner
                        .transition(DialogState::Confirmed, Some(req.into()))
                        .ok();
                }
                Method::Cancel => {
                    let request = self.initial_request();
                    let resp = self.inner.make_response(
                        &request,
                        StatusCode::RequestTerminated,
                        None,
                        None,
                    );
                    match tx.respond(resp).await {
                        Ok(()) => {
                            info!(id = %self.id(), "call cancelled by caller");
                            self.inner
                                .transition(
                                    DialogState::Terminated(TerminatedReason::RemoteCancel),
                                    Some(req.into()),
                                )
                                .ok();
                        }
                        Err(e) => debug!(id = %self.id(), "CANCEL after final response: {}", e),
                    }
                }
                _ => {}
            }
        }

        if self.inner.is_terminated() {
            return;
        }
        match tx.outcome() {
            Some(TransactionOutcome::Timeout) => {
                info!(id = %self.id(), "no ACK for 2xx, hanging up");
                self.inner
                    .send_bye(TerminatedReason::Timeout)
                    .await
                    .ok();
            }
            Some(TransactionOutcome::TransportFailure) => {
                self.inner
                    .transition(
                        DialogState::Terminated(TerminatedReason::TransportFailure),
                        None,
                    )
                    .ok();
            }
            _ => {}
        }
    }
}
