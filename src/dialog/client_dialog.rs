use super::{
    authenticate::handle_client_authenticate,
    dialog::{DialogInnerRef, DialogState, TerminatedReason},
    dialog_layer::DialogLayerInnerRef,
    DialogId,
};
use crate::{
    rsip_ext::RsipResponseExt,
    transaction::{Transaction, TransactionOutcome},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Header, Method, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

/// Our side of a call we placed.
///
/// Created Early by [`DialogLayer::create_client_invite`]; the INVITE is run
/// by [`process_invite`](Self::process_invite). Each distinct To tag in the
/// answers gets its own early dialog; the first 2xx picks the survivor.
///
/// [`DialogLayer::create_client_invite`]: super::dialog_layer::DialogLayer::create_client_invite
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub(super) inner: DialogInnerRef,
    pub(super) layer: DialogLayerInnerRef,
    pub(super) cancel_requested: Arc<AtomicBool>,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state()
    }

    /// CANCELs the INVITE. Valid while no final response has arrived; the
    /// dialog ends when the 487 does. Before the INVITE is out the CANCEL
    /// is queued and sent right behind it.
    pub async fn cancel(&self) -> Result<()> {
        let key = {
            let invite_key = self.inner.invite_key.lock();
            match invite_key.clone() {
                Some(key) => key,
                None => {
                    self.cancel_requested.store(true, Ordering::Release);
                    info!(id = %self.id(), "INVITE not sent yet, CANCEL queued");
                    return Ok(());
                }
            }
        };
        if !self.inner.can_cancel() {
            return Err(Error::AlreadyCompleted(key));
        }
        self.cancel_requested.store(true, Ordering::Release);
        info!(id = %self.id(), "cancelling INVITE");
        self.inner.endpoint_inner.cancel_transaction(&key).await
    }

    pub async fn bye(&self) -> Result<()> {
        self.inner.bye().await
    }

    /// CANCEL while early, BYE once confirmed.
    pub async fn hangup(&self) -> Result<()> {
        if self.inner.can_cancel() {
            match self.cancel().await {
                Err(Error::AlreadyCompleted(_)) => {}
                other => return other,
            }
        }
        self.inner.bye().await
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

    pub async fn options(&self, headers: Option<Vec<Header>>) -> Result<Option<Response>> {
        self.inner.request(Method::Options, headers, None).await
    }

    pub async fn update(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<Response>> {
        self.inner.request(Method::Update, headers, body).await
    }

    /// Sends the INVITE and follows it to a final response. Returns once the
    /// call is confirmed; 2xx retransmissions and late forks are handled in
    /// the background until the transaction ends.
    pub async fn process_invite(&self, mut tx: Transaction) -> Result<()> {
        let mut forks: HashMap<String, ClientInviteDialog> = HashMap::new();
        if let Err(e) = tx.send().await {
            info!(id = %self.id(), "INVITE not sent: {}", e);
            self.terminate_all(&forks, TerminatedReason::TransportFailure, None)?;
            return Err(e);
        }
        *self.inner.initial_request.lock() = tx.original.clone();
        let cancel_queued = {
            let mut invite_key = self.inner.invite_key.lock();
            *invite_key = Some(tx.key.clone());
            self.cancel_requested.load(Ordering::Acquire)
        };
        if cancel_queued {
            info!(id = %self.id(), "sending queued CANCEL");
            if let Err(e) = self.inner.endpoint_inner.cancel_transaction(&tx.key).await {
                warn!(id = %self.id(), "queued CANCEL not sent: {}", e);
            }
        }

        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            let remote_tag = resp.to_header()?.tag()?.map(|t| t.value().to_string());

            match resp.status_code.kind() {
                StatusCodeKind::Provisional => {
                    if let Some(tag) = remote_tag {
                        let (dialog, created) = self.early_dialog(&mut forks, &tag);
                        if created {
                            dialog
                                .inner
                                .transition(DialogState::Early, Some(resp.into()))?;
                        }
                    }
                }
                StatusCodeKind::Successful => {
                    let Some(tag) = remote_tag else {
                        warn!(id = %self.id(), "2xx without To tag ignored");
                        continue;
                    };
                    let (winner, _) = self.early_dialog(&mut forks, &tag);
                    // ended on our side before the answer came in
                    let abandoned = winner.inner.is_terminated();
                    winner.confirm(&resp).await?;
                    for (_, fork) in forks.iter().filter(|(t, _)| **t != tag) {
                        fork.inner.transition(
                            DialogState::Terminated(TerminatedReason::ForkNotSelected),
                            None,
                        )?;
                    }
                    if abandoned || self.cancel_requested.load(Ordering::Acquire) {
                        info!(id = %winner.id(), "answered after hangup, sending BYE");
                        winner.inner.send_bye(TerminatedReason::LocalBye).await?;
                    }
                    tokio::spawn(winner.absorb_retransmissions(tx, tag));
                    return Ok(());
                }
                _ => {
                    let challenged = matches!(
                        resp.status_code,
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                    );
                    if let (true, false, Some(cred)) =
                        (challenged, auth_sent, self.inner.credential.as_ref())
                    {
                        auth_sent = true;
                        let new_seq = self.inner.increment_local_seq();
                        tx = handle_client_authenticate(new_seq, &tx, &resp, cred)?;
                        if let Err(e) = tx.send().await {
                            info!(id = %self.id(), "authenticated INVITE not sent: {}", e);
                            self.terminate_all(&forks, TerminatedReason::TransportFailure, None)?;
                            return Err(e);
                        }
                        *self.inner.invite_key.lock() = Some(tx.key.clone());
                        *self.inner.initial_request.lock() = tx.original.clone();
                        continue;
                    }

                    let reason = if self.cancel_requested.load(Ordering::Acquire) {
                        TerminatedReason::LocalCancel
                    } else {
                        TerminatedReason::Rejected(resp.status_code.clone())
                    };
                    info!(id = %self.id(), status = %resp.status_code, "call not answered");
                    let status = resp.status_code.clone();
                    self.terminate_all(&forks, reason, Some(resp.into()))?;
                    return Err(Error::CallRejected(status));
                }
            }
        }

        match tx.outcome() {
            Some(TransactionOutcome::TransportFailure) => {
                self.terminate_all(&forks, TerminatedReason::TransportFailure, None)?;
                Err(Error::TransportFailure(
                    "INVITE not delivered".to_string(),
                    tx.destination.clone().unwrap_or_default(),
                ))
            }
            _ => {
                self.terminate_all(&forks, TerminatedReason::Timeout, None)?;
                Err(Error::Timeout(tx.key.clone()))
            }
        }
    }

    /// The early dialog for `tag`: binds ours on the first tag seen, then
    /// opens a fork per new tag. The flag is set when `tag` is new.
    fn early_dialog(
        &self,
        forks: &mut HashMap<String, ClientInviteDialog>,
        tag: &str,
    ) -> (ClientInviteDialog, bool) {
        if let Some(dialog) = forks.get(tag) {
            return (dialog.clone(), false);
        }
        let dialog = if self.id().remote_tag.is_empty() {
            let early_id = self.id();
            self.inner.update_remote_tag(tag);
            self.layer.rekey(&early_id, &self.id());
            self.clone()
        } else {
            let fork = ClientInviteDialog {
                inner: Arc::new(self.inner.fork(tag)),
                layer: self.layer.clone(),
                cancel_requested: self.cancel_requested.clone(),
            };
            info!(id = %fork.id(), "forked early dialog");
            self.layer
                .insert(super::dialog::Dialog::ClientInvite(fork.clone()));
            fork
        };
        forks.insert(tag.to_string(), dialog.clone());
        (dialog, true)
    }

    async fn confirm(&self, resp: &Response) -> Result<()> {
        match resp.remote_uri() {
            Ok(uri) => self.inner.set_remote_target(uri),
            Err(e) => warn!(id = %self.id(), "no usable Contact in 2xx: {}", e),
        }
        self.inner.update_route_set(resp);
        if let Err(e) = self.inner.send_ack(resp).await {
            warn!(id = %self.id(), "failed to ACK 2xx: {}", e);
        }
        self.inner
            .transition(DialogState::Confirmed, Some(resp.clone().into()))
    }

    fn terminate_all(
        &self,
        forks: &HashMap<String, ClientInviteDialog>,
        reason: TerminatedReason,
        message: Option<SipMessage>,
    ) -> Result<()> {
        for fork in forks.values() {
            if !Arc::ptr_eq(&fork.inner, &self.inner) {
                fork.inner
                    .transition(DialogState::Terminated(reason.clone()), message.clone())?;
            }
        }
        self.inner
            .transition(DialogState::Terminated(reason), message)
    }

    /// Re-ACKs the winning 2xx and hangs up on late answers from other
    /// forks, until the INVITE transaction is gone.
    async fn absorb_retransmissions(self, mut tx: Transaction, tag: String) {
        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            if resp.status_code.kind() != StatusCodeKind::Successful {
                continue;
            }
            let remote_tag = match resp.to_header().and_then(|h| h.tag()) {
                Ok(Some(t)) => t.value().to_string(),
                _ => continue,
            };
            if remote_tag == tag {
                debug!(id = %self.id(), "2xx retransmission, ACK again");
                self.inner.send_ack(&resp).await.ok();
                continue;
            }

            info!(id = %self.id(), %remote_tag, "late 2xx from another fork, hanging up");
            let late = ClientInviteDialog {
                inner: Arc::new(self.inner.fork(&remote_tag)),
                layer: self.layer.clone(),
                cancel_requested: self.cancel_requested.clone(),
            };
            if let Ok(uri) = resp.remote_uri() {
                late.inner.set_remote_target(uri);
            }
            late.inner.update_route_set(&resp);
            if let Err(e) = late.inner.send_ack(&resp).await {
                warn!(id = %late.id(), "failed to ACK late 2xx: {}", e);
                continue;
            }
            self.layer
                .insert(super::dialog::Dialog::ClientInvite(late.clone()));
            late.inner
                .transition(DialogState::Confirmed, Some(resp.into()))
                .ok();
            late.inner.send_bye(TerminatedReason::LocalBye).await.ok();
        }
    }
}
