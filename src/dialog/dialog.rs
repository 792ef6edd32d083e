use super::{
    authenticate::{handle_client_authenticate, Credential},
    client_dialog::ClientInviteDialog,
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    rsip_ext::extract_uri_from_contact,
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        Transaction, TransactionOutcome,
    },
    Error, Result,
};
use parking_lot::Mutex;
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::CSeq,
    Header, Method, Param, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Where an INVITE dialog stands. A dialog starts Early, may become
/// Confirmed once, and never leaves Terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated(TerminatedReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    /// No response, or no ACK, within 64*T1.
    Timeout,
    TransportFailure,
    /// We cancelled our own INVITE.
    LocalCancel,
    /// The caller cancelled the INVITE we were answering.
    RemoteCancel,
    LocalBye,
    RemoteBye,
    /// Our INVITE got this final response.
    Rejected(StatusCode),
    /// We answered the INVITE with this final response.
    LocalReject(StatusCode),
    /// Another fork answered first.
    ForkNotSelected,
    Shutdown,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Early => write!(f, "Early"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::Terminated(reason) => write!(f, "Terminated({:?})", reason),
        }
    }
}

impl DialogState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_))
    }
}

/// One transition, with the message that caused it when there is one.
#[derive(Debug, Clone)]
pub struct DialogStateChange {
    pub id: DialogId,
    pub previous: DialogState,
    pub current: DialogState,
    pub message: Option<SipMessage>,
}

pub type DialogStateReceiver = UnboundedReceiver<DialogStateChange>;
pub type DialogStateSender = UnboundedSender<DialogStateChange>;

#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        self.inner().id()
    }

    pub fn state(&self) -> DialogState {
        self.inner().state()
    }

    pub(super) fn inner(&self) -> &DialogInnerRef {
        match self {
            Dialog::ServerInvite(d) => &d.inner,
            Dialog::ClientInvite(d) => &d.inner,
        }
    }

    /// Handles a request that arrived inside this dialog.
    pub async fn handle(&self, tx: Transaction) -> Result<()> {
        self.inner().handle_request(tx).await
    }

    pub async fn hangup(&self) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.hangup().await,
            Dialog::ClientInvite(d) => d.hangup().await,
        }
    }

    /// Ends the dialog without telling the peer.
    pub fn terminate_local(&self, reason: TerminatedReason) {
        self.inner()
            .transition(DialogState::Terminated(reason), None)
            .ok();
    }
}

pub struct DialogInner {
    pub role: TransactionRole,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,

    pub local_contact: Option<rsip::Uri>,
    pub remote_target: Mutex<rsip::Uri>,

    /// Our side, always carrying our tag.
    pub from: rsip::typed::From,
    /// The peer's side; gains its tag once known.
    pub to: Mutex<rsip::typed::To>,
    pub route_set: Mutex<Vec<Route>>,
    pub credential: Option<Credential>,

    pub(super) invite_key: Mutex<Option<TransactionKey>>,
    // replaced when the INVITE is resent with credentials
    pub(super) initial_request: Mutex<Request>,
    pub(super) local_body: Mutex<Option<Vec<u8>>>,
    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) state_sender: DialogStateSender,
}

pub(super) type DialogInnerRef = Arc<DialogInner>;

impl DialogInner {
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<Self> {
        let cseq = initial_request.cseq_header()?.seq()?;
        let request_from = initial_request.from_header()?.typed()?;
        let request_to = initial_request.to_header()?.typed()?;

        let (from, to, remote_target, route_set, local_seq, remote_seq) = match role {
            TransactionRole::Client => (
                request_from,
                request_to,
                initial_request.uri.clone(),
                vec![],
                cseq,
                0,
            ),
            TransactionRole::Server => {
                let from = rsip::typed::From {
                    display_name: request_to.display_name,
                    uri: request_to.uri,
                    params: request_to.params,
                }
                .with_tag(id.local_tag.clone().into());
                let to = rsip::typed::To {
                    display_name: request_from.display_name,
                    uri: request_from.uri,
                    params: request_from.params,
                };
                let remote_target =
                    extract_uri_from_contact(initial_request.contact_header()?.value())?;
                // the UAS keeps Record-Route in order
                let route_set = initial_request
                    .headers
                    .iter()
                    .filter_map(|h| match h {
                        Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                        _ => None,
                    })
                    .collect();
                (from, to, remote_target, route_set, 0, cseq)
            }
        };
        let local_body = match role {
            TransactionRole::Client if !initial_request.body.is_empty() => {
                Some(initial_request.body.clone())
            }
            _ => None,
        };

        Ok(Self {
            role,
            id: Mutex::new(id),
            state: Mutex::new(DialogState::Early),
            local_seq: AtomicU32::new(local_seq),
            remote_seq: AtomicU32::new(remote_seq),
            local_contact,
            remote_target: Mutex::new(remote_target),
            from,
            to: Mutex::new(to),
            route_set: Mutex::new(route_set),
            credential,
            invite_key: Mutex::new(None),
            initial_request: Mutex::new(initial_request),
            local_body: Mutex::new(local_body),
            endpoint_inner,
            state_sender,
        })
    }

    /// A sibling early dialog created by a fork answering with another tag.
    pub(super) fn fork(&self, remote_tag: &str) -> Self {
        let mut id = self.id();
        id.remote_tag = remote_tag.to_string();
        let to = set_tag(self.to.lock().clone(), remote_tag);
        Self {
            role: self.role,
            id: Mutex::new(id),
            state: Mutex::new(DialogState::Early),
            local_seq: AtomicU32::new(self.get_local_seq()),
            remote_seq: AtomicU32::new(0),
            local_contact: self.local_contact.clone(),
            remote_target: Mutex::new(self.remote_target.lock().clone()),
            from: self.from.clone(),
            to: Mutex::new(to),
            route_set: Mutex::new(vec![]),
            credential: self.credential.clone(),
            invite_key: Mutex::new(self.invite_key.lock().clone()),
            initial_request: Mutex::new(self.initial_request.lock().clone()),
            local_body: Mutex::new(self.local_body.lock().clone()),
            endpoint_inner: self.endpoint_inner.clone(),
            state_sender: self.state_sender.clone(),
        }
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().clone()
    }

    pub fn state(&self) -> DialogState {
        self.state.lock().clone()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().is_confirmed()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().is_terminated()
    }

    /// Key of the INVITE transaction, derived from the INVITE when it was
    /// never sent.
    pub fn transaction_key(&self) -> Option<TransactionKey> {
        if let Some(key) = self.invite_key.lock().clone() {
            return Some(key);
        }
        TransactionKey::from_request(&self.initial_request.lock(), self.role).ok()
    }

    pub fn can_cancel(&self) -> bool {
        self.role == TransactionRole::Client && *self.state.lock() == DialogState::Early
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Acquire)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records the CSeq of a request from the peer. Anything not above the
    /// last one seen is refused.
    pub(super) fn accept_remote_seq(&self, cseq: u32) -> std::result::Result<(), u32> {
        let mut last = self.remote_seq.load(Ordering::Acquire);
        loop {
            if last != 0 && cseq <= last {
                return Err(last);
            }
            match self
                .remote_seq
                .compare_exchange(last, cseq, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if last != 0 && cseq > last + 1 {
                        debug!(id = %self.id(), last, cseq, "remote CSeq skipped ahead");
                    }
                    return Ok(());
                }
                Err(current) => last = current,
            }
        }
    }

    pub(super) fn update_remote_tag(&self, tag: &str) {
        self.id.lock().remote_tag = tag.to_string();
        let mut to = self.to.lock();
        *to = set_tag(to.clone(), tag);
    }

    pub(super) fn set_remote_target(&self, uri: rsip::Uri) {
        *self.remote_target.lock() = uri;
    }

    /// The UAC route set is the Record-Route of the 2xx, reversed.
    pub(super) fn update_route_set(&self, resp: &Response) {
        let mut route_set = resp
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                _ => None,
            })
            .collect::<Vec<_>>();
        route_set.reverse();
        *self.route_set.lock() = route_set;
    }

    pub(super) fn make_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let via = self.endpoint_inner.get_via(None, None)?;
        let seq = cseq.unwrap_or_else(|| self.increment_local_seq());

        let mut request_headers = vec![
            Header::Via(via.into()),
            Header::CallId(self.id.lock().call_id.clone().into()),
            Header::From(self.from.clone().into()),
            Header::To(self.to.lock().clone().into()),
            Header::CSeq(CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
        ];
        if let Some(contact) = &self.local_contact {
            request_headers.push(local_contact_header(contact));
        }
        request_headers.extend(self.route_set.lock().iter().cloned().map(Header::Route));
        request_headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));
        request_headers.extend(headers.unwrap_or_default());
        request_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Ok(Request {
            method,
            uri: self.remote_target.lock().clone(),
            headers: request_headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    /// Response inside the dialog: our tag on To (except for 100), our
    /// Contact, Record-Route echoed back.
    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::To(to) => {
                    let tagged = match to.typed() {
                        Ok(to)
                            if status != StatusCode::Trying
                                && !to.params.iter().any(|p| matches!(p, Param::Tag(_))) =>
                        {
                            Header::To(to.with_tag(self.id.lock().local_tag.clone().into()).into())
                        }
                        _ => Header::To(to.clone()),
                    };
                    resp_headers.push(tagged);
                }
                Header::Via(_)
                | Header::From(_)
                | Header::CallId(_)
                | Header::CSeq(_)
                | Header::RecordRoute(_) => resp_headers.push(header.clone()),
                _ => {}
            }
        }
        if let Some(contact) = &self.local_contact {
            resp_headers.push(local_contact_header(contact));
        }
        for header in headers.unwrap_or_default() {
            resp_headers.unique_push(header);
        }
        resp_headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));
        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version.clone(),
        }
    }

    /// Runs a client transaction to its final response. A 401/407 is
    /// answered once when credentials are configured.
    pub(super) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method;
        let mut tx = Transaction::new_client(request, self.endpoint_inner.clone(), None)?;
        tx.send().await?;

        let mut auth_sent = false;
        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            if resp.status_code.kind() == StatusCodeKind::Provisional {
                continue;
            }
            let challenged = matches!(
                resp.status_code,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
            );
            match &self.credential {
                Some(cred) if challenged && !auth_sent => {
                    auth_sent = true;
                    let new_seq = match method {
                        Method::Cancel => self.get_local_seq(),
                        _ => self.increment_local_seq(),
                    };
                    tx = handle_client_authenticate(new_seq, &tx, &resp, cred)?;
                    tx.send().await?;
                }
                _ => {
                    debug!(id = %self.id(), %method, status = %resp.status_code, "request done");
                    return Ok(Some(resp));
                }
            }
        }
        match tx.outcome() {
            Some(TransactionOutcome::Timeout) => Err(Error::Timeout(tx.key.clone())),
            Some(TransactionOutcome::TransportFailure) => Err(Error::TransportFailure(
                format!("{} not delivered", method),
                tx.destination.clone().unwrap_or_default(),
            )),
            _ => Ok(None),
        }
    }

    /// ACK for a 2xx, sent outside any transaction.
    pub(super) async fn send_ack(&self, resp: &Response) -> Result<()> {
        let ack = self.endpoint_inner.make_ack(resp)?;
        self.endpoint_inner
            .send_stateless(ack.into(), None, None)
            .await
    }

    /// Moves to `state` and notifies. Terminated is final and Confirmed
    /// never goes back to Early.
    pub(super) fn transition(&self, state: DialogState, message: Option<SipMessage>) -> Result<()> {
        let previous = {
            let mut current = self.state.lock();
            match (&*current, &state) {
                (DialogState::Terminated(_), _) => {
                    debug!(id = %self.id(), target = %state, "dialog already terminated");
                    return Ok(());
                }
                (DialogState::Confirmed, DialogState::Early) => {
                    warn!(id = %self.id(), "ignoring transition back to Early");
                    return Ok(());
                }
                _ => {}
            }
            std::mem::replace(&mut *current, state.clone())
        };
        let id = self.id();
        info!(%id, "{} -> {}", previous, state);
        self.state_sender
            .send(DialogStateChange {
                id,
                previous,
                current: state,
                message,
            })
            .ok();
        Ok(())
    }

    pub(super) async fn bye(&self) -> Result<()> {
        if !self.is_confirmed() {
            return Ok(());
        }
        self.send_bye(TerminatedReason::LocalBye).await
    }

    /// Sends BYE whatever the state and ends the dialog with `reason`, even
    /// when the BYE goes unanswered.
    pub(super) async fn send_bye(&self, reason: TerminatedReason) -> Result<()> {
        let request = self.make_request(Method::Bye, None, None, None)?;
        match self.do_request(request).await {
            Ok(resp) => {
                debug!(id = %self.id(), status = ?resp.map(|r| r.status_code), "BYE answered")
            }
            Err(e) => info!(id = %self.id(), "BYE failed: {}", e),
        }
        self.transition(DialogState::Terminated(reason), None)
    }

    /// Re-INVITE with a new offer. The dialog survives a non-2xx answer.
    pub(super) async fn reinvite(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<Response>> {
        if !self.is_confirmed() {
            return Ok(None);
        }
        let mut headers = headers.unwrap_or_default();
        if body.is_some() && !headers.iter().any(|h| matches!(h, Header::ContentType(_))) {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        let request = self.make_request(Method::Invite, None, Some(headers), body.clone())?;
        let resp = self.do_request(request).await?;
        if let Some(resp) = &resp {
            if resp.status_code.kind() == StatusCodeKind::Successful {
                self.send_ack(resp).await?;
                if body.is_some() {
                    *self.local_body.lock() = body;
                }
                self.transition(DialogState::Confirmed, Some(resp.clone().into()))?;
            }
        }
        Ok(resp)
    }

    /// INFO, OPTIONS, UPDATE and other requests that do not change the
    /// dialog state.
    pub(super) async fn request(
        &self,
        method: Method,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<Response>> {
        if !self.is_confirmed() {
            return Ok(None);
        }
        let request = self.make_request(method, None, headers, body)?;
        self.do_request(request).await
    }

    pub(super) async fn handle_request(&self, mut tx: Transaction) -> Result<()> {
        let cseq = tx.original.cseq_header()?.seq()?;
        if let Err(last) = self.accept_remote_seq(cseq) {
            info!(id = %self.id(), cseq, last, "refusing out of order request");
            tx.reply(StatusCode::ServerInternalError).await?;
            return Err(Error::ProtocolViolation(format!(
                "{} with CSeq {} after {}",
                tx.original.method, cseq, last
            )));
        }

        let request = tx.original.clone();
        match request.method {
            Method::Bye => {
                info!(id = %self.id(), "received BYE");
                let resp = self.make_response(&request, StatusCode::OK, None, None);
                tx.respond(resp).await?;
                self.transition(
                    DialogState::Terminated(TerminatedReason::RemoteBye),
                    Some(request.into()),
                )
            }
            Method::Invite if self.is_confirmed() => self.handle_reinvite(tx).await,
            Method::Invite => {
                tx.reply(StatusCode::RequestPending).await?;
                Ok(())
            }
            Method::Info | Method::Options | Method::Update => {
                let resp = self.make_response(&request, StatusCode::OK, None, None);
                tx.respond(resp).await
            }
            _ => {
                info!(id = %self.id(), method = %request.method, "method not allowed in dialog");
                tx.reply(StatusCode::MethodNotAllowed).await
            }
        }
    }

    /// Answers a re-INVITE with the last local body and waits for its ACK.
    async fn handle_reinvite(&self, mut tx: Transaction) -> Result<()> {
        let request = tx.original.clone();
        if let Ok(contact) = request.contact_header() {
            if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                self.set_remote_target(uri);
            }
        }
        let body = self.local_body.lock().clone();
        let headers = body
            .as_ref()
            .map(|_| vec![Header::ContentType("application/sdp".into())]);
        let resp = self.make_response(&request, StatusCode::OK, headers, body);
        tx.respond(resp).await?;

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(ack) = msg {
                if ack.method == Method::Ack {
                    return self.transition(DialogState::Confirmed, Some(request.into()));
                }
            }
        }
        info!(id = %self.id(), outcome = ?tx.outcome(), "re-INVITE never acknowledged");
        Ok(())
    }
}

pub(super) fn set_tag(to: rsip::typed::To, tag: &str) -> rsip::typed::To {
    let mut to = to;
    to.params.retain(|p| !matches!(p, Param::Tag(_)));
    if !tag.is_empty() {
        to.params.push(Param::Tag(tag.into()));
    }
    to
}

pub(super) fn local_contact_header(uri: &rsip::Uri) -> Header {
    rsip::typed::Contact {
        display_name: None,
        uri: uri.clone(),
        params: vec![],
    }
    .into()
}
