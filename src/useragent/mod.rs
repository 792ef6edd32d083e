use crate::{
    dialog::{
        client_dialog::ClientInviteDialog,
        dialog::{Dialog, DialogStateChange, DialogStateReceiver, DialogStateSender, TerminatedReason},
        dialog_layer::DialogLayer,
        invitation::InviteOption,
        server_dialog::ServerInviteDialog,
        DialogId,
    },
    rsip_ext::HeaderList,
    transaction::{
        endpoint::{Endpoint, EndpointOption},
        key::TransactionRole,
        Transaction,
    },
    transport::{SipAddr, TransportLayer},
    EndpointBuilder, Error, Result, VERSION,
};
use futures::future::join_all;
use parking_lot::Mutex;
use rsip::{transport::Transport, Method, Request, Response, StatusCode};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod profile;
pub use profile::{AuthInfo, Profile};

#[cfg(test)]
mod tests;

/// What the application hears from a [`UserAgent`].
#[derive(Debug, Clone)]
pub enum UserAgentEvent {
    /// A new INVITE created an Early server dialog. Answer it with
    /// [`UserAgent::accept`], [`UserAgent::ringing`] or [`UserAgent::reject`].
    IncomingCall { id: DialogId, invite: Request },
    StateChanged(DialogStateChange),
}

pub type UserAgentEventReceiver = UnboundedReceiver<UserAgentEvent>;

pub struct UserAgentBuilder {
    user_agent: String,
    option: Option<EndpointOption>,
    outbound: Option<SipAddr>,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    shutdown_grace: Duration,
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        UserAgentBuilder {
            user_agent: VERSION.to_string(),
            option: None,
            outbound: None,
            transport_layer: None,
            cancel_token: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_option(&mut self, option: EndpointOption) -> &mut Self {
        self.option.replace(option);
        self
    }

    /// Every request leaves through this proxy, whatever its Request-URI.
    pub fn with_outbound(&mut self, outbound: SipAddr) -> &mut Self {
        self.outbound.replace(outbound);
        self
    }

    pub fn with_transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    /// How long [`UserAgent::shutdown`] waits for hangups to be answered.
    pub fn with_shutdown_grace(&mut self, grace: Duration) -> &mut Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(&mut self) -> UserAgent {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let mut transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        if let Some(outbound) = self.outbound.take() {
            transport_layer.outbound = Some(outbound);
        }

        let mut builder = EndpointBuilder::new();
        builder
            .with_user_agent(&self.user_agent)
            .with_transport_layer(transport_layer)
            .with_cancel_token(cancel_token.clone());
        if let Some(option) = self.option.take() {
            builder.with_option(option);
        }
        let endpoint = builder.build();
        let dialog_layer = DialogLayer::new(endpoint.inner.clone());
        let (state_sender, state_receiver) = unbounded_channel();
        let (event_sender, event_receiver) = unbounded_channel();

        UserAgent {
            inner: Arc::new(UserAgentInner {
                endpoint,
                dialog_layer,
                state_sender,
                state_receiver: Mutex::new(Some(state_receiver)),
                event_sender,
                event_receiver: Mutex::new(Some(event_receiver)),
                shutdown_grace: self.shutdown_grace,
                cancel_token,
            }),
        }
    }
}

pub struct UserAgentInner {
    endpoint: Endpoint,
    dialog_layer: DialogLayer,
    state_sender: DialogStateSender,
    state_receiver: Mutex<Option<DialogStateReceiver>>,
    event_sender: UnboundedSender<UserAgentEvent>,
    event_receiver: Mutex<Option<UserAgentEventReceiver>>,
    shutdown_grace: Duration,
    cancel_token: CancellationToken,
}

/// Call control on top of one endpoint: places calls, answers them and
/// routes in-dialog requests to their dialogs.
///
/// `listen` first, then keep `serve` running; every other call needs it.
/// Events queue up until [`take_event_receiver`] is called.
///
/// [`take_event_receiver`]: Self::take_event_receiver
#[derive(Clone)]
pub struct UserAgent {
    pub inner: Arc<UserAgentInner>,
}

impl UserAgent {
    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn dialog_layer(&self) -> &DialogLayer {
        &self.inner.dialog_layer
    }

    pub fn take_event_receiver(&self) -> Option<UserAgentEventReceiver> {
        self.inner.event_receiver.lock().take()
    }

    pub async fn listen(&self, protocol: Transport, addr: SocketAddr) -> Result<SipAddr> {
        let local = self
            .inner
            .endpoint
            .inner
            .transport_layer
            .listen(protocol, addr)
            .await?;
        info!(%local, "listening");
        Ok(local)
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.endpoint.get_addrs()
    }

    /// Runs the endpoint and dispatches inbound transactions until
    /// [`shutdown`](Self::shutdown). Only one `serve` may run at a time.
    pub async fn serve(&self) -> Result<()> {
        let incoming = self.inner.endpoint.incoming_transactions()?;
        let mut states = self
            .inner
            .state_receiver
            .lock()
            .take()
            .ok_or_else(|| Error::EndpointError("user agent already serving".to_string()))?;
        let inner = self.inner.clone();

        select! {
            _ = inner.endpoint.serve() => {
                info!("endpoint stopped");
            }
            r = inner.clone().process_incoming(incoming) => {
                info!("incoming loop exited: {:?}", r);
            }
            r = inner.process_dialog_state(&mut states) => {
                info!("dialog state loop exited: {:?}", r);
            }
        }
        // terminations raised by shutdown land after the loops stop
        while let Ok(change) = states.try_recv() {
            inner.on_state_change(change);
        }
        Ok(())
    }

    /// Places a call to `target`. Returns as soon as the INVITE is on its
    /// way; progress arrives as [`UserAgentEvent::StateChanged`].
    pub async fn invite(
        &self,
        profile: &Profile,
        target: &str,
        offer: Option<Vec<u8>>,
        headers: HeaderList,
    ) -> Result<DialogId> {
        let callee = parse_target(target)?;
        let contact = self
            .inner
            .local_contact(&callee, profile.user())
            .ok_or_else(|| Error::EndpointError("no transport to place calls from".to_string()))?;
        let opt = InviteOption {
            caller: profile.aor.clone(),
            callee,
            display_name: profile.display_name.clone(),
            contact,
            offer,
            credential: profile.credential(),
            headers: headers.to_headers(),
            session_expires: profile.session_expires(),
            ..Default::default()
        };
        let (dialog, tx) = self
            .inner
            .dialog_layer
            .create_client_invite(opt, self.inner.state_sender.clone())?;
        let id = dialog.id();
        info!(%id, %target, "placing call");
        tokio::spawn(async move {
            if let Err(e) = dialog.process_invite(tx).await {
                info!(id = %dialog.id(), "call not established: {}", e);
            }
        });
        Ok(id)
    }

    pub async fn ringing(&self, id: &DialogId) -> Result<()> {
        self.server_dialog(id)?.ringing().await
    }

    pub async fn accept(&self, id: &DialogId, answer: Option<Vec<u8>>) -> Result<()> {
        self.server_dialog(id)?.accept(None, answer).await
    }

    pub async fn reject(&self, id: &DialogId, status: StatusCode) -> Result<()> {
        self.server_dialog(id)?.reject(status).await
    }

    /// Cancels a call we placed that has not been answered yet.
    pub async fn cancel(&self, id: &DialogId) -> Result<()> {
        self.client_dialog(id)?.cancel().await
    }

    pub async fn hangup(&self, id: &DialogId) -> Result<()> {
        self.dialog(id)?.hangup().await
    }

    pub async fn reinvite(&self, id: &DialogId, offer: Option<Vec<u8>>) -> Result<Option<Response>> {
        match self.dialog(id)? {
            Dialog::ServerInvite(dialog) => dialog.reinvite(None, offer).await,
            Dialog::ClientInvite(dialog) => dialog.reinvite(None, offer).await,
        }
    }

    /// Hangs up every dialog, waiting at most the shutdown grace for the
    /// peers to answer, then stops the endpoint.
    pub async fn shutdown(&self) {
        let dialogs = self.inner.dialog_layer.all_dialogs();
        info!(dialogs = dialogs.len(), "user agent shutting down");
        let hangups = join_all(dialogs.iter().map(|dialog| async move {
            if let Err(e) = dialog.hangup().await {
                debug!(id = %dialog.id(), "hangup on shutdown failed: {}", e);
            }
        }));
        if tokio::time::timeout(self.inner.shutdown_grace, hangups)
            .await
            .is_err()
        {
            warn!("hangups still pending at shutdown");
        }
        for dialog in self.inner.dialog_layer.all_dialogs() {
            dialog.terminate_local(TerminatedReason::Shutdown);
        }
        self.inner.cancel_token.cancel();
    }

    /// A call that ended moments ago answers AlreadyCompleted, an unknown
    /// id DialogError.
    fn dialog(&self, id: &DialogId) -> Result<Dialog> {
        let layer = &self.inner.dialog_layer;
        if let Some(dialog) = layer.get_dialog(id) {
            return Ok(dialog);
        }
        match layer.finished_key(id) {
            Some(key) => Err(Error::AlreadyCompleted(key)),
            None => Err(Error::DialogError("no such dialog".to_string(), id.clone())),
        }
    }

    fn server_dialog(&self, id: &DialogId) -> Result<ServerInviteDialog> {
        match self.dialog(id)? {
            Dialog::ServerInvite(dialog) => Ok(dialog),
            Dialog::ClientInvite(_) => Err(Error::DialogError(
                "not an incoming call".to_string(),
                id.clone(),
            )),
        }
    }

    fn client_dialog(&self, id: &DialogId) -> Result<ClientInviteDialog> {
        match self.dialog(id)? {
            Dialog::ClientInvite(dialog) => Ok(dialog),
            Dialog::ServerInvite(_) => Err(Error::DialogError(
                "not an outgoing call".to_string(),
                id.clone(),
            )),
        }
    }
}

impl UserAgentInner {
    async fn process_incoming(
        self: Arc<Self>,
        mut incoming: UnboundedReceiver<Transaction>,
    ) -> Result<()> {
        while let Some(tx) = incoming.recv().await {
            let inner = self.clone();
            tokio::spawn(async move {
                let key = tx.key.clone();
                if let Err(e) = inner.handle_incoming(tx).await {
                    info!(%key, "incoming request failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn process_dialog_state(&self, states: &mut DialogStateReceiver) -> Result<()> {
        while let Some(change) = states.recv().await {
            self.on_state_change(change);
        }
        Ok(())
    }

    fn on_state_change(&self, change: DialogStateChange) {
        debug!(id = %change.id, previous = %change.previous, current = %change.current, "dialog state");
        if change.current.is_terminated() {
            self.dialog_layer.remove_dialog(&change.id);
        }
        self.event_sender
            .send(UserAgentEvent::StateChanged(change))
            .ok();
    }

    async fn handle_incoming(&self, mut tx: Transaction) -> Result<()> {
        let id = match DialogId::from_request(&tx.original, TransactionRole::Server) {
            Ok(id) => id,
            Err(e) => {
                tx.reply(StatusCode::BadRequest).await?;
                return Err(e);
            }
        };

        if !id.local_tag.is_empty() {
            return match self.dialog_layer.get_dialog(&id) {
                Some(dialog) => dialog.handle(tx).await,
                None => {
                    info!(%id, method = %tx.original.method, "request for unknown dialog");
                    tx.reply(StatusCode::CallTransactionDoesNotExist).await
                }
            };
        }

        match tx.original.method {
            Method::Invite => {
                let user = tx.original.uri.auth.as_ref().map(|auth| auth.user.clone());
                let contact = tx
                    .connection
                    .as_ref()
                    .map(|connection| contact_uri(connection.get_addr(), user));
                let dialog = self
                    .dialog_layer
                    .create_server_invite(&mut tx, self.state_sender.clone(), contact)
                    .await?;
                let id = dialog.id();
                info!(%id, "incoming call");
                self.event_sender
                    .send(UserAgentEvent::IncomingCall {
                        id,
                        invite: tx.original.clone(),
                    })
                    .ok();
                dialog.handle_invite(tx).await;
                Ok(())
            }
            Method::Options => tx.reply(StatusCode::OK).await,
            Method::Ack => Ok(()),
            _ => {
                debug!(method = %tx.original.method, "method not allowed outside a dialog");
                tx.reply(StatusCode::MethodNotAllowed).await
            }
        }
    }

    /// Contact for a call to `target`: the first local address on the
    /// target's transport, else the first one bound.
    fn local_contact(&self, target: &rsip::Uri, user: Option<String>) -> Option<rsip::Uri> {
        let wanted = target.transport().cloned().unwrap_or(Transport::Udp);
        let addrs = self.endpoint.get_addrs();
        let addr = addrs
            .iter()
            .find(|addr| addr.r#type.as_ref().unwrap_or(&Transport::Udp) == &wanted)
            .or_else(|| addrs.first())?;
        Some(contact_uri(addr, user))
    }
}

fn contact_uri(addr: &SipAddr, user: Option<String>) -> rsip::Uri {
    let mut uri = rsip::Uri::from(addr);
    uri.auth = user.map(|user| rsip::Auth {
        user,
        password: None,
    });
    uri
}

/// Parses a call target. Anything but a `sip:`/`sips:` URI with a host is
/// refused before a single byte is sent.
pub fn parse_target(target: &str) -> Result<rsip::Uri> {
    let uri = rsip::Uri::try_from(target)
        .map_err(|e| Error::InvalidTarget(format!("{}: {}", target, e)))?;
    match uri.scheme {
        Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips) => {}
        _ => {
            return Err(Error::InvalidTarget(format!(
                "{}: not a sip or sips uri",
                target
            )))
        }
    }
    if uri.host_with_port.host.to_string().is_empty() {
        return Err(Error::InvalidTarget(format!("{}: no host", target)));
    }
    Ok(uri)
}
