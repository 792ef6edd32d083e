use super::{
    fsm::{
        TransactionAction, TransactionFsm, TransactionInput, TransactionOutcome, TransactionTimer,
        TransactionTimers, TransactionType,
    },
    key::{TransactionKey, TransactionRole},
    timer::Timer,
    transaction::Transaction,
    TransactionEvent, TransactionEventSender,
};
use crate::{
    rsip_ext::destination_from_request,
    transport::{connection::TransportReceiver, SipAddr, SipConnection, TransportEvent, TransportLayer},
    Error, Result, VERSION,
};
use parking_lot::Mutex;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Request, SipMessage, StatusCode,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub timer_interval: Duration,
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        let timers = TransactionTimers::default();
        EndpointOption {
            t1: timers.t1,
            t2: timers.t2,
            t4: timers.t4,
            timer_interval: Duration::from_millis(20),
            callid_suffix: None,
        }
    }
}

impl EndpointOption {
    fn timers(&self) -> TransactionTimers {
        TransactionTimers {
            t1: self.t1,
            t2: self.t2,
            t4: self.t4,
        }
    }
}

/// Call-ID, CSeq number and From tag: what an ACK for a 2xx shares with its
/// INVITE once the branch differs.
type AckKey = (String, u32, String);

struct TransactionSlot {
    key: TransactionKey,
    fsm: TransactionFsm,
    original: Request,
    connection: SipConnection,
    destination: Option<SipAddr>,
    sender: TransactionEventSender,
    timers: HashMap<TransactionTimer, (u64, u64)>,
    timer_seq: u64,
    ack_key: Option<AckKey>,
}
type TransactionSlotRef = Arc<tokio::sync::Mutex<TransactionSlot>>;

struct PendingCancel {
    request: Request,
    connection: SipConnection,
    destination: Option<SipAddr>,
}

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    timers: Timer<(TransactionKey, TransactionTimer, u64)>,
    transactions: Mutex<HashMap<TransactionKey, TransactionSlotRef>>,
    ack_index: Mutex<HashMap<AckKey, TransactionKey>>,
    incoming_sender: UnboundedSender<Transaction>,
    incoming_receiver: Mutex<Option<UnboundedReceiver<Transaction>>>,
    cancel_sender: UnboundedSender<PendingCancel>,
    cancel_receiver: Mutex<Option<UnboundedReceiver<PendingCancel>>>,
}
pub type EndpointInnerRef = Arc<EndpointInner>;

/// Owns the transport layer and every live transaction. `serve()` must be
/// running for anything to move.
#[derive(Clone)]
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    option: Option<EndpointOption>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: VERSION.to_string(),
            transport_layer: None,
            cancel_token: None,
            option: None,
        }
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
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

    pub fn with_option(&mut self, option: EndpointOption) -> &mut Self {
        self.option.replace(option);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let (incoming_sender, incoming_receiver) = unbounded_channel();
        let (cancel_sender, cancel_receiver) = unbounded_channel();

        let inner = EndpointInner {
            user_agent: self.user_agent.clone(),
            option: self.option.take().unwrap_or_default(),
            transport_layer,
            cancel_token,
            timers: Timer::new(),
            transactions: Mutex::new(HashMap::new()),
            ack_index: Mutex::new(HashMap::new()),
            incoming_sender,
            incoming_receiver: Mutex::new(Some(incoming_receiver)),
            cancel_sender,
            cancel_receiver: Mutex::new(Some(cancel_receiver)),
        };
        Endpoint {
            inner: Arc::new(inner),
        }
    }
}

impl Endpoint {
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        let (sender, receiver) = unbounded_channel();
        if let Err(e) = inner.transport_layer.serve_listens(sender).await {
            warn!("failed to serve transports: {}", e);
            return;
        }
        select! {
            _ = inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            r = inner.process_transport(receiver) => {
                info!("transport loop exited: {:?}", r);
            }
            r = inner.process_timer() => {
                info!("timer loop exited: {:?}", r);
            }
            r = inner.process_cancels() => {
                info!("cancel loop exited: {:?}", r);
            }
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.inner.cancel_token.cancel();
    }

    /// New server transactions, one per inbound request that matched none.
    /// Can be taken once.
    pub fn incoming_transactions(&self) -> Result<UnboundedReceiver<Transaction>> {
        self.inner
            .incoming_receiver
            .lock()
            .take()
            .ok_or_else(|| Error::EndpointError("incoming transactions already taken".to_string()))
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.transport_layer.get_addrs()
    }
}

impl EndpointInner {
    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }

    fn get_slot(&self, key: &TransactionKey) -> Option<TransactionSlotRef> {
        self.transactions.lock().get(key).cloned()
    }

    async fn process_transport(self: &Arc<Self>, mut receiver: TransportReceiver) -> Result<()> {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, from) => {
                    if let Err(e) = self.on_received(msg, connection, from).await {
                        info!("dropping inbound message: {}", e);
                    }
                }
                TransportEvent::New(connection) => {
                    debug!(%connection, "new connection");
                    self.transport_layer.add_connection(connection);
                }
                TransportEvent::Closed(connection) => {
                    debug!(%connection, "connection closed");
                    self.transport_layer.del_connection(&connection);
                }
            }
        }
        Ok(())
    }

    async fn process_timer(&self) -> Result<()> {
        loop {
            for (key, timer, seq) in self.timers.poll(Instant::now()) {
                let Some(slot) = self.get_slot(&key) else {
                    continue;
                };
                let mut slot = slot.lock().await;
                match slot.timers.get(&timer) {
                    Some((_, armed)) if *armed == seq => {
                        slot.timers.remove(&timer);
                    }
                    _ => continue,
                }
                trace!(%key, %timer, "timer fired");
                self.run(&mut slot, TransactionInput::Timer(timer)).await;
            }
            tokio::time::sleep(self.option.timer_interval).await;
        }
    }

    async fn process_cancels(&self) -> Result<()> {
        let mut receiver = self
            .cancel_receiver
            .lock()
            .take()
            .ok_or_else(|| Error::EndpointError("cancel loop already running".to_string()))?;
        while let Some(pending) = receiver.recv().await {
            // nobody listens to the CANCEL transaction; the INVITE sees a 487
            let (sender, _) = unbounded_channel();
            if let Err(e) = self
                .start_client(
                    pending.request,
                    pending.connection,
                    pending.destination,
                    sender,
                )
                .await
            {
                warn!("failed to send CANCEL: {}", e);
            }
        }
        Ok(())
    }

    async fn on_received(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        from: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;
                let Some(slot) = self.get_slot(&key) else {
                    debug!(%key, status = %resp.status_code, "no transaction for response");
                    return Ok(());
                };
                let mut slot = slot.lock().await;
                self.run(&mut slot, TransactionInput::Received(resp.into()))
                    .await;
                Ok(())
            }
            SipMessage::Request(req) => {
                let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
                if let Some(slot) = self.get_slot(&key) {
                    let mut slot = slot.lock().await;
                    self.run(&mut slot, TransactionInput::Received(req.into()))
                        .await;
                    return Ok(());
                }
                match req.method {
                    rsip::Method::Ack => self.on_ack(req).await,
                    rsip::Method::Cancel => self.on_cancel(req, key, connection).await,
                    _ => self.on_new_request(req, key, connection, from).await,
                }
            }
        }
    }

    async fn on_ack(&self, req: Request) -> Result<()> {
        let ack_key = Self::ack_key(&req)?;
        let key = self.ack_index.lock().get(&ack_key).cloned();
        let Some(slot) = key.and_then(|key| self.get_slot(&key)) else {
            debug!(call_id = %ack_key.0, "ACK matches no transaction");
            return Ok(());
        };
        let mut slot = slot.lock().await;
        self.run(&mut slot, TransactionInput::Received(req.into()))
            .await;
        Ok(())
    }

    async fn on_cancel(
        &self,
        req: Request,
        key: TransactionKey,
        connection: SipConnection,
    ) -> Result<()> {
        let invite = self.get_slot(&key.with_method(rsip::Method::Invite));
        let (sender, _) = unbounded_channel();
        let slot = self.insert_server(&req, key, connection, sender, None)?;
        let mut slot = slot.lock().await;

        let Some(invite) = invite else {
            let resp = self.make_response(&req, StatusCode::CallTransactionDoesNotExist, None);
            self.run(&mut slot, TransactionInput::Respond(resp)).await;
            return Ok(());
        };
        let resp = self.make_response(&req, StatusCode::OK, None);
        self.run(&mut slot, TransactionInput::Respond(resp)).await;
        // a CANCEL after the final response is answered but changes nothing
        let mut invite = invite.lock().await;
        if invite.fsm.can_respond() {
            self.run(&mut invite, TransactionInput::Received(req.into()))
                .await;
        }
        Ok(())
    }

    async fn on_new_request(
        self: &Arc<Self>,
        req: Request,
        key: TransactionKey,
        connection: SipConnection,
        from: SipAddr,
    ) -> Result<()> {
        let (sender, receiver) = unbounded_channel();
        let ack_key = match req.method {
            rsip::Method::Invite => Some(Self::ack_key(&req)?),
            _ => None,
        };
        let slot = self.insert_server(&req, key.clone(), connection.clone(), sender, ack_key)?;
        info!(%key, %from, "new server transaction");

        if req.method == rsip::Method::Invite {
            let trying = self.make_response(&req, StatusCode::Trying, None);
            let mut slot = slot.lock().await;
            self.run(&mut slot, TransactionInput::Respond(trying)).await;
        }
        let transaction = Transaction::new_server(key, req, connection, receiver, self.clone());
        self.incoming_sender
            .send(transaction)
            .map_err(|e| Error::EndpointError(e.to_string()))
    }

    fn ack_key(req: &Request) -> Result<AckKey> {
        let from_tag = req
            .from_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        Ok((
            req.call_id_header()?.value().to_string(),
            req.cseq_header()?.seq()?,
            from_tag,
        ))
    }

    fn insert_server(
        &self,
        req: &Request,
        key: TransactionKey,
        connection: SipConnection,
        sender: TransactionEventSender,
        ack_key: Option<AckKey>,
    ) -> Result<TransactionSlotRef> {
        let transaction_type = match req.method {
            rsip::Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let fsm = TransactionFsm::new(
            transaction_type,
            connection.is_reliable(),
            self.option.timers(),
        );
        let slot = Arc::new(tokio::sync::Mutex::new(TransactionSlot {
            key: key.clone(),
            fsm,
            original: req.clone(),
            connection,
            destination: None,
            sender,
            timers: HashMap::new(),
            timer_seq: 0,
            ack_key: ack_key.clone(),
        }));
        self.transactions.lock().insert(key.clone(), slot.clone());
        if let Some(ack_key) = ack_key {
            self.ack_index.lock().insert(ack_key, key);
        }
        Ok(slot)
    }

    /// Registers a client transaction and transmits its request. The Via is
    /// rewritten to the connection actually used.
    pub(super) async fn start_client(
        &self,
        mut request: Request,
        connection: SipConnection,
        destination: Option<SipAddr>,
        sender: TransactionEventSender,
    ) -> Result<TransactionKey> {
        Self::rewrite_via(&mut request, &connection)?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let transaction_type = match request.method {
            rsip::Method::Invite => TransactionType::ClientInvite,
            rsip::Method::Ack => {
                return Err(Error::TransactionError(
                    "ACK is never a client transaction".to_string(),
                    key,
                ))
            }
            _ => TransactionType::ClientNonInvite,
        };
        let slot = {
            let mut transactions = self.transactions.lock();
            if transactions.contains_key(&key) {
                return Err(Error::TransactionError(
                    "transaction already exists".to_string(),
                    key,
                ));
            }
            let slot = Arc::new(tokio::sync::Mutex::new(TransactionSlot {
                key: key.clone(),
                fsm: TransactionFsm::new(
                    transaction_type,
                    connection.is_reliable(),
                    self.option.timers(),
                ),
                original: request.clone(),
                connection,
                destination,
                sender,
                timers: HashMap::new(),
                timer_seq: 0,
                ack_key: None,
            }));
            transactions.insert(key.clone(), slot.clone());
            slot
        };
        debug!(%key, "new client transaction");
        let mut slot = slot.lock().await;
        self.run(&mut slot, TransactionInput::Send(request)).await;
        Ok(key)
    }

    pub fn rewrite_via(request: &mut Request, connection: &SipConnection) -> Result<()> {
        let addr = connection.get_addr();
        let via = request.via_header_mut()?;
        let mut typed_via = via.typed()?;
        typed_via.transport = addr
            .r#type
            .clone()
            .unwrap_or(rsip::transport::Transport::Udp);
        typed_via.uri.host_with_port = addr.addr.clone();
        *via = typed_via.into();
        Ok(())
    }

    /// Picks the connection and destination for a request that has none
    /// chosen yet: Route first, then the Request-URI.
    pub async fn resolve_target(
        &self,
        request: &Request,
        connection: Option<SipConnection>,
        destination: Option<SipAddr>,
    ) -> Result<(SipConnection, Option<SipAddr>)> {
        let destination = match destination {
            Some(destination) => destination,
            None => destination_from_request(request).ok_or_else(|| {
                Error::InvalidTarget(format!("no destination for {}", request.uri))
            })?,
        };
        let connection = match connection {
            Some(connection) => connection,
            None => self.transport_layer.lookup(&destination).await?,
        };
        let destination = match &self.transport_layer.outbound {
            Some(outbound) => outbound.clone(),
            None => destination,
        };
        Ok((connection, Some(destination)))
    }

    pub async fn respond(&self, key: &TransactionKey, response: rsip::Response) -> Result<()> {
        let slot = self
            .get_slot(key)
            .ok_or_else(|| Error::AlreadyCompleted(key.clone()))?;
        let mut slot = slot.lock().await;
        if !slot.fsm.can_respond() {
            return Err(Error::AlreadyCompleted(key.clone()));
        }
        self.run(&mut slot, TransactionInput::Respond(response))
            .await;
        Ok(())
    }

    pub async fn cancel_transaction(&self, key: &TransactionKey) -> Result<()> {
        let slot = self
            .get_slot(key)
            .ok_or_else(|| Error::AlreadyCompleted(key.clone()))?;
        let mut slot = slot.lock().await;
        if !slot.fsm.can_cancel() {
            return Err(Error::AlreadyCompleted(key.clone()));
        }
        self.run(&mut slot, TransactionInput::Cancel).await;
        Ok(())
    }

    /// Sends outside any transaction, used for the ACK of a 2xx.
    pub async fn send_stateless(
        &self,
        msg: SipMessage,
        connection: Option<SipConnection>,
        destination: Option<SipAddr>,
    ) -> Result<()> {
        let (connection, destination) = match &msg {
            SipMessage::Request(req) => self.resolve_target(req, connection, destination).await?,
            SipMessage::Response(_) => match connection {
                Some(connection) => (connection, destination),
                None => {
                    return Err(Error::EndpointError(
                        "stateless response needs a connection".to_string(),
                    ))
                }
            },
        };
        connection.send(msg, destination.as_ref()).await
    }

    async fn run(&self, slot: &mut TransactionSlot, input: TransactionInput) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let before = slot.fsm.state;
            let actions = slot.fsm.on_event(input);
            if slot.fsm.state != before {
                debug!(key = %slot.key, "{} -> {}", before, slot.fsm.state);
            }
            for action in actions {
                match action {
                    TransactionAction::Transmit(msg) => {
                        if let Err(e) = slot.connection.send(msg, slot.destination.as_ref()).await
                        {
                            warn!(key = %slot.key, "transmit failed: {}", e);
                            inputs.push_back(TransactionInput::TransportError);
                        }
                    }
                    TransactionAction::Deliver(msg) => {
                        slot.sender
                            .send(TransactionEvent::Received(
                                msg,
                                Some(slot.connection.clone()),
                            ))
                            .ok();
                    }
                    TransactionAction::Acknowledge(resp) => {
                        let sent = match self.make_non2xx_ack(&slot.original, &resp) {
                            Ok(ack) => {
                                slot.connection
                                    .send(ack.into(), slot.destination.as_ref())
                                    .await
                            }
                            Err(e) => Err(e),
                        };
                        if let Err(e) = sent {
                            warn!(key = %slot.key, "failed to ACK {}: {}", resp.status_code, e);
                        }
                    }
                    TransactionAction::Schedule(timer, duration) => {
                        if let Some((task_id, _)) = slot.timers.remove(&timer) {
                            self.timers.cancel(task_id);
                        }
                        slot.timer_seq += 1;
                        let task_id = self
                            .timers
                            .timeout(duration, (slot.key.clone(), timer, slot.timer_seq));
                        slot.timers.insert(timer, (task_id, slot.timer_seq));
                    }
                    TransactionAction::Unschedule(timer) => {
                        if let Some((task_id, _)) = slot.timers.remove(&timer) {
                            self.timers.cancel(task_id);
                        }
                    }
                    TransactionAction::SendCancel => match self.make_cancel(&slot.original) {
                        Ok(request) => {
                            self.cancel_sender
                                .send(PendingCancel {
                                    request,
                                    connection: slot.connection.clone(),
                                    destination: slot.destination.clone(),
                                })
                                .ok();
                        }
                        Err(e) => warn!(key = %slot.key, "failed to build CANCEL: {}", e),
                    },
                    TransactionAction::Terminate(outcome) => self.finish(slot, outcome),
                }
            }
        }
    }

    fn finish(&self, slot: &mut TransactionSlot, outcome: TransactionOutcome) {
        for (_, (task_id, _)) in slot.timers.drain() {
            self.timers.cancel(task_id);
        }
        self.transactions.lock().remove(&slot.key);
        if let Some(ack_key) = slot.ack_key.take() {
            self.ack_index.lock().remove(&ack_key);
        }
        match outcome {
            TransactionOutcome::Completed => debug!(key = %slot.key, "transaction terminated"),
            _ => info!(key = %slot.key, ?outcome, "transaction terminated"),
        }
        slot.sender.send(TransactionEvent::Terminated(outcome)).ok();
    }
}
