use super::{
    endpoint::{EndpointInner, EndpointInnerRef},
    fsm::{TransactionOutcome, TransactionType},
    key::{TransactionKey, TransactionRole},
    TransactionEvent, TransactionEventReceiver, TransactionEventSender,
};
use crate::{
    transport::{SipAddr, SipConnection},
    Error, Result,
};
use rsip::{Header, Request, Response, SipMessage, StatusCode};
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

/// Handle to one transaction held by its user.
///
/// Client side: build with [`Transaction::new_client`], then [`send`] and
/// read responses with [`receive`] until it yields `None`.
///
/// Server side: handed out by the endpoint for every new inbound request.
/// Answer with [`reply`]/[`respond`]; [`receive`] yields the ACK of a 2xx
/// and any CANCEL aimed at an INVITE.
///
/// [`send`]: Transaction::send
/// [`receive`]: Transaction::receive
/// [`reply`]: Transaction::reply
/// [`respond`]: Transaction::respond
pub struct Transaction {
    pub key: TransactionKey,
    pub transaction_type: TransactionType,
    pub original: Request,
    pub connection: Option<SipConnection>,
    pub destination: Option<SipAddr>,
    pub endpoint_inner: EndpointInnerRef,
    pub last_response: Option<Response>,
    outcome: Option<TransactionOutcome>,
    sender: Option<TransactionEventSender>,
    receiver: TransactionEventReceiver,
}

impl Transaction {
    pub fn new_client(
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Result<Self> {
        let key = TransactionKey::from_request(&original, TransactionRole::Client)?;
        let transaction_type = match original.method {
            rsip::Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        let (sender, receiver) = unbounded_channel();
        Ok(Self {
            key,
            transaction_type,
            original,
            connection,
            destination: None,
            endpoint_inner,
            last_response: None,
            outcome: None,
            sender: Some(sender),
            receiver,
        })
    }

    pub(super) fn new_server(
        key: TransactionKey,
        original: Request,
        connection: SipConnection,
        receiver: TransactionEventReceiver,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let transaction_type = match original.method {
            rsip::Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Self {
            key,
            transaction_type,
            original,
            connection: Some(connection),
            destination: None,
            endpoint_inner,
            last_response: None,
            outcome: None,
            sender: None,
            receiver,
        }
    }

    pub fn is_client(&self) -> bool {
        self.transaction_type.is_client()
    }

    /// Why the transaction ended, once [`receive`](Self::receive) has
    /// returned `None`.
    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.outcome
    }

    pub async fn send(&mut self) -> Result<()> {
        let sender = self.sender.take().ok_or_else(|| {
            Error::TransactionError("transaction already sent".to_string(), self.key.clone())
        })?;
        let (connection, destination) = self
            .endpoint_inner
            .resolve_target(
                &self.original,
                self.connection.clone(),
                self.destination.clone(),
            )
            .await?;
        EndpointInner::rewrite_via(&mut self.original, &connection)?;
        self.key = self
            .endpoint_inner
            .start_client(
                self.original.clone(),
                connection.clone(),
                destination.clone(),
                sender,
            )
            .await?;
        self.connection = Some(connection);
        self.destination = destination;
        Ok(())
    }

    /// Next message delivered by the transaction; `None` once it has
    /// terminated.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        match self.receiver.recv().await? {
            TransactionEvent::Received(msg, connection) => {
                if let SipMessage::Response(resp) = &msg {
                    self.last_response = Some(resp.clone());
                }
                if connection.is_some() {
                    self.connection = connection;
                }
                Some(msg)
            }
            TransactionEvent::Terminated(outcome) => {
                debug!(key = %self.key, ?outcome, "transaction ended");
                self.outcome = Some(outcome);
                None
            }
        }
    }

    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut resp = self
            .endpoint_inner
            .make_response(&self.original, status_code, body);
        for header in headers {
            resp.headers.unique_push(header);
        }
        self.respond(resp).await
    }

    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::TransactionError(
                "client transactions cannot respond".to_string(),
                self.key.clone(),
            ));
        }
        self.endpoint_inner
            .respond(&self.key, response.clone())
            .await?;
        self.last_response = Some(response);
        Ok(())
    }

    /// Cancels a pending client INVITE. Before any provisional the CANCEL is
    /// held back until one arrives.
    pub async fn cancel(&self) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "only INVITE client transactions can be cancelled".to_string(),
                self.key.clone(),
            ));
        }
        self.endpoint_inner.cancel_transaction(&self.key).await
    }
}
