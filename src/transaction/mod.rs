use crate::transport::SipConnection;
use rand::{distributions::Alphanumeric, Rng};
use rsip::{param::Tag, SipMessage};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod fsm;
pub mod key;
pub mod message;
mod timer;
pub mod transaction;
pub use endpoint::{Endpoint, EndpointBuilder, EndpointOption};
pub use fsm::{TransactionOutcome, TransactionState, TransactionType};
pub use transaction::Transaction;

#[cfg(test)]
pub(crate) mod tests;

pub const TO_TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CALL_ID_LEN: usize = 22;

/// What a transaction reports to its user.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Terminated(TransactionOutcome),
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

pub fn random_text(count: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!("{}@{}", random_text(CALL_ID_LEN), domain.unwrap_or("rsipua")).into()
}

pub fn make_tag() -> Tag {
    random_text(TO_TAG_LEN).into()
}
