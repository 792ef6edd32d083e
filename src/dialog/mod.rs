use crate::{transaction::key::TransactionRole, Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod server_dialog;

#[cfg(test)]
pub(crate) mod tests;

/// Call-ID plus the tag pair, seen from our side of the dialog.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// Reads the id off a request. A client sent it, so the From tag is
    /// ours; a server received it, so the From tag is the peer's.
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let call_id = req.call_id_header()?.value().to_string();
        let from_tag = req
            .from_header()?
            .tag()?
            .ok_or_else(|| Error::Error("from tag not found".to_string()))?
            .to_string();
        let to_tag = req.to_header()?.tag()?.map(|t| t.to_string()).unwrap_or_default();
        Ok(Self::with_role(call_id, from_tag, to_tag, role))
    }

    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let call_id = resp.call_id_header()?.value().to_string();
        let from_tag = resp
            .from_header()?
            .tag()?
            .ok_or_else(|| Error::Error("from tag not found".to_string()))?
            .to_string();
        let to_tag = resp.to_header()?.tag()?.map(|t| t.to_string()).unwrap_or_default();
        Ok(Self::with_role(call_id, from_tag, to_tag, role))
    }

    fn with_role(call_id: String, from_tag: String, to_tag: String, role: TransactionRole) -> Self {
        match role {
            TransactionRole::Client => DialogId {
                call_id,
                local_tag: from_tag,
                remote_tag: to_tag,
            },
            TransactionRole::Server => DialogId {
                call_id,
                local_tag: to_tag,
                remote_tag: from_tag,
            },
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
