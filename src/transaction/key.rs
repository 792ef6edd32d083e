use crate::{Error, Result};
use rsip::headers::UntypedHeader;
use rsip::{
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

/// Which side of the exchange a transaction sits on. A request we send and
/// the same request looped back to us must not share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// Key for peers that predate the magic cookie and send no branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    RFC3261(Rfc3261),
    RFC2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::RFC3261(rfc3261) => write!(
                f,
                "{}:{} {}/{} {}({})",
                rfc3261.role,
                rfc3261.call_id,
                rfc3261.method,
                rfc3261.cseq,
                rfc3261.from_tag,
                rfc3261.branch,
            ),
            TransactionKey::RFC2543(rfc2543) => write!(
                f,
                "{}:{} {}/{} {}[{}]",
                rfc2543.role,
                rfc2543.call_id,
                rfc2543.method,
                rfc2543.cseq,
                rfc2543.from_tag,
                rfc2543.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TransactionKey {
    /// ACK is keyed as INVITE so a non-2xx ACK lands on the INVITE server
    /// transaction it belongs to.
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let method = match &req.method {
            Method::Ack => Method::Invite,
            m => m.clone(),
        };
        let from_tag = req.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tags missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = req.call_id_header()?.value().to_string();
        let cseq = req.cseq_header()?.seq()?;
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                method,
                cseq,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                role,
                method,
                cseq,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        let from_tag = resp.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tags missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = resp.call_id_header()?.value().to_string();
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                role,
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    pub fn role(&self) -> Option<TransactionRole> {
        match self {
            TransactionKey::RFC3261(k) => Some(k.role),
            TransactionKey::RFC2543(k) => Some(k.role),
            TransactionKey::Invalid => None,
        }
    }

    /// The same transaction seen from the other side, e.g. to find the
    /// INVITE server transaction a received CANCEL refers to.
    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::RFC3261(k) => TransactionKey::RFC3261(Rfc3261 {
                method,
                ..k.clone()
            }),
            TransactionKey::RFC2543(k) => TransactionKey::RFC2543(Rfc2543 {
                method,
                ..k.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }
}

#[test]
fn test_transaction_key() -> Result<()> {
    use rsip::headers::*;
    let register_req = rsip::message::Request {
        method: rsip::method::Method::Register,
        uri: rsip::Uri {
            scheme: Some(rsip::Scheme::Sips),
            host_with_port: rsip::Domain::from("example.com").into(),
            ..Default::default()
        },
        headers: vec![
            Via::new("SIP/2.0/TLS client.biloxi.example.com:5061;branch=z9hG4bKnashd92").into(),
            CSeq::new("2 REGISTER").into(),
            From::new("Bob <sips:bob@biloxi.example.com>;tag=ja743ks76zlflH").into(),
            CallId::new("1j9FpLxk3uxtm8tn@biloxi.example.com").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };
    let expected = |role| {
        TransactionKey::RFC3261(Rfc3261 {
            role,
            branch: "z9hG4bKnashd92".to_string(),
            method: Method::Register,
            cseq: 2,
            from_tag: Tag::new("ja743ks76zlflH"),
            call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
        })
    };

    let client_key = TransactionKey::from_request(&register_req, TransactionRole::Client)?;
    let server_key = TransactionKey::from_request(&register_req, TransactionRole::Server)?;
    assert_eq!(client_key, expected(TransactionRole::Client));
    assert_ne!(client_key, server_key);

    let register_resp = rsip::message::Response {
        status_code: rsip::StatusCode::OK,
        version: rsip::Version::V2,
        headers: register_req.headers.clone(),
        body: Default::default(),
    };
    let key = TransactionKey::from_response(&register_resp, TransactionRole::Client)?;
    assert_eq!(key, client_key);

    let mut ack_req = register_req.clone();
    ack_req.method = Method::Ack;
    ack_req.headers.unique_push(CSeq::new("2 ACK").into());
    let key = TransactionKey::from_request(&ack_req, TransactionRole::Server)?;
    assert_eq!(
        key,
        expected(TransactionRole::Server).with_method(Method::Invite)
    );

    let mut no_branch = register_req.clone();
    no_branch
        .headers
        .unique_push(Via::new("SIP/2.0/UDP 10.0.0.1:5060").into());
    assert!(matches!(
        TransactionKey::from_request(&no_branch, TransactionRole::Server)?,
        TransactionKey::RFC2543(_)
    ));
    Ok(())
}
