use crate::{
    transaction::{make_via_branch, random_text, Transaction},
    Error, Result,
};
use rsip::{
    headers::auth::AuthQop,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    services::DigestGenerator,
    typed::{Authorization, ProxyAuthorization},
    Header, Param, Response, StatusCode,
};
use tracing::debug;

const CNONCE_LEN: usize = 8;

/// What we present when a server or proxy challenges us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Answer only challenges from this realm when set.
    pub realm: Option<String>,
}

/// Builds the retry for a 401/407: same request, new branch, CSeq `new_seq`,
/// and a digest answer to the challenge. The returned transaction is not
/// sent yet.
pub fn handle_client_authenticate(
    new_seq: u32,
    tx: &Transaction,
    resp: &Response,
    cred: &Credential,
) -> Result<Transaction> {
    let proxy = resp.status_code == StatusCode::ProxyAuthenticationRequired;
    let challenge = match proxy {
        true => resp
            .headers
            .iter()
            .find_map(|h| match h {
                Header::ProxyAuthenticate(h) => Some(h.value().to_string()),
                _ => None,
            })
            .map(|value| rsip::headers::WwwAuthenticate::new(value).typed()),
        false => resp.www_authenticate_header().map(|h| h.typed()),
    };
    let challenge = challenge
        .ok_or_else(|| {
            Error::TransactionError(
                format!("{} without a challenge", resp.status_code),
                tx.key.clone(),
            )
        })??;

    if let Some(realm) = &cred.realm {
        if realm != &challenge.realm {
            return Err(Error::TransactionError(
                format!("no credential for realm {}", challenge.realm),
                tx.key.clone(),
            ));
        }
    }

    let mut request = tx.original.clone();
    request.cseq_header_mut()?.mut_seq(new_seq)?;

    let mut via = request.via_header()?.typed()?;
    via.params.retain(|p| !matches!(p, Param::Branch(_)));
    via.params.push(make_via_branch());
    request.headers.unique_push(Header::Via(via.into()));

    let qop = challenge.qop.as_ref().map(|_| AuthQop::Auth {
        cnonce: random_text(CNONCE_LEN),
        nc: 1,
    });
    let generator = DigestGenerator {
        username: cred.username.as_str(),
        password: cred.password.as_str(),
        algorithm: challenge.algorithm.unwrap_or_default(),
        nonce: challenge.nonce.as_str(),
        method: &request.method,
        qop: qop.as_ref(),
        uri: &request.uri,
        realm: challenge.realm.as_str(),
    };
    let auth = Authorization {
        scheme: challenge.scheme,
        username: cred.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: request.uri.clone(),
        response: generator.compute(),
        algorithm: challenge.algorithm,
        opaque: challenge.opaque,
        qop,
    };

    request
        .headers
        .retain(|h| !matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_)));
    if proxy {
        request
            .headers
            .push(Header::ProxyAuthorization(ProxyAuthorization(auth).into()));
    } else {
        request.headers.push(Header::Authorization(auth.into()));
    }
    debug!(key = %tx.key, realm = %challenge.realm, new_seq, "answering challenge");

    Transaction::new_client(request, tx.endpoint_inner.clone(), tx.connection.clone())
}
