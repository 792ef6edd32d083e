use super::{
    authenticate::Credential,
    client_dialog::ClientInviteDialog,
    dialog::{local_contact_header, DialogInner, DialogStateSender},
    dialog_layer::DialogLayer,
    DialogId,
};
use crate::{
    transaction::{key::TransactionRole, make_tag, Transaction},
    Result,
};
use rsip::{Header, Request};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to place one call.
#[derive(Default, Clone)]
pub struct InviteOption {
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub display_name: Option<String>,
    pub contact: rsip::Uri,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub credential: Option<Credential>,
    /// Copied onto the INVITE as they are, except Content-Type when there
    /// is an offer and Session-Expires when `session_expires` is set.
    pub headers: Vec<Header>,
    pub session_expires: Option<u32>,
}

impl DialogLayer {
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let from = rsip::typed::From {
            display_name: opt.display_name.clone(),
            uri: opt.caller.clone(),
            params: vec![],
        }
        .with_tag(make_tag());
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(
            rsip::Method::Invite,
            opt.callee.clone(),
            via,
            from,
            to,
            last_seq,
        );

        request.headers.push(local_contact_header(&opt.contact));
        if let Some(expires) = opt.session_expires {
            request
                .headers
                .push(Header::Other("Session-Expires".into(), expires.to_string()));
        }
        for header in &opt.headers {
            if builder_owns(opt, header) {
                warn!(%header, "dropping caller header the INVITE already carries");
                continue;
            }
            request.headers.push(header.clone());
        }
        let body = opt.offer.clone().unwrap_or_default();
        if opt.offer.is_some() {
            request.headers.push(Header::ContentType(
                opt.content_type
                    .clone()
                    .unwrap_or_else(|| "application/sdp".to_string())
                    .into(),
            ));
        }
        request
            .headers
            .push(Header::ContentLength((body.len() as u32).into()));
        request.body = body;
        Ok(request)
    }

    /// Builds the INVITE and its Early dialog without sending anything.
    /// The dialog is registered under its early id.
    pub fn create_client_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let request = self.make_invite_request(&opt)?;
        let id = DialogId::from_request(&request, TransactionRole::Client)?;
        let inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            opt.credential,
            Some(opt.contact),
        )?;
        let tx = Transaction::new_client(request, self.endpoint.clone(), None)?;
        let dialog = ClientInviteDialog {
            inner: Arc::new(inner),
            layer: self.inner.clone(),
            cancel_requested: Default::default(),
        };
        self.inner
            .insert(super::dialog::Dialog::ClientInvite(dialog.clone()));
        info!(%id, "client invite dialog created");
        Ok((dialog, tx))
    }

    /// Places the call and waits for it to be answered or refused.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<ClientInviteDialog> {
        let (dialog, tx) = self.create_client_invite(opt, state_sender)?;
        dialog.process_invite(tx).await?;
        Ok(dialog)
    }
}

// headers make_invite_request writes itself
fn builder_owns(opt: &InviteOption, header: &Header) -> bool {
    match header {
        Header::ContentType(_) => opt.offer.is_some(),
        Header::Other(name, _) => {
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "content-type" | "c" => opt.offer.is_some(),
                "session-expires" | "x" => opt.session_expires.is_some(),
                _ => false,
            }
        }
        _ => false,
    }
}
