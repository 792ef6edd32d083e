use super::{
    dialog::{Dialog, DialogInner, DialogStateSender},
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_tag, Transaction,
    },
    Error, Result,
};
use parking_lot::RwLock;
use rsip::{Request, StatusCode};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{debug, info};

pub struct DialogLayerInner {
    pub(super) last_seq: AtomicU32,
    pub(super) dialogs: RwLock<HashMap<DialogId, Dialog>>,
    // early id of a client dialog -> id once the remote tag is known
    pub(super) aliases: RwLock<HashMap<DialogId, DialogId>>,
    // ids removed within the last 64*T1, with their INVITE transaction
    pub(super) finished: RwLock<HashMap<DialogId, (TransactionKey, Instant)>>,
}
pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

impl DialogLayerInner {
    pub(super) fn insert(&self, dialog: Dialog) {
        let id = dialog.id();
        debug!(%id, "dialog registered");
        self.dialogs.write().insert(id, dialog);
    }

    /// Moves a dialog whose remote tag just became known.
    pub(super) fn rekey(&self, old: &DialogId, new: &DialogId) {
        if old == new {
            return;
        }
        let mut dialogs = self.dialogs.write();
        if let Some(dialog) = dialogs.remove(old) {
            debug!(%old, %new, "dialog rekeyed");
            dialogs.insert(new.clone(), dialog);
            self.aliases.write().insert(old.clone(), new.clone());
        }
    }
}

/// Every live dialog of the user agent, by id.
#[derive(Clone)]
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        Self {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                last_seq: AtomicU32::new(0),
                dialogs: RwLock::new(HashMap::new()),
                aliases: RwLock::new(HashMap::new()),
                finished: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dialogs.read().is_empty()
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Looks a dialog up by its current id, or by the early id a client
    /// dialog had before the remote tag was known.
    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.inner.dialogs.read();
        if let Some(dialog) = dialogs.get(id) {
            return Some(dialog.clone());
        }
        let current = self.inner.aliases.read().get(id).cloned()?;
        dialogs.get(&current).cloned()
    }

    pub fn all_dialogs(&self) -> Vec<Dialog> {
        self.inner.dialogs.read().values().cloned().collect()
    }

    /// Dialog an inbound request belongs to. The To tag of a request we
    /// receive is always our tag, whichever side created the dialog.
    pub fn match_dialog(&self, req: &Request) -> Option<Dialog> {
        let id = DialogId::from_request(req, TransactionRole::Server).ok()?;
        if id.local_tag.is_empty() {
            return None;
        }
        self.get_dialog(&id)
    }

    pub fn remove_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let removed = self.inner.dialogs.write().remove(id);
        let mut ids = vec![id.clone()];
        self.inner.aliases.write().retain(|early, current| {
            if early != id && current != id {
                return true;
            }
            ids.push(early.clone());
            false
        });
        if let Some(dialog) = &removed {
            info!(%id, "dialog removed");
            if let Some(key) = dialog.inner().transaction_key() {
                let now = Instant::now();
                let linger = self.endpoint.option.t1 * 64;
                let mut finished = self.inner.finished.write();
                finished.retain(|_, (_, at)| now.duration_since(*at) < linger);
                for id in ids {
                    finished.insert(id, (key.clone(), now));
                }
            }
        }
        removed
    }

    /// INVITE transaction of a dialog that ended less than 64*T1 ago.
    pub fn finished_key(&self, id: &DialogId) -> Option<TransactionKey> {
        let linger = self.endpoint.option.t1 * 64;
        self.inner
            .finished
            .read()
            .get(id)
            .filter(|(_, at)| at.elapsed() < linger)
            .map(|(key, _)| key.clone())
    }

    /// Creates the Early server dialog for a new INVITE, choosing our tag.
    /// An INVITE reusing the Call-ID and From tag of a live dialog without
    /// naming it is refused with 482.
    pub async fn create_server_invite(
        &self,
        tx: &mut Transaction,
        state_sender: DialogStateSender,
        contact: Option<rsip::Uri>,
    ) -> Result<ServerInviteDialog> {
        let mut id = DialogId::from_request(&tx.original, TransactionRole::Server)?;
        let clash = self
            .inner
            .dialogs
            .read()
            .keys()
            .any(|known| known.call_id == id.call_id && known.remote_tag == id.remote_tag);
        if clash {
            info!(call_id = %id.call_id, "INVITE merges with a live dialog");
            tx.reply(StatusCode::LoopDetected).await?;
            return Err(Error::ProtocolViolation(format!(
                "dialog already exists for call {}",
                id.call_id
            )));
        }
        id.local_tag = make_tag().to_string();

        let inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            state_sender,
            None,
            contact,
        )?;
        *inner.invite_key.lock() = Some(tx.key.clone());
        let dialog = ServerInviteDialog {
            inner: Arc::new(inner),
        };
        self.inner.insert(Dialog::ServerInvite(dialog.clone()));
        info!(%id, "server invite dialog created");
        Ok(dialog)
    }
}
