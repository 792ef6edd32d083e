use crate::{dialog::authenticate::Credential, Error, Result};

/// Digest credentials for one realm. A username left empty means the
/// trunk does not challenge and nothing is answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub realm: String,
    pub username: String,
    pub password: String,
}

/// Who we are when placing a call.
#[derive(Debug, Clone)]
pub struct Profile {
    pub display_name: Option<String>,
    pub aor: rsip::Uri,
    pub auth: Option<AuthInfo>,
    /// Offered as Session-Expires, in seconds; 0 leaves the header out.
    pub expires: u32,
}

impl Profile {
    /// `aor` may omit the scheme, `alice@example.com` reads as
    /// `sip:alice@example.com`.
    pub fn new(
        aor: &str,
        display_name: Option<&str>,
        auth: Option<AuthInfo>,
        expires: u32,
    ) -> Result<Self> {
        let aor = match aor.starts_with("sip:") || aor.starts_with("sips:") {
            true => aor.to_string(),
            false => format!("sip:{}", aor),
        };
        let aor = rsip::Uri::try_from(aor.as_str())
            .map_err(|e| Error::InvalidTarget(format!("bad address of record {}: {}", aor, e)))?;
        Ok(Profile {
            display_name: display_name.map(str::to_string),
            aor,
            auth,
            expires,
        })
    }

    pub fn user(&self) -> Option<String> {
        self.aor.auth.as_ref().map(|auth| auth.user.clone())
    }

    pub fn credential(&self) -> Option<Credential> {
        let auth = self.auth.as_ref()?;
        if auth.username.is_empty() {
            return None;
        }
        Some(Credential {
            username: auth.username.clone(),
            password: auth.password.clone(),
            realm: match auth.realm.is_empty() {
                true => None,
                false => Some(auth.realm.clone()),
            },
        })
    }

    pub fn session_expires(&self) -> Option<u32> {
        (self.expires > 0).then_some(self.expires)
    }
}
