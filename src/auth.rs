//! HTTP Basic authentication against URL-prefix realms.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use crate::http::Request;
use crate::syscalls;

/// Password-checking capability. The production verifier compares against a
/// stored secret; tests swap in fixtures.
pub trait Verifier: Send + Sync {
    fn check(&self, plaintext: &str) -> bool;
}

/// Verifies against a stored secret: either the plaintext itself matches,
/// or crypt(3) of the candidate under the secret-as-salt reproduces it.
/// Both comparisons are always attempted; either one grants access.
pub struct StoredVerifier {
    secret: String,
}

impl StoredVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Verifier for StoredVerifier {
    fn check(&self, plaintext: &str) -> bool {
        if self.secret == plaintext {
            return true;
        }
        match syscalls::crypt_hash(plaintext, &self.secret) {
            Some(hashed) => hashed == self.secret,
            None => false,
        }
    }
}

/// An authentication scope: a URL prefix, one user, and the credential
/// verifier guarding it.
pub struct AuthRealm {
    pub path: String,
    pub user: String,
    pub verifier: Box<dyn Verifier>,
}

/// Registers a realm. A password of the form `$p$account` resolves the
/// stored hash of that system account (shadow database first, passwd as the
/// fallback); anything else is stored verbatim. Returns false, without
/// registering, when no verifier can be materialized.
pub fn realm_add(realms: &mut Vec<AuthRealm>, path: &str, user: &str, pass: &str) -> bool {
    let secret = match pass.strip_prefix("$p$") {
        Some(account) => match syscalls::system_password(account) {
            Some(hash) => hash,
            None => {
                warn!(path, user, account, "no system password entry; realm not registered");
                return false;
            }
        },
        None => pass.to_string(),
    };

    realms.push(AuthRealm {
        path: path.to_string(),
        user: user.to_string(),
        verifier: Box::new(StoredVerifier::new(secret)),
    });
    true
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Not protected, or valid credentials; carries the index of the realm
    /// that matched, when one did.
    Granted(Option<usize>),
    /// Protected and the credentials are missing, undecodable, or wrong.
    Denied,
}

/// Gates a resolved path. The first realm (insertion order) whose path is a
/// case-insensitive prefix of `name` protects the request; the credential
/// rescan then requires a realm matching both path and user.
pub fn check(req: &Request, realms: &[AuthRealm], name: &[u8]) -> AuthOutcome {
    if !realms.iter().any(|r| prefix_match(r.path.as_bytes(), name)) {
        return AuthOutcome::Granted(None);
    }

    let Some((user, pass)) = basic_credentials(req) else {
        return AuthOutcome::Denied;
    };

    let granted = realms.iter().position(|r| {
        prefix_match(r.path.as_bytes(), name) && r.user == user && r.verifier.check(&pass)
    });
    match granted {
        Some(idx) => AuthOutcome::Granted(Some(idx)),
        None => AuthOutcome::Denied,
    }
}

/// Pulls `user:pass` out of an `Authorization: Basic` header. The header
/// name is matched case-insensitively, the scheme case-sensitively.
fn basic_credentials(req: &Request) -> Option<(String, String)> {
    let value = req.header("Authorization")?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn prefix_match(prefix: &[u8], name: &[u8]) -> bool {
    name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix)
}
