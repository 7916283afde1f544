//! Admin authentication: salted password file + bearer JWTs.
//!
//! The admin password lives in `.admin_password` as `salt$hex_hash`
//! (SHA-256 over salt ‖ password), owner-only on POSIX. When no file
//! exists the default password is `admin`; `EMBEDDER_ADMIN_PASSWORD`
//! overrides verification entirely. Successful Basic authentication mints
//! an HS256 JWT (24 h expiry) that later requests can present as a Bearer
//! token. The signing secret comes from `EMBEDDER_JWT_SECRET` or is
//! generated once per process.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64URL};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

const PASSWORD_FILE: &str = ".admin_password";
const DEFAULT_PASSWORD: &str = "admin";
const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

type HmacSha256 = Hmac<Sha256>;

/// Credential as extracted from an `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Basic,
    Bearer,
}

pub struct AdminAuth {
    password_file: PathBuf,
    jwt_secret: Vec<u8>,
}

impl AdminAuth {
    pub fn new() -> Self {
        let jwt_secret = match std::env::var("EMBEDDER_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret.into_bytes(),
            _ => {
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        Self {
            password_file: PathBuf::from(PASSWORD_FILE),
            jwt_secret,
        }
    }

    #[cfg(test)]
    fn with_file(path: PathBuf) -> Self {
        let mut auth = Self::new();
        auth.password_file = path;
        auth
    }

    /// True while no custom password has been stored.
    pub fn is_default_password(&self) -> bool {
        !self.password_file.exists()
    }

    /// Unix mtime of the password file, 0 when absent.
    pub fn file_last_modified(&self) -> i64 {
        std::fs::metadata(&self.password_file)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Store a new password as `salt$hex_hash`, owner-only on POSIX.
    pub fn set_password(&self, password: &str) -> Result<()> {
        if password.len() < 8 {
            bail!("Password must be at least 8 characters");
        }
        if password == DEFAULT_PASSWORD {
            bail!("Cannot use '{}' as password", DEFAULT_PASSWORD);
        }
        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex(&salt_bytes);
        let entry = format!("{}${}", salt, hash_password(&salt, password));
        std::fs::write(&self.password_file, entry)
            .with_context(|| format!("Failed to write {}", self.password_file.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.password_file,
                std::fs::Permissions::from_mode(0o600),
            )?;
        }
        Ok(())
    }

    /// Verify a plaintext password against the stored (or default) one.
    pub fn verify_password(&self, password: &str) -> bool {
        if let Ok(env_password) = std::env::var("EMBEDDER_ADMIN_PASSWORD") {
            if !env_password.is_empty() {
                return constant_eq(password.as_bytes(), env_password.as_bytes());
            }
        }
        match std::fs::read_to_string(&self.password_file) {
            Ok(entry) => {
                let Some((salt, stored_hash)) = entry.trim().split_once('$') else {
                    return false;
                };
                constant_eq(
                    hash_password(salt, password).as_bytes(),
                    stored_hash.as_bytes(),
                )
            }
            Err(_) => constant_eq(password.as_bytes(), DEFAULT_PASSWORD.as_bytes()),
        }
    }

    /// Authenticate a credential. Basic credentials verify the password and
    /// mint a fresh JWT; Bearer credentials verify an existing JWT.
    /// Returns the token on success.
    pub fn authenticate(&self, secret: &str, scheme: Scheme) -> Option<String> {
        match scheme {
            Scheme::Basic => {
                if self.verify_password(secret) {
                    Some(self.mint_token())
                } else {
                    None
                }
            }
            Scheme::Bearer => {
                if self.verify_token(secret) {
                    Some(secret.to_string())
                } else {
                    None
                }
            }
        }
    }

    fn mint_token(&self) -> String {
        let now = chrono::Utc::now().timestamp();
        let header = B64URL.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = B64URL.encode(
            serde_json::json!({
                "sub": "admin",
                "iat": now,
                "exp": now + TOKEN_TTL_SECS,
            })
            .to_string(),
        );
        let signature = self.sign(&format!("{}.{}", header, payload));
        format!("{}.{}.{}", header, payload, signature)
    }

    fn verify_token(&self, token: &str) -> bool {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let expected = self.sign(&format!("{}.{}", header, payload));
        if !constant_eq(expected.as_bytes(), signature.as_bytes()) {
            return false;
        }
        let Ok(payload_bytes) = B64URL.decode(payload) else {
            return false;
        };
        let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&payload_bytes) else {
            return false;
        };
        claims
            .get("exp")
            .and_then(|e| e.as_i64())
            .map(|exp| exp > chrono::Utc::now().timestamp())
            .unwrap_or(false)
    }

    fn sign(&self, input: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.jwt_secret).expect("HMAC accepts any key length");
        mac.update(input.as_bytes());
        B64URL.encode(mac.finalize().into_bytes())
    }
}

impl Default for AdminAuth {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract `(secret, scheme)` from an `Authorization` header value. For
/// Basic, the secret is the password part after the first colon.
pub fn extract_credential(header: &str) -> Option<(String, Scheme)> {
    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = B64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_, password) = decoded.split_once(':')?;
        Some((password.to_string(), Scheme::Basic))
    } else if let Some(token) = header.strip_prefix("Bearer ") {
        Some((token.trim().to_string(), Scheme::Bearer))
    } else {
        None
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn constant_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_auth() -> (tempfile::TempDir, AdminAuth) {
        let tmp = tempfile::tempdir().unwrap();
        let auth = AdminAuth::with_file(tmp.path().join(".admin_password"));
        (tmp, auth)
    }

    #[test]
    fn default_password_accepted_until_set() {
        let (_tmp, auth) = scratch_auth();
        assert!(auth.is_default_password());
        assert!(auth.verify_password("admin"));
        assert!(!auth.verify_password("wrong"));
    }

    #[test]
    fn set_password_replaces_default() {
        let (_tmp, auth) = scratch_auth();
        auth.set_password("correct horse battery").unwrap();
        assert!(!auth.is_default_password());
        assert!(auth.verify_password("correct horse battery"));
        assert!(!auth.verify_password("admin"));
    }

    #[test]
    fn weak_passwords_rejected() {
        let (_tmp, auth) = scratch_auth();
        assert!(auth.set_password("short").is_err());
        assert!(auth.set_password("admin").is_err());
    }

    #[test]
    fn password_file_format() {
        let (_tmp, auth) = scratch_auth();
        auth.set_password("some password").unwrap();
        let entry = std::fs::read_to_string(&auth.password_file).unwrap();
        let (salt, hash) = entry.split_once('$').unwrap();
        assert_eq!(salt.len(), 32);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn basic_auth_mints_valid_bearer_token() {
        let (_tmp, auth) = scratch_auth();
        let token = auth.authenticate("admin", Scheme::Basic).unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert!(auth.authenticate(&token, Scheme::Bearer).is_some());
        assert!(auth.authenticate("not.a.token", Scheme::Bearer).is_none());
    }

    #[test]
    fn tampered_token_rejected() {
        let (_tmp, auth) = scratch_auth();
        let token = auth.authenticate("admin", Scheme::Basic).unwrap();
        let tampered = format!("{}x", token);
        assert!(auth.authenticate(&tampered, Scheme::Bearer).is_none());
    }

    #[test]
    fn extract_credential_schemes() {
        let basic = B64.encode("admin:secretpw");
        let (secret, scheme) = extract_credential(&format!("Basic {}", basic)).unwrap();
        assert_eq!(secret, "secretpw");
        assert_eq!(scheme, Scheme::Basic);

        let (token, scheme) = extract_credential("Bearer abc.def.ghi").unwrap();
        assert_eq!(token, "abc.def.ghi");
        assert_eq!(scheme, Scheme::Bearer);

        assert!(extract_credential("Digest xyz").is_none());
    }
}
