//! Session layer configuration.
//!
//! Options are resolved once by [`SessionConfigBuilder::build`]; the result
//! is immutable and shared by every request through an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use crate::crypto::{AesCbcCodec, Cipher, Decipher, HkdfKeyManager, KeyManager, Secret};
use crate::error::{Result, SessionError};

pub const DEFAULT_SESSION_NAME: &str = "session";
pub const DEFAULT_COOKIE_PATH: &str = "/";

/// Attributes applied to every issued session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: String,
    pub http_only: bool,
    /// Only used as a fallback for `expire_after`; never emitted as-is
    pub max_age: Option<Duration>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self { path: DEFAULT_COOKIE_PATH.to_string(), http_only: true, max_age: None }
    }
}

/// Resolved session configuration
#[derive(Clone)]
pub struct SessionConfig {
    /// Cookie name prefix; cookies are named `<name>.<key id>`
    pub name: String,
    /// Lifetime of an issued cookie, zero for browser-session cookies
    pub expire_after: Duration,
    /// Age after which a still valid cookie is re-issued
    pub refresh_after: Duration,
    /// Embed the expiry in the payload to reject replayed cookies
    pub timestamp: bool,
    pub cookie: CookieOptions,
    key_manager: Arc<dyn KeyManager>,
    cipher: Arc<dyn Cipher>,
    decipher: Arc<dyn Decipher>,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Configuration with defaults for everything but the secret.
    pub fn with_secret(secret: Secret) -> Result<Self> {
        Self::builder().secret(secret).build()
    }

    /// Load configuration from `SESSION_*` environment variables.
    ///
    /// `SESSION_SECRET` is required; it is decoded as base64 when possible.
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("SESSION_SECRET")
            .map_err(|_| SessionError::Configuration("SESSION_SECRET is not set".to_string()))?;

        let mut builder = Self::builder().secret(Secret::from_base64_or_raw(&secret));

        if let Ok(name) = std::env::var("SESSION_NAME") {
            builder = builder.name(name);
        }
        if let Some(ms) = env_parse::<u64>("SESSION_EXPIRE_AFTER_MS")? {
            builder = builder.expire_after(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("SESSION_REFRESH_AFTER_MS")? {
            builder = builder.refresh_after(Duration::from_millis(ms));
        }
        if let Some(enabled) = env_parse::<bool>("SESSION_TIMESTAMP")? {
            builder = builder.timestamp(enabled);
        }

        let mut cookie = CookieOptions::default();
        if let Ok(path) = std::env::var("SESSION_COOKIE_PATH") {
            cookie.path = path;
        }
        if let Some(http_only) = env_parse::<bool>("SESSION_COOKIE_HTTP_ONLY")? {
            cookie.http_only = http_only;
        }

        builder.cookie(cookie).build()
    }

    pub fn key_manager(&self) -> &Arc<dyn KeyManager> {
        &self.key_manager
    }

    pub fn cipher(&self) -> &Arc<dyn Cipher> {
        &self.cipher
    }

    pub fn decipher(&self) -> &Arc<dyn Decipher> {
        &self.decipher
    }

    /// Window before expiry in which a cookie is proactively re-issued.
    pub fn refresh_window_ms(&self) -> i64 {
        millis(self.expire_after) - millis(self.refresh_after)
    }

    pub fn expire_after_ms(&self) -> i64 {
        millis(self.expire_after)
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("name", &self.name)
            .field("expire_after", &self.expire_after)
            .field("refresh_after", &self.refresh_after)
            .field("timestamp", &self.timestamp)
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}

/// Builder resolving the session defaults
#[derive(Default)]
pub struct SessionConfigBuilder {
    secret: Option<Secret>,
    key_manager: Option<Arc<dyn KeyManager>>,
    cipher: Option<Arc<dyn Cipher>>,
    decipher: Option<Arc<dyn Decipher>>,
    name: Option<String>,
    expire_after: Option<Duration>,
    refresh_after: Option<Duration>,
    timestamp: Option<bool>,
    cookie: Option<CookieOptions>,
}

impl SessionConfigBuilder {
    pub fn secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Replace the HKDF key manager
    pub fn key_manager(mut self, key_manager: Arc<dyn KeyManager>) -> Self {
        self.key_manager = Some(key_manager);
        self
    }

    /// Custom encryption; requires a matching [`Self::decipher`]
    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Custom decryption; requires a matching [`Self::cipher`]
    pub fn decipher(mut self, decipher: Arc<dyn Decipher>) -> Self {
        self.decipher = Some(decipher);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = Some(expire_after);
        self
    }

    pub fn refresh_after(mut self, refresh_after: Duration) -> Self {
        self.refresh_after = Some(refresh_after);
        self
    }

    pub fn timestamp(mut self, enabled: bool) -> Self {
        self.timestamp = Some(enabled);
        self
    }

    pub fn cookie(mut self, cookie: CookieOptions) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let (cipher, decipher): (Arc<dyn Cipher>, Arc<dyn Decipher>) =
            match (self.cipher, self.decipher) {
                (Some(cipher), Some(decipher)) => (cipher, decipher),
                (None, None) => (Arc::new(AesCbcCodec::new()), Arc::new(AesCbcCodec::new())),
                _ => {
                    return Err(SessionError::Configuration(
                        "cipher and decipher must be specified together".to_string(),
                    ))
                }
            };

        let key_manager: Arc<dyn KeyManager> = match (self.key_manager, self.secret) {
            (Some(key_manager), _) => key_manager,
            (None, Some(secret)) if !secret.is_empty() => Arc::new(HkdfKeyManager::new(secret)),
            (None, _) => {
                return Err(SessionError::Configuration(
                    "a non-empty secret or a key manager is required".to_string(),
                ))
            }
        };

        let mut cookie = self.cookie.unwrap_or_default();
        let expire_after = self.expire_after.or(cookie.max_age).unwrap_or(Duration::ZERO);
        cookie.max_age = None;
        if cookie.path.is_empty() {
            cookie.path = DEFAULT_COOKIE_PATH.to_string();
        }

        let timestamp = !expire_after.is_zero() && self.timestamp.unwrap_or(true);
        let refresh_after = self.refresh_after.unwrap_or(expire_after / 2);
        check_lifetime("expire_after", expire_after)?;
        check_lifetime("refresh_after", refresh_after)?;

        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_SESSION_NAME.to_string(),
        };
        if !is_cookie_token(&name) {
            return Err(SessionError::Configuration(format!(
                "session name {name:?} is not a valid cookie name"
            )));
        }

        Ok(SessionConfig {
            name,
            expire_after,
            refresh_after,
            timestamp,
            cookie,
            key_manager,
            cipher,
            decipher,
        })
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SessionError::Configuration(format!("invalid {var}: {value}"))),
        Err(_) => Ok(None),
    }
}

/// A lifetime must be representable as an instant after now.
fn check_lifetime(field: &str, duration: Duration) -> Result<()> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .map(|_| ())
        .ok_or_else(|| SessionError::Configuration(format!("{field} of {duration:?} is out of range")))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn is_cookie_token(name: &str) -> bool {
    name.bytes().all(|b| {
        b.is_ascii_graphic() && !matches!(b, b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';'
            | b':' | b'\\' | b'"' | b'/' | b'[' | b']' | b'?' | b'=' | b'{' | b'}')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Secret {
        Secret::from_bytes(b"config-test-secret".to_vec())
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::with_secret(secret()).unwrap();
        assert_eq!(config.name, "session");
        assert_eq!(config.expire_after, Duration::ZERO);
        assert_eq!(config.refresh_after, Duration::ZERO);
        assert!(!config.timestamp);
        assert_eq!(config.cookie.path, "/");
        assert!(config.cookie.http_only);
    }

    #[test]
    fn test_expire_after_enables_timestamp_and_half_refresh() {
        let config = SessionConfig::builder()
            .secret(secret())
            .expire_after(Duration::from_secs(3600))
            .build()
            .unwrap();
        assert!(config.timestamp);
        assert_eq!(config.refresh_after, Duration::from_secs(1800));
        assert_eq!(config.refresh_window_ms(), 1_800_000);
    }

    #[test]
    fn test_timestamp_forced_off_without_expiry() {
        let config = SessionConfig::builder().secret(secret()).timestamp(true).build().unwrap();
        assert!(!config.timestamp);

        let config = SessionConfig::builder()
            .secret(secret())
            .expire_after(Duration::from_secs(60))
            .timestamp(false)
            .build()
            .unwrap();
        assert!(!config.timestamp);
    }

    #[test]
    fn test_cookie_max_age_becomes_expire_after() {
        let config = SessionConfig::builder()
            .secret(secret())
            .cookie(CookieOptions {
                path: String::new(),
                http_only: false,
                max_age: Some(Duration::from_secs(120)),
            })
            .build()
            .unwrap();
        assert_eq!(config.expire_after, Duration::from_secs(120));
        assert_eq!(config.cookie.max_age, None);
        assert_eq!(config.cookie.path, "/");
        assert!(!config.cookie.http_only);
    }

    #[test]
    fn test_cipher_requires_decipher() {
        let err = SessionConfig::builder()
            .secret(secret())
            .cipher(Arc::new(AesCbcCodec::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));

        let err = SessionConfig::builder()
            .secret(secret())
            .decipher(Arc::new(AesCbcCodec::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));

        assert!(SessionConfig::builder()
            .secret(secret())
            .cipher(Arc::new(AesCbcCodec::new()))
            .decipher(Arc::new(AesCbcCodec::new()))
            .build()
            .is_ok());
    }

    #[test]
    fn test_secret_or_key_manager_required() {
        assert!(matches!(
            SessionConfig::builder().build(),
            Err(SessionError::Configuration(_))
        ));
        assert!(SessionConfig::builder()
            .key_manager(Arc::new(HkdfKeyManager::new(secret())))
            .build()
            .is_ok());
    }

    #[test]
    fn test_unrepresentable_lifetime_rejected() {
        let err = SessionConfig::builder()
            .secret(secret())
            .expire_after(Duration::from_millis(u64::MAX))
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(ref msg) if msg.contains("expire_after")));

        let err = SessionConfig::builder()
            .secret(secret())
            .expire_after(Duration::from_secs(60))
            .refresh_after(Duration::from_secs(u64::MAX))
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(ref msg) if msg.contains("refresh_after")));

        // Ten years is fine
        assert!(SessionConfig::builder()
            .secret(secret())
            .expire_after(Duration::from_secs(10 * 365 * 24 * 3600))
            .build()
            .is_ok());
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(SessionConfig::builder().secret(secret()).name("my;session").build().is_err());
        assert_eq!(
            SessionConfig::builder().secret(secret()).name("").build().unwrap().name,
            "session"
        );
        assert!(SessionConfig::builder().secret(secret()).name("app.sid").build().is_ok());
    }
}
