//! Cookie attributes, `Set-Cookie` formatting and request cookie parsing.

use base64::{
    alphabet,
    engine::{general_purpose::URL_SAFE_NO_PAD, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use chrono::{DateTime, TimeDelta, Utc};

use crate::config::CookieOptions;
use crate::error::{Result, SessionError};

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const EXPIRED: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

/// Emission attributes of the session cookie.
///
/// `max_age` is derived from `expires` on every read and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieAttributes {
    pub path: String,
    pub http_only: bool,
    pub expires: Option<DateTime<Utc>>,
}

impl CookieAttributes {
    pub fn from_options(options: &CookieOptions) -> Self {
        Self { path: options.path.clone(), http_only: options.http_only, expires: None }
    }

    /// Time left until expiry; zero for browser-session cookies.
    pub fn max_age(&self) -> TimeDelta {
        self.expires.map(|expires| expires - Utc::now()).unwrap_or_else(TimeDelta::zero)
    }

    pub fn set_max_age(&mut self, age: TimeDelta) {
        self.expires = Some(Utc::now() + age);
    }

    /// `Set-Cookie` value carrying `value` under `name`.
    pub fn to_header(&self, name: &str, value: &str) -> String {
        let mut header = format!("{}={}; Path={}", name, value, self.path);
        if let Some(expires) = self.expires {
            header.push_str("; Expires=");
            header.push_str(&http_date(expires));
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }
}

/// `Set-Cookie` value instructing the client to drop `name`.
pub fn deletion_header(name: &str, path: &str) -> String {
    format!("{}=; Path={}; Expires={}", name, path, EXPIRED)
}

/// IMF-fixdate as used by the `Expires` attribute.
pub fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn encode_value(envelope: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(envelope)
}

/// Decode a cookie value in either base64 alphabet, padded or not.
pub fn decode_value(value: &str) -> Result<Vec<u8>> {
    let engine = if value.contains(['+', '/']) { &STANDARD_LENIENT } else { &URL_SAFE_LENIENT };
    engine
        .decode(value)
        .map_err(|e| SessionError::Decryption(format!("cookie value is not base64: {e}")))
}

/// Parse `Cookie` header values into `(name, value)` pairs in request order.
///
/// The first occurrence of a name wins; surrounding double quotes are
/// stripped from values.
pub fn parse_cookie_pairs<'a>(headers: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for header in headers {
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() || pairs.iter().any(|(seen, _)| seen == name) {
                continue;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            pairs.push((name.to_string(), value.to_string()));
        }
    }
    pairs
}
