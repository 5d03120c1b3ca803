//! Time-based one-time passwords (RFC 6238, HMAC-SHA1, 30 s step, 6 digits).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::env::EnvSource;
use crate::error::ConfigError;

type HmacSha1 = Hmac<Sha1>;

pub const TIME_STEP_SECS: u64 = 30;
pub const DIGITS: u32 = 6;

/// Generates codes for one shared secret.
#[derive(Clone)]
pub struct TotpGenerator {
    mac: HmacSha1,
}

impl fmt::Debug for TotpGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpGenerator").finish_non_exhaustive()
    }
}

impl TotpGenerator {
    /// Key from raw secret bytes.
    pub fn new(secret: &[u8]) -> Result<Self, String> {
        if secret.is_empty() {
            return Err("secret is empty".to_string());
        }
        let mac = HmacSha1::new_from_slice(secret).map_err(|e| e.to_string())?;
        Ok(Self { mac })
    }

    /// Key from a base32 secret as shown by authenticator enrolment screens.
    pub fn from_base32(secret: &str) -> Result<Self, String> {
        Self::new(&decode_base32(secret)?)
    }

    /// Read the base32 secret from `var`.
    pub fn from_env(env: &dyn EnvSource, role: &str, var: &str) -> Result<Self, ConfigError> {
        let secret = env
            .non_empty(var)
            .ok_or_else(|| ConfigError::MissingEnvVar {
                role: role.to_string(),
                field: "totpSecretEnv".to_string(),
                var: var.to_string(),
            })?;
        Self::from_base32(&secret).map_err(|reason| ConfigError::InvalidTotpSecret {
            var: var.to_string(),
            reason,
        })
    }

    /// Code for an explicit counter value.
    #[must_use]
    pub fn code_for_step(&self, step: u64) -> String {
        let mut mac = self.mac.clone();
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation, RFC 4226 section 5.3.
        let offset = usize::from(digest[digest.len() - 1] & 0x0f);
        let binary = (u32::from(digest[offset]) & 0x7f) << 24
            | u32::from(digest[offset + 1]) << 16
            | u32::from(digest[offset + 2]) << 8
            | u32::from(digest[offset + 3]);
        format!(
            "{:0width$}",
            binary % 10_u32.pow(DIGITS),
            width = DIGITS as usize
        )
    }

    #[must_use]
    pub fn code_at(&self, unix_secs: u64) -> String {
        self.code_for_step(unix_secs / TIME_STEP_SECS)
    }

    #[must_use]
    pub fn current_code(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.code_at(now)
    }
}

/// RFC 4648 base32. Case-insensitive; spaces, hyphens and `=` are ignored.
pub fn decode_base32(input: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    let mut seen = 0usize;

    for c in input.chars() {
        let value = match c.to_ascii_uppercase() {
            ' ' | '-' | '=' => continue,
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => c as u32 - '2' as u32 + 26,
            other => return Err(format!("invalid character '{other}'")),
        };
        seen += 1;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if seen == 0 {
        return Err("secret is empty".to_string());
    }
    if out.is_empty() {
        return Err("secret is too short".to_string());
    }
    Ok(out)
}
