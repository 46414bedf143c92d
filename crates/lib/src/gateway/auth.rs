//! Operator authentication for `verify.send`: the operator frontend passes
//! `auth_key = hex(HMAC-SHA256(app_secret, "<app_id>_<user_id>"))`.

use anyhow::{anyhow, bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

fn operator_payload(app_id: &str, user_id: &str) -> String {
    format!("{}_{}", app_id, user_id)
}

/// Hex digest an operator must present as `auth_key`.
pub fn operator_hash(app_secret: &str, app_id: &str, user_id: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes())
        .context("failed to initialize operator hmac")?;
    mac.update(operator_payload(app_id, user_id).as_bytes());
    Ok(mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Check `auth_key` against the expected digest in constant time.
pub fn verify_operator(app_secret: &str, app_id: &str, user_id: &str, auth_key: &str) -> Result<()> {
    let provided = decode_hex(auth_key)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes())
        .context("failed to initialize operator hmac")?;
    mac.update(operator_payload(app_id, user_id).as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| anyhow!("operator hash mismatch"))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("auth key cannot be empty");
    }
    if trimmed.len() % 2 != 0 {
        bail!("auth key must have an even number of hex characters");
    }
    (0..trimmed.len())
        .step_by(2)
        .map(|i| {
            let chunk = trimmed
                .get(i..i + 2)
                .ok_or_else(|| anyhow!("auth key is not ascii hex"))?;
            u8::from_str_radix(chunk, 16)
                .with_context(|| format!("invalid hex byte '{}' in auth key", chunk))
        })
        .collect()
}
