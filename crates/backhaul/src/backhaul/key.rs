//! Shared-key credentials.
//!
//! The broker is configured with a plain key. Clients may present either the
//! key itself or a generated credential derived from it, optionally carrying
//! an expiry date. A credential is the URL-safe base64 of
//! `seed|expiry|tag`, where `tag` authenticates the first two fields with an
//! HMAC-SHA256 keyed by the seed.

use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Local, NaiveDate};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const EXPIRY_FORMAT: &str = "%Y-%m-%d";

/// Build a credential for `seed`, optionally expiring at the end of the
/// given `YYYY-MM-DD` day.
pub fn generate(seed: &str, expiry: Option<&str>) -> anyhow::Result<String> {
    let seed = seed.trim();
    if seed.is_empty() {
        anyhow::bail!("key: empty seed");
    }
    if seed.contains('|') {
        anyhow::bail!("key: seed must not contain '|'");
    }

    let expiry = expiry.unwrap_or("").trim();
    if !expiry.is_empty() {
        NaiveDate::parse_from_str(expiry, EXPIRY_FORMAT)
            .with_context(|| format!("key: bad expiry {expiry:?} (expected YYYY-MM-DD)"))?;
    }

    let tag = tag_hex(seed, expiry);
    let raw = format!("{seed}|{expiry}|{tag}");
    Ok(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
}

/// Check a presented key against the broker's configured key.
///
/// Accepts the configured key verbatim, or a credential generated from it
/// whose tag verifies and whose expiry (when present) is today or later.
pub fn verify(server_key: &str, presented: &str) -> bool {
    let server_key = server_key.trim();
    let presented = presented.trim();
    if server_key.is_empty() || presented.is_empty() {
        return false;
    }
    if presented == server_key {
        return true;
    }

    let Ok(raw) = URL_SAFE_NO_PAD.decode(presented.as_bytes()) else {
        return false;
    };
    let Ok(raw) = String::from_utf8(raw) else {
        return false;
    };

    let mut parts = raw.splitn(3, '|');
    let (Some(seed), Some(expiry), Some(tag)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    if seed != server_key {
        return false;
    }
    if tag != tag_hex(seed, expiry) {
        return false;
    }
    if expiry.is_empty() {
        return true;
    }

    match NaiveDate::parse_from_str(expiry, EXPIRY_FORMAT) {
        Ok(date) => Local::now().date_naive() <= date,
        Err(_) => false,
    }
}

fn tag_hex(seed: &str, expiry: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(seed.as_bytes()).expect("hmac accepts any key size");
    mac.update(seed.as_bytes());
    mac.update(b"|");
    mac.update(expiry.as_bytes());
    let tag = mac.finalize().into_bytes();

    // 16 tag bytes keep the credential comfortably inside the frame's
    // 246-byte key limit.
    let mut out = String::with_capacity(32);
    for b in &tag[..16] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_key_matches_itself() {
        assert!(verify("Aulang", "Aulang"));
        assert!(verify(" Aulang ", "Aulang"));
        assert!(!verify("Aulang", "Wrong"));
        assert!(!verify("Aulang", ""));
    }

    #[test]
    fn generated_credential_verifies() {
        let cred = generate("Aulang", None).unwrap();
        assert_ne!(cred, "Aulang");
        assert!(verify("Aulang", &cred));
        assert!(!verify("Other", &cred));
    }

    #[test]
    fn future_expiry_verifies_past_expiry_does_not() {
        let future = (Local::now().date_naive() + chrono::Days::new(30))
            .format(EXPIRY_FORMAT)
            .to_string();
        let cred = generate("Aulang", Some(&future)).unwrap();
        assert!(verify("Aulang", &cred));

        let past = (Local::now().date_naive() - chrono::Days::new(1))
            .format(EXPIRY_FORMAT)
            .to_string();
        let cred = generate("Aulang", Some(&past)).unwrap();
        assert!(!verify("Aulang", &cred));
    }

    #[test]
    fn expiry_today_still_verifies() {
        let today = Local::now().date_naive().format(EXPIRY_FORMAT).to_string();
        let cred = generate("Aulang", Some(&today)).unwrap();
        assert!(verify("Aulang", &cred));
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(generate("", None).is_err());
        assert!(generate("a|b", None).is_err());
        assert!(generate("Aulang", Some("2020/01/01")).is_err());
        assert!(!verify("Aulang", "not-base64!!"));

        // Valid base64 of a malformed payload.
        let junk = URL_SAFE_NO_PAD.encode(b"Aulang|nope");
        assert!(!verify("Aulang", &junk));
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let cred = generate("Aulang", None).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(cred.as_bytes()).unwrap();
        let last = raw.len() - 1;
        raw[last] = if raw[last] == b'0' { b'1' } else { b'0' };
        let forged = URL_SAFE_NO_PAD.encode(&raw);
        assert!(!verify("Aulang", &forged));
    }

    #[test]
    fn credential_fits_frame_key_limit() {
        let cred = generate("a-rather-long-shared-key-string", Some("2099-12-31")).unwrap();
        assert!(cred.len() <= 246);
    }
}
