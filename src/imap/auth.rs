//! Authentication mechanisms (spec §4.3.2 step 3): `CRAM-MD5` and plain
//! `LOGIN`.

use hmac::{Hmac, Mac};
use log::debug;
use md5::Md5;

use crate::error::{Result, SyncError};

use super::driver::{Continuation, ImapDriver};
use super::response::TaggedStatus;

type HmacMd5 = Hmac<Md5>;

/// Spec §4.3.2 step 3: `AUTHENTICATE CRAM-MD5`, then answer the server's
/// base64 challenge with `base64(user SPACE hex-hmac-md5(secret, challenge))`.
pub fn authenticate_cram_md5(driver: &mut ImapDriver, user: &str, pass: &str) -> Result<()> {
    debug!("authenticating as {} via CRAM-MD5", user);
    let tag = driver.submit_with(
        "AUTHENTICATE CRAM-MD5",
        Continuation::CramChallenge {
            user: user.to_owned(),
            secret: pass.to_owned(),
        },
        None,
        false,
    )?;
    let exchange = driver.wait_for(tag)?;
    match exchange.status {
        Some(TaggedStatus::Ok) => Ok(()),
        _ => Err(SyncError::store_bad(format!("CRAM-MD5 authentication failed: {}", exchange.text))),
    }
}

/// Compute the base64-encoded CRAM-MD5 reply for a base64-encoded
/// challenge line received as a `+` continuation.
pub fn cram_md5_response(challenge_b64: &str, user: &str, secret: &str) -> Result<String> {
    let challenge = base64::decode(challenge_b64.trim())
        .map_err(|e| SyncError::store_bad(format!("malformed CRAM-MD5 challenge: {}", e)))?;
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::fatal(format!("HMAC-MD5 key setup failed: {}", e)))?;
    mac.update(&challenge);
    let digest = mac.finalize().into_bytes();
    let reply = format!("{} {}", user, hex::encode(digest));
    Ok(base64::encode(reply))
}

/// Spec §4.3.2 step 3: plain `LOGIN "<user>" "<pass>"` fallback when the
/// server does not advertise `AUTH=CRAM-MD5`.
pub fn authenticate_login(driver: &mut ImapDriver, user: &str, pass: &str) -> Result<()> {
    debug!("authenticating as {} via LOGIN", user);
    let command = format!("LOGIN {} {}", quote(user), quote(pass));
    let exchange = driver.call(&command)?;
    match exchange.status {
        Some(TaggedStatus::Ok) => Ok(()),
        _ => Err(SyncError::store_bad("LOGIN authentication failed (credentials withheld)")),
    }
}

/// Quote an IMAP string literal, escaping `\` and `"` (spec §4.2).
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cram_md5_response_matches_known_vector() {
        // RFC 2195 §3 worked example.
        let reply = cram_md5_response(
            &base64::encode("<1896.697170952@postoffice.reston.mci.net>"),
            "tim",
            "tanstaaftanstaaf",
        )
        .unwrap();
        let decoded = String::from_utf8(base64::decode(&reply).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn quote_escapes_special_characters() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}
