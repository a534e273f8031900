//! Just enough DER/X.509 to pull a human-readable subject, issuer, and
//! validity period out of a certificate for the TOFU prompt (spec
//! §4.1). No X.509-parsing crate is attested anywhere in the retrieval
//! pack, so this walks the handful of fields a trust prompt needs by
//! hand rather than pull in an unattested dependency; anything beyond
//! that (signature checking, extensions, chain building) stays with
//! `rustls`/webpki, which already does it during the handshake.

use chrono::NaiveDateTime;

const TAG_INTEGER: u8 = 0x02;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_UTC_TIME: u8 = 0x17;
const TAG_GENERALIZED_TIME: u8 = 0x18;
const TAG_CONTEXT_0: u8 = 0xa0;

#[derive(Debug, Default, Clone)]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
}

struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
    rest: &'a [u8],
}

/// Read one TLV (tag-length-value) off the front of `data`.
fn read_tlv(data: &[u8]) -> Option<Tlv<'_>> {
    let tag = *data.first()?;
    let first_len = *data.get(1)? as usize;
    let (len, header_len) = if first_len & 0x80 == 0 {
        (first_len, 2)
    } else {
        let nbytes = first_len & 0x7f;
        if nbytes == 0 || nbytes > 4 {
            return None;
        }
        let mut len = 0usize;
        for i in 0..nbytes {
            len = (len << 8) | *data.get(2 + i)? as usize;
        }
        (len, 2 + nbytes)
    };
    let content = data.get(header_len..header_len + len)?;
    let rest = data.get(header_len + len..)?;
    Some(Tlv { tag, content, rest })
}

/// Best-effort subject/issuer/validity extraction; returns `None` on
/// any malformed input rather than guessing.
pub fn parse_certificate(der: &[u8]) -> Option<CertInfo> {
    let outer = read_tlv(der)?;
    if outer.tag != TAG_SEQUENCE {
        return None;
    }
    let tbs = read_tlv(outer.content)?;
    if tbs.tag != TAG_SEQUENCE {
        return None;
    }
    let mut rest = tbs.content;

    // Optional explicit [0] version.
    if rest.first() == Some(&TAG_CONTEXT_0) {
        rest = read_tlv(rest)?.rest;
    }
    // serialNumber INTEGER.
    let serial = read_tlv(rest)?;
    if serial.tag != TAG_INTEGER {
        return None;
    }
    rest = serial.rest;
    // signature AlgorithmIdentifier SEQUENCE.
    rest = read_tlv(rest)?.rest;
    // issuer Name SEQUENCE.
    let issuer_tlv = read_tlv(rest)?;
    rest = issuer_tlv.rest;
    // validity SEQUENCE of two Time values.
    let validity_tlv = read_tlv(rest)?;
    rest = validity_tlv.rest;
    // subject Name SEQUENCE.
    let subject_tlv = read_tlv(rest)?;

    let (not_before, not_after) = parse_validity(validity_tlv.content).unwrap_or_default();

    Some(CertInfo {
        subject: parse_name(subject_tlv.content),
        issuer: parse_name(issuer_tlv.content),
        not_before,
        not_after,
    })
}

fn parse_validity(content: &[u8]) -> Option<(String, String)> {
    let not_before = read_tlv(content)?;
    let not_after = read_tlv(not_before.rest)?;
    Some((format_time(not_before.tag, not_before.content), format_time(not_after.tag, not_after.content)))
}

fn format_time(tag: u8, content: &[u8]) -> String {
    let raw = String::from_utf8_lossy(content);
    let parsed = match tag {
        TAG_UTC_TIME => parse_utc_time(&raw),
        TAG_GENERALIZED_TIME => parse_generalized_time(&raw),
        _ => None,
    };
    parsed.map(|t| format!("{} UTC", t.format("%Y-%m-%d %H:%M:%S"))).unwrap_or_else(|| raw.into_owned())
}

/// `YYMMDDHHMMSSZ`; two-digit year 50-99 means 19xx, 00-49 means 20xx
/// (RFC 5280 §4.1.2.5.1).
fn parse_utc_time(raw: &str) -> Option<NaiveDateTime> {
    let digits = raw.trim_end_matches('Z');
    if digits.len() != 12 {
        return None;
    }
    let yy: i32 = digits[0..2].parse().ok()?;
    let year = if yy >= 50 { 1900 + yy } else { 2000 + yy };
    let full = format!("{:04}{}", year, &digits[2..]);
    NaiveDateTime::parse_from_str(&full, "%Y%m%d%H%M%S").ok()
}

/// `YYYYMMDDHHMMSSZ`.
fn parse_generalized_time(raw: &str) -> Option<NaiveDateTime> {
    let digits = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()
}

/// Render a Name SEQUENCE OF RDN as `CN=..., O=..., C=...`, preferring
/// the attributes an operator actually recognises.
fn parse_name(mut content: &[u8]) -> String {
    let mut parts = Vec::new();
    while let Some(rdn) = read_tlv(content) {
        content = rdn.rest;
        if rdn.tag != TAG_SET {
            continue;
        }
        let Some(atv) = read_tlv(rdn.content) else { continue };
        if atv.tag != TAG_SEQUENCE {
            continue;
        }
        let Some(oid_tlv) = read_tlv(atv.content) else { continue };
        let Some(value_tlv) = read_tlv(oid_tlv.rest) else { continue };
        let label = oid_label(oid_tlv.content);
        let value = String::from_utf8_lossy(value_tlv.content);
        parts.push(format!("{}={}", label, value));
    }
    if parts.is_empty() {
        "<empty>".to_owned()
    } else {
        parts.join(", ")
    }
}

/// Only the handful of `id-at-*` OIDs that show up in practice; unknown
/// OIDs print as their dotted form.
fn oid_label(oid: &[u8]) -> String {
    match oid {
        [0x55, 0x04, 0x03] => "CN".to_owned(),
        [0x55, 0x04, 0x0a] => "O".to_owned(),
        [0x55, 0x04, 0x0b] => "OU".to_owned(),
        [0x55, 0x04, 0x06] => "C".to_owned(),
        [0x55, 0x04, 0x08] => "ST".to_owned(),
        [0x55, 0x04, 0x07] => "L".to_owned(),
        _ => oid.iter().map(|b| b.to_string()).collect::<Vec<_>>().join("."),
    }
}
