//! Capability cache and bracketed response-code parsing (spec §4.3.2).

use crate::proto::Node;

/// Recognised capability atoms (spec §4.3.2), as a bitset. Any other
/// capability the server advertises is simply not representable here and
/// is ignored, matching spec's "recognised capability atoms" list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const LOGINDISABLED: Capabilities = Capabilities(1 << 0);
    pub const UIDPLUS: Capabilities = Capabilities(1 << 1);
    pub const LITERALPLUS: Capabilities = Capabilities(1 << 2);
    pub const NAMESPACE: Capabilities = Capabilities(1 << 3);
    pub const AUTH_CRAM_MD5: Capabilities = Capabilities(1 << 4);
    pub const STARTTLS: Capabilities = Capabilities(1 << 5);

    pub fn empty() -> Capabilities {
        Capabilities(0)
    }

    pub fn contains(self, other: Capabilities) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;
    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Capabilities) {
        self.0 |= rhs.0;
    }
}

impl Capabilities {
    /// Rebuild from a `CAPABILITY` response's atom list. A fresh
    /// `CAPABILITY` response always wipes and rebuilds the cache (spec
    /// §4.3.2) rather than being merged into the existing one.
    pub fn parse(atoms: &[Node]) -> Capabilities {
        let mut caps = Capabilities::empty();
        for atom in atoms {
            let Some(text) = atom.as_str() else { continue };
            let upper = text.to_ascii_uppercase();
            match upper.as_str() {
                "LOGINDISABLED" => caps |= Capabilities::LOGINDISABLED,
                "UIDPLUS" => caps |= Capabilities::UIDPLUS,
                "LITERAL+" => caps |= Capabilities::LITERALPLUS,
                "NAMESPACE" => caps |= Capabilities::NAMESPACE,
                "STARTTLS" => caps |= Capabilities::STARTTLS,
                "AUTH=CRAM-MD5" => caps |= Capabilities::AUTH_CRAM_MD5,
                _ => {}
            }
        }
        caps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggedStatus {
    Ok,
    No,
    Bad,
}

impl TaggedStatus {
    pub fn parse(atom: &str) -> Option<TaggedStatus> {
        match atom.to_ascii_uppercase().as_str() {
            "OK" => Some(TaggedStatus::Ok),
            "NO" => Some(TaggedStatus::No),
            "BAD" => Some(TaggedStatus::Bad),
            _ => None,
        }
    }
}

/// A decoded `[...]` bracketed response code (spec §4.3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    UidValidity(u32),
    UidNext(u32),
    Capability(Vec<String>),
    Alert(String),
    /// `APPENDUID <validity> <uid>` — the UID assigned to a just-appended
    /// message (spec §4.3.2, §4.3.3 `append`).
    AppendUid(u32, u32),
    TryCreate,
    Other(String),
}

/// Parse the content between `[` and `]` in a response line, if present.
/// `text` is everything after the status atom (e.g. after `OK`).
pub fn parse_response_code(text: &str) -> Option<ResponseCode> {
    let text = text.trim_start();
    if !text.starts_with('[') {
        return None;
    }
    let end = text.find(']')?;
    let inner = &text[1..end];
    let mut parts = inner.split_whitespace();
    let kind = parts.next()?.to_ascii_uppercase();
    match kind.as_str() {
        "UIDVALIDITY" => parts.next()?.parse().ok().map(ResponseCode::UidValidity),
        "UIDNEXT" => parts.next()?.parse().ok().map(ResponseCode::UidNext),
        "CAPABILITY" => Some(ResponseCode::Capability(parts.map(|s| s.to_owned()).collect())),
        "ALERT" => Some(ResponseCode::Alert(inner["ALERT".len()..].trim().to_owned())),
        "APPENDUID" => {
            let validity = parts.next()?.parse().ok()?;
            let uid = parts.next()?.parse().ok()?;
            Some(ResponseCode::AppendUid(validity, uid))
        }
        "TRYCREATE" => Some(ResponseCode::TryCreate),
        _ => Some(ResponseCode::Other(inner.to_owned())),
    }
}
