//! The mailbox-operations table offered to the sync engine (spec §4.3.3).

use std::collections::HashSet;

use itertools::Itertools;
use log::warn;

use crate::error::{Result, SyncError};
use crate::message::{Flags, Message, Tuid};
use crate::proto::Node;

use super::driver::ImapDriver;
use super::response::{Capabilities, ResponseCode, TaggedStatus};

/// One entry from a `LIST` response, after filtering.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
}

/// Result of a successful `SELECT` (spec §4.3.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxInfo {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub exists: u32,
}

/// Wraps an [`ImapDriver`] with the namespace prefix resolved at connect
/// time (spec §4.3.3 "Namespace handling") and exposes the mailbox
/// operations table.
pub struct MailboxSession {
    pub driver: ImapDriver,
    prefix: String,
}

impl MailboxSession {
    pub fn new(driver: ImapDriver, prefix: String) -> Self {
        MailboxSession { driver, prefix }
    }

    /// Resolve the personal namespace prefix via `NAMESPACE` (spec
    /// §4.3.3). Only called when `UseNamespace` is set, no explicit
    /// folder prefix was configured, and the server advertises
    /// `NAMESPACE`.
    pub fn resolve_namespace(driver: &mut ImapDriver) -> Result<String> {
        if !driver.capabilities.contains(Capabilities::NAMESPACE) {
            return Ok(String::new());
        }
        let exchange = driver.call("NAMESPACE")?;
        for line in &exchange.untagged {
            if line.first().and_then(Node::as_atom).map(|a| a.eq_ignore_ascii_case("NAMESPACE")).unwrap_or(false) {
                // (personal) (other users) (shared) — take the first
                // personal namespace's prefix atom.
                if let Some(Node::List(personal)) = line.get(1) {
                    if let Some(Node::List(first)) = personal.first() {
                        if let Some(prefix) = first.first().and_then(Node::as_str) {
                            return Ok(prefix.to_owned());
                        }
                    }
                }
            }
        }
        Ok(String::new())
    }

    /// The fully-qualified, quoted mailbox name for a command, applying
    /// the namespace prefix — except `INBOX`, which is always addressed
    /// literally (spec §4.3.3).
    fn addr(&self, box_name: &str) -> String {
        if box_name.eq_ignore_ascii_case("INBOX") {
            "INBOX".to_owned()
        } else {
            format!("{}{}", self.prefix, box_name)
        }
    }

    fn quoted_addr(&self, box_name: &str) -> String {
        quote(&self.addr(box_name))
    }

    pub fn list(&mut self, pattern: &str) -> Result<Vec<ListEntry>> {
        let command = format!("LIST \"\" {}", quote(&format!("{}{}", self.prefix, pattern)));
        let exchange = self.driver.call(&command)?;
        require_ok(&exchange, "LIST")?;
        let mut entries = Vec::new();
        for line in &exchange.untagged {
            if line.first().and_then(Node::as_atom).map(|a| a.eq_ignore_ascii_case("LIST")).unwrap_or(false) {
                let attrs = line.get(1).and_then(Node::as_list).unwrap_or(&[]);
                let noselect = attrs.iter().any(|a| a.as_atom().map(|s| s.eq_ignore_ascii_case("\\Noselect")).unwrap_or(false));
                let name = line.get(3).and_then(Node::as_str).unwrap_or_default().to_owned();
                if noselect || name.ends_with(".lock") {
                    continue;
                }
                entries.push(ListEntry { name });
            }
        }
        Ok(entries)
    }

    /// `select(box, create)`: on `NO` with `create` set and a
    /// `TRYCREATE` response code (or the server simply refused because
    /// the box doesn't exist), issue `CREATE` then reissue `SELECT`
    /// (spec §4.3.3).
    pub fn select(&mut self, box_name: &str, create: bool) -> Result<MailboxInfo> {
        let command = format!("SELECT {}", self.quoted_addr(box_name));
        let exchange = if create {
            self.driver.call_create_on_no(&command, &self.addr(box_name), true)?
        } else {
            self.driver.call(&command)?
        };

        let exchange = if exchange.status != Some(TaggedStatus::Ok) && create && exchange.needs_create.is_some() {
            let create_cmd = format!("CREATE {}", self.quoted_addr(box_name));
            let created = self.driver.call(&create_cmd)?;
            require_ok(&created, "CREATE")?;
            self.driver.call(&command)?
        } else {
            exchange
        };

        require_ok(&exchange, "SELECT")?;
        let mut info = MailboxInfo::default();
        for code in &exchange.codes {
            match code {
                ResponseCode::UidValidity(v) => info.uidvalidity = *v,
                ResponseCode::UidNext(n) => info.uidnext = *n,
                _ => {}
            }
        }
        for line in &exchange.untagged {
            if line.len() >= 2 {
                if let (Some(n), Some(kind)) = (line[0].as_atom(), line[1].as_atom()) {
                    if kind.eq_ignore_ascii_case("EXISTS") {
                        info.exists = n.parse().unwrap_or(0);
                    }
                }
            }
        }
        Ok(info)
    }

    /// `scan(minuid, maxuid, excs)`: coalesce `excs` (known UIDs whose
    /// flags need refreshing) with the fresh `[minuid..maxuid]` range
    /// into one `UID FETCH` (spec §4.3.3). `maxuid = None` means
    /// unbounded (`minuid:*`), matching the "scan(1, ∞)" / "scan(maxuid
    /// + 1, ∞)" preflight calls of spec §4.5.1.
    pub fn scan(&mut self, minuid: u32, maxuid: Option<u32>, excs: &[u32]) -> Result<Vec<Message>> {
        let ranges = build_ranges(minuid, maxuid, excs);
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let command = format!("UID FETCH {} (UID FLAGS RFC822.SIZE)", ranges);
        let exchange = self.driver.call(&command)?;
        require_ok(&exchange, "UID FETCH")?;

        let mut messages = Vec::new();
        let mut warned = HashSet::new();
        for line in &exchange.untagged {
            if let Some(msg) = parse_fetch_message(line, &mut warned) {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// `fetch_body(uid)`: `UID FETCH <uid> (BODY.PEEK[])`, optionally
    /// also requesting `FLAGS` when not already known.
    pub fn fetch_body(&mut self, uid: u32, need_flags: bool) -> Result<(Vec<u8>, Option<Flags>)> {
        let items = if need_flags { "(BODY.PEEK[] FLAGS)" } else { "(BODY.PEEK[])" };
        let command = format!("UID FETCH {} {}", uid, items);
        let exchange = self.driver.call(&command)?;
        require_ok(&exchange, "UID FETCH")?;

        let mut warned = HashSet::new();
        for line in &exchange.untagged {
            let Some(list) = find_fetch_attrs(line) else { continue };
            let mut body = None;
            let mut flags = None;
            let mut i = 0;
            while i < list.len() {
                if let Some(key) = list[i].as_atom() {
                    let upper = key.to_ascii_uppercase();
                    if upper.starts_with("BODY") {
                        body = list.get(i + 1).and_then(Node::as_bytes).map(|b| b.to_vec());
                    } else if upper == "FLAGS" {
                        flags = list.get(i + 1).and_then(Node::as_list).map(|l| parse_flags_list(l, &mut warned));
                    }
                }
                i += 1;
            }
            if let Some(body) = body {
                return Ok((body, flags));
            }
        }
        Err(SyncError::msg_bad(format!("UID {} vanished before body could be fetched", uid)))
    }

    /// `append(box, flags, body, tuid)`: insert the `X-TUID:` header
    /// before the first blank line, then `APPEND` with a literal. Returns
    /// the new UID if the server replied with `APPENDUID`.
    pub fn append(&mut self, box_name: &str, flags: Flags, body: &[u8], tuid: &Tuid) -> Result<Option<u32>> {
        let payload = insert_tuid_header(body, tuid);
        let prefix = format!("APPEND {} {}", self.quoted_addr(box_name), flags.to_imap_list());
        let exchange = self.driver.call_with_literal(&prefix, &payload)?;
        require_ok(&exchange, "APPEND")?;
        for code in &exchange.codes {
            if let ResponseCode::AppendUid(_, uid) = code {
                return Ok(Some(*uid));
            }
        }
        Ok(None)
    }

    /// `find_tuid(tuid)`: used only when `APPEND` yielded no
    /// `APPENDUID`, to recover the UID the server actually assigned.
    /// Zero or more-than-one hit is ambiguous and returns `None` rather
    /// than guessing (spec §9 "known quirk": the message re-uploads on
    /// the next sync).
    pub fn find_tuid(&mut self, tuid: &Tuid) -> Result<Option<u32>> {
        let command = format!("UID SEARCH HEADER X-TUID {}", tuid.0);
        let exchange = self.driver.call(&command)?;
        require_ok(&exchange, "UID SEARCH")?;
        let mut hits: Vec<u32> = Vec::new();
        for line in &exchange.untagged {
            if line.first().and_then(Node::as_atom).map(|a| a.eq_ignore_ascii_case("SEARCH")).unwrap_or(false) {
                hits.extend(line[1..].iter().filter_map(|n| n.as_atom().and_then(|s| s.parse::<u32>().ok())));
            }
        }
        match hits.as_slice() {
            [uid] => Ok(Some(*uid)),
            _ => Ok(None),
        }
    }

    /// `set_flags(uid, add, del)`: `.SILENT` variants to suppress
    /// untagged `FETCH` echoes.
    pub fn set_flags(&mut self, uid: u32, add: Flags, del: Flags) -> Result<()> {
        if !add.is_empty() {
            let command = format!("UID STORE {} +FLAGS.SILENT {}", uid, add.to_imap_list());
            require_ok(&self.driver.call(&command)?, "UID STORE")?;
        }
        if !del.is_empty() {
            let command = format!("UID STORE {} -FLAGS.SILENT {}", uid, del.to_imap_list());
            require_ok(&self.driver.call(&command)?, "UID STORE")?;
        }
        Ok(())
    }

    /// `trash(uid, trashbox)`: same create-on-NO policy as `select`.
    pub fn trash(&mut self, uid: u32, trashbox: &str) -> Result<()> {
        let command = format!("UID COPY {} {}", uid, self.quoted_addr(trashbox));
        let exchange = self.driver.call_create_on_no(&command, &self.addr(trashbox), true)?;
        let exchange = if exchange.status != Some(TaggedStatus::Ok) && exchange.needs_create.is_some() {
            let create_cmd = format!("CREATE {}", self.quoted_addr(trashbox));
            require_ok(&self.driver.call(&create_cmd)?, "CREATE")?;
            self.driver.call(&command)?
        } else {
            exchange
        };
        require_ok(&exchange, "UID COPY")
    }

    pub fn close(&mut self) -> Result<()> {
        require_ok(&self.driver.call("CLOSE")?, "CLOSE")
    }

    pub fn expunge(&mut self) -> Result<()> {
        require_ok(&self.driver.call("EXPUNGE")?, "EXPUNGE")
    }

    pub fn logout(&mut self) -> Result<()> {
        self.driver.logout()
    }
}

fn require_ok(exchange: &super::driver::Exchange, op: &str) -> Result<()> {
    match exchange.status {
        Some(TaggedStatus::Ok) => Ok(()),
        Some(TaggedStatus::No) => Err(SyncError::box_bad(format!("{} failed: NO {}", op, exchange.text))),
        Some(TaggedStatus::Bad) => Err(SyncError::box_bad(format!("{} rejected: BAD {}", op, exchange.text))),
        None => Err(SyncError::box_bad(format!("{} never completed", op))),
    }
}

/// Coalesce `excs` (flag-refresh UIDs) into compact ranges and append
/// the fresh `minuid:maxuid` (or `minuid:*` when unbounded) range for
/// new messages (spec §4.3.3 `scan`).
fn build_ranges(minuid: u32, maxuid: Option<u32>, excs: &[u32]) -> String {
    let mut uids: Vec<u32> = excs.to_vec();
    uids.sort_unstable();
    uids.dedup();

    let mut parts: Vec<String> = if uids.is_empty() {
        Vec::new()
    } else {
        uids.into_iter()
            .map(|u| (u, u))
            .coalesce(|(s1, e1), (s2, e2)| {
                if s2 == e1 + 1 {
                    Ok((s1, e2))
                } else {
                    Err(((s1, e1), (s2, e2)))
                }
            })
            .map(|(s, e)| if s == e { s.to_string() } else { format!("{}:{}", s, e) })
            .collect()
    };

    match maxuid {
        Some(max) if max >= minuid => parts.push(format!("{}:{}", minuid, max)),
        Some(_) => {}
        None => parts.push(format!("{}:*", minuid)),
    }

    parts.join(",")
}

/// `warned` is per-scan state: an unknown flag atom is only logged the
/// first time it's seen in a given `scan`/`fetch_body` call, matching
/// `drv_imap.c`'s `warned` bitset gating against repeated log spam for
/// the same unrecognised flag.
fn parse_flags_list(list: &[Node], warned: &mut HashSet<String>) -> Flags {
    let mut flags = Flags::EMPTY;
    for node in list {
        let Some(name) = node.as_atom() else { continue };
        match name {
            "\\Draft" => flags.insert(Flags::DRAFT),
            "\\Flagged" => flags.insert(Flags::FLAGGED),
            "\\Answered" => flags.insert(Flags::ANSWERED),
            "\\Seen" => flags.insert(Flags::SEEN),
            "\\Deleted" => flags.insert(Flags::DELETED),
            "\\Recent" => {}
            other => {
                if warned.insert(other.to_owned()) {
                    warn!("ignoring unrecognised IMAP flag {}", other);
                }
            }
        }
    }
    flags
}

fn find_fetch_attrs(line: &[Node]) -> Option<&[Node]> {
    if line.first().and_then(Node::as_atom)?.parse::<u32>().is_err() {
        return None;
    }
    if !line.get(1).and_then(Node::as_atom).map(|a| a.eq_ignore_ascii_case("FETCH")).unwrap_or(false) {
        return None;
    }
    line.get(2).and_then(Node::as_list)
}

fn parse_fetch_message(line: &[Node], warned: &mut HashSet<String>) -> Option<Message> {
    let attrs = find_fetch_attrs(line)?;
    let mut uid = None;
    let mut flags = Flags::EMPTY;
    let mut size = None;
    let mut i = 0;
    while i < attrs.len() {
        if let Some(key) = attrs[i].as_atom() {
            match key.to_ascii_uppercase().as_str() {
                "UID" => uid = attrs.get(i + 1).and_then(Node::as_atom).and_then(|s| s.parse().ok()),
                "FLAGS" => flags = attrs.get(i + 1).and_then(Node::as_list).map(|l| parse_flags_list(l, warned)).unwrap_or(Flags::EMPTY),
                "RFC822.SIZE" => size = attrs.get(i + 1).and_then(Node::as_atom).and_then(|s| s.parse().ok()),
                _ => {}
            }
        }
        i += 1;
    }
    let uid = uid?;
    let mut msg = Message::new_remote(uid, flags);
    msg.size = size;
    Some(msg)
}

/// Insert the `X-TUID:` header line immediately before the first blank
/// line separating headers from body (spec §4.3.3 `append`).
fn insert_tuid_header(body: &[u8], tuid: &Tuid) -> Vec<u8> {
    let header_line = tuid.header_line();
    let needle = b"\r\n\r\n";
    if let Some(pos) = body.windows(4).position(|w| w == needle) {
        let mut out = Vec::with_capacity(body.len() + header_line.len());
        out.extend_from_slice(&body[..pos + 2]);
        out.extend_from_slice(header_line.as_bytes());
        out.extend_from_slice(&body[pos + 2..]);
        out
    } else {
        let mut out = header_line.into_bytes();
        out.extend_from_slice(body);
        out
    }
}

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
