//! In-process fake IMAP server for integration testing, adapted from
//! `examples/LeakIX-protonmail-client/tests/fake_imap/` to this crate's
//! blocking, non-tokio transport (`std::net`/`std::thread` instead of
//! tokio, no TLS since the integration suite exercises `TlsMode::None`
//! rather than `STARTTLS`).
//!
//! The server understands exactly the command subset `MailboxSession`
//! issues (spec §4.3.3): `CAPABILITY`, `LOGIN`, `SELECT`/`CREATE`,
//! `UID FETCH`, `APPEND`, `UID SEARCH HEADER X-TUID`, `UID STORE`,
//! `UID COPY`, `CLOSE`/`EXPUNGE`, `LOGOUT`. It is a line-oriented
//! hand-matcher rather than a full grammar, the same pragmatic scope the
//! teacher-adjacent pack example takes for its own fake server.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub body: Vec<u8>,
}

impl FakeMessage {
    pub fn new(uid: u32, flags: &[&str], body: &[u8]) -> Self {
        FakeMessage {
            uid,
            flags: flags.iter().map(|s| s.to_string()).collect(),
            body: body.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeMailbox {
    pub uidvalidity: u32,
    pub next_uid: u32,
    pub messages: Vec<FakeMessage>,
}

impl FakeMailbox {
    pub fn new(uidvalidity: u32, messages: Vec<FakeMessage>) -> Self {
        let next_uid = messages.iter().map(|m| m.uid).max().unwrap_or(0) + 1;
        FakeMailbox { uidvalidity, next_uid, messages }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeState {
    pub mailboxes: HashMap<String, FakeMailbox>,
    pub user: String,
    pub pass: String,
    next_uidvalidity: u32,
}

impl FakeState {
    pub fn new(user: &str, pass: &str) -> Self {
        FakeState { mailboxes: HashMap::new(), user: user.to_owned(), pass: pass.to_owned(), next_uidvalidity: 9_000_000 }
    }

    pub fn with_mailbox(mut self, name: &str, mailbox: FakeMailbox) -> Self {
        self.mailboxes.insert(name.to_owned(), mailbox);
        self
    }

    fn alloc_uidvalidity(&mut self) -> u32 {
        let v = self.next_uidvalidity;
        self.next_uidvalidity += 1;
        v
    }
}

/// A fake IMAP server bound to an OS-assigned localhost port, speaking
/// just enough IMAP to drive `sync::run_all` end to end.
pub struct FakeImapServer {
    port: u16,
    state: Arc<Mutex<FakeState>>,
    _handle: thread::JoinHandle<()>,
}

impl FakeImapServer {
    pub fn start(state: FakeState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(state));
        let accept_state = state.clone();
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let conn_state = accept_state.clone();
                thread::spawn(move || handle_connection(stream, conn_state));
            }
        });
        FakeImapServer { port, state, _handle: handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Inspect mailbox state as it stands on the server right now (after
    /// the client session has run and logged out).
    pub fn mailbox(&self, name: &str) -> Option<FakeMailbox> {
        self.state.lock().unwrap().mailboxes.get(name).cloned()
    }
}

struct Command {
    tag: String,
    verb: String,
    rest: String,
    literal: Option<Vec<u8>>,
}

fn handle_connection(stream: TcpStream, state: Arc<Mutex<FakeState>>) {
    stream.set_nodelay(true).ok();
    let Ok(mut writer) = stream.try_clone() else { return };
    let mut reader = BufReader::new(stream);

    if write_line(&mut writer, "* OK IMAP4rev1 fake server ready\r\n").is_err() {
        return;
    }

    let mut selected: Option<String> = None;

    loop {
        let cmd = match read_command(&mut reader) {
            Ok(Some(c)) => c,
            Ok(None) | Err(_) => break,
        };
        let (verb, rest) = normalize_verb(&cmd);
        match verb.as_str() {
            "CAPABILITY" => {
                write_line(&mut writer, "* CAPABILITY IMAP4rev1 LITERAL+ UIDPLUS\r\n").ok();
                tagged_ok(&mut writer, &cmd.tag, "CAPABILITY completed");
            }
            "NOOP" => tagged_ok(&mut writer, &cmd.tag, "NOOP completed"),
            "LOGIN" => {
                let ok = {
                    let st = state.lock().unwrap();
                    login_matches(&rest, &st.user, &st.pass)
                };
                if ok {
                    tagged_ok(&mut writer, &cmd.tag, "LOGIN completed");
                } else {
                    tagged_no(&mut writer, &cmd.tag, "LOGIN failed");
                }
            }
            "SELECT" => handle_select(&mut writer, &cmd.tag, &rest, &state, &mut selected),
            "CREATE" => handle_create(&mut writer, &cmd.tag, &rest, &state),
            "UID FETCH" => handle_uid_fetch(&mut writer, &cmd.tag, &rest, &state, selected.as_deref()),
            "APPEND" => handle_append(&mut writer, &cmd.tag, &rest, cmd.literal.as_deref(), &state),
            "UID SEARCH" => handle_uid_search(&mut writer, &cmd.tag, &rest, &state, selected.as_deref()),
            "UID STORE" => handle_uid_store(&mut writer, &cmd.tag, &rest, &state, selected.as_deref()),
            "UID COPY" => handle_uid_copy(&mut writer, &cmd.tag, &rest, &state, selected.as_deref()),
            "CLOSE" => {
                expunge_deleted(&state, selected.as_deref());
                tagged_ok(&mut writer, &cmd.tag, "CLOSE completed");
            }
            "EXPUNGE" => {
                expunge_deleted(&state, selected.as_deref());
                tagged_ok(&mut writer, &cmd.tag, "EXPUNGE completed");
            }
            "LOGOUT" => {
                write_line(&mut writer, "* BYE logging out\r\n").ok();
                tagged_ok(&mut writer, &cmd.tag, "LOGOUT completed");
                break;
            }
            _ => tagged_bad(&mut writer, &cmd.tag, "unrecognised command"),
        }
    }
}

fn normalize_verb(cmd: &Command) -> (String, String) {
    if cmd.verb == "UID" {
        let mut it = cmd.rest.splitn(2, ' ');
        let sub = it.next().unwrap_or("").to_ascii_uppercase();
        let rest = it.next().unwrap_or("").to_owned();
        (format!("UID {}", sub), rest)
    } else {
        (cmd.verb.clone(), cmd.rest.clone())
    }
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Command>> {
    let Some(mut line) = read_line_crlf(reader)? else { return Ok(None) };
    if let Some(n) = trailing_literal_len(&line) {
        let marker_start = line.rfind('{').unwrap();
        line.truncate(marker_start);
        let line = line.trim_end().to_owned();
        let mut payload = vec![0u8; n];
        reader.read_exact(&mut payload)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        return Ok(Some(parse_command_line(&line, Some(payload))));
    }
    Ok(Some(parse_command_line(&line, None)))
}

fn read_line_crlf(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// The client always issues `LITERAL+` markers (our advertised
/// capability): `{n+}` at the end of the command line.
fn trailing_literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    if !line.ends_with('}') {
        return None;
    }
    let start = line.rfind('{')?;
    let digits = &line[start + 1..line.len() - 1];
    digits.trim_end_matches('+').parse().ok()
}

fn parse_command_line(line: &str, literal: Option<Vec<u8>>) -> Command {
    let mut parts = line.splitn(3, ' ');
    let tag = parts.next().unwrap_or_default().to_owned();
    let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
    let rest = parts.next().unwrap_or_default().to_owned();
    Command { tag, verb, rest, literal }
}

fn write_line(writer: &mut TcpStream, s: &str) -> std::io::Result<()> {
    writer.write_all(s.as_bytes())?;
    writer.flush()
}

fn tagged_ok(writer: &mut TcpStream, tag: &str, text: &str) {
    write_line(writer, &format!("{} OK {}\r\n", tag, text)).ok();
}

fn tagged_no(writer: &mut TcpStream, tag: &str, text: &str) {
    write_line(writer, &format!("{} NO {}\r\n", tag, text)).ok();
}

fn tagged_bad(writer: &mut TcpStream, tag: &str, text: &str) {
    write_line(writer, &format!("{} BAD {}\r\n", tag, text)).ok();
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_owned()
    }
}

fn take_quoted(s: &str) -> (String, String) {
    let s = s.trim_start();
    if let Some(stripped) = s.strip_prefix('"') {
        if let Some(end) = stripped.find('"') {
            return (stripped[..end].to_owned(), stripped[end + 1..].trim_start().to_owned());
        }
    }
    match s.split_once(' ') {
        Some((a, b)) => (a.to_owned(), b.trim_start().to_owned()),
        None => (s.to_owned(), String::new()),
    }
}

fn parse_flags_paren(s: &str) -> Vec<String> {
    let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
    inner.split_whitespace().map(|s| s.to_owned()).collect()
}

fn login_matches(rest: &str, user: &str, pass: &str) -> bool {
    let cleaned: String = rest.chars().filter(|c| *c != '"').collect();
    let mut it = cleaned.split_whitespace();
    let u = it.next().unwrap_or("");
    let p = it.next().unwrap_or("");
    u == user && p == pass
}

fn handle_select(writer: &mut TcpStream, tag: &str, rest: &str, state: &Arc<Mutex<FakeState>>, selected: &mut Option<String>) {
    let name = unquote(rest);
    let st = state.lock().unwrap();
    let Some(mb) = st.mailboxes.get(&name) else {
        drop(st);
        tagged_no(writer, tag, "SELECT failed: no such mailbox");
        return;
    };
    let exists = mb.messages.len();
    let uidvalidity = mb.uidvalidity;
    drop(st);
    write_line(writer, "* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n").ok();
    write_line(writer, &format!("* {} EXISTS\r\n", exists)).ok();
    *selected = Some(name);
    tagged_ok(writer, tag, &format!("[UIDVALIDITY {}] SELECT completed", uidvalidity));
}

fn handle_create(writer: &mut TcpStream, tag: &str, rest: &str, state: &Arc<Mutex<FakeState>>) {
    let name = unquote(rest);
    let mut st = state.lock().unwrap();
    if !st.mailboxes.contains_key(&name) {
        let uidvalidity = st.alloc_uidvalidity();
        st.mailboxes.insert(name, FakeMailbox::new(uidvalidity, Vec::new()));
    }
    drop(st);
    tagged_ok(writer, tag, "CREATE completed");
}

fn parse_uid_ranges(spec: &str, existing_max: u32) -> Vec<(u32, u32)> {
    spec.split(',')
        .filter_map(|part| {
            let part = part.trim();
            if let Some((a, b)) = part.split_once(':') {
                let start: u32 = a.parse().ok()?;
                let end = if b == "*" { existing_max } else { b.parse().ok()? };
                Some((start, end))
            } else {
                let n: u32 = part.parse().ok()?;
                Some((n, n))
            }
        })
        .collect()
}

fn uid_in_ranges(uid: u32, ranges: &[(u32, u32)]) -> bool {
    ranges.iter().any(|(a, b)| uid >= *a && uid <= *b)
}

fn handle_uid_fetch(writer: &mut TcpStream, tag: &str, rest: &str, state: &Arc<Mutex<FakeState>>, selected: Option<&str>) {
    let Some(name) = selected else {
        tagged_bad(writer, tag, "no mailbox selected");
        return;
    };
    let (range_spec, items) = match rest.find('(') {
        Some(pos) => (rest[..pos].trim().to_owned(), rest[pos..].to_owned()),
        None => (rest.trim().to_owned(), String::new()),
    };
    if items.contains("BODY") {
        handle_uid_fetch_body(writer, tag, &range_spec, &items, state, name);
    } else {
        handle_uid_fetch_scan(writer, tag, &range_spec, state, name);
    }
}

fn handle_uid_fetch_scan(writer: &mut TcpStream, tag: &str, range_spec: &str, state: &Arc<Mutex<FakeState>>, name: &str) {
    let st = state.lock().unwrap();
    let Some(mb) = st.mailboxes.get(name) else {
        drop(st);
        tagged_bad(writer, tag, "no such mailbox");
        return;
    };
    let existing_max = mb.messages.iter().map(|m| m.uid).max().unwrap_or(0);
    let ranges = parse_uid_ranges(range_spec, existing_max);
    let mut lines = Vec::new();
    for (seq, msg) in mb.messages.iter().enumerate() {
        if uid_in_ranges(msg.uid, &ranges) {
            let flags = msg.flags.join(" ");
            lines.push(format!("* {} FETCH (UID {} FLAGS ({}) RFC822.SIZE {})\r\n", seq + 1, msg.uid, flags, msg.body.len()));
        }
    }
    drop(st);
    for line in lines {
        write_line(writer, &line).ok();
    }
    tagged_ok(writer, tag, "UID FETCH completed");
}

fn handle_uid_fetch_body(writer: &mut TcpStream, tag: &str, range_spec: &str, items: &str, state: &Arc<Mutex<FakeState>>, name: &str) {
    let Ok(uid) = range_spec.trim().parse::<u32>() else {
        tagged_bad(writer, tag, "bad uid");
        return;
    };
    let st = state.lock().unwrap();
    let found = st.mailboxes.get(name).and_then(|mb| mb.messages.iter().find(|m| m.uid == uid).cloned());
    drop(st);
    let Some(msg) = found else {
        tagged_ok(writer, tag, "UID FETCH completed");
        return;
    };
    let want_flags = items.contains("FLAGS");
    write_line(writer, &format!("* 1 FETCH (BODY[] {{{}}}\r\n", msg.body.len())).ok();
    writer.write_all(&msg.body).ok();
    if want_flags {
        writer.write_all(format!(" FLAGS ({}))\r\n", msg.flags.join(" ")).as_bytes()).ok();
    } else {
        writer.write_all(b")\r\n").ok();
    }
    writer.flush().ok();
    tagged_ok(writer, tag, "UID FETCH completed");
}

fn handle_append(writer: &mut TcpStream, tag: &str, rest: &str, literal: Option<&[u8]>, state: &Arc<Mutex<FakeState>>) {
    let Some(body) = literal else {
        tagged_bad(writer, tag, "APPEND missing literal");
        return;
    };
    let (mailbox, flags_part) = take_quoted(rest);
    let flags = parse_flags_paren(&flags_part);
    let mut st = state.lock().unwrap();
    if !st.mailboxes.contains_key(&mailbox) {
        let uidvalidity = st.alloc_uidvalidity();
        st.mailboxes.insert(mailbox.clone(), FakeMailbox::new(uidvalidity, Vec::new()));
    }
    let mb = st.mailboxes.get_mut(&mailbox).unwrap();
    let uid = mb.next_uid;
    mb.next_uid += 1;
    let uidvalidity = mb.uidvalidity;
    mb.messages.push(FakeMessage { uid, flags, body: body.to_vec() });
    drop(st);
    tagged_ok(writer, tag, &format!("[APPENDUID {} {}] APPEND completed", uidvalidity, uid));
}

fn handle_uid_search(writer: &mut TcpStream, tag: &str, rest: &str, state: &Arc<Mutex<FakeState>>, selected: Option<&str>) {
    let Some(name) = selected else {
        tagged_bad(writer, tag, "no mailbox selected");
        return;
    };
    let tuid = rest.trim().rsplit(' ').next().unwrap_or("");
    let needle = format!("X-TUID: {}", tuid);
    let st = state.lock().unwrap();
    let hits: Vec<u32> = st
        .mailboxes
        .get(name)
        .map(|mb| {
            mb.messages
                .iter()
                .filter(|m| String::from_utf8_lossy(&m.body).contains(&needle))
                .map(|m| m.uid)
                .collect()
        })
        .unwrap_or_default();
    drop(st);
    if hits.is_empty() {
        write_line(writer, "* SEARCH\r\n").ok();
    } else {
        let ids = hits.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(" ");
        write_line(writer, &format!("* SEARCH {}\r\n", ids)).ok();
    }
    tagged_ok(writer, tag, "UID SEARCH completed");
}

fn handle_uid_store(writer: &mut TcpStream, tag: &str, rest: &str, state: &Arc<Mutex<FakeState>>, selected: Option<&str>) {
    let Some(name) = selected else {
        tagged_bad(writer, tag, "no mailbox selected");
        return;
    };
    let mut parts = rest.splitn(3, ' ');
    let Some(uid) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
        tagged_bad(writer, tag, "bad uid");
        return;
    };
    let op = parts.next().unwrap_or("").to_ascii_uppercase();
    let flags = parse_flags_paren(parts.next().unwrap_or(""));
    let mut st = state.lock().unwrap();
    if let Some(msg) = st.mailboxes.get_mut(name).and_then(|mb| mb.messages.iter_mut().find(|m| m.uid == uid)) {
        if op.starts_with('+') {
            for f in flags {
                if !msg.flags.iter().any(|existing| existing.eq_ignore_ascii_case(&f)) {
                    msg.flags.push(f);
                }
            }
        } else if op.starts_with('-') {
            msg.flags.retain(|existing| !flags.iter().any(|f| f.eq_ignore_ascii_case(existing)));
        }
    }
    drop(st);
    tagged_ok(writer, tag, "UID STORE completed");
}

fn handle_uid_copy(writer: &mut TcpStream, tag: &str, rest: &str, state: &Arc<Mutex<FakeState>>, selected: Option<&str>) {
    let Some(name) = selected else {
        tagged_bad(writer, tag, "no mailbox selected");
        return;
    };
    let mut parts = rest.splitn(2, ' ');
    let Some(uid) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
        tagged_bad(writer, tag, "bad uid");
        return;
    };
    let dest = unquote(parts.next().unwrap_or(""));
    let mut st = state.lock().unwrap();
    let Some(msg) = st.mailboxes.get(name).and_then(|mb| mb.messages.iter().find(|m| m.uid == uid).cloned()) else {
        drop(st);
        tagged_bad(writer, tag, "no such message");
        return;
    };
    if !st.mailboxes.contains_key(&dest) {
        drop(st);
        write_line(writer, &format!("{} NO [TRYCREATE] COPY failed: no such mailbox\r\n", tag)).ok();
        return;
    }
    let dest_mb = st.mailboxes.get_mut(&dest).unwrap();
    let new_uid = dest_mb.next_uid;
    dest_mb.next_uid += 1;
    dest_mb.messages.push(FakeMessage { uid: new_uid, flags: msg.flags.clone(), body: msg.body.clone() });
    drop(st);
    tagged_ok(writer, tag, "UID COPY completed");
}

fn expunge_deleted(state: &Arc<Mutex<FakeState>>, selected: Option<&str>) {
    let Some(name) = selected else { return };
    let mut st = state.lock().unwrap();
    if let Some(mb) = st.mailboxes.get_mut(name) {
        mb.messages.retain(|m| !m.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Deleted")));
    }
}
