//! Command pipeline, response dispatcher, and connection sequence (spec
//! §4.3.1, §4.3.2).

use std::collections::VecDeque;
use std::io::Write;

use log::{debug, warn};

use crate::config::{Config, TlsMode};
use crate::error::{Result, SyncError};
use crate::proto::{parse_list_line, LineBuffer, Node};
use crate::transport::{AnyTransport, CertPolicy, TcpTransport, Transport, TunnelTransport};

use super::auth;
use super::response::{parse_response_code, Capabilities, ResponseCode, TaggedStatus};

/// Up to this many commands may be outstanding before the submitter must
/// block on `drain_one` (spec §4.3.1).
pub const MAX_IN_PROGRESS: usize = 50;

/// A continuation record attached to an in-flight command (spec §4.3.1).
pub enum Continuation {
    /// No special continuation handling expected.
    None,
    /// A literal payload to write, followed by CRLF, the next time a
    /// `+` continuation arrives.
    LiteralPayload(Vec<u8>),
    /// CRAM-MD5 challenge/response (spec §4.3.2 step 3).
    CramChallenge { user: String, secret: String },
}

pub struct PendingCommand {
    pub tag: u32,
    pub text: String,
    pub continuation: Continuation,
    /// create-on-NO policy for SELECT/trash (spec §4.3.3).
    pub create_on_no: Option<String>,
    pub trycreate: bool,
}

/// Everything the dispatcher collected while this command was
/// outstanding: every untagged response's token list, plus the final
/// tagged outcome once it arrives.
#[derive(Debug, Default)]
pub struct Exchange {
    pub untagged: Vec<Vec<Node>>,
    pub status: Option<TaggedStatus>,
    pub codes: Vec<ResponseCode>,
    pub text: String,
    /// Set when the exchange completed a command that had
    /// `create_on_no` configured and the server replied `NO` — the
    /// caller is expected to `CREATE` and retry (spec §4.3.3).
    pub needs_create: Option<String>,
}

pub struct ImapDriver {
    transport: Option<AnyTransport>,
    lb: LineBuffer,
    next_tag: u32,
    in_flight: VecDeque<PendingCommand>,
    pub capabilities: Capabilities,
    literal_pending: bool,
    completed: std::collections::HashMap<u32, Exchange>,
    pending_untagged: Vec<Vec<Node>>,
}

impl ImapDriver {
    pub fn connect(config: &Config) -> Result<Self> {
        let transport = if let Some(cmd) = &config.tunnel {
            AnyTransport::Tunnel(TunnelTransport::spawn(cmd)?)
        } else {
            let policy = CertPolicy {
                require_ssl: config.tls.require_ssl,
                cert_file: config.tls.cert_file.clone(),
            };
            match config.tls.mode {
                TlsMode::Implicit => {
                    AnyTransport::Tcp(TcpTransport::connect_tls(&config.host, config.port, &policy)?)
                }
                _ => AnyTransport::Tcp(TcpTransport::connect(&config.host, config.port)?),
            }
        };

        let mut driver = ImapDriver {
            transport: Some(transport),
            lb: LineBuffer::new(),
            next_tag: 1,
            in_flight: VecDeque::new(),
            capabilities: Capabilities::empty(),
            literal_pending: false,
            completed: std::collections::HashMap::new(),
            pending_untagged: Vec::new(),
        };

        driver.greet_and_authenticate(config)?;
        Ok(driver)
    }

    fn t(&mut self) -> &mut AnyTransport {
        self.transport.as_mut().expect("transport always present outside promote_tls")
    }

    fn is_tls(&self) -> bool {
        matches!(self.transport, Some(AnyTransport::Tcp(TcpTransport::Tls(_))))
    }

    /// Promote the transport from plaintext TCP to TLS in place (spec
    /// §4.1 `start_tls`).
    fn promote_tls(&mut self, host: &str, policy: &CertPolicy) -> Result<()> {
        let transport = self.transport.take().expect("transport present before promote_tls");
        let promoted = transport.start_tls(host, policy)?;
        self.transport = Some(promoted);
        Ok(())
    }

    /// Spec §4.3.2 "Connection sequence".
    fn greet_and_authenticate(&mut self, config: &Config) -> Result<()> {
        let transport = self.transport.as_mut().expect("transport always present outside promote_tls");
        let greeting = self.lb.getline(transport)?;
        let (_, rest) = split_tag_and_rest(&greeting);
        let transport = self.transport.as_mut().expect("transport always present outside promote_tls");
        let nodes = parse_list_line(rest.to_owned(), &mut self.lb, transport)?;
        let kind = nodes.first().and_then(Node::as_atom).unwrap_or_default();
        let preauth = kind.eq_ignore_ascii_case("PREAUTH");
        if !preauth && !kind.eq_ignore_ascii_case("OK") {
            return Err(SyncError::store_bad(format!("unexpected greeting: {:?}", nodes)));
        }

        self.refresh_capabilities()?;

        let wants_tls = config.tls.mode != TlsMode::None;
        if wants_tls && config.tunnel.is_none() && !self.is_tls() {
            if self.capabilities.contains(Capabilities::STARTTLS) {
                self.call("STARTTLS")?;
                let policy = CertPolicy {
                    require_ssl: config.tls.require_ssl,
                    cert_file: config.tls.cert_file.clone(),
                };
                self.promote_tls(&config.host, &policy)?;
                self.refresh_capabilities()?;
            } else if config.tls.require_ssl {
                return Err(SyncError::config_error(
                    "server does not advertise STARTTLS and RequireSSL is set",
                ));
            } else {
                warn!("server does not support STARTTLS; continuing without TLS");
            }
        }

        if preauth {
            return Ok(());
        }

        if self.capabilities.contains(Capabilities::AUTH_CRAM_MD5) || config.tls.require_cram {
            auth::authenticate_cram_md5(self, &config.user, &config.pass)?;
        } else if !self.capabilities.contains(Capabilities::LOGINDISABLED) {
            auth::authenticate_login(self, &config.user, &config.pass)?;
        } else {
            return Err(SyncError::store_bad("server disabled LOGIN and does not support CRAM-MD5"));
        }
        Ok(())
    }

    fn refresh_capabilities(&mut self) -> Result<()> {
        let exchange = self.call("CAPABILITY")?;
        self.apply_capability_exchange(&exchange);
        Ok(())
    }

    fn apply_capability_exchange(&mut self, exchange: &Exchange) {
        for line in &exchange.untagged {
            if line
                .first()
                .and_then(Node::as_atom)
                .map(|a| a.eq_ignore_ascii_case("CAPABILITY"))
                .unwrap_or(false)
            {
                self.capabilities = Capabilities::parse(&line[1..]);
            }
        }
        for code in &exchange.codes {
            if let ResponseCode::Capability(atoms) = code {
                let nodes: Vec<Node> = atoms.iter().map(|a| Node::Atom(a.clone())).collect();
                self.capabilities = Capabilities::parse(&nodes);
            }
        }
    }

    /// Allocate the next monotonically increasing tag (spec §4.3.1).
    fn alloc_tag(&mut self) -> u32 {
        let t = self.next_tag;
        self.next_tag += 1;
        t
    }

    fn tag_str(tag: u32) -> String {
        format!("A{:04}", tag)
    }

    /// Submit a command with no literal payload, queuing it and writing
    /// its line immediately (subject to the `MAX_IN_PROGRESS` /
    /// literal-pending gates of spec §4.3.1).
    pub fn submit(&mut self, command: &str) -> Result<u32> {
        self.submit_with(command, Continuation::None, None, false)
    }

    pub fn submit_with(
        &mut self,
        command: &str,
        continuation: Continuation,
        create_on_no: Option<String>,
        trycreate: bool,
    ) -> Result<u32> {
        while self.literal_pending || self.in_flight.len() >= MAX_IN_PROGRESS {
            self.drain_one()?;
        }
        if self.t().pending()? > 0 {
            // Opportunistically drain to keep the dispatcher from
            // falling behind a chatty server (spec §4.3.1).
            self.drain_one()?;
        }

        let tag = self.alloc_tag();
        let tag_s = Self::tag_str(tag);
        let line = format!("{} {}\r\n", tag_s, command);
        self.t()
            .write_all(line.as_bytes())
            .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
        self.t().flush().ok();

        if matches!(continuation, Continuation::LiteralPayload(_)) {
            self.literal_pending = true;
        }

        self.in_flight.push_back(PendingCommand {
            tag,
            text: command.to_owned(),
            continuation,
            create_on_no,
            trycreate,
        });
        Ok(tag)
    }

    /// Process exactly one line's worth of server response (spec
    /// §4.3.1 "Response dispatch per received line").
    pub fn drain_one(&mut self) -> Result<()> {
        let transport = self.transport.as_mut().expect("transport always present outside promote_tls");
        let line = self.lb.getline(transport)?;
        if line.is_empty() {
            return Ok(());
        }
        let first_byte = line.as_bytes()[0];
        match first_byte {
            b'*' => self.dispatch_untagged(line),
            b'+' => self.dispatch_continuation(line),
            _ => self.dispatch_tagged(line),
        }
    }

    fn dispatch_untagged(&mut self, line: String) -> Result<()> {
        let rest = line[1..].trim_start().to_owned();
        let nodes = {
            let t = self.transport.as_mut().expect("transport present");
            parse_list_line(rest, &mut self.lb, t)?
        };
        if let Some(kind) = nodes.first().and_then(Node::as_atom) {
            let upper = kind.to_ascii_uppercase();
            if upper == "BYE" {
                return Err(SyncError::store_bad("server sent unsolicited BYE"));
            }
            if matches!(upper.as_str(), "OK" | "NO" | "BAD" | "PREAUTH") {
                if let Some(code_text) = nodes.get(1).and_then(Node::as_str) {
                    if let Some(code) = parse_response_code(code_text) {
                        if let ResponseCode::Alert(text) = &code {
                            eprintln!("ALERT: {}", text);
                        }
                        self.record_code(code);
                    }
                }
            }
        }
        self.pending_untagged.push(nodes);
        Ok(())
    }

    fn record_code(&mut self, code: ResponseCode) {
        if let Some(tag) = self.in_flight.front().map(|c| c.tag) {
            self.completed.entry(tag).or_default().codes.push(code);
        }
    }

    fn dispatch_continuation(&mut self, line: String) -> Result<()> {
        let challenge = line[1..].trim_start().to_owned();
        let Some(cmd) = self.in_flight.back_mut() else {
            return Ok(());
        };
        match &mut cmd.continuation {
            Continuation::LiteralPayload(payload) => {
                let payload = std::mem::take(payload);
                self.literal_pending = false;
                let t = self.transport.as_mut().expect("transport present");
                t.write_all(&payload)
                    .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
                t.write_all(b"\r\n")
                    .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
                t.flush().ok();
                if let Some(cmd) = self.in_flight.back_mut() {
                    cmd.continuation = Continuation::None;
                }
            }
            Continuation::CramChallenge { user, secret } => {
                let reply = auth::cram_md5_response(&challenge, user, secret)?;
                let t = self.transport.as_mut().expect("transport present");
                t.write_all(reply.as_bytes())
                    .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
                t.write_all(b"\r\n")
                    .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
                t.flush().ok();
                if let Some(cmd) = self.in_flight.back_mut() {
                    cmd.continuation = Continuation::None;
                }
            }
            Continuation::None => {}
        }
        Ok(())
    }

    fn dispatch_tagged(&mut self, line: String) -> Result<()> {
        let mut parts = line.splitn(3, ' ');
        let tag_s = parts.next().unwrap_or_default();
        let status_atom = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        let Some(pos) = self.in_flight.iter().position(|c| Self::tag_str(c.tag) == tag_s) else {
            debug!("unmatched tagged response: {}", line);
            return Ok(());
        };
        let cmd = self.in_flight.remove(pos).unwrap();
        let status = TaggedStatus::parse(status_atom)
            .ok_or_else(|| SyncError::box_bad(format!("unrecognised tagged status: {}", line)))?;

        let mut exchange = self.completed.remove(&cmd.tag).unwrap_or_default();
        exchange.untagged.extend(std::mem::take(&mut self.pending_untagged));
        exchange.status = Some(status);
        exchange.text = rest.to_owned();
        if let Some(code) = parse_response_code(rest) {
            if let ResponseCode::Alert(text) = &code {
                eprintln!("ALERT: {}", text);
            }
            if matches!(code, ResponseCode::TryCreate) {
                exchange.needs_create = cmd.create_on_no.clone();
            }
            exchange.codes.push(code);
        }
        if status == TaggedStatus::No && cmd.trycreate && exchange.needs_create.is_none() {
            exchange.needs_create = cmd.create_on_no.clone();
        }
        self.completed.insert(cmd.tag, exchange);
        Ok(())
    }

    /// Block until `tag`'s tagged response has arrived, returning its
    /// full exchange (spec §4.3.1 "get_cmd_result").
    pub fn wait_for(&mut self, tag: u32) -> Result<Exchange> {
        loop {
            if let Some(exchange) = self.completed.remove(&tag) {
                return Ok(exchange);
            }
            self.drain_one()?;
        }
    }

    /// Convenience: submit and wait for a simple command with no
    /// literal payload.
    pub fn call(&mut self, command: &str) -> Result<Exchange> {
        let tag = self.submit(command)?;
        self.wait_for(tag)
    }

    pub fn call_create_on_no(&mut self, command: &str, create_box: &str, trycreate: bool) -> Result<Exchange> {
        let tag = self.submit_with(command, Continuation::None, Some(create_box.to_owned()), trycreate)?;
        self.wait_for(tag)
    }

    /// Issue a command carrying a literal payload (e.g. `APPEND`),
    /// honoring `LITERAL+` to avoid the continuation round-trip (spec
    /// §4.3.1, §4.3.3 `append`).
    pub fn call_with_literal(&mut self, prefix_before_len: &str, literal: &[u8]) -> Result<Exchange> {
        let has_literal_plus = self.capabilities.contains(Capabilities::LITERALPLUS);
        let marker = if has_literal_plus {
            format!("{{{}+}}", literal.len())
        } else {
            format!("{{{}}}", literal.len())
        };
        let command = format!("{} {}", prefix_before_len, marker);

        if has_literal_plus {
            let tag = self.submit(&command)?;
            // Non-synchronizing literal: no '+' round-trip, write the
            // payload immediately after the command line.
            let t = self.t();
            t.write_all(literal)
                .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
            t.write_all(b"\r\n")
                .map_err(|e| SyncError::store_bad(format!("write failed: {}", e)))?;
            t.flush().ok();
            self.wait_for(tag)
        } else {
            let tag = self.submit_with(&command, Continuation::LiteralPayload(literal.to_vec()), None, false)?;
            self.wait_for(tag)
        }
    }

    pub fn logout(&mut self) -> Result<()> {
        self.call("LOGOUT")?;
        Ok(())
    }
}

fn split_tag_and_rest(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, ""),
    }
}
