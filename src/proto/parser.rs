//! IMAP atom/quoted-string/parenthesised-list/literal grammar parser
//! (spec §4.2). Produces a tagged tree; literals are pulled directly off
//! the transport via the shared [`LineBuffer`], possibly spanning
//! several physical CRLF-terminated lines.

use crate::error::{Result, SyncError};
use crate::proto::LineBuffer;
use crate::transport::Transport;

/// One node of the parsed response tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A raw, unquoted token.
    Atom(String),
    /// The distinguished `NIL` sentinel — only recognised when it forms
    /// a whole atom, never as a substring (spec §4.2).
    Nil,
    /// A double-quoted string, with escapes resolved.
    Quoted(String),
    /// An `{n}` counted literal: exactly `n` bytes read straight off the
    /// transport.
    Literal(Vec<u8>),
    /// A parenthesised, space-separated sequence.
    List(Vec<Node>),
}

impl Node {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Node::Atom(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Atom(s) | Node::Quoted(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Node::Literal(b) => Some(b.as_slice()),
            _ => None,
        }
    }
}

/// Parses every top-level token of one logical IMAP response line into a
/// flat list of sibling [`Node`]s. `line` is the line already returned
/// by [`LineBuffer::getline`] (CRLF stripped); more lines are pulled
/// through `lb`/`transport` as needed to satisfy literals.
///
/// On any parse failure the partially built tree is simply dropped —
/// Rust's ownership takes care of freeing the whole subtree (spec §4.2
/// "Free the whole subtree on any parse failure").
pub fn parse_list_line(line: String, lb: &mut LineBuffer, transport: &mut dyn Transport) -> Result<Vec<Node>> {
    let mut cur = Cursor { s: line, pos: 0 };
    let mut nodes = Vec::new();
    loop {
        cur.skip_spaces();
        if cur.at_end() {
            break;
        }
        nodes.push(parse_one(&mut cur, lb, transport)?);
    }
    Ok(nodes)
}

struct Cursor {
    s: String,
    pos: usize,
}

impl Cursor {
    fn at_end(&self) -> bool {
        self.pos >= self.s.as_bytes().len()
    }

    fn peek(&self) -> Option<u8> {
        self.s.as_bytes().get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    /// Append more response content (the continuation of the logical
    /// line after a literal's raw bytes) and keep parsing from the
    /// current position.
    fn extend(&mut self, more: String) {
        self.s.push_str(&more);
    }
}

fn parse_one(cur: &mut Cursor, lb: &mut LineBuffer, transport: &mut dyn Transport) -> Result<Node> {
    match cur.peek() {
        None => Err(SyncError::box_bad("unexpected end of response while parsing")),
        Some(b'(') => parse_list(cur, lb, transport),
        Some(b'"') => parse_quoted(cur),
        Some(b'{') => parse_literal(cur, lb, transport),
        Some(_) => parse_atom(cur),
    }
}

fn parse_list(cur: &mut Cursor, lb: &mut LineBuffer, transport: &mut dyn Transport) -> Result<Node> {
    cur.pos += 1; // consume '('
    let mut items = Vec::new();
    loop {
        cur.skip_spaces();
        match cur.peek() {
            None => return Err(SyncError::box_bad("unterminated list in response")),
            Some(b')') => {
                cur.pos += 1;
                return Ok(Node::List(items));
            }
            _ => items.push(parse_one(cur, lb, transport)?),
        }
    }
}

fn parse_quoted(cur: &mut Cursor) -> Result<Node> {
    cur.pos += 1; // opening quote
    let bytes = cur.s.as_bytes();
    let mut out = String::new();
    loop {
        match bytes.get(cur.pos).copied() {
            None => return Err(SyncError::box_bad("unterminated quoted string in response")),
            Some(b'"') => {
                cur.pos += 1;
                return Ok(Node::Quoted(out));
            }
            Some(b'\\') => {
                cur.pos += 1;
                match bytes.get(cur.pos).copied() {
                    Some(c) => {
                        out.push(c as char);
                        cur.pos += 1;
                    }
                    None => return Err(SyncError::box_bad("dangling escape in quoted string")),
                }
            }
            Some(c) => {
                out.push(c as char);
                cur.pos += 1;
            }
        }
    }
}

fn parse_atom(cur: &mut Cursor) -> Result<Node> {
    let start = cur.pos;
    let bytes = cur.s.as_bytes();
    while let Some(c) = bytes.get(cur.pos).copied() {
        if c == b' ' || c == b'(' || c == b')' {
            break;
        }
        cur.pos += 1;
    }
    if cur.pos == start {
        return Err(SyncError::box_bad("empty atom in response"));
    }
    let text = cur.s[start..cur.pos].to_owned();
    // NIL is only special when it forms a whole atom (spec §4.2).
    if text.eq_ignore_ascii_case("nil") {
        Ok(Node::Nil)
    } else {
        Ok(Node::Atom(text))
    }
}

fn parse_literal(cur: &mut Cursor, lb: &mut LineBuffer, transport: &mut dyn Transport) -> Result<Node> {
    cur.pos += 1; // consume '{'
    let start = cur.pos;
    let bytes = cur.s.as_bytes();
    while let Some(c) = bytes.get(cur.pos).copied() {
        if c == b'}' {
            break;
        }
        cur.pos += 1;
    }
    let digits = &cur.s[start..cur.pos];
    let n: usize = digits
        .trim_end_matches('+') // LITERAL+ non-synchronizing literal marker
        .parse()
        .map_err(|_| SyncError::box_bad(format!("malformed literal length {:?}", digits)))?;
    if cur.peek() != Some(b'}') {
        return Err(SyncError::box_bad("unterminated literal length"));
    }
    cur.pos += 1; // consume '}'
    // Whatever followed `{n}` on this physical line was only ever the
    // CRLF that `getline` already stripped, so the literal's bytes come
    // next directly off the transport.
    let data = lb.read_literal(transport, n)?;
    // The server may continue the logical response after the literal's
    // raw bytes, up to the next real CRLF; pull that tail in and keep
    // parsing from here.
    let tail = lb.getline(transport)?;
    cur.extend(tail);
    Ok(Node::Literal(data))
}
