//! Per-message and per-mailbox data model shared by both drivers (spec §3).

use std::fmt;

/// UID value meaning "local-only, not yet uploaded".
pub const UID_SENTINEL: u32 = 0;

/// Minimal hand-rolled bitflags macro, in the spirit of the teacher's
/// preference for small local helpers over an extra dependency for a
/// five-bit set (see DESIGN.md).
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $( const $flag:ident = $val:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(pub $ty);

        impl $name {
            $( pub const $flag: $name = $name($val); )*

            pub const EMPTY: $name = $name(0);

            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            pub fn intersection(self, other: $name) -> $name {
                $name(self.0 & other.0)
            }

            pub fn difference(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }
    };
}

bitflags_like! {
    /// The syncable flag set: {Seen, Answered, Deleted, Flagged, Draft}.
    /// `\Recent` is intentionally not a member — it lives in [`Status`].
    pub struct Flags: u8 {
        const SEEN     = 0b0000_0001;
        const ANSWERED = 0b0000_0010;
        const DELETED  = 0b0000_0100;
        const FLAGGED  = 0b0000_1000;
        const DRAFT    = 0b0001_0000;
    }
}

bitflags_like! {
    /// Transient, non-syncable per-message status bits.
    pub struct Status: u8 {
        const RECENT        = 0b0000_0001;
        const DEAD          = 0b0000_0010;
        const FLAGS_FETCHED = 0b0000_0100;
    }
}

impl Flags {
    /// Parse a Maildir `:2,<flags>` suffix (subset of `DFRST`) into the
    /// syncable flag set. `T` (Trashed) maps to `Deleted`; `R` (Replied)
    /// maps to `Answered`.
    pub fn from_maildir_suffix(suffix: &str) -> Flags {
        let mut f = Flags::EMPTY;
        for c in suffix.chars() {
            match c {
                'D' => f.insert(Flags::DRAFT),
                'F' => f.insert(Flags::FLAGGED),
                'R' => f.insert(Flags::ANSWERED),
                'S' => f.insert(Flags::SEEN),
                'T' => f.insert(Flags::DELETED),
                _ => {}
            }
        }
        f
    }

    /// Render the Maildir `:2,<flags>` suffix letters, in the canonical
    /// lexical order `DFRST`.
    pub fn to_maildir_suffix(self) -> String {
        let mut s = String::with_capacity(5);
        if self.contains(Flags::DRAFT) {
            s.push('D');
        }
        if self.contains(Flags::FLAGGED) {
            s.push('F');
        }
        if self.contains(Flags::ANSWERED) {
            s.push('R');
        }
        if self.contains(Flags::SEEN) {
            s.push('S');
        }
        if self.contains(Flags::DELETED) {
            s.push('T');
        }
        s
    }

    /// Render the IMAP `(\Flag \Flag ...)` parenthesised list.
    pub fn to_imap_list(self) -> String {
        let mut parts = Vec::new();
        if self.contains(Flags::DRAFT) {
            parts.push("\\Draft");
        }
        if self.contains(Flags::FLAGGED) {
            parts.push("\\Flagged");
        }
        if self.contains(Flags::ANSWERED) {
            parts.push("\\Answered");
        }
        if self.contains(Flags::SEEN) {
            parts.push("\\Seen");
        }
        if self.contains(Flags::DELETED) {
            parts.push("\\Deleted");
        }
        format!("({})", parts.join(" "))
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_maildir_suffix())
    }
}

/// Opaque 12-character tag used to re-identify a freshly appended message
/// when the server gave no `APPENDUID` (spec §3, §4.5.1, GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuid(pub String);

impl Tuid {
    pub const LEN: usize = 12;

    /// Generate a fresh random lowercase-hex TUID.
    pub fn generate() -> Tuid {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let s: String = (0..Tuid::LEN)
            .map(|_| {
                let n: u8 = rng.gen_range(0..16);
                std::char::from_digit(n as u32, 16).unwrap()
            })
            .collect();
        Tuid(s)
    }

    pub fn header_line(&self) -> String {
        format!("X-TUID: {}\r\n", self.0)
    }
}

/// A message as held in memory by either driver, per spec §3.
#[derive(Debug, Clone)]
pub struct Message {
    pub uid: u32,
    pub flags: Flags,
    pub size: Option<u64>,
    pub status: Status,
    pub tuid: Option<Tuid>,

    /// Local-only: filename base within the Maildir, without the
    /// `:2,<flags>` suffix or `,U=<uid>` tag.
    pub local_base: Option<String>,
    /// Local-only: whether the message currently lives under `new/`
    /// (true) or `cur/` (false).
    pub in_new: bool,
}

impl Message {
    pub fn new_remote(uid: u32, flags: Flags) -> Self {
        Message {
            uid,
            flags,
            size: None,
            status: Status::EMPTY,
            tuid: None,
            local_base: None,
            in_new: false,
        }
    }

    pub fn new_local(base: String, flags: Flags, in_new: bool) -> Self {
        Message {
            uid: UID_SENTINEL,
            flags,
            size: None,
            status: if in_new { Status::RECENT } else { Status::EMPTY },
            tuid: None,
            local_base: Some(base),
            in_new,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.uid == UID_SENTINEL
    }

    pub fn is_dead(&self) -> bool {
        self.status.contains(Status::DEAD)
    }

    pub fn mark_dead(&mut self) {
        self.status.insert(Status::DEAD);
    }
}

/// Persistent per-local-Maildir sync state (spec §3 "Mailbox state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxState {
    pub uidvalidity: u32,
    pub maxuid: u32,
    pub nuid: u32,
}

impl MailboxState {
    pub fn fresh(uidvalidity: u32) -> Self {
        MailboxState {
            uidvalidity,
            maxuid: 0,
            nuid: 1,
        }
    }

    /// Invariant I1: every non-sentinel local UID must be `<= maxuid`.
    /// Record a newly observed or assigned UID, advancing `maxuid` as
    /// needed (I1, spec §3).
    pub fn observe_uid(&mut self, uid: u32) {
        if uid > self.maxuid {
            self.maxuid = uid;
        }
    }

    pub fn alloc_uid(&mut self) -> u32 {
        self.maxuid += 1;
        self.maxuid
    }
}
