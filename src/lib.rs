//! Bidirectional IMAP4rev1 <-> Maildir mailbox reconciler.
//!
//! The crate is organized the way the component design splits it:
//! transport and wire parsing (`proto`, `transport`), the IMAP driver
//! and its mailbox-operations table (`imap`), the Maildir driver
//! (`maildir`), the shared data model (`message`), configuration
//! (`config`), and the sync engine that ties local and remote stores
//! together (`sync`).

pub mod config;
pub mod error;
pub mod imap;
pub mod maildir;
pub mod message;
pub mod proto;
pub mod sync;
pub mod transport;

pub use error::{Result, SyncError};
