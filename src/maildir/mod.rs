//! Maildir driver: on-disk layout, UID persistence, scanning, and
//! mutation (spec §4.4).

mod lock;
mod store;
mod uidmap;

pub use store::{MaildirStore, ScanOptions};
pub use uidmap::UidScheme;
