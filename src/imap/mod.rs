//! IMAP4rev1 driver: transport-level command pipeline, capability and
//! authentication handling, and the mailbox-operations table (spec §4.3).

mod auth;
mod commands;
mod driver;
mod response;

pub use commands::{ListEntry, MailboxInfo, MailboxSession};
pub use driver::{Exchange, ImapDriver, MAX_IN_PROGRESS};
pub use response::{Capabilities, ResponseCode, TaggedStatus};

use crate::config::Config;
use crate::error::Result;

/// Connect, authenticate, and resolve the namespace prefix, handing back
/// a ready-to-use [`MailboxSession`] (spec §4.3.2, §4.3.3).
pub fn open_session(config: &Config) -> Result<MailboxSession> {
    let mut driver = ImapDriver::connect(config)?;
    let prefix = resolve_prefix(&mut driver, config)?;
    Ok(MailboxSession::new(driver, prefix))
}

fn resolve_prefix(driver: &mut ImapDriver, config: &Config) -> Result<String> {
    if let Some(explicit) = &config.policy.folder_prefix {
        return Ok(explicit.clone());
    }
    if config.policy.use_namespace {
        return MailboxSession::resolve_namespace(driver);
    }
    Ok(String::new())
}
