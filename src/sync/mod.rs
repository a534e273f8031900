//! The sync engine: preflight, UID pairing, MaxMessages trimming, and
//! finalization (spec §4.5).

use std::collections::HashSet;

use log::{info, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::imap::{self, MailboxSession};
use crate::maildir::{MaildirStore, ScanOptions};
use crate::message::{Flags, Message, Tuid};

/// Counts returned to the (out-of-scope) CLI layer for a single
/// mailbox's run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub appended: u32,
    pub fetched: u32,
    pub flagged: u32,
    pub expunged: u32,
    pub orphaned: u32,
    pub skipped: u32,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        self.appended += rhs.appended;
        self.fetched += rhs.fetched;
        self.flagged += rhs.flagged;
        self.expunged += rhs.expunged;
        self.orphaned += rhs.orphaned;
        self.skipped += rhs.skipped;
    }
}

/// Run the sync engine for every mailbox named in `boxes` against the
/// same remote session, without logging out in between (spec §4.5.4
/// "Do not LOGOUT between mailboxes that share a server config").
pub fn run_all(config: &Config, boxes: &[String]) -> Result<Stats> {
    let mut session = imap::open_session(config)?;
    let mut total = Stats::default();
    let mut aborted = 0u32;

    for box_name in boxes {
        match run_one(config, &mut session, box_name) {
            Ok(stats) => total += stats,
            Err(e) if !e.is_store_fatal() => {
                warn!("mailbox {} aborted: {}", box_name, e);
                aborted += 1;
            }
            Err(e) => {
                session.logout().ok();
                return Err(e);
            }
        }
    }
    if aborted > 0 {
        info!("{} of {} mailboxes aborted", aborted, boxes.len());
    }
    session.logout()?;
    Ok(total)
}

fn run_one(config: &Config, session: &mut MailboxSession, box_name: &str) -> Result<Stats> {
    let local_root = local_root(config, box_name);
    let mut local = MaildirStore::open(&local_root, config.policy.create_local)?;

    let info = session.select(box_name, config.policy.create_remote)?;

    // Preflight step 3: UIDVALIDITY agreement (spec §4.5.1). A fresh local
    // mailbox (no sidecar ever read from disk) adopts the remote's value
    // instead of being compared against it, since its in-memory value is
    // just a self-generated epoch, not a prior sync's record.
    if local.is_fresh() {
        local.adopt_uidvalidity(info.uidvalidity)?;
    } else {
        let local_state = local.state();
        if local_state.uidvalidity != info.uidvalidity {
            return Err(SyncError::box_bad(format!(
                "UIDVALIDITY mismatch for {}: local {} != remote {}",
                box_name, local_state.uidvalidity, info.uidvalidity
            )));
        }
    }

    let scan_opts = ScanOptions { read_size: config.caps.max_size > 0, read_tuid: true };
    let mut local_messages = local.scan(scan_opts)?;

    let minuid = if config.policy.fast { local.state().maxuid + 1 } else { 1 };
    let remote_messages = session.scan(minuid, None, &[])?;
    let mut remote_by_uid: std::collections::HashMap<u32, Message> =
        remote_messages.into_iter().map(|m| (m.uid, m)).collect();

    let mut stats = Stats::default();
    let mut seen_remote_uids = HashSet::new();
    let mut any_deleted = false;

    for msg in local_messages.iter_mut() {
        if msg.is_sentinel() {
            handle_unuploaded(session, &mut local, msg, box_name, config, &mut stats)?;
            if !msg.is_sentinel() {
                seen_remote_uids.insert(msg.uid);
            }
            continue;
        }

        match remote_by_uid.remove(&msg.uid) {
            None => {
                if config.policy.delete {
                    msg.flags.insert(Flags::DELETED);
                    msg.mark_dead();
                    any_deleted = true;
                } else {
                    info!("orphan: local UID {} in {} has no remote counterpart", msg.uid, box_name);
                    stats.orphaned += 1;
                }
            }
            Some(remote_msg) => {
                seen_remote_uids.insert(msg.uid);
                if flags_differ(msg.flags, remote_msg.flags) {
                    reconcile_flags(session, &mut local, msg, remote_msg.flags, config, &mut stats)?;
                }
                if msg.flags.contains(Flags::DELETED) {
                    any_deleted = true;
                }
            }
        }
    }

    // Remaining remote messages were never paired with a local one.
    for (_uid, remote_msg) in remote_by_uid.into_iter() {
        if seen_remote_uids.contains(&remote_msg.uid) {
            continue;
        }
        if config.policy.expunge && remote_msg.flags.contains(Flags::DELETED) {
            continue;
        }
        if config.caps.max_size > 0 && remote_msg.size.unwrap_or(0) > config.caps.max_size {
            info!("skipping UID {} in {}: exceeds MaxSize", remote_msg.uid, box_name);
            stats.skipped += 1;
            continue;
        }
        let stored = download_message(session, &mut local, &remote_msg, config)?;
        stats.fetched += 1;
        local_messages.push(stored);
    }

    trim_max_messages(&mut local_messages, config.caps.max_messages);
    if local_messages.iter().any(|m| m.flags.contains(Flags::DELETED) && m.is_dead()) {
        any_deleted = true;
    }

    finalize(session, &mut local, &mut local_messages, config, any_deleted, &mut stats)?;

    Ok(stats)
}

/// Flags differ for pairing purposes when ignoring `Recent` (which has
/// no bit in [`Flags`] at all — it lives in `Status`) and `Draft` (spec
/// §4.5.2).
fn flags_differ(local: Flags, remote: Flags) -> bool {
    local.difference(Flags::DRAFT) != remote.difference(Flags::DRAFT)
}

fn handle_unuploaded(
    session: &mut MailboxSession,
    local: &mut MaildirStore,
    msg: &mut Message,
    box_name: &str,
    config: &Config,
    stats: &mut Stats,
) -> Result<()> {
    if msg.flags.contains(Flags::DELETED) && config.policy.expunge {
        stats.skipped += 1;
        return Ok(());
    }
    if config.caps.max_size > 0 {
        if let Some(size) = msg.size {
            if size > config.caps.max_size {
                warn!("skipping local message: exceeds MaxSize");
                stats.skipped += 1;
                return Ok(());
            }
        }
    }

    let body = local.read_body(msg)?;
    let tuid = Tuid::generate();
    match session.append(box_name, msg.flags, &body, &tuid) {
        Ok(Some(uid)) => {
            local.assign_uploaded_uid(msg, uid)?;
            stats.appended += 1;
        }
        Ok(None) => match session.find_tuid(&tuid) {
            Ok(Some(uid)) => {
                local.assign_uploaded_uid(msg, uid)?;
                stats.appended += 1;
            }
            Ok(None) => {
                warn!("APPEND succeeded but UID could not be recovered via X-TUID search");
            }
            Err(e) => warn!("X-TUID recovery failed: {}", e),
        },
        Err(e) => {
            // Any upload failure is non-fatal for the run (spec §4.5.2).
            warn!("APPEND failed for local message: {}", e);
            stats.skipped += 1;
        }
    }
    Ok(())
}

fn reconcile_flags(
    session: &mut MailboxSession,
    local: &mut MaildirStore,
    msg: &mut Message,
    remote_flags: Flags,
    config: &Config,
    stats: &mut Stats,
) -> Result<()> {
    let add = msg.flags.difference(remote_flags);
    let del = remote_flags.difference(msg.flags);

    if let Some(trash_box) = &config.policy.copy_deleted_to {
        let either_side_deleted = add.contains(Flags::DELETED) || remote_flags.contains(Flags::DELETED) || msg.flags.contains(Flags::DELETED);
        if config.policy.expunge && either_side_deleted {
            if let Err(e) = session.trash(msg.uid, trash_box) {
                warn!("copy-to-trash failed for UID {}: {}", msg.uid, e);
            }
        }
    }

    if !add.is_empty() {
        if let Err(e) = session.set_flags(msg.uid, add, Flags::EMPTY) {
            warn!("flag sync failed for UID {}: {}", msg.uid, e);
            return Ok(());
        }
    }

    let merged = msg.flags.union(remote_flags.difference(Flags::DRAFT));
    if merged != msg.flags {
        let local_add = merged.difference(msg.flags);
        let local_del = msg.flags.difference(merged);
        local.set_flags(msg, local_add, local_del)?;
    }
    let _ = del; // one-way local->remote: remote-only removals are not pushed back down
    stats.flagged += 1;
    Ok(())
}

fn download_message(session: &mut MailboxSession, local: &mut MaildirStore, remote_msg: &Message, _config: &Config) -> Result<Message> {
    let (body, _) = session.fetch_body(remote_msg.uid, false)?;
    let host = hostname();
    local.store_downloaded(&body, remote_msg.flags, &host, remote_msg.uid)
}

/// Spec §4.5.3: sacrosanct `Flagged` messages aside, keep only the
/// newest `MaxMessages` UIDs.
fn trim_max_messages(messages: &mut [Message], max_messages: u32) {
    if max_messages == 0 {
        return;
    }
    let mut uids: Vec<u32> = messages.iter().filter(|m| !m.is_sentinel()).map(|m| m.uid).collect();
    uids.sort_unstable();
    if (uids.len() as u32) <= max_messages {
        return;
    }
    let cutoff_index = uids.len() - max_messages as usize;
    let keep: HashSet<u32> = uids[cutoff_index..].iter().copied().collect();
    for msg in messages.iter_mut() {
        if msg.is_sentinel() || keep.contains(&msg.uid) || msg.flags.contains(Flags::FLAGGED) {
            continue;
        }
        msg.flags.insert(Flags::DELETED);
        msg.mark_dead();
    }
}

/// Spec §4.5.4: there is no IMAP command for un-SELECTing a mailbox, so
/// the session is left SELECTed on this mailbox between runs rather
/// than closed — `CLOSE` implicitly expunges every `\Deleted` message,
/// which would silently delete more than the policy asked for when
/// `expunge` is off. Only `run_all`'s trailing `logout()` ends the
/// session.
fn finalize(
    session: &mut MailboxSession,
    local: &mut MaildirStore,
    messages: &mut [Message],
    config: &Config,
    any_deleted: bool,
    stats: &mut Stats,
) -> Result<()> {
    if config.policy.expunge && any_deleted {
        session.expunge()?;
        stats.expunged += local.expunge(messages)?.try_into().unwrap_or(u32::MAX);
    } else if config.policy.delete {
        let dead_count = local.expunge(messages)?;
        stats.expunged += dead_count.try_into().unwrap_or(u32::MAX);
    }
    local.close()
}

/// `MapInbox` remaps the local directory used for the remote `INBOX`
/// (any other mailbox is addressed under `maildir_root` by its own
/// name), matching the driver's own `INBOX` special-case of substituting
/// a configured path for the usual `<root>/<name>` join.
fn local_root(config: &Config, box_name: &str) -> std::path::PathBuf {
    if box_name.eq_ignore_ascii_case("INBOX") {
        if let Some(mapped) = &config.policy.map_inbox {
            return std::path::PathBuf::from(mapped);
        }
    }
    config.maildir_root.join(box_name)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}
