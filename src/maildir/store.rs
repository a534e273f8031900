//! Maildir scanning and mutation (spec §4.4.1, §4.4.3, §4.4.4).

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::{Result, SyncError};
use crate::message::{Flags, MailboxState, Message, UID_SENTINEL};

use super::uidmap::{UidMap, UidScheme};

const STALE_TMP_SECS: u64 = 24 * 60 * 60;

/// Optional scan features opted into per open (spec §4.4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub read_size: bool,
    pub read_tuid: bool,
}

pub struct MaildirStore {
    root: PathBuf,
    uidmap: UidMap,
    counter: u64,
}

impl MaildirStore {
    /// Open a Maildir at `root`, creating `cur/`, `new/`, `tmp/` with
    /// mode `0700` if `create` is set (spec §4.4.1).
    pub fn open(root: &Path, create: bool) -> Result<MaildirStore> {
        let dirs = [root.join("cur"), root.join("new"), root.join("tmp")];
        let missing = dirs.iter().any(|d| !d.is_dir());
        if missing {
            if !create {
                return Err(SyncError::box_bad(format!("{} is not a valid Maildir", root.display())));
            }
            for d in &dirs {
                create_dir_0700(d)?;
            }
        }
        let uidmap = UidMap::open(root)?;
        Ok(MaildirStore { root: root.to_owned(), uidmap, counter: 0 })
    }

    pub fn state(&self) -> MailboxState {
        self.uidmap.state()
    }

    /// Spec §4.5.1 preflight: "local unset" means no UIDVALIDITY sidecar
    /// was readable at `open`, not "`uidvalidity == 0`" (a self-generated
    /// epoch is never 0).
    pub fn is_fresh(&self) -> bool {
        self.uidmap.is_fresh()
    }

    /// Adopt the remote's UIDVALIDITY for a brand-new local mailbox and
    /// persist it immediately (spec §4.5.1).
    pub fn adopt_uidvalidity(&mut self, uidvalidity: u32) -> Result<()> {
        self.uidmap.adopt(uidvalidity);
        self.uidmap.persist()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate `new/` and `cur/`, resolving UIDs per the active
    /// scheme and restarting on catastrophic collision (spec §4.4.3).
    pub fn scan(&mut self, opts: ScanOptions) -> Result<Vec<Message>> {
        loop {
            match self.scan_once(opts) {
                ScanResult::Ok(messages) => return Ok(messages),
                ScanResult::Collision(uid, first, second) => {
                    warn!(
                        "duplicate UID {} in {} between {} and {}; regenerating UIDVALIDITY",
                        uid,
                        self.root.display(),
                        first,
                        second
                    );
                    self.uidmap.regenerate()?;
                }
                ScanResult::Err(e) => return Err(e),
            }
        }
    }

    fn scan_once(&mut self, opts: ScanOptions) -> ScanResult {
        let mut messages = Vec::new();
        let mut seen_uids: std::collections::HashMap<u32, String> = std::collections::HashMap::new();

        for (subdir, in_new) in [("new", true), ("cur", false)] {
            let dir = self.root.join(subdir);
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) => return ScanResult::Err(SyncError::box_bad(format!("reading {}: {}", dir.display(), e))),
            };
            for entry in entries {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => return ScanResult::Err(SyncError::from(e)),
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let (base, embedded_uid, flags) = parse_filename(&name);

                let uid = match self.resolve_uid(&base, embedded_uid, flags, &dir, &name) {
                    Ok(u) => u,
                    Err(e) => return ScanResult::Err(e),
                };
                if uid != UID_SENTINEL {
                    if let Some(first) = seen_uids.insert(uid, name.clone()) {
                        return ScanResult::Collision(uid, first, name);
                    }
                }
                self.uidmap.observe_uid(uid);

                let mut msg = Message::new_local(base, flags, in_new);
                msg.uid = uid;
                if opts.read_size {
                    msg.size = entry.metadata().ok().map(|m| m.len());
                }
                if opts.read_tuid {
                    msg.tuid = read_x_tuid(&dir.join(&name));
                }
                messages.push(msg);
            }
        }

        messages.sort_by_key(|m| (m.uid, arrival_key(m.local_base.as_deref().unwrap_or(""))));
        if let Err(e) = self.uidmap.persist() {
            return ScanResult::Err(e);
        }
        ScanResult::Ok(messages)
    }

    /// A file with no embedded UID (scheme A) or no map entry (scheme B)
    /// is a message never uploaded to the remote: it stays at
    /// [`UID_SENTINEL`] until `assign_uploaded_uid` tags it with the
    /// UID the server actually assigned (spec §3 "local-only, not yet
    /// uploaded"; see DESIGN.md for why this departs from eagerly
    /// minting a local placeholder UID).
    fn resolve_uid(&self, base: &str, embedded_uid: Option<u32>, _flags: Flags, _dir: &Path, _name: &str) -> Result<u32> {
        match self.uidmap.scheme() {
            UidScheme::FilenameEmbedded => Ok(embedded_uid.unwrap_or(UID_SENTINEL)),
            UidScheme::DatabaseMapped => Ok(self.uidmap.lookup(base).unwrap_or(UID_SENTINEL)),
        }
    }

    /// Store a brand-new message with no UID yet (e.g. a future local
    /// draft staged for upload) (spec §4.4.4 "Store new message").
    pub fn store_new(&mut self, body: &[u8], flags: Flags, host: &str) -> Result<Message> {
        self.store_new_inner(body, flags, host, None)
    }

    /// Store a message just downloaded from the remote, with its UID
    /// already known — recorded in the UID map immediately (spec §4.5.2
    /// "Otherwise" row).
    pub fn store_downloaded(&mut self, body: &[u8], flags: Flags, host: &str, uid: u32) -> Result<Message> {
        let msg = self.store_new_inner(body, flags, host, Some(uid))?;
        self.uidmap.observe_uid(uid);
        if self.uidmap.scheme() == UidScheme::DatabaseMapped {
            if let Some(base) = &msg.local_base {
                self.uidmap.assign(base, uid);
            }
        }
        self.uidmap.persist()?;
        Ok(msg)
    }

    fn store_new_inner(&mut self, body: &[u8], flags: Flags, host: &str, uid: Option<u32>) -> Result<Message> {
        self.counter += 1;
        let base = generate_base(host, self.counter);
        let name = build_filename(&base, uid, flags);

        let tmp_path = self.root.join("tmp").join(&name);
        {
            let mut f = fs::File::create(&tmp_path).map_err(SyncError::from)?;
            f.write_all(body).map_err(SyncError::from)?;
            f.sync_all().map_err(SyncError::from)?;
        }

        let subdir = if flags.contains(Flags::SEEN) { "cur" } else { "new" };
        let dest = self.root.join(subdir).join(&name);
        if dest.exists() {
            return Err(SyncError::fatal(format!("maildir filename collision: {}", dest.display())));
        }
        fs::rename(&tmp_path, &dest).map_err(|e| SyncError::store_bad(format!("linking new message into place: {}", e)))?;

        let mut msg = Message::new_local(base, flags, subdir == "new");
        msg.uid = uid.unwrap_or(UID_SENTINEL);
        Ok(msg)
    }

    /// Read a local message's raw bytes back off disk (needed to
    /// `APPEND` a not-yet-uploaded message, spec §4.5.2).
    pub fn read_body(&self, msg: &Message) -> Result<Vec<u8>> {
        let base = msg.local_base.as_deref().ok_or_else(|| SyncError::fatal("read_body on a message with no local file"))?;
        let subdir = if msg.in_new { "new" } else { "cur" };
        let name = build_filename(base, non_sentinel(msg.uid), msg.flags);
        let path = self.root.join(subdir).join(&name);
        fs::read(&path).map_err(|e| SyncError::msg_bad(format!("reading {}: {}", path.display(), e)))
    }

    /// Tag a local message with the UID the remote just assigned it
    /// (spec §4.5.2 "update local UID map").
    pub fn assign_uploaded_uid(&mut self, msg: &mut Message, uid: u32) -> Result<()> {
        let base = msg.local_base.clone().ok_or_else(|| SyncError::fatal("assign_uploaded_uid on a message with no local file"))?;
        match self.uidmap.scheme() {
            UidScheme::FilenameEmbedded => {
                let subdir = if msg.in_new { "new" } else { "cur" };
                let old_name = build_filename(&base, None, msg.flags);
                let new_name = build_filename(&base, Some(uid), msg.flags);
                let old_path = self.root.join(subdir).join(&old_name);
                let new_path = self.root.join(subdir).join(&new_name);
                fs::rename(&old_path, &new_path)
                    .map_err(|e| SyncError::msg_bad(format!("tagging {} with its new UID: {}", old_name, e)))?;
            }
            UidScheme::DatabaseMapped => {
                self.uidmap.assign(&base, uid);
            }
        }
        msg.uid = uid;
        self.uidmap.observe_uid(uid);
        self.uidmap.persist()
    }

    /// Rewrite a message's flags by renaming it to the new canonical
    /// filename (spec §4.4.4 "Set flags").
    pub fn set_flags(&mut self, msg: &mut Message, add: Flags, del: Flags) -> Result<()> {
        let base = msg.local_base.clone().ok_or_else(|| SyncError::fatal("set_flags on a message with no local file"))?;
        let old_subdir = if msg.in_new { "new" } else { "cur" };
        let old_name = build_filename(&base, non_sentinel(msg.uid), msg.flags);
        let old_path = self.root.join(old_subdir).join(&old_name);

        let mut new_flags = msg.flags;
        new_flags.insert(add);
        new_flags.remove(del);
        // Seen moves a message from new/ to cur/ per Maildir convention.
        let new_subdir = if new_flags.contains(Flags::SEEN) { "cur" } else { old_subdir };
        let new_name = build_filename(&base, non_sentinel(msg.uid), new_flags);
        let new_path = self.root.join(new_subdir).join(&new_name);

        if old_path == new_path {
            msg.flags = new_flags;
            return Ok(());
        }
        match fs::rename(&old_path, &new_path) {
            Ok(()) => {
                msg.flags = new_flags;
                msg.in_new = new_subdir == "new";
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                msg.mark_dead();
                Err(SyncError::msg_bad(format!("{} vanished before flags could be updated", old_name)))
            }
            Err(e) => Err(SyncError::from(e)),
        }
    }

    /// Move a message into `trash`'s `cur/`/`new/`, creating it on
    /// demand (spec §4.4.4 "Trash").
    pub fn trash(&mut self, msg: &Message, trash_root: &Path) -> Result<()> {
        let base = msg.local_base.clone().ok_or_else(|| SyncError::fatal("trash on a message with no local file"))?;
        let old_subdir = if msg.in_new { "new" } else { "cur" };
        let name = build_filename(&base, non_sentinel(msg.uid), msg.flags);
        let old_path = self.root.join(old_subdir).join(&name);

        for d in ["cur", "new", "tmp"] {
            create_dir_0700(&trash_root.join(d))?;
        }
        let dest_subdir = if msg.in_new { "new" } else { "cur" };
        let dest = trash_root.join(dest_subdir).join(&name);
        fs::rename(&old_path, &dest).map_err(|e| SyncError::msg_bad(format!("moving {} to trash: {}", name, e)))
    }

    /// Unlink every message whose `Deleted` flag is set (spec §4.4.4
    /// "Expunge").
    pub fn expunge(&mut self, messages: &[Message]) -> Result<usize> {
        let mut removed = 0;
        for msg in messages {
            if !msg.flags.contains(Flags::DELETED) {
                continue;
            }
            let Some(base) = &msg.local_base else { continue };
            let subdir = if msg.in_new { "new" } else { "cur" };
            let name = build_filename(base, non_sentinel(msg.uid), msg.flags);
            let path = self.root.join(subdir).join(&name);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("{} already gone during expunge", path.display());
                }
                Err(e) => return Err(SyncError::from(e)),
            }
        }
        Ok(removed)
    }

    /// Unlink any regular file in `tmp/` older than 24h (spec §4.4.4).
    pub fn gc_stale_tmp(&self) -> Result<()> {
        let tmp = self.root.join("tmp");
        let entries = match fs::read_dir(&tmp) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            if now.duration_since(modified).unwrap_or_default().as_secs() > STALE_TMP_SECS {
                fs::remove_file(entry.path()).ok();
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.gc_stale_tmp()?;
        self.uidmap.persist()
    }
}

enum ScanResult {
    Ok(Vec<Message>),
    /// `(uid, first filename, second filename)` that collided.
    Collision(u32, String, String),
    Err(SyncError),
}

fn non_sentinel(uid: u32) -> Option<u32> {
    if uid == UID_SENTINEL {
        None
    } else {
        Some(uid)
    }
}

fn create_dir_0700(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| SyncError::box_bad(format!("creating {}: {}", path.display(), e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).ok();
    }
    Ok(())
}

/// Parse `<base>[,U=<uid>][:2,<flags>]` (spec §4.4.1).
fn parse_filename(name: &str) -> (String, Option<u32>, Flags) {
    let (stem, flags) = match name.find(":2,") {
        Some(pos) => (&name[..pos], Flags::from_maildir_suffix(&name[pos + 3..])),
        None => (name, Flags::EMPTY),
    };
    let (base, uid) = match stem.find(",U=") {
        Some(pos) => (stem[..pos].to_owned(), stem[pos + 3..].parse().ok()),
        None => (stem.to_owned(), None),
    };
    (base, uid, flags)
}

fn build_filename(base: &str, uid: Option<u32>, flags: Flags) -> String {
    let mut s = base.to_owned();
    if let Some(uid) = uid {
        s.push_str(&format!(",U={}", uid));
    }
    s.push_str(":2,");
    s.push_str(&flags.to_maildir_suffix());
    s
}

/// Conventional unique base: `<secs>.<pid>_<counter>.<host>` (spec
/// §4.4.1).
fn generate_base(host: &str, counter: u64) -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let pid = std::process::id();
    format!("{}.{}_{}.{}", secs, pid, counter, host)
}

/// Parse the `<secs>` / `<counter>` components out of a base for
/// secondary sort-by-arrival-time ordering (spec §4.4.3).
fn arrival_key(base: &str) -> (u64, u64) {
    let mut parts = base.splitn(2, '.');
    let secs: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let rest = parts.next().unwrap_or("");
    let counter: u64 = rest
        .split('_')
        .nth(1)
        .and_then(|s| s.split('.').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (secs, counter)
}

fn read_x_tuid(path: &Path) -> Option<crate::message::Tuid> {
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines().take(200) {
        if line.is_empty() {
            break; // end of headers
        }
        if let Some(rest) = line.strip_prefix("X-TUID:") {
            return Some(crate::message::Tuid(rest.trim().to_owned()));
        }
    }
    None
}
