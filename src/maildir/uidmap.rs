//! UIDVALIDITY and UID persistence (spec §4.4.2): two on-disk schemes,
//! chosen per-mailbox at first use and preserved thereafter.
//!
//! Scheme A (filename-embedded) stores nothing here beyond the
//! `<validity>\n<maxuid>\n` pair in `.uidvalidity`; the UID itself lives
//! in the `,U=<uid>` filename tag and is parsed during scanning (see
//! `store.rs`).
//!
//! Scheme B (database-mapped) is specified as a Berkeley-DB-compatible
//! hash file. No BDB-reading crate is available here, so this
//! implementation instead keeps a simple `<len><base>\0<uid-le>` record
//! sidecar of its own under the same `.isyncuidmap.db` name — a
//! documented simplification (see DESIGN.md) rather than true BDB wire
//! compatibility. Key = filename base, value = 4-byte UID; the
//! UIDVALIDITY pair occupies the reserved key `"UIDVALIDITY"`.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SyncError};
use crate::message::MailboxState;

use super::lock::MailboxLock;

const UIDVALIDITY_FILE: &str = ".uidvalidity";
const UIDMAP_DB_FILE: &str = ".isyncuidmap.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidScheme {
    FilenameEmbedded,
    DatabaseMapped,
}

pub struct UidMap {
    root: PathBuf,
    scheme: UidScheme,
    lock: MailboxLock,
    state: MailboxState,
    /// base -> uid, populated and consulted only under `DatabaseMapped`.
    entries: HashMap<String, u32>,
    dirty: bool,
    /// `true` when `state` was invented by `open` (no readable sidecar)
    /// rather than loaded off disk — distinct from "`uidvalidity` happens
    /// to be 0," which a self-generated epoch never is (spec §4.5.1
    /// "local unset").
    fresh: bool,
}

impl UidMap {
    /// Detect the scheme in use (preferring whichever sidecar already
    /// exists; a brand-new mailbox defaults to `FilenameEmbedded`),
    /// acquire its lock, and load the persisted state, generating a
    /// fresh UIDVALIDITY epoch if none is readable (spec §4.4.2).
    pub fn open(root: &Path) -> Result<UidMap> {
        let db_path = root.join(UIDMAP_DB_FILE);
        let scheme = if db_path.exists() {
            UidScheme::DatabaseMapped
        } else {
            UidScheme::FilenameEmbedded
        };
        Self::open_with_scheme(root, scheme)
    }

    pub fn open_with_scheme(root: &Path, scheme: UidScheme) -> Result<UidMap> {
        let path = match scheme {
            UidScheme::FilenameEmbedded => root.join(UIDVALIDITY_FILE),
            UidScheme::DatabaseMapped => root.join(UIDMAP_DB_FILE),
        };
        let lock = MailboxLock::acquire(&path)?;

        let (state, entries, fresh) = match scheme {
            UidScheme::FilenameEmbedded => {
                let loaded = load_uidvalidity_file(lock.file())?;
                let fresh = loaded.is_none();
                (loaded.unwrap_or_else(|| MailboxState::fresh(unix_time())), HashMap::new(), fresh)
            }
            UidScheme::DatabaseMapped => load_uidmap_db(lock.file())?,
        };

        Ok(UidMap {
            root: root.to_owned(),
            scheme,
            lock,
            state,
            entries,
            dirty: false,
            fresh,
        })
    }

    pub fn scheme(&self) -> UidScheme {
        self.scheme
    }

    pub fn state(&self) -> MailboxState {
        self.state
    }

    /// Whether `state` was invented at `open` time rather than read off
    /// disk — the preflight UIDVALIDITY check (spec §4.5.1) uses this,
    /// not a zero-check on `uidvalidity`, to decide "local unset."
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Adopt the remote's UIDVALIDITY for a brand-new local mailbox
    /// (spec §4.5.1 "if local unset, adopt remote's value and persist").
    pub fn adopt(&mut self, uidvalidity: u32) {
        self.state.uidvalidity = uidvalidity;
        self.fresh = false;
        self.dirty = true;
    }

    pub fn observe_uid(&mut self, uid: u32) {
        self.state.observe_uid(uid);
    }

    /// Allocate the next UID for a not-yet-tagged message.
    pub fn alloc_uid(&mut self) -> u32 {
        self.dirty = true;
        self.state.alloc_uid()
    }

    /// Scheme B only: look up a previously assigned UID by filename
    /// base.
    pub fn lookup(&self, base: &str) -> Option<u32> {
        self.entries.get(base).copied()
    }

    /// Scheme B only: record a base -> uid association.
    pub fn assign(&mut self, base: &str, uid: u32) {
        self.entries.insert(base.to_owned(), uid);
        self.dirty = true;
    }

    /// Catastrophic UID collision (spec §4.4.3): regenerate the
    /// UIDVALIDITY epoch, reset `maxuid`, and invalidate every local
    /// UID — the caller must restart its scan from scratch.
    pub fn regenerate(&mut self) -> Result<()> {
        let epoch = unix_time();
        self.state = MailboxState::fresh(epoch);
        self.entries.clear();
        self.fresh = false;
        self.dirty = true;
        self.persist()
    }

    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        match self.scheme {
            UidScheme::FilenameEmbedded => write_uidvalidity_file(self.lock.file_mut(), self.state)?,
            UidScheme::DatabaseMapped => write_uidmap_db(self.lock.file_mut(), self.state, &self.entries)?,
        }
        self.dirty = false;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

/// `None` means unreadable or missing: a fresh mailbox (spec §4.4.2).
fn load_uidvalidity_file(file: &fs::File) -> Result<Option<MailboxState>> {
    let mut content = String::new();
    let mut file = file.try_clone().map_err(SyncError::from)?;
    file.read_to_string(&mut content).map_err(SyncError::from)?;
    let mut lines = content.lines();
    let validity: Option<u32> = lines.next().and_then(|l| l.trim().parse().ok());
    let maxuid: Option<u32> = lines.next().and_then(|l| l.trim().parse().ok());
    match (validity, maxuid) {
        (Some(v), Some(m)) => Ok(Some(MailboxState {
            uidvalidity: v,
            maxuid: m,
            nuid: m + 1,
        })),
        _ => Ok(None),
    }
}

fn write_uidvalidity_file(file: &mut fs::File, state: MailboxState) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    file.set_len(0).map_err(SyncError::from)?;
    file.seek(SeekFrom::Start(0)).map_err(SyncError::from)?;
    write!(file, "{}\n{}\n", state.uidvalidity, state.maxuid).map_err(SyncError::from)?;
    file.sync_all().ok();
    Ok(())
}

fn load_uidmap_db(file: &fs::File) -> Result<(MailboxState, HashMap<String, u32>, bool)> {
    let mut content = Vec::new();
    let mut file = file.try_clone().map_err(SyncError::from)?;
    file.read_to_end(&mut content).map_err(SyncError::from)?;
    if content.is_empty() {
        return Ok((MailboxState::fresh(unix_time()), HashMap::new(), true));
    }

    let mut entries = HashMap::new();
    let mut state = None;
    let mut pos = 0;
    while pos + 4 <= content.len() {
        let key_len = u32::from_le_bytes(content[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + key_len + 4 > content.len() {
            break;
        }
        let key = String::from_utf8_lossy(&content[pos..pos + key_len]).into_owned();
        pos += key_len;
        let a = u32::from_le_bytes(content[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if key == "UIDVALIDITY" {
            if pos + 4 > content.len() {
                break;
            }
            let maxuid = u32::from_le_bytes(content[pos..pos + 4].try_into().unwrap());
            pos += 4;
            state = Some(MailboxState {
                uidvalidity: a,
                maxuid,
                nuid: maxuid + 1,
            });
        } else {
            entries.insert(key, a);
        }
    }
    let fresh = state.is_none();
    Ok((state.unwrap_or_else(|| MailboxState::fresh(unix_time())), entries, fresh))
}

fn write_uidmap_db(file: &mut fs::File, state: MailboxState, entries: &HashMap<String, u32>) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    let mut out = Vec::new();
    put_record(&mut out, "UIDVALIDITY", state.uidvalidity);
    out.extend_from_slice(&state.maxuid.to_le_bytes());
    for (base, uid) in entries {
        put_record(&mut out, base, *uid);
    }
    file.set_len(0).map_err(SyncError::from)?;
    file.seek(SeekFrom::Start(0)).map_err(SyncError::from)?;
    file.write_all(&out).map_err(SyncError::from)?;
    file.sync_all().ok();
    Ok(())
}

fn put_record(out: &mut Vec<u8>, key: &str, value: u32) {
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uidvalidity_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut map = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
            map.observe_uid(7);
            map.alloc_uid();
            map.persist().unwrap();
        }
        let map = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
        assert_eq!(map.state().maxuid, 8);
    }

    #[test]
    fn uidmap_db_roundtrips_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut map = UidMap::open_with_scheme(dir.path(), UidScheme::DatabaseMapped).unwrap();
            map.assign("1700000000.123_1.host", 5);
            map.observe_uid(5);
            map.persist().unwrap();
        }
        let map = UidMap::open_with_scheme(dir.path(), UidScheme::DatabaseMapped).unwrap();
        assert_eq!(map.lookup("1700000000.123_1.host"), Some(5));
        assert_eq!(map.state().maxuid, 5);
    }

    #[test]
    fn missing_uidvalidity_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let map = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
        assert_eq!(map.state().maxuid, 0);
        assert!(map.is_fresh());
    }

    #[test]
    fn adopt_sets_uidvalidity_and_clears_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
        assert!(map.is_fresh());
        map.adopt(1700000000);
        assert!(!map.is_fresh());
        map.persist().unwrap();
        drop(map);

        let reopened = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
        assert_eq!(reopened.state().uidvalidity, 1700000000);
        assert!(!reopened.is_fresh());
    }

    #[test]
    fn existing_uidvalidity_file_is_not_fresh() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut map = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
            map.observe_uid(1);
            map.alloc_uid();
            map.persist().unwrap();
        }
        let map = UidMap::open_with_scheme(dir.path(), UidScheme::FilenameEmbedded).unwrap();
        assert!(!map.is_fresh());
    }
}
