//! End-to-end sync engine tests: a real temp-directory Maildir on one
//! side, the in-process fake IMAP server (`tests/fake_imap/`) on the
//! other, driven through the only public entry point, `sync::run_all`.

mod fake_imap;

use fake_imap::{FakeImapServer, FakeMailbox, FakeMessage, FakeState};
use mdsync::config::{Config, MailboxCaps, PolicyFlags, TlsMode, TlsPolicy};
use mdsync::maildir::{MaildirStore, ScanOptions};

fn test_config(port: u16, maildir_root: std::path::PathBuf) -> Config {
    Config {
        host: "127.0.0.1".into(),
        port,
        tunnel: None,
        user: "alice".into(),
        pass: "hunter2".into(),
        tls: TlsPolicy { mode: TlsMode::None, ..TlsPolicy::default() },
        caps: MailboxCaps::default(),
        policy: PolicyFlags { create_local: true, ..PolicyFlags::default() },
        maildir_root,
    }
}

#[test]
fn adopts_uidvalidity_for_fresh_local_mailbox() {
    let tmp = tempfile::tempdir().unwrap();
    let state = FakeState::new("alice", "hunter2").with_mailbox("INBOX", FakeMailbox::new(424242, Vec::new()));
    let server = FakeImapServer::start(state);
    let config = test_config(server.port(), tmp.path().to_path_buf());

    mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("sync should succeed");

    let local = MaildirStore::open(&tmp.path().join("INBOX"), false).unwrap();
    assert_eq!(local.state().uidvalidity, 424242);
}

#[test]
fn downloads_new_remote_message() {
    let tmp = tempfile::tempdir().unwrap();
    let body = b"From: a@b\r\nSubject: hi\r\n\r\nbody\r\n".to_vec();
    let state = FakeState::new("alice", "hunter2")
        .with_mailbox("INBOX", FakeMailbox::new(1, vec![FakeMessage::new(1, &["\\Seen"], &body)]));
    let server = FakeImapServer::start(state);
    let config = test_config(server.port(), tmp.path().to_path_buf());

    let stats = mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("sync should succeed");
    assert_eq!(stats.fetched, 1);

    let mut local = MaildirStore::open(&tmp.path().join("INBOX"), false).unwrap();
    let messages = local.scan(ScanOptions { read_size: false, read_tuid: false }).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].uid, 1);
    assert!(local.read_body(&messages[0]).unwrap().ends_with(b"body\r\n"));
}

#[test]
fn uploads_new_local_message_and_assigns_remote_uid() {
    let tmp = tempfile::tempdir().unwrap();
    let local_root = tmp.path().join("INBOX");
    {
        let mut local = MaildirStore::open(&local_root, true).unwrap();
        local.store_new(b"Subject: new\r\n\r\nhello\r\n", mdsync::message::Flags::EMPTY, "testhost").unwrap();
    }

    let state = FakeState::new("alice", "hunter2").with_mailbox("INBOX", FakeMailbox::new(1, Vec::new()));
    let server = FakeImapServer::start(state);
    let config = test_config(server.port(), tmp.path().to_path_buf());

    let stats = mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("sync should succeed");
    assert_eq!(stats.appended, 1);

    let remote_mailbox = server.mailbox("INBOX").unwrap();
    assert_eq!(remote_mailbox.messages.len(), 1);
    assert!(remote_mailbox.messages[0].body.starts_with(b"X-TUID: "));

    let mut local = MaildirStore::open(&local_root, false).unwrap();
    let messages = local.scan(ScanOptions { read_size: false, read_tuid: false }).unwrap();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].is_sentinel());
}

#[test]
fn propagates_local_flag_change_to_remote() {
    let tmp = tempfile::tempdir().unwrap();
    let local_root = tmp.path().join("INBOX");
    let body = b"Subject: flagme\r\n\r\nbody\r\n".to_vec();
    {
        let mut local = MaildirStore::open(&local_root, true).unwrap();
        let mut msg = local.store_downloaded(&body, mdsync::message::Flags::SEEN, "testhost", 7).unwrap();
        local.set_flags(&mut msg, mdsync::message::Flags::FLAGGED, mdsync::message::Flags::EMPTY).unwrap();
    }

    let state = FakeState::new("alice", "hunter2")
        .with_mailbox("INBOX", FakeMailbox::new(1, vec![FakeMessage::new(7, &["\\Seen"], &body)]));
    let server = FakeImapServer::start(state);
    let config = test_config(server.port(), tmp.path().to_path_buf());

    mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("sync should succeed");

    let remote_mailbox = server.mailbox("INBOX").unwrap();
    let remote_msg = remote_mailbox.messages.iter().find(|m| m.uid == 7).unwrap();
    assert!(remote_msg.flags.iter().any(|f| f == "\\Flagged"));
}

#[test]
fn uidvalidity_mismatch_aborts_mailbox_without_touching_local_state() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let state = FakeState::new("alice", "hunter2").with_mailbox("INBOX", FakeMailbox::new(100, Vec::new()));
        let server = FakeImapServer::start(state);
        let config = test_config(server.port(), tmp.path().to_path_buf());
        mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("first sync should succeed");
    }

    // A mismatched UIDVALIDITY aborts just that mailbox (spec §7 `BoxBad`):
    // `run_all` logs it and keeps going rather than propagating an error.
    let state = FakeState::new("alice", "hunter2").with_mailbox("INBOX", FakeMailbox::new(200, Vec::new()));
    let server = FakeImapServer::start(state);
    let config = test_config(server.port(), tmp.path().to_path_buf());
    let stats = mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("run_all itself should not fail");
    assert_eq!(stats.fetched, 0);
    assert_eq!(stats.appended, 0);

    let local = MaildirStore::open(&tmp.path().join("INBOX"), false).unwrap();
    assert_eq!(local.state().uidvalidity, 100);
}

#[test]
fn copies_either_side_deleted_message_before_expunge() {
    let tmp = tempfile::tempdir().unwrap();
    let local_root = tmp.path().join("INBOX");
    let body = b"Subject: trashme\r\n\r\nbody\r\n".to_vec();
    {
        let mut local = MaildirStore::open(&local_root, true).unwrap();
        let mut msg = local.store_downloaded(&body, mdsync::message::Flags::SEEN, "testhost", 9).unwrap();
        local.set_flags(&mut msg, mdsync::message::Flags::DELETED, mdsync::message::Flags::EMPTY).unwrap();
    }

    let state = FakeState::new("alice", "hunter2")
        .with_mailbox("INBOX", FakeMailbox::new(1, vec![FakeMessage::new(9, &["\\Seen"], &body)]))
        .with_mailbox("Trash", FakeMailbox::new(2, Vec::new()));
    let server = FakeImapServer::start(state);
    let mut config = test_config(server.port(), tmp.path().to_path_buf());
    config.policy.copy_deleted_to = Some("Trash".into());
    config.policy.expunge = true;
    config.policy.create_remote = true;

    mdsync::sync::run_all(&config, &["INBOX".to_string()]).expect("sync should succeed");

    let trash = server.mailbox("Trash").unwrap();
    assert_eq!(trash.messages.len(), 1);
    let inbox = server.mailbox("INBOX").unwrap();
    assert!(inbox.messages.is_empty());
}
