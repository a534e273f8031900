//! Config snapshot types (spec §3 "Config snapshot", §6 "Configuration
//! inputs"). Loading is a thin `toml`+`serde` read, in the same style as
//! the teacher's own `Config::load_from_fs` — actual command-line parsing
//! and config-file *lexing* are out of scope (spec §1) and live in an
//! external collaborator.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Implicit TLS from the first byte (`imaps`, port 993 by default).
    Implicit,
    /// Plaintext, optionally promoted with `STARTTLS`.
    Starttls,
    /// No TLS at all.
    None,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Starttls
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsPolicy {
    pub mode: TlsMode,
    #[serde(default)]
    pub require_ssl: bool,
    #[serde(default)]
    pub allow_sslv2: bool,
    #[serde(default)]
    pub allow_sslv3: bool,
    #[serde(default)]
    pub allow_tlsv1: bool,
    #[serde(default)]
    pub require_cram: bool,
    /// Path to a PEM file of certificates to whitelist by digest/subject
    /// rather than via full chain verification (spec §4.1).
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MailboxCaps {
    /// 0 means "no cap".
    #[serde(default)]
    pub max_size: u64,
    /// 0 means "no cap".
    #[serde(default)]
    pub max_messages: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyFlags {
    #[serde(default)]
    pub expunge: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub copy_deleted_to: Option<String>,
    #[serde(default)]
    pub use_namespace: bool,
    #[serde(default)]
    pub map_inbox: Option<String>,
    #[serde(default)]
    pub folder_prefix: Option<String>,
    #[serde(default)]
    pub create_remote: bool,
    #[serde(default)]
    pub create_local: bool,
    /// Fast mode: only fetch UIDs above local maxuid, skip flag
    /// reconciliation (spec §4.5.1, GLOSSARY).
    #[serde(default)]
    pub fast: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shell command to spawn for a tunnel transport instead of a direct
    /// TCP connection (spec §4.1 `spawn_tunnel`).
    #[serde(default)]
    pub tunnel: Option<String>,
    pub user: String,
    pub pass: String,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub caps: MailboxCaps,
    #[serde(default)]
    pub policy: PolicyFlags,
    /// Local Maildir root directory.
    pub maildir_root: PathBuf,
}

fn default_port() -> u16 {
    993
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))
            .map_err(|e| SyncError::config_error(e.to_string()))?;
        toml::from_str(&content).map_err(|e| SyncError::config_error(format!("{}: {}", path.display(), e)))
    }

    /// Misconfiguration detected at open time (spec §7 `ConfigError`):
    /// neither a host nor a tunnel, or an unreadable cert file.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() && self.tunnel.is_none() {
            return Err(SyncError::config_error("no host and no tunnel configured"));
        }
        if let Some(cert_file) = &self.tls.cert_file {
            fs::metadata(cert_file)
                .map_err(|e| SyncError::config_error(format!("cert file {}: {}", cert_file.display(), e)))?;
        }
        Ok(())
    }
}
