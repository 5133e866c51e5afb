//! Per-node durable files.
//!
//! Each node keeps three files in its data directory, named by machine id:
//!
//! - `accounts{id}.bin`: the codec's `list<Account>` encoding of the table
//! - `messages{id}.bin`: the codec's `list<Message>` encoding of the table
//! - `primary{id}.bin`: one encoded bool, whether this node believed itself
//!   primary when the file was last written
//!
//! Files are replaced by writing a sibling temp file and renaming it over the
//! old one, so a crash mid-write leaves the previous version intact.
//!
//! Reads are forgiving: a missing file is a first boot, and an unreadable or
//! undecodable file is logged and treated as empty.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::codec::{Decode, Encode};
use crate::schema::{Account, Message};
use crate::tables::Tables;

#[derive(Debug, Clone)]
pub struct Persistence {
    accounts_path: PathBuf,
    messages_path: PathBuf,
    primary_path: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: &Path, machine_id: usize) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self {
            accounts_path: data_dir.join(format!("accounts{machine_id}.bin")),
            messages_path: data_dir.join(format!("messages{machine_id}.bin")),
            primary_path: data_dir.join(format!("primary{machine_id}.bin")),
        })
    }

    pub fn load_tables(&self) -> Tables {
        let accounts = read_or_default::<Vec<Account>>(&self.accounts_path);
        let messages = read_or_default::<Vec<Message>>(&self.messages_path);
        Tables::from_parts(accounts, messages)
    }

    pub fn load_was_primary(&self) -> bool {
        read_or_default::<bool>(&self.primary_path)
    }

    pub fn save_accounts(&self, accounts: &[Account]) -> Result<()> {
        write_atomic(&self.accounts_path, accounts)
    }

    pub fn save_messages(&self, messages: &[Message]) -> Result<()> {
        write_atomic(&self.messages_path, messages)
    }

    pub fn save_tables(&self, tables: &Tables) -> Result<()> {
        self.save_accounts(&tables.accounts())?;
        self.save_messages(&tables.all_messages())
    }

    pub fn save_primary_flag(&self, was_primary: bool) -> Result<()> {
        write_atomic(&self.primary_path, &was_primary)
    }
}

fn read_or_default<T: Decode + Default>(path: &Path) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no persisted file, starting empty");
            return T::default();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read persisted file, starting empty");
            return T::default();
        }
    };
    if bytes.is_empty() {
        return T::default();
    }
    match T::decode(&bytes) {
        Ok((value, _)) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt persisted file, starting empty");
            T::default()
        }
    }
}

fn write_atomic<T: Encode + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = value
        .encode()
        .with_context(|| format!("failed to encode {}", path.display()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tables() -> Tables {
        Tables::from_parts(
            vec![Account::new("alice", true), Account::new("bob", false)],
            vec![Message {
                sender_username: "alice".into(),
                recipient_username: "bob".into(),
                body: "hi".into(),
                time: 10,
                delivered: false,
                recipient_logged_in: false,
            }],
        )
    }

    #[test]
    fn first_boot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), 0).unwrap();
        assert_eq!(persistence.load_tables(), Tables::new());
        assert!(!persistence.load_was_primary());
    }

    #[test]
    fn tables_and_flag_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), 2).unwrap();
        persistence.save_tables(&sample_tables()).unwrap();
        persistence.save_primary_flag(true).unwrap();

        let reopened = Persistence::new(dir.path(), 2).unwrap();
        assert_eq!(reopened.load_tables(), sample_tables());
        assert!(reopened.load_was_primary());
        assert!(dir.path().join("accounts2.bin").exists());

        // Another machine id in the same directory sees nothing.
        assert_eq!(Persistence::new(dir.path(), 1).unwrap().load_tables(), Tables::new());
    }

    #[test]
    fn corrupt_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), 0).unwrap();
        fs::write(dir.path().join("accounts0.bin"), b"\x09\x09\x09\x09\x09").unwrap();
        fs::write(dir.path().join("messages0.bin"), b"").unwrap();
        fs::write(dir.path().join("primary0.bin"), b"\x07").unwrap();

        assert_eq!(persistence.load_tables(), Tables::new());
        assert!(!persistence.load_was_primary());
    }
}
