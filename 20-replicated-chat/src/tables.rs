//! In-memory accounts and messages tables.
//!
//! These are plain data with no locking or I/O; [`crate::store`] owns one
//! instance behind its mutex and decides when mutations may be applied.

use std::collections::BTreeMap;

use crate::schema::{Account, Message, Snapshot};

/// Accounts keyed by username, messages keyed by recipient username.
///
/// BTreeMap keeps iteration (and therefore snapshots and persisted files)
/// in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    accounts: BTreeMap<String, Account>,
    messages: BTreeMap<String, Vec<Message>>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(accounts: Vec<Account>, messages: Vec<Message>) -> Self {
        let mut tables = Self::new();
        for account in accounts {
            tables.accounts.insert(account.username.clone(), account);
        }
        for message in messages {
            tables
                .messages
                .entry(message.recipient_username.clone())
                .or_default()
                .push(message);
        }
        for inbox in tables.messages.values_mut() {
            inbox.sort_by_key(|message| message.time);
        }
        tables
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self::from_parts(snapshot.accounts, snapshot.messages)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            accounts: self.accounts(),
            messages: self.all_messages(),
        }
    }

    pub fn upsert_account(&mut self, account: Account) {
        self.accounts.insert(account.username.clone(), account);
    }

    /// Removes the account and every message addressed to it.
    pub fn delete_account(&mut self, username: &str) {
        self.accounts.remove(username);
        self.messages.remove(username);
    }

    pub fn delete_all(&mut self) {
        self.accounts.clear();
        self.messages.clear();
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }

    pub fn has_account(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    /// Missing accounts read as logged out.
    pub fn account_logged_in(&self, username: &str) -> bool {
        self.accounts
            .get(username)
            .map(|account| account.logged_in)
            .unwrap_or(false)
    }

    /// Inserts a new message, or acknowledges an existing one. Returns
    /// `false`, leaving the tables untouched, when the recipient has no
    /// account.
    ///
    /// An incoming message with `delivered == true` flips the matching
    /// undelivered message in place. A repeated acknowledgement of an already
    /// delivered message is a no-op, and an acknowledgement matching nothing
    /// is stored as already delivered. The recipient's inbox stays ordered by
    /// `time`.
    pub fn upsert_message(&mut self, message: Message) -> bool {
        if !self.accounts.contains_key(&message.recipient_username) {
            return false;
        }
        let inbox = self
            .messages
            .entry(message.recipient_username.clone())
            .or_default();

        if message.delivered {
            let pending = inbox
                .iter()
                .position(|stored| !stored.delivered && stored.same_message(&message));
            match pending {
                Some(index) => inbox[index].delivered = true,
                None if inbox.iter().any(|stored| stored.same_message(&message)) => {}
                None => inbox.push(message),
            }
        } else {
            inbox.push(message);
        }
        inbox.sort_by_key(|message| message.time);
        true
    }

    /// Undelivered messages for `username`, optionally only those sent while
    /// the recipient was logged in.
    pub fn messages_for(&self, username: &str, logged_in_only: bool) -> Vec<Message> {
        self.messages
            .get(username)
            .map(|inbox| {
                inbox
                    .iter()
                    .filter(|message| !message.delivered)
                    .filter(|message| !logged_in_only || message.recipient_logged_in)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_messages(&self) -> Vec<Message> {
        self.messages.values().flatten().cloned().collect()
    }

    pub fn inbox(&self, username: &str) -> &[Message] {
        self.messages.get(username).map(Vec::as_slice).unwrap_or(&[])
    }
}
