//! Client operations built on the replicated store.
//!
//! Validation failures are returned in the response's `error` field, never as
//! a Rust error. Store failures surface the same way.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::codec::MAX_STRING_LEN;
use crate::schema::{
    Account, AcknowledgeMessagesRequest, ClientRequest, ClientResponse,
    DeliverUndeliveredMessagesRequest, DeliverUndeliveredMessagesResponse, ErrorResponse,
    ListAccountsRequest, ListAccountsResponse, Message, SendMessageRequest,
};
use crate::store::{ReplicatedStore, StoreError, NO_SUCH_RECIPIENT};

pub const ACCOUNT_MISSING: &str = "This account does not exist.";
pub const ACCOUNT_EXISTS: &str = "This account already exists.";
pub const RECIPIENT_MISSING: &str = "Recipient account does not exist.";
pub const MESSAGE_TOO_LONG: &str = "Message is too long.";
pub const NO_NEW_MESSAGES: &str = "No new messages!";

/// The client-facing operations of one node. Cheap to clone; every session
/// holds its own copy.
#[derive(Clone)]
pub struct Events {
    store: Arc<ReplicatedStore>,
}

impl Events {
    pub fn new(store: Arc<ReplicatedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    /// Dispatches one decoded client request.
    pub fn handle(&self, request: ClientRequest) -> ClientResponse {
        debug!(opcode = ?request.opcode(), "handling client request");
        match request {
            ClientRequest::LogInAccount(req) => {
                ClientResponse::LogInAccount(self.log_in_account(&req.username))
            }
            ClientRequest::CreateAccount(req) => {
                ClientResponse::CreateAccount(self.create_account(&req.username))
            }
            ClientRequest::ListAccounts(req) => {
                ClientResponse::ListAccounts(self.list_accounts(&req))
            }
            ClientRequest::SendMessage(req) => ClientResponse::SendMessage(self.send_message(&req)),
            ClientRequest::DeliverUndeliveredMessages(req) => {
                ClientResponse::DeliverUndeliveredMessages(self.deliver_undelivered_messages(&req))
            }
            ClientRequest::DeleteAccount(req) => {
                ClientResponse::DeleteAccount(self.delete_account(&req.username))
            }
            ClientRequest::LogOutAccount(req) => {
                ClientResponse::LogOutAccount(self.log_out_account(&req.username))
            }
            ClientRequest::AcknowledgeMessages(req) => {
                ClientResponse::AcknowledgeMessages(self.acknowledge_messages(req))
            }
        }
    }

    pub fn log_in_account(&self, username: &str) -> ErrorResponse {
        self.set_logged_in(username, true)
    }

    pub fn log_out_account(&self, username: &str) -> ErrorResponse {
        self.set_logged_in(username, false)
    }

    fn set_logged_in(&self, username: &str, logged_in: bool) -> ErrorResponse {
        outcome(self.store.has_account(username).and_then(|exists| {
            if !exists {
                return Ok(Some(ACCOUNT_MISSING));
            }
            self.store
                .upsert_account(Account::new(username, logged_in))
                .map(|()| None)
        }))
    }

    /// Creates the account already logged in.
    pub fn create_account(&self, username: &str) -> ErrorResponse {
        outcome(self.store.has_account(username).and_then(|exists| {
            if exists {
                return Ok(Some(ACCOUNT_EXISTS));
            }
            self.store
                .upsert_account(Account::new(username, true))
                .map(|()| None)
        }))
    }

    pub fn delete_account(&self, username: &str) -> ErrorResponse {
        outcome(self.store.has_account(username).and_then(|exists| {
            if !exists {
                return Ok(Some(ACCOUNT_MISSING));
            }
            self.store.delete_account(username).map(|()| None)
        }))
    }

    /// Accounts whose username contains `text_wildcard`, sorted by username.
    pub fn list_accounts(&self, request: &ListAccountsRequest) -> ListAccountsResponse {
        match self.store.get_accounts() {
            Ok(accounts) => {
                let mut accounts: Vec<Account> = accounts
                    .into_iter()
                    .filter(|account| account.username.contains(&request.text_wildcard))
                    .collect();
                accounts.sort_by(|a, b| a.username.cmp(&b.username));
                ListAccountsResponse {
                    accounts,
                    error: String::new(),
                }
            }
            Err(err) => ListAccountsResponse {
                accounts: Vec::new(),
                error: err.to_string(),
            },
        }
    }

    pub fn send_message(&self, request: &SendMessageRequest) -> ErrorResponse {
        if request.message.len() as u64 > MAX_STRING_LEN {
            return ErrorResponse {
                error: MESSAGE_TOO_LONG.to_string(),
            };
        }
        let recipient = request.recipient_username.as_str();
        outcome(self.store.has_account(recipient).and_then(|exists| {
            if !exists {
                return Ok(Some(RECIPIENT_MISSING));
            }
            let recipient_logged_in = self.store.get_account_logged_in(recipient)?;
            self.store
                .upsert_message(Message {
                    sender_username: request.sender_username.clone(),
                    recipient_username: request.recipient_username.clone(),
                    body: request.message.clone(),
                    time: unix_now(),
                    delivered: false,
                    recipient_logged_in,
                })
                .map(|()| None)
                .or_else(|err| match err {
                    // Deleted between the presence check and the write.
                    StoreError::Rejected { ref message, .. } if message == NO_SUCH_RECIPIENT => {
                        Ok(Some(RECIPIENT_MISSING))
                    }
                    err => Err(err),
                })
        }))
    }

    /// Pending messages for the user. Messages stay undelivered until
    /// acknowledged.
    pub fn deliver_undelivered_messages(
        &self,
        request: &DeliverUndeliveredMessagesRequest,
    ) -> DeliverUndeliveredMessagesResponse {
        let result = self.store.has_account(&request.username).and_then(|exists| {
            if !exists {
                return Ok(Err(ACCOUNT_MISSING));
            }
            self.store
                .get_messages(&request.username, request.logged_in)
                .map(Ok)
        });
        let (messages, error) = match result {
            Ok(Ok(messages)) if messages.is_empty() => (messages, NO_NEW_MESSAGES.to_string()),
            Ok(Ok(messages)) => (messages, String::new()),
            Ok(Err(message)) => (Vec::new(), message.to_string()),
            Err(err) => (Vec::new(), err.to_string()),
        };
        DeliverUndeliveredMessagesResponse { messages, error }
    }

    /// Marks each message delivered.
    pub fn acknowledge_messages(&self, request: AcknowledgeMessagesRequest) -> ErrorResponse {
        let result = request.messages.into_iter().try_for_each(|mut message| {
            message.delivered = true;
            self.store.upsert_message(message)
        });
        outcome(result.map(|()| None))
    }
}

/// Folds a store result with an optional validation failure into a response.
fn outcome(result: Result<Option<&str>, StoreError>) -> ErrorResponse {
    let error = match result {
        Ok(None) => String::new(),
        Ok(Some(message)) => message.to_string(),
        Err(err) => err.to_string(),
    };
    ErrorResponse { error }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Mesh;
    use crate::config::{ClusterConfig, NodeAddress, NodeConfig};
    use crate::persistence::Persistence;
    use crate::schema::UsernameRequest;

    fn events(dir: &std::path::Path) -> Events {
        let cluster = ClusterConfig::new(vec![NodeAddress::new("127.0.0.1", 0)], dir).unwrap();
        let config = NodeConfig::new(0, cluster).unwrap();
        let persistence = Persistence::new(dir, 0).unwrap();
        let tables = persistence.load_tables();
        Events::new(ReplicatedStore::new(&config, Mesh::default(), persistence, tables))
    }

    fn send(events: &Events, from: &str, to: &str, body: &str) -> ErrorResponse {
        events.send_message(&SendMessageRequest {
            message: body.into(),
            recipient_username: to.into(),
            sender_username: from.into(),
        })
    }

    fn deliver(events: &Events, username: &str, logged_in: bool) -> DeliverUndeliveredMessagesResponse {
        events.deliver_undelivered_messages(&DeliverUndeliveredMessagesRequest {
            username: username.into(),
            logged_in,
        })
    }

    #[test]
    fn create_rejects_duplicates_and_logs_in() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        assert_eq!(events.create_account("alice").error, "");
        assert_eq!(events.create_account("alice").error, ACCOUNT_EXISTS);
        assert!(events.store().get_account_logged_in("alice").unwrap());
    }

    #[test]
    fn login_logout_delete_require_existing_account() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        assert_eq!(events.log_in_account("ghost").error, ACCOUNT_MISSING);
        assert_eq!(events.log_out_account("ghost").error, ACCOUNT_MISSING);
        assert_eq!(events.delete_account("ghost").error, ACCOUNT_MISSING);

        events.create_account("bob");
        assert_eq!(events.log_out_account("bob").error, "");
        assert!(!events.store().get_account_logged_in("bob").unwrap());
        assert_eq!(events.log_in_account("bob").error, "");
        assert!(events.store().get_account_logged_in("bob").unwrap());
        assert_eq!(events.delete_account("bob").error, "");
        assert!(!events.store().has_account("bob").unwrap());
    }

    #[test]
    fn list_accounts_filters_by_substring_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        for name in ["carol", "alice", "malice", "bob"] {
            events.create_account(name);
        }
        let response = events.list_accounts(&ListAccountsRequest {
            text_wildcard: "lic".into(),
        });
        let names: Vec<&str> = response.accounts.iter().map(|a| a.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "malice"]);

        let everyone = events.list_accounts(&ListAccountsRequest {
            text_wildcard: String::new(),
        });
        assert_eq!(everyone.accounts.len(), 4);
        assert_eq!(everyone.accounts[0].username, "alice");
    }

    #[test]
    fn send_to_missing_recipient_leaves_messages_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        events.create_account("alice");
        assert_eq!(send(&events, "alice", "nobody", "hi").error, RECIPIENT_MISSING);
        assert!(events.store().tables().all_messages().is_empty());
    }

    #[test]
    fn send_rejects_overlong_body() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        events.create_account("bob");
        assert_eq!(send(&events, "alice", "bob", &"x".repeat(281)).error, MESSAGE_TOO_LONG);
        assert_eq!(send(&events, "alice", "bob", &"x".repeat(280)).error, "");
    }

    #[test]
    fn deliver_then_acknowledge_clears_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        events.create_account("alice");
        events.create_account("bob");
        events.log_out_account("bob");
        assert_eq!(send(&events, "alice", "bob", "hi").error, "");

        let pending = deliver(&events, "bob", false);
        assert_eq!(pending.error, "");
        assert_eq!(pending.messages.len(), 1);
        assert_eq!(pending.messages[0].body, "hi");
        assert!(!pending.messages[0].delivered);
        assert!(!pending.messages[0].recipient_logged_in);

        // Only messages sent while bob was logged in.
        assert_eq!(deliver(&events, "bob", true).error, NO_NEW_MESSAGES);

        let ack = events.acknowledge_messages(AcknowledgeMessagesRequest {
            messages: pending.messages.clone(),
        });
        assert_eq!(ack.error, "");
        let after = deliver(&events, "bob", false);
        assert_eq!(after.error, NO_NEW_MESSAGES);
        assert!(after.messages.is_empty());

        events.acknowledge_messages(AcknowledgeMessagesRequest {
            messages: pending.messages,
        });
        assert_eq!(events.store().tables().inbox("bob").len(), 1);
    }

    #[test]
    fn deliver_for_missing_account_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        let response = deliver(&events, "ghost", false);
        assert_eq!(response.error, ACCOUNT_MISSING);
        assert!(response.messages.is_empty());
    }

    #[test]
    fn handle_routes_by_opcode() {
        let dir = tempfile::tempdir().unwrap();
        let events = events(dir.path());
        let response = events.handle(ClientRequest::CreateAccount(UsernameRequest {
            username: "alice".into(),
        }));
        assert_eq!(response, ClientResponse::CreateAccount(ErrorResponse::default()));
        let response = events.handle(ClientRequest::LogInAccount(UsernameRequest {
            username: "nobody".into(),
        }));
        assert_eq!(response.error(), ACCOUNT_MISSING);
        assert_eq!(response.opcode(), crate::schema::ClientOpcode::LogInAccount);
    }
}
