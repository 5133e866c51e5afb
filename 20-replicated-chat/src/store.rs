//! Replicated accounts/messages store.
//!
//! Every node holds a full copy of the tables. Exactly one node, the
//! primary, applies operations; it is the lowest-indexed node that this
//! node's [`Liveness`] view has not marked down.
//!
//! # Request path
//!
//! [`ReplicatedStore::execute`] is the single entry point for both local
//! callers and requests forwarded by peers:
//!
//! 1. If this node is primary, apply the operation to the local tables.
//!    Writes are persisted, then a full [`Snapshot`] is pushed to every live
//!    replica over the sync channel.
//! 2. Otherwise forward the request over the command channel to the primary
//!    and wait for its response. A send or receive failure (including the
//!    command timeout) marks that primary down, and the loop retries against
//!    the next candidate.
//!
//! The loop always terminates: a node never marks itself down, so at worst
//! it becomes primary.
//!
//! # Locking
//!
//! The state mutex is held for the whole of `execute`, including a forward.
//! Forwards only ever go to lower machine ids, so two nodes can never wait on
//! each other's locks. Sync readers read a complete frame before taking the
//! lock, so a primary's snapshot write never blocks on the replica's lock.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cluster::{Channel, Mesh};
use crate::config::{NodeConfig, Timeouts};
use crate::frame::{encode_record, recv_record, write_frame};
use crate::liveness::Liveness;
use crate::persistence::Persistence;
use crate::schema::{
    Account, ErrorResponse, FlagResponse, GetAccountsResponse, GetMessagesRequest,
    GetMessagesResponse, Message, NoFields, Snapshot, StoreOpcode, StoreRequest, StoreResponse,
    SyncRecord, UpsertAccountRequest, UpsertMessageRequest, UsernameRequest,
};
use crate::tables::Tables;

/// Why a typed store call did not produce its value.
///
/// Transport failures never surface here: [`ReplicatedStore::execute`]
/// retries them against the next primary until this node applies the request
/// itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("primary rejected {opcode:?}: {message}")]
    Rejected { opcode: StoreOpcode, message: String },
    #[error("expected a {expected:?} response, got {actual:?}")]
    UnexpectedResponse {
        expected: StoreOpcode,
        actual: StoreOpcode,
    },
}

/// Error text for a message whose recipient has no account.
pub const NO_SUCH_RECIPIENT: &str = "recipient account does not exist";

/// Mutable state guarded by one lock.
#[derive(Debug)]
struct StoreState {
    tables: Tables,
    liveness: Liveness,
}

/// One node's replica of the tables plus its links to every peer.
///
/// Shared behind an [`Arc`] between the client sessions, the peer reader
/// threads and the owning [`Node`](crate::node::Node).
pub struct ReplicatedStore {
    machine_id: usize,
    state: Mutex<StoreState>,
    mesh: Mesh,
    persistence: Persistence,
    timeouts: Timeouts,
    shutting_down: AtomicBool,
}

impl ReplicatedStore {
    /// Wraps recovered tables and a formed mesh. Every node starts presumed up.
    pub fn new(config: &NodeConfig, mesh: Mesh, persistence: Persistence, tables: Tables) -> Arc<Self> {
        Arc::new(Self {
            machine_id: config.machine_id,
            state: Mutex::new(StoreState {
                tables,
                liveness: Liveness::new(config.cluster.len()),
            }),
            mesh,
            persistence,
            timeouts: config.cluster.timeouts.clone(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn is_primary(&self) -> bool {
        self.lock().liveness.is_primary(self.machine_id)
    }

    pub fn primary(&self) -> Option<usize> {
        self.lock().liveness.primary()
    }

    pub fn liveness(&self) -> Liveness {
        self.lock().liveness.clone()
    }

    /// A copy of the local tables, whatever this node's role.
    pub fn tables(&self) -> Tables {
        self.lock().tables.clone()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `request` on the primary, forwarding if that is another node.
    ///
    /// A request that cannot be framed is answered with an error response and
    /// never reaches a peer, so it cannot cost the primary its place.
    pub fn execute(&self, request: &StoreRequest) -> StoreResponse {
        let payload = match encode_record(request) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(opcode = ?request.opcode(), error = %err, "refusing request");
                return StoreResponse::failure(request.opcode(), err.to_string());
            }
        };

        let mut state = self.lock();
        // Each failed attempt marks one lower node down, so after at most
        // `machine_id` failures this node is primary.
        for _ in 0..self.machine_id {
            let primary = state.liveness.primary().unwrap_or(self.machine_id);
            if primary == self.machine_id {
                break;
            }
            match self.forward(primary, request, &payload) {
                Ok(response) => return response,
                Err(err) => {
                    warn!(
                        primary,
                        opcode = ?request.opcode(),
                        error = %err,
                        "forward to primary failed"
                    );
                    self.mark_down(&mut state, primary);
                }
            }
        }
        self.apply_locally(&mut state, request)
    }

    /// Sends an already encoded request to `primary` and waits for the answer.
    /// Every error here is a transport failure.
    fn forward(&self, primary: usize, request: &StoreRequest, payload: &[u8]) -> Result<StoreResponse> {
        let links = self
            .mesh
            .peer(primary)
            .ok_or_else(|| anyhow!("no command link to node {primary}"))?;
        let mut stream = &links.command_out;
        write_frame(&mut stream, payload).context("failed to send request")?;
        let response: StoreResponse = recv_record(&mut stream)
            .context("failed to read response")?
            .ok_or_else(|| anyhow!("primary closed the command channel"))?;
        if response.opcode() != request.opcode() {
            bail!(
                "primary answered {:?} with {:?}",
                request.opcode(),
                response.opcode()
            );
        }
        debug!(primary, opcode = ?request.opcode(), "forwarded request");
        Ok(response)
    }

    fn apply_locally(&self, state: &mut StoreState, request: &StoreRequest) -> StoreResponse {
        let tables = &mut state.tables;
        let response = match request {
            StoreRequest::DeleteAccount(req) => {
                tables.delete_account(&req.username);
                StoreResponse::DeleteAccount(ErrorResponse::default())
            }
            StoreRequest::DeleteAll(_) => {
                tables.delete_all();
                StoreResponse::DeleteAll(ErrorResponse::default())
            }
            StoreRequest::GetAccounts(_) => StoreResponse::GetAccounts(GetAccountsResponse {
                accounts: tables.accounts(),
                error: String::new(),
            }),
            StoreRequest::GetAccountLoggedIn(req) => StoreResponse::GetAccountLoggedIn(FlagResponse {
                value: tables.account_logged_in(&req.username),
                error: String::new(),
            }),
            StoreRequest::GetMessages(req) => StoreResponse::GetMessages(GetMessagesResponse {
                messages: tables.messages_for(&req.username, req.logged_in_only),
                error: String::new(),
            }),
            StoreRequest::HasAccount(req) => StoreResponse::HasAccount(FlagResponse {
                value: tables.has_account(&req.username),
                error: String::new(),
            }),
            StoreRequest::UpsertAccount(req) => {
                tables.upsert_account(req.account.clone());
                StoreResponse::UpsertAccount(ErrorResponse::default())
            }
            StoreRequest::UpsertMessage(req) => {
                if !tables.upsert_message(req.message.clone()) {
                    return StoreResponse::failure(StoreOpcode::UpsertMessage, NO_SUCH_RECIPIENT);
                }
                StoreResponse::UpsertMessage(ErrorResponse::default())
            }
        };

        if request.is_write() {
            self.persist_write(&state.tables, request.opcode());
            self.replicate(state);
        }
        response
    }

    /// Rewrites both table files. Deleting an account also drops its inbox, so
    /// no write touches only one of them.
    fn persist_write(&self, tables: &Tables, opcode: StoreOpcode) {
        if let Err(err) = self.persistence.save_tables(tables) {
            error!(?opcode, error = ?err, "failed to persist write");
        }
    }

    /// Pushes the full tables to every live replica. A failed push marks that
    /// replica down.
    fn replicate(&self, state: &mut StoreState) {
        let replicas = state.liveness.replicas();
        if replicas.is_empty() {
            return;
        }
        let failed = self.push_snapshot(state.tables.snapshot(), &replicas);
        for peer in failed {
            self.mark_down(state, peer);
        }
    }

    /// Writes one snapshot frame to each target. Returns the targets that
    /// could not be reached.
    ///
    /// A snapshot that cannot be framed is logged and dropped without
    /// blaming any peer.
    fn push_snapshot(&self, snapshot: Snapshot, targets: &[usize]) -> Vec<usize> {
        let accounts = snapshot.accounts.len();
        let messages = snapshot.messages.len();
        let payload = match encode_record(&SyncRecord::Snapshot(snapshot)) {
            Ok(payload) => payload,
            Err(err) => {
                error!(accounts, messages, error = %err, "snapshot cannot be framed");
                return Vec::new();
            }
        };

        let mut failed = Vec::new();
        for &peer in targets {
            let Some(links) = self.mesh.peer(peer) else {
                continue;
            };
            let mut stream = &links.sync_out;
            match write_frame(&mut stream, &payload) {
                Ok(()) => debug!(peer, accounts, messages, "pushed snapshot"),
                Err(err) => {
                    warn!(peer, error = %err, "snapshot push failed");
                    failed.push(peer);
                }
            }
        }
        failed
    }

    /// Marks `peer` down and rewrites the persisted primary flag if that
    /// changed the view.
    fn mark_down(&self, state: &mut StoreState, peer: usize) {
        if peer == self.machine_id || !state.liveness.mark_down(peer) {
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let is_primary = state.liveness.is_primary(self.machine_id);
        warn!(
            peer,
            primary = ?state.liveness.primary(),
            is_primary,
            "marked node down"
        );
        if let Err(err) = self.persistence.save_primary_flag(is_primary) {
            error!(error = ?err, "failed to persist primary flag");
        }
    }

    fn peer_failed(&self, peer: usize) {
        let mut state = self.lock();
        self.mark_down(&mut state, peer);
    }

    /// Replaces the local tables with a snapshot received from a peer.
    fn apply_snapshot(&self, from: usize, snapshot: Snapshot) {
        let mut state = self.lock();
        state.tables = Tables::from_snapshot(snapshot);
        if let Err(err) = self.persistence.save_tables(&state.tables) {
            error!(from, error = ?err, "failed to persist received snapshot");
        }
        debug!(from, "applied snapshot");
    }

    /// Starts one reader thread per inbound peer stream.
    pub fn spawn_readers(self: &Arc<Self>) -> Result<()> {
        for (peer, channel, stream) in self.mesh.inbound()? {
            let store = Arc::clone(self);
            let name = match channel {
                Channel::Command => format!("command-reader-{}-{peer}", self.machine_id),
                Channel::Sync => format!("sync-reader-{}-{peer}", self.machine_id),
            };
            thread::Builder::new()
                .name(name)
                .spawn(move || match channel {
                    Channel::Command => store.serve_commands(peer, stream),
                    Channel::Sync => store.serve_sync(peer, stream),
                })
                .context("failed to spawn peer reader")?;
        }
        Ok(())
    }

    /// Answers requests forwarded by `peer` until the stream closes.
    fn serve_commands(&self, peer: usize, stream: TcpStream) {
        let mut reader = &stream;
        let reason = loop {
            let request: StoreRequest = match recv_record(&mut reader) {
                Ok(Some(request)) => request,
                Ok(None) => break "closed".to_string(),
                Err(err) => break err.to_string(),
            };
            debug!(peer, opcode = ?request.opcode(), "serving forwarded request");
            let response = self.execute(&request);
            let payload = match encode_record(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(peer, opcode = ?response.opcode(), error = %err, "response cannot be framed");
                    match encode_record(&StoreResponse::failure(response.opcode(), err.to_string())) {
                        Ok(payload) => payload,
                        Err(err) => break err.to_string(),
                    }
                }
            };
            let mut writer = &stream;
            if let Err(err) = write_frame(&mut writer, &payload) {
                break err.to_string();
            }
        };
        if !self.shutting_down.load(Ordering::SeqCst) {
            info!(peer, %reason, "command channel ended");
        }
        self.peer_failed(peer);
    }

    /// Applies snapshots pushed by `peer` until the stream closes.
    fn serve_sync(&self, peer: usize, stream: TcpStream) {
        let mut reader = &stream;
        let reason = loop {
            match recv_record::<_, SyncRecord>(&mut reader) {
                Ok(Some(SyncRecord::Snapshot(snapshot))) => self.apply_snapshot(peer, snapshot),
                Ok(None) => break "closed".to_string(),
                Err(err) => break err.to_string(),
            }
        };
        if !self.shutting_down.load(Ordering::SeqCst) {
            info!(peer, %reason, "sync channel ended");
        }
        self.peer_failed(peer);
    }

    /// Reconciles state after a cluster restart.
    ///
    /// The highest-indexed node that was primary at the end of its last run
    /// holds the newest data and pushes it to every peer. Afterwards each
    /// node records whether it is primary now.
    pub fn recover(&self, was_primary: bool) {
        let mut claimants: Vec<usize> = self
            .mesh
            .prior_primaries()
            .into_iter()
            .filter_map(|(peer, flag)| flag.then_some(peer))
            .collect();
        if was_primary {
            claimants.push(self.machine_id);
        }
        let source = claimants.into_iter().max();

        let mut state = self.lock();
        if source == Some(self.machine_id) {
            let peers: Vec<usize> = self.mesh.peer_ids().collect();
            info!(
                machine_id = self.machine_id,
                peers = peers.len(),
                "pushing recovered state to peers"
            );
            self.with_sync_timeout(self.timeouts.command(), &peers);
            let failed = self.push_snapshot(state.tables.snapshot(), &peers);
            self.with_sync_timeout(self.timeouts.sync(), &peers);
            for peer in failed {
                self.mark_down(&mut state, peer);
            }
        } else {
            debug!(source = ?source, "waiting for recovered state from peer");
        }

        let is_primary = state.liveness.is_primary(self.machine_id);
        if let Err(err) = self.persistence.save_primary_flag(is_primary) {
            error!(error = ?err, "failed to persist primary flag");
        }
    }

    fn with_sync_timeout(&self, timeout: Duration, peers: &[usize]) {
        for peer in peers {
            if let Some(links) = self.mesh.peer(*peer) {
                if let Err(err) = links.sync_out.set_write_timeout(Some(timeout)) {
                    warn!(peer, error = %err, "failed to set sync write timeout");
                }
            }
        }
    }

    /// Closes every peer link. Liveness changes observed after this point are
    /// not persisted, so the primary flag on disk stays as it was.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.mesh.shutdown();
    }

    fn call(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        let opcode = request.opcode();
        let response = self.execute(&request);
        if response.opcode() != opcode {
            return Err(StoreError::UnexpectedResponse {
                expected: opcode,
                actual: response.opcode(),
            });
        }
        if !response.error().is_empty() {
            return Err(StoreError::Rejected {
                opcode,
                message: response.error().to_string(),
            });
        }
        Ok(response)
    }

    /// Removes the account and every message addressed to it.
    pub fn delete_account(&self, username: &str) -> Result<(), StoreError> {
        self.call(StoreRequest::DeleteAccount(UsernameRequest {
            username: username.to_string(),
        }))
        .map(drop)
    }

    /// Empties both tables.
    pub fn delete_all(&self) -> Result<(), StoreError> {
        self.call(StoreRequest::DeleteAll(NoFields {})).map(drop)
    }

    /// Every account, in username order.
    pub fn get_accounts(&self) -> Result<Vec<Account>, StoreError> {
        match self.call(StoreRequest::GetAccounts(NoFields {}))? {
            StoreResponse::GetAccounts(response) => Ok(response.accounts),
            other => Err(unexpected(StoreOpcode::GetAccounts, &other)),
        }
    }

    /// Whether `username` is logged in. A missing account reads as logged out.
    pub fn get_account_logged_in(&self, username: &str) -> Result<bool, StoreError> {
        let request = StoreRequest::GetAccountLoggedIn(UsernameRequest {
            username: username.to_string(),
        });
        match self.call(request)? {
            StoreResponse::GetAccountLoggedIn(response) => Ok(response.value),
            other => Err(unexpected(StoreOpcode::GetAccountLoggedIn, &other)),
        }
    }

    /// Undelivered messages addressed to `username`.
    pub fn get_messages(&self, username: &str, logged_in_only: bool) -> Result<Vec<Message>, StoreError> {
        let request = StoreRequest::GetMessages(GetMessagesRequest {
            username: username.to_string(),
            logged_in_only,
        });
        match self.call(request)? {
            StoreResponse::GetMessages(response) => Ok(response.messages),
            other => Err(unexpected(StoreOpcode::GetMessages, &other)),
        }
    }

    /// Whether an account named `username` exists. This and a following write
    /// are separate calls, so the answer may be stale by then.
    pub fn has_account(&self, username: &str) -> Result<bool, StoreError> {
        let request = StoreRequest::HasAccount(UsernameRequest {
            username: username.to_string(),
        });
        match self.call(request)? {
            StoreResponse::HasAccount(response) => Ok(response.value),
            other => Err(unexpected(StoreOpcode::HasAccount, &other)),
        }
    }

    /// Creates the account or replaces its logged-in flag.
    pub fn upsert_account(&self, account: Account) -> Result<(), StoreError> {
        self.call(StoreRequest::UpsertAccount(UpsertAccountRequest { account }))
            .map(drop)
    }

    /// Inserts `message`, or marks the matching undelivered copy delivered
    /// when `message.delivered` is set. Refused if the recipient has no
    /// account.
    pub fn upsert_message(&self, message: Message) -> Result<(), StoreError> {
        self.call(StoreRequest::UpsertMessage(UpsertMessageRequest { message }))
            .map(drop)
    }
}

fn unexpected(expected: StoreOpcode, response: &StoreResponse) -> StoreError {
    StoreError::UnexpectedResponse {
        expected,
        actual: response.opcode(),
    }
}
