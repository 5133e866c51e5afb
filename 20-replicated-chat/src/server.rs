//! Client-facing TCP server.
//!
//! One thread per client connection. Each request is a framed
//! [`ClientRequest`]; each gets exactly one framed [`ClientResponse`].
//!
//! A session remembers every account it logged in or created. When the
//! client disconnects, those still logged in are logged out on its behalf.

use std::collections::{BTreeSet, HashMap};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::events::Events;
use crate::frame::{encode_record, recv_record, write_frame};
use crate::schema::{ClientRequest, ClientResponse};

type Sessions = Arc<Mutex<HashMap<u64, TcpStream>>>;

pub struct ClientServer {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    sessions: Sessions,
    accept_thread: Option<JoinHandle<()>>,
}

impl ClientServer {
    pub fn start(addr: &str, events: Events) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind client port {addr}"))?;
        let local_addr = listener.local_addr()?;
        let stopping = Arc::new(AtomicBool::new(false));
        let sessions: Sessions = Arc::default();

        let accept_thread = {
            let stopping = Arc::clone(&stopping);
            let sessions = Arc::clone(&sessions);
            thread::Builder::new()
                .name(format!("client-accept-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, events, stopping, sessions))
                .context("failed to spawn client accept thread")?
        };
        info!(%local_addr, "client server listening");

        Ok(Self {
            local_addr,
            stopping,
            sessions,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every open session.
    pub fn shutdown(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept so it observes the flag.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        for stream in sessions.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!(local_addr = %self.local_addr, sessions = sessions.len(), "client server stopped");
    }
}

impl Drop for ClientServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, events: Events, stopping: Arc<AtomicBool>, sessions: Sessions) {
    let next_id = AtomicU64::new(0);
    for incoming in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to accept client");
                continue;
            }
        };
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let registered = stream.try_clone().map(|clone| {
            sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, clone);
        });
        if let Err(err) = registered {
            warn!(error = %err, "failed to register client session");
            continue;
        }

        let events = events.clone();
        let stopping = Arc::clone(&stopping);
        let sessions = Arc::clone(&sessions);
        let spawned = thread::Builder::new()
            .name(format!("client-session-{id}"))
            .spawn(move || {
                Session::new(events).run(stream, &stopping);
                sessions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn client session");
        }
    }
}

struct Session {
    events: Events,
    /// Accounts this connection logged in or created and has not since
    /// logged out or deleted.
    accounts: BTreeSet<String>,
}

impl Session {
    fn new(events: Events) -> Self {
        Self {
            events,
            accounts: BTreeSet::new(),
        }
    }

    fn run(mut self, stream: TcpStream, stopping: &AtomicBool) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!(%peer, "client connected");

        let mut reader = &stream;
        loop {
            let request: ClientRequest = match recv_record(&mut reader) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) => {
                    if !stopping.load(Ordering::SeqCst) {
                        warn!(%peer, error = %err, "dropping client connection");
                    }
                    break;
                }
            };
            let response = self.handle(request);
            let payload = match encode_record(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%peer, opcode = ?response.opcode(), error = %err, "response cannot be framed");
                    match encode_record(&ClientResponse::failure(response.opcode(), err.to_string())) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(%peer, error = %err, "failed to answer client");
                            break;
                        }
                    }
                }
            };
            let mut writer = &stream;
            if let Err(err) = write_frame(&mut writer, &payload) {
                warn!(%peer, error = %err, "failed to answer client");
                break;
            }
        }

        if stopping.load(Ordering::SeqCst) {
            return;
        }
        for username in std::mem::take(&mut self.accounts) {
            let response = self.events.log_out_account(&username);
            debug!(%peer, %username, error = %response.error, "logged out disconnected client");
        }
        debug!(%peer, "client disconnected");
    }

    fn handle(&mut self, request: ClientRequest) -> ClientResponse {
        let change = match &request {
            ClientRequest::LogInAccount(req) | ClientRequest::CreateAccount(req) => {
                Some((req.username.clone(), true))
            }
            ClientRequest::LogOutAccount(req) | ClientRequest::DeleteAccount(req) => {
                Some((req.username.clone(), false))
            }
            _ => None,
        };
        let response = self.events.handle(request);
        if !response.error().is_empty() {
            return response;
        }
        match change {
            Some((username, true)) => {
                self.accounts.insert(username);
            }
            Some((username, false)) => {
                self.accounts.remove(&username);
            }
            None => {}
        }
        response
    }
}
