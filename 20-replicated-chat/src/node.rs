//! Boot sequence for one cluster member.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cluster::Mesh;
use crate::config::NodeConfig;
use crate::events::Events;
use crate::persistence::Persistence;
use crate::server::ClientServer;
use crate::store::ReplicatedStore;

/// A running node: replicated store, peer readers, and client server.
pub struct Node {
    config: NodeConfig,
    store: Arc<ReplicatedStore>,
    server: ClientServer,
}

impl Node {
    /// Starts a node and blocks until the full mesh has formed.
    ///
    /// 1. Load persisted tables and the primary flag
    /// 2. Form the mesh, announcing the flag to peers
    /// 3. Start peer readers, then run recovery
    /// 4. Open the client port
    pub fn start(config: NodeConfig) -> Result<Self> {
        let machine_id = config.machine_id;
        let persistence = Persistence::new(&config.cluster.data_dir, machine_id)?;
        let tables = persistence.load_tables();
        let was_primary = persistence.load_was_primary();
        info!(
            machine_id,
            was_primary,
            accounts = tables.accounts().len(),
            messages = tables.all_messages().len(),
            "loaded persisted state"
        );

        let mesh = Mesh::form(&config, was_primary).context("failed to form cluster mesh")?;
        let store = ReplicatedStore::new(&config, mesh, persistence, tables);
        store.spawn_readers()?;
        store.recover(was_primary);

        let events = Events::new(Arc::clone(&store));
        let server = ClientServer::start(&config.address().client_addr(), events)?;
        info!(machine_id, primary = ?store.primary(), "node ready");

        Ok(Self {
            config,
            store,
            server,
        })
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Closes client sessions and peer links. Peers observe this node as dead.
    pub fn shutdown(&mut self) {
        self.server.shutdown();
        self.store.shutdown();
        info!(machine_id = self.config.machine_id, "node stopped");
    }
}
