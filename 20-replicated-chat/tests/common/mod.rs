//! Test harness for clusters of real nodes on localhost.

#![allow(dead_code)]

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use replicated_chat::client::ChatClient;
use replicated_chat::cluster::Mesh;
use replicated_chat::config::{ClusterConfig, NodeAddress, NodeConfig};
use replicated_chat::node::Node;

/// One cluster slot.
pub enum Member {
    Running(Node),
    /// Joined the mesh but never reads or answers: its sockets stay open and
    /// every request to it runs into the command timeout.
    Hung(Mesh),
}

pub struct TestCluster {
    pub members: Vec<Member>,
}

impl TestCluster {
    /// Starts `n` nodes with base ports `base_port, base_port + 10, ...`.
    ///
    /// Nodes boot concurrently because each blocks until the mesh is formed.
    pub fn spawn(n: usize, base_port: u16, data_dir: &Path) -> Result<Self> {
        Self::spawn_with_hung(n, base_port, data_dir, &[])
    }

    /// Like [`spawn`](Self::spawn), but the ids in `hung` only form their
    /// mesh links and then go silent.
    pub fn spawn_with_hung(n: usize, base_port: u16, data_dir: &Path, hung: &[usize]) -> Result<Self> {
        let addresses = (0..n)
            .map(|i| NodeAddress::new("127.0.0.1", base_port + 10 * i as u16))
            .collect();
        let cluster = ClusterConfig::new(addresses, data_dir)?;

        let handles: Vec<_> = (0..n)
            .map(|id| {
                let config = NodeConfig::new(id, cluster.clone());
                let is_hung = hung.contains(&id);
                thread::spawn(move || -> Result<Member> {
                    let config = config?;
                    if is_hung {
                        Ok(Member::Hung(Mesh::form(&config, false)?))
                    } else {
                        Ok(Member::Running(Node::start(config)?))
                    }
                })
            })
            .collect();

        let mut members = Vec::with_capacity(n);
        for handle in handles {
            let member = handle
                .join()
                .map_err(|_| anyhow!("node start thread panicked"))??;
            members.push(member);
        }
        Ok(Self { members })
    }

    pub fn node(&self, id: usize) -> &Node {
        match &self.members[id] {
            Member::Running(node) => node,
            Member::Hung(_) => panic!("node {id} is hung"),
        }
    }

    pub fn client(&self, id: usize) -> Result<ChatClient> {
        ChatClient::connect(self.node(id).client_addr())
    }

    /// Simulates a crash of one node; the others see its links close.
    pub fn kill(&mut self, id: usize) {
        match &mut self.members[id] {
            Member::Running(node) => node.shutdown(),
            Member::Hung(mesh) => mesh.shutdown(),
        }
    }

    pub fn shutdown(mut self) {
        for id in 0..self.members.len() {
            self.kill(id);
        }
        // Let reader threads observe the closed links.
        thread::sleep(Duration::from_millis(100));
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
pub fn wait_until(timeout: Duration, what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    loop {
        if check() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timeout waiting for {what}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}
