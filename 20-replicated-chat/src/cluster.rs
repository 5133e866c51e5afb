//! Full-mesh transport between the configured nodes.
//!
//! Every pair of nodes is joined by two logical channels:
//!
//! - **command**: a replica sends a store request and blocks for the response
//! - **sync**: the primary pushes full snapshots, no response
//!
//! Each node dials every peer on both channels and also accepts both channels
//! from every peer, so for each peer it ends up with four streams: outbound
//! command, outbound sync, inbound command, inbound sync. Outbound streams are
//! used by this node's own callers; inbound streams get a reader thread each
//! (see [`crate::store`]).
//!
//! # Formation
//!
//! [`Mesh::form`] runs once at boot and returns only when all `4 * (n - 1)`
//! streams are in place. Dialing retries forever with a bounded per-attempt
//! timeout, so nodes may start in any order. Each dialed stream begins with a
//! fixed-size handshake naming the dialer's machine id; the sync handshake
//! also carries the dialer's persisted "was primary" flag.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info, warn};

use crate::codec::{Decode, Encode};
use crate::config::NodeConfig;
use crate::schema::{CommandHello, SyncHello};

/// Which logical channel a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Command,
    Sync,
}

/// One stream produced during formation.
enum Link {
    Outbound {
        peer: usize,
        channel: Channel,
        stream: TcpStream,
    },
    Inbound {
        peer: usize,
        channel: Channel,
        stream: TcpStream,
        was_primary: bool,
    },
}

/// The four streams this node holds for one peer.
#[derive(Debug)]
pub struct PeerLinks {
    pub command_out: TcpStream,
    pub sync_out: TcpStream,
    pub command_in: TcpStream,
    pub sync_in: TcpStream,
    /// The peer's persisted primary flag, learned from its sync handshake.
    pub was_primary: bool,
}

#[derive(Debug, Default)]
pub struct Mesh {
    peers: BTreeMap<usize, PeerLinks>,
}

#[derive(Default)]
struct PartialLinks {
    command_out: Option<TcpStream>,
    sync_out: Option<TcpStream>,
    command_in: Option<TcpStream>,
    sync_in: Option<TcpStream>,
    was_primary: bool,
}

impl Mesh {
    /// Binds this node's command and sync listeners and blocks until the mesh
    /// with every configured peer is complete.
    pub fn form(config: &NodeConfig, was_primary: bool) -> Result<Self> {
        let address = config.address();
        let command_listener = TcpListener::bind(address.command_addr())
            .with_context(|| format!("failed to bind command port {}", address.command_addr()))?;
        let sync_listener = TcpListener::bind(address.sync_addr())
            .with_context(|| format!("failed to bind sync port {}", address.sync_addr()))?;
        Self::form_with_listeners(config, was_primary, command_listener, sync_listener)
    }

    fn form_with_listeners(
        config: &NodeConfig,
        was_primary: bool,
        command_listener: TcpListener,
        sync_listener: TcpListener,
    ) -> Result<Self> {
        let machine_id = config.machine_id;
        let peer_ids: Vec<usize> = config.peer_ids().collect();
        if peer_ids.is_empty() {
            return Ok(Self::default());
        }

        let timeouts = &config.cluster.timeouts;
        let command_hello = CommandHello { machine_id }.encode()?;
        let sync_hello = SyncHello {
            machine_id,
            was_primary,
        }
        .encode()?;

        let (link_tx, link_rx) = unbounded();
        let expected = 4 * peer_ids.len();

        thread::scope(|scope| {
            for &peer in &peer_ids {
                let node = &config.cluster.nodes[peer];
                for (channel, addr, hello) in [
                    (Channel::Command, node.command_addr(), &command_hello),
                    (Channel::Sync, node.sync_addr(), &sync_hello),
                ] {
                    let link_tx = link_tx.clone();
                    let retry = timeouts.connect_retry();
                    scope.spawn(move || {
                        let stream = dial(&addr, hello, retry);
                        let _ = link_tx.send(Link::Outbound {
                            peer,
                            channel,
                            stream,
                        });
                    });
                }
            }

            for (channel, listener) in [
                (Channel::Command, &command_listener),
                (Channel::Sync, &sync_listener),
            ] {
                let link_tx = link_tx.clone();
                let peer_ids = &peer_ids;
                let handshake = timeouts.handshake();
                scope.spawn(move || {
                    accept_peers(listener, channel, machine_id, peer_ids, handshake, &link_tx)
                });
            }
            drop(link_tx);

            let mut partial: BTreeMap<usize, PartialLinks> = BTreeMap::new();
            for link in link_rx.iter().take(expected) {
                match link {
                    Link::Outbound {
                        peer,
                        channel,
                        stream,
                    } => {
                        let entry = partial.entry(peer).or_default();
                        match channel {
                            Channel::Command => entry.command_out = Some(stream),
                            Channel::Sync => entry.sync_out = Some(stream),
                        }
                    }
                    Link::Inbound {
                        peer,
                        channel,
                        stream,
                        was_primary,
                    } => {
                        let entry = partial.entry(peer).or_default();
                        match channel {
                            Channel::Command => entry.command_in = Some(stream),
                            Channel::Sync => {
                                entry.sync_in = Some(stream);
                                entry.was_primary = was_primary;
                            }
                        }
                    }
                }
            }
            Self::assemble(partial, config)
        })
    }

    fn assemble(mut partial: BTreeMap<usize, PartialLinks>, config: &NodeConfig) -> Result<Self> {
        let timeouts = &config.cluster.timeouts;
        let mut peers = BTreeMap::new();
        for peer in config.peer_ids() {
            let Some(PartialLinks {
                command_out: Some(command_out),
                sync_out: Some(sync_out),
                command_in: Some(command_in),
                sync_in: Some(sync_in),
                was_primary,
            }) = partial.remove(&peer)
            else {
                return Err(anyhow!(
                    "mesh formation ended without all links to peer {peer}"
                ));
            };

            command_out.set_read_timeout(Some(timeouts.command()))?;
            command_out.set_write_timeout(Some(timeouts.command()))?;
            sync_out.set_write_timeout(Some(timeouts.sync()))?;

            peers.insert(
                peer,
                PeerLinks {
                    command_out,
                    sync_out,
                    command_in,
                    sync_in,
                    was_primary,
                },
            );
        }
        info!(
            machine_id = config.machine_id,
            peers = peers.len(),
            "cluster mesh formed"
        );
        Ok(Self { peers })
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.peers.keys().copied()
    }

    pub fn peer(&self, id: usize) -> Option<&PeerLinks> {
        self.peers.get(&id)
    }

    /// Persisted primary flags announced by each peer.
    pub fn prior_primaries(&self) -> BTreeMap<usize, bool> {
        self.peers
            .iter()
            .map(|(id, links)| (*id, links.was_primary))
            .collect()
    }

    /// Cloned inbound streams for the reader threads.
    pub fn inbound(&self) -> Result<Vec<(usize, Channel, TcpStream)>> {
        let mut streams = Vec::with_capacity(self.peers.len() * 2);
        for (id, links) in &self.peers {
            streams.push((*id, Channel::Command, links.command_in.try_clone()?));
            streams.push((*id, Channel::Sync, links.sync_in.try_clone()?));
        }
        Ok(streams)
    }

    /// Closes every stream; peers observe this node as dead.
    pub fn shutdown(&self) {
        for links in self.peers.values() {
            for stream in [
                &links.command_out,
                &links.sync_out,
                &links.command_in,
                &links.sync_in,
            ] {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Connects to `addr` and sends `hello`, retrying until it succeeds.
fn dial(addr: &str, hello: &[u8], retry: Duration) -> TcpStream {
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match try_dial(addr, hello, retry) {
            Ok(stream) => {
                debug!(%addr, attempts, "connected to peer");
                return stream;
            }
            Err(err) => {
                if attempts % 50 == 1 {
                    debug!(%addr, attempts, error = %err, "peer not reachable yet, retrying");
                }
                thread::sleep(retry);
            }
        }
    }
}

fn try_dial(addr: &str, hello: &[u8], timeout: Duration) -> Result<TcpStream> {
    let targets: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {addr}"))?
        .collect();
    let mut last_err = None;
    for target in targets {
        match TcpStream::connect_timeout(&target, timeout) {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                stream.write_all(hello)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => anyhow!(err).context(format!("failed to connect to {addr}")),
        None => anyhow!("{addr} resolved to no addresses"),
    })
}

/// Accepts until every peer has announced itself on this listener.
fn accept_peers(
    listener: &TcpListener,
    channel: Channel,
    machine_id: usize,
    peer_ids: &[usize],
    handshake: Duration,
    link_tx: &Sender<Link>,
) {
    let mut pending: Vec<usize> = peer_ids.to_vec();
    while !pending.is_empty() {
        let (stream, remote) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(?channel, error = %err, "failed to accept peer connection");
                continue;
            }
        };
        let (peer, was_primary) = match read_hello(&stream, channel, handshake) {
            Ok(hello) => hello,
            Err(err) => {
                warn!(?channel, %remote, error = %err, "dropping connection with bad handshake");
                continue;
            }
        };
        if peer == machine_id || !peer_ids.contains(&peer) {
            warn!(?channel, %remote, peer, "handshake named an unknown machine id");
            continue;
        }
        if !pending.contains(&peer) {
            warn!(?channel, peer, "peer connected twice, keeping the first connection");
            continue;
        }
        pending.retain(|id| *id != peer);
        debug!(?channel, peer, "accepted peer connection");
        if link_tx
            .send(Link::Inbound {
                peer,
                channel,
                stream,
                was_primary,
            })
            .is_err()
        {
            return;
        }
    }
}

fn read_hello(stream: &TcpStream, channel: Channel, timeout: Duration) -> Result<(usize, bool)> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut reader = stream;
    let hello = match channel {
        Channel::Command => {
            let mut buf = [0u8; CommandHello::LEN];
            reader.read_exact(&mut buf)?;
            let (hello, _) = CommandHello::decode(&buf)?;
            (hello.machine_id, false)
        }
        Channel::Sync => {
            let mut buf = [0u8; SyncHello::LEN];
            reader.read_exact(&mut buf)?;
            let (hello, _) = SyncHello::decode(&buf)?;
            (hello.machine_id, hello.was_primary)
        }
    };
    stream.set_read_timeout(None)?;
    Ok(hello)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, NodeAddress};

    fn free_base_ports(count: usize) -> Vec<u16> {
        // Reserve three consecutive ports per node by probing.
        let mut bases = Vec::new();
        let mut candidate = 41_000u16;
        while bases.len() < count {
            let ok = (0..3).all(|offset| TcpListener::bind(("127.0.0.1", candidate + offset)).is_ok());
            if ok {
                bases.push(candidate);
            }
            candidate += 10;
        }
        bases
    }

    #[test]
    fn three_nodes_form_a_full_mesh() {
        let bases = free_base_ports(3);
        let cluster = ClusterConfig::new(
            bases.iter().map(|base| NodeAddress::new("127.0.0.1", *base)).collect(),
            "unused",
        )
        .unwrap();

        let meshes: Vec<Mesh> = thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|id| {
                    let config = NodeConfig::new(id, cluster.clone()).unwrap();
                    scope.spawn(move || Mesh::form(&config, id == 2).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (id, mesh) in meshes.iter().enumerate() {
            let peers: Vec<usize> = mesh.peer_ids().collect();
            assert_eq!(peers, (0..3).filter(|p| *p != id).collect::<Vec<_>>());
            assert_eq!(mesh.inbound().unwrap().len(), 4);
            let flags = mesh.prior_primaries();
            for (peer, flag) in flags {
                assert_eq!(flag, peer == 2);
            }
        }
        for mesh in &meshes {
            mesh.shutdown();
        }
    }

    #[test]
    fn single_node_needs_no_links() {
        let cluster = ClusterConfig::new(vec![NodeAddress::new("127.0.0.1", 0)], "unused").unwrap();
        let config = NodeConfig::new(0, cluster).unwrap();
        let command = TcpListener::bind("127.0.0.1:0").unwrap();
        let sync = TcpListener::bind("127.0.0.1:0").unwrap();
        let mesh = Mesh::form_with_listeners(&config, false, command, sync).unwrap();
        assert_eq!(mesh.peer_ids().count(), 0);
    }
}
