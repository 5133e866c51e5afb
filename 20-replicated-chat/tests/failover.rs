//! Primary failure and cluster restart.

mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use common::{wait_until, TestCluster};

#[test]
fn test_write_survives_primary_crash() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cluster = TestCluster::spawn(3, 47500, dir.path())?;
    let mut client = cluster.client(2)?;

    assert_eq!(client.create_account("alice")?.error, "");
    cluster.kill(0);

    // The retry loop moves on to node 1 without surfacing an error.
    assert_eq!(client.create_account("bob")?.error, "");
    assert_eq!(cluster.node(2).store().primary(), Some(1));
    assert!(cluster.node(1).store().is_primary());

    let accounts = client.list_accounts("")?;
    assert_eq!(accounts.error, "");
    assert_eq!(accounts.accounts.len(), 2);

    let replica = cluster.node(2).store();
    wait_until(Duration::from_secs(2), "new primary to replicate", || {
        replica.tables().has_account("bob")
    })?;

    cluster.shutdown();
    Ok(())
}

#[test]
fn test_hung_primary_is_skipped_after_command_timeout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = TestCluster::spawn_with_hung(3, 47900, dir.path(), &[0])?;
    let mut client = cluster.client(1)?;
    client.set_timeout(Some(Duration::from_secs(10)))?;

    // Node 0 keeps its sockets open but never answers.
    let started = Instant::now();
    assert_eq!(client.create_account("alice")?.error, "");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    let node1 = cluster.node(1).store();
    assert_eq!(node1.primary(), Some(1));
    assert!(node1.liveness().is_down(0));

    // Node 2 still routes to node 0 until its own forward times out.
    let node2 = cluster.node(2).store();
    assert!(node2.has_account("alice")?);
    assert_eq!(node2.primary(), Some(1));
    wait_until(Duration::from_secs(2), "node 2 to hold the new account", || {
        node2.tables().has_account("alice")
    })?;

    cluster.shutdown();
    Ok(())
}

#[test]
fn test_replica_crash_does_not_block_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cluster = TestCluster::spawn(3, 47600, dir.path())?;
    cluster.kill(2);

    let mut client = cluster.client(1)?;
    assert_eq!(client.create_account("alice")?.error, "");

    let primary = cluster.node(0).store();
    wait_until(Duration::from_secs(2), "primary to drop the dead replica", || {
        primary.liveness().is_down(2)
    })?;
    assert_eq!(primary.primary(), Some(0));

    cluster.shutdown();
    Ok(())
}

#[test]
fn test_restart_recovers_from_last_primary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let mut cluster = TestCluster::spawn(3, 47700, dir.path())?;
        let mut client = cluster.client(2)?;
        client.create_account("alice")?;

        cluster.kill(0);
        client.create_account("bob")?;
        let node1 = cluster.node(1).store();
        wait_until(Duration::from_secs(2), "node 1 to take over", || node1.is_primary())?;
        cluster.shutdown();
    }

    // Node 0 still holds only "alice"; node 1 was primary last and has both.
    let cluster = TestCluster::spawn(3, 47700, dir.path())?;
    for id in 0..3 {
        let store = cluster.node(id).store();
        wait_until(Duration::from_secs(3), "recovered state to spread", || {
            let tables = store.tables();
            tables.has_account("alice") && tables.has_account("bob")
        })?;
    }
    assert_eq!(cluster.node(0).store().primary(), Some(0));

    let mut client = cluster.client(0)?;
    assert_eq!(client.list_accounts("")?.accounts.len(), 2);

    cluster.shutdown();
    Ok(())
}
