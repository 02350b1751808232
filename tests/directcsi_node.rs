// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use std::{thread, time};

#[test]
fn test_directcsi_node_bad_loglevel() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("directcsi-node")?;
    let assert = cmd
        .args(["--node-id", "n1", "--log-level", "nosuchlevel"])
        .assert();
    assert.failure().code(2);
    Ok(())
}

#[test]
fn test_directcsi_node_bad_option() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("directcsi-node")?;
    let assert = cmd.args(["--node-id", "n1", "--nosim"]).assert();
    assert.failure().code(2);
    Ok(())
}

#[test]
fn test_directcsi_node_missing_node_id() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("directcsi-node")?;
    let assert = cmd.env_remove("NODE_ID").arg("--sim").assert();
    assert
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--node-id"));
    Ok(())
}

#[test]
fn test_directcsi_node_bad_topology() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("directcsi-node")?;
    let assert = cmd
        .args(["--node-id", "n1", "--topology", "zone"])
        .assert();
    assert
        .failure()
        .code(2)
        .stderr(predicate::str::contains("key=value"));
    Ok(())
}

#[test]
fn test_directcsi_node_bad_access_tier() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("directcsi-node")?;
    let assert = cmd
        .args(["--node-id", "n1", "--access-tier", "Lukewarm"])
        .assert();
    assert.failure().code(2);
    Ok(())
}

#[test]
fn test_directcsi_node_sim_startup() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("directcsi-node")?;
    let mut child = cmd
        .args(["--sim", "--node-id", "n1", "--sync-interval", "1"])
        .spawn()?;
    thread::sleep(time::Duration::from_secs(1));
    assert!(child.try_wait()?.is_none());
    child.kill()?;
    Ok(())
}
