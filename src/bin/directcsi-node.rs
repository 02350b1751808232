// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{env, error::Error, path::PathBuf, str::FromStr, time::Duration};

use clap::{value_parser, Arg, ArgAction, Command};
use env_logger::Builder;
use log::LevelFilter;

use directcsi::{
    engine::{
        consts::{DEFAULT_STATE_FILE, DEFAULT_SYNC_INTERVAL},
        types::AccessTier,
        HostPaths, NodeConfig,
    },
    node::{run, NodeOptions, VERSION},
};

fn parse_topology(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got \"{value}\"")),
    }
}

fn parse_args() -> Command {
    Command::new("directcsi-node")
        .version(VERSION)
        .about("Discovers block devices on this node and keeps their drive records current")
        .arg(
            Arg::new("node_id")
                .long("node-id")
                .env("NODE_ID")
                .required(true)
                .help("Name of the node this agent runs on"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .action(ArgAction::Set)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Sets level for generation of log messages."),
        )
        .arg(
            Arg::new("sim")
                .long("sim")
                .action(ArgAction::SetTrue)
                .help("Keep drive records in memory and do not listen for uevents."),
        )
        .arg(
            Arg::new("state_file")
                .long("state-file")
                .value_parser(value_parser!(PathBuf))
                .default_value(DEFAULT_STATE_FILE)
                .help("JSON file holding drive and volume records"),
        )
        .arg(
            Arg::new("sync_interval")
                .long("sync-interval")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("60")
                .help("Seconds between full walks of the block devices"),
        )
        .arg(
            Arg::new("access_tier")
                .long("access-tier")
                .value_parser(["Warm", "Hot", "Cold", "Unknown"])
                .default_value("Unknown")
                .help("Access tier label for new drives"),
        )
        .arg(
            Arg::new("topology")
                .long("topology")
                .value_name("KEY=VALUE")
                .action(ArgAction::Append)
                .value_parser(parse_topology)
                .help("Topology segment for new drives; may be repeated"),
        )
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args().get_matches();

    let mut builder = Builder::new();
    if let Some(log_level) = args.get_one::<String>("log_level") {
        builder.filter(Some("directcsi"), LevelFilter::from_str(log_level)?);
    } else if let Ok(s) = env::var("RUST_LOG") {
        builder.parse_filters(&s);
    } else {
        builder.filter(Some("directcsi"), LevelFilter::Info);
    }
    builder.init();

    let mut config = NodeConfig::new(
        args.get_one::<String>("node_id")
            .ok_or("--node-id is required")?,
    );
    if let Some(tier) = args.get_one::<String>("access_tier") {
        config.access_tier = AccessTier::from_str(tier)?;
    }
    config.topology = args
        .get_many::<(String, String)>("topology")
        .into_iter()
        .flatten()
        .cloned()
        .collect();

    let options = NodeOptions {
        config,
        sim: args.get_flag("sim"),
        state_file: args
            .get_one::<PathBuf>("state_file")
            .cloned()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
        sync_interval: args
            .get_one::<u64>("sync_interval")
            .map_or(DEFAULT_SYNC_INTERVAL, |secs| Duration::from_secs(*secs)),
        host_paths: HostPaths::default(),
    };
    run(options)?;
    Ok(())
}
