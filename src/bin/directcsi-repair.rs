// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    env,
    path::PathBuf,
    process::exit,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use env_logger::Builder;
use log::{warn, LevelFilter};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use directcsi::{
    engine::{
        consts::DEFAULT_STATE_FILE, sys::cmd::RepairOptions, FileStore, FsOps, HostPaths,
        RepairCoordinator, Store,
    },
    node::{DirectCsiError, ErrorKind, VERSION},
};

const EXIT_USAGE: i32 = 1;
const EXIT_DEVICE_NOT_FOUND: i32 = 2;
const EXIT_STILL_MOUNTED: i32 = 3;
const EXIT_REPAIR_FAILED: i32 = 4;
const EXIT_MOUNT_FAILED: i32 = 5;

static CANCEL: AtomicBool = AtomicBool::new(false);

extern "C" fn request_cancel(_: libc::c_int) {
    CANCEL.store(true, Ordering::SeqCst);
}

/// Stop a running xfs_repair on SIGINT or SIGTERM instead of dying with
/// the drive unmounted.
fn install_cancel_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_cancel),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // The handler only stores to an atomic.
        unsafe { sigaction(signal, &action)? };
    }
    Ok(())
}

fn parse_args() -> Command {
    Command::new("directcsi-repair")
        .version(VERSION)
        .about("Repairs the XFS filesystem of managed drives and remounts them")
        .arg(
            Arg::new("drives")
                .value_name("DRIVE")
                .required(true)
                .num_args(1..)
                .help("Names of the drive records to repair"),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .help("Zero the log before repairing, discarding pending changes"),
        )
        .arg(
            Arg::new("disable_prefetch")
                .long("disable-prefetch")
                .action(ArgAction::SetTrue)
                .help("Disable xfs_repair's prefetching of metadata"),
        )
        .arg(
            Arg::new("dry_run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Only report what would be repaired"),
        )
        .arg(
            Arg::new("node_id")
                .long("node-id")
                .env("NODE_ID")
                .help("Refuse drives that belong to any other node"),
        )
        .arg(
            Arg::new("state_file")
                .long("state-file")
                .value_parser(value_parser!(PathBuf))
                .default_value(DEFAULT_STATE_FILE)
                .help("JSON file holding drive and volume records"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .action(ArgAction::Set)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Sets level for generation of log messages."),
        )
}

fn exit_code(err: &DirectCsiError) -> i32 {
    match err.kind() {
        ErrorKind::DeviceNotFound | ErrorKind::NotFound => EXIT_DEVICE_NOT_FOUND,
        ErrorKind::StillMounted => EXIT_STILL_MOUNTED,
        ErrorKind::RepairFailed => EXIT_REPAIR_FAILED,
        _ => EXIT_MOUNT_FAILED,
    }
}

fn init_logger(args: &ArgMatches) {
    let mut builder = Builder::new();
    match args
        .get_one::<String>("log_level")
        .and_then(|level| LevelFilter::from_str(level).ok())
    {
        Some(level) => {
            builder.filter(Some("directcsi"), level);
        }
        None => match env::var("RUST_LOG") {
            Ok(s) => {
                builder.parse_filters(&s);
            }
            Err(_) => {
                builder.filter(Some("directcsi"), LevelFilter::Error);
            }
        },
    }
    builder.init();
}

/// Repair every named drive in turn. Returns the exit code of the first
/// failure, or 0.
fn repair_all(args: &ArgMatches) -> i32 {
    let state_file = args
        .get_one::<PathBuf>("state_file")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    let store = match FileStore::open(&state_file) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Unable to load drive records: {err}");
            return EXIT_USAGE;
        }
    };
    let ops = FsOps::host(HostPaths::default());
    let coordinator = RepairCoordinator::new(&store, &ops);
    let opts = RepairOptions {
        force: args.get_flag("force"),
        disable_prefetch: args.get_flag("disable_prefetch"),
        dry_run: args.get_flag("dry_run"),
    };
    let node_id = args.get_one::<String>("node_id");

    let mut code = 0;
    for name in args.get_many::<String>("drives").into_iter().flatten() {
        let result = store.get_drive(name).and_then(|drive| {
            if let Some(node_id) = node_id {
                if &drive.status.node_name != node_id {
                    return Err(DirectCsiError::Msg(format!(
                        "drive {name} belongs to node {}",
                        drive.status.node_name
                    )));
                }
            }
            coordinator.repair(&drive, opts, &CANCEL)
        });
        match result {
            Ok(()) => println!("{name}: repaired"),
            Err(err) => {
                eprintln!("{name}: {err}");
                if code == 0 {
                    code = if matches!(err, DirectCsiError::Msg(_)) {
                        EXIT_USAGE
                    } else {
                        exit_code(&err)
                    };
                }
            }
        }
        if CANCEL.load(Ordering::SeqCst) {
            break;
        }
    }
    code
}

fn main() {
    let args = match parse_args().try_get_matches() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            exit(if err.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    init_logger(&args);

    if let Err(err) = install_cancel_handler() {
        warn!("Unable to install signal handlers: {err}");
    }
    exit(repair_all(&args));
}
