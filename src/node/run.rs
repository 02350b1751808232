// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Main loop

use std::{
    future::pending,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{runtime::Builder, select, signal, task};

use crate::{
    engine::{
        consts::DEFAULT_RESYNC_PERIOD,
        sys::{cmd::verify_binaries, HostPaths},
        DriveIndexer, EventQueue, FileStore, FsOps, Handler, MemoryStore, NodeConfig, Prober,
        Store,
    },
    node::{
        controller::drive_controller, errors::DirectCsiResult, processor::process_events,
        timer::sync_timer, uevent::uevent_thread, VERSION,
    },
};

/// How the node agent was asked to run.
#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub config: NodeConfig,
    /// Keep drive records in memory and skip the uevent listener.
    pub sim: bool,
    /// Where drive records are kept when not simulating.
    pub state_file: PathBuf,
    pub sync_interval: Duration,
    pub host_paths: HostPaths,
}

// Waits for SIGINT. If received, sets should_exit to true.
async fn signal_thread(should_exit: Arc<AtomicBool>) {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failure while listening for signals: {}", e);
    }
    should_exit.store(true, Ordering::Relaxed);
}

fn open_store(options: &NodeOptions) -> DirectCsiResult<Arc<dyn Store>> {
    if options.sim {
        info!("Using in-memory drive store");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        info!("Using drive store at {}", options.state_file.display());
        verify_binaries()?;
        Ok(Arc::new(FileStore::open(&options.state_file)?))
    }
}

/// Start the uevent listener, the sync timer, the event processor and the
/// drive controller, and keep them running until a signal is received or
/// one of them fails.
pub fn run(options: NodeOptions) -> DirectCsiResult<()> {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("directcsi-wt-{}", id)
        })
        .on_thread_start(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            debug!("{}: thread started", id)
        })
        .on_thread_stop(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            debug!("{}: thread finished", id)
        })
        .build()?;
    runtime.block_on(async move {
        info!(
            "direct-csi node agent version {} started on node {}",
            VERSION, options.config.node_id
        );
        let store = match open_store(&options) {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to start up the node agent: {}; exiting", e);
                return Err(e);
            }
        };

        let indexer = Arc::new(DriveIndexer::new(store, &options.config.node_id));
        indexer.resync()?;
        let handler = Arc::new(Handler::new(
            options.config.clone(),
            Arc::clone(&indexer),
            FsOps::host(options.host_paths.clone()),
        ));
        let prober = Prober::new(options.host_paths.clone());
        let queue = Arc::new(EventQueue::new());
        let should_exit = Arc::new(AtomicBool::new(false));

        let join_uevent = if options.sim {
            task::spawn(pending::<DirectCsiResult<()>>())
        } else {
            let queue = Arc::clone(&queue);
            let should_exit = Arc::clone(&should_exit);
            task::spawn_blocking(move || uevent_thread(queue, should_exit))
        };
        let join_processor = {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let prober = prober.clone();
            let should_exit = Arc::clone(&should_exit);
            task::spawn_blocking(move || process_events(queue, handler, prober, should_exit))
        };
        let join_controller = {
            let handler = Arc::clone(&handler);
            let should_exit = Arc::clone(&should_exit);
            task::spawn_blocking(move || {
                drive_controller(handler, should_exit, DEFAULT_RESYNC_PERIOD)
            })
        };
        let join_reflector = {
            let indexer = Arc::clone(&indexer);
            let should_exit = Arc::clone(&should_exit);
            task::spawn_blocking(move || indexer.run_reflector(&should_exit, DEFAULT_RESYNC_PERIOD))
        };
        let join_timer = task::spawn(sync_timer(
            Arc::clone(&queue),
            Arc::clone(&handler),
            prober,
            options.sync_interval,
            Arc::clone(&should_exit),
        ));
        let join_signal = task::spawn(signal_thread(Arc::clone(&should_exit)));

        let result = select! {
            res = join_uevent => {
                if let Ok(Err(e)) = res {
                    error!("The uevent thread exited with an error: {}; shutting down...", e);
                    Err(e)
                } else {
                    error!("The uevent thread exited; shutting down...");
                    Ok(())
                }
            }
            res = join_processor => {
                if let Ok(Err(e)) = res {
                    error!("The event processor exited with an error: {}; shutting down...", e);
                    Err(e)
                } else {
                    error!("The event processor exited; shutting down...");
                    Ok(())
                }
            }
            res = join_controller => {
                if let Ok(Err(e)) = res {
                    error!("The drive controller exited with an error: {}; shutting down...", e);
                    Err(e)
                } else {
                    error!("The drive controller exited; shutting down...");
                    Ok(())
                }
            }
            Ok(Err(e)) = join_reflector => {
                error!("The drive reflector exited with an error: {}; shutting down...", e);
                Err(e)
            }
            Ok(Err(e)) = join_timer => {
                error!("The sync timer exited with an error: {}; shutting down...", e);
                Err(e)
            }
            _ = join_signal => {
                info!("Caught SIGINT; exiting...");
                Ok(())
            }
        };
        should_exit.store(true, Ordering::Relaxed);
        queue.close();
        result
    })?;
    runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(())
}
