// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking external binaries.
// The node agent looks for each binary in a short, fixed list of
// directories. verify_binaries() is expected to be called once at start
// up, and the agent exits if it fails. A binary may still disappear while
// the agent runs, so each invocation checks for it again and returns an
// explicit error if it is gone.

use std::{
    collections::HashMap,
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, LazyLock,
    },
    thread,
    time::Duration,
};

use crate::{
    engine::consts::XFS_MAX_INODE_PERCENT,
    node::errors::{DirectCsiError, DirectCsiResult},
};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
/// PATH is not consulted; the agent may run with an empty environment.
fn find_binary(name: &str) -> Option<PathBuf> {
    BINARIES_PATHS
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

// These are the external binaries the node agent relies on.
// Any change in this list requires a corresponding change to BINARIES.
const MKFS_XFS: &str = "mkfs.xfs";
const XFS_ADMIN: &str = "xfs_admin";
const XFS_REPAIR: &str = "xfs_repair";

static BINARIES: LazyLock<HashMap<&'static str, Option<PathBuf>>> = LazyLock::new(|| {
    [MKFS_XFS, XFS_ADMIN, XFS_REPAIR]
        .iter()
        .map(|name| (*name, find_binary(name)))
        .collect()
});

/// Verify that all binaries the agent might invoke are available at some
/// path. Return an error naming the missing ones otherwise.
pub fn verify_binaries() -> DirectCsiResult<()> {
    let mut missing = BINARIES
        .iter()
        .filter(|(_, path)| path.is_none())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort_unstable();
        Err(DirectCsiError::Msg(format!(
            "executables {} could not be found in any of {}",
            missing.join(", "),
            BINARIES_PATHS.join(", ")
        )))
    }
}

/// Get an absolute path for the executable with the given name.
fn get_executable(name: &str) -> DirectCsiResult<&'static Path> {
    BINARIES
        .get(name)
        .and_then(|path| path.as_deref())
        .filter(|path| path.exists())
        .ok_or_else(|| DirectCsiError::Msg(format!("executable {name} not found")))
}

/// Invoke the specified command. Return the captured stdout, or an error
/// carrying both output streams if the command fails.
fn execute_cmd(cmd: &mut Command) -> DirectCsiResult<String> {
    match cmd.output() {
        Err(err) => Err(DirectCsiError::CommandExecutionFailure {
            cmd: format!("{cmd:?}"),
            err,
        }),
        Ok(result) => {
            let stdout = String::from_utf8_lossy(&result.stdout).into_owned();
            if result.status.success() {
                Ok(stdout)
            } else {
                Err(DirectCsiError::CommandFailure {
                    cmd: format!("{cmd:?}"),
                    stdout,
                    stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                })
            }
        }
    }
}

fn mkfs_args(device: &Path, force: bool) -> Vec<OsString> {
    let mut args = Vec::new();
    if force {
        args.push(OsString::from("-f"));
    }
    args.push(OsString::from("-i"));
    args.push(OsString::from(XFS_MAX_INODE_PERCENT));
    args.push(device.as_os_str().to_owned());
    args
}

fn xfs_admin_args(device: &Path, uuid: &str) -> Vec<OsString> {
    vec![
        OsString::from("-U"),
        OsString::from(uuid),
        device.as_os_str().to_owned(),
    ]
}

fn xfs_repair_args(device: &Path, opts: RepairOptions) -> Vec<OsString> {
    let mut args = Vec::new();
    if opts.dry_run {
        args.push(OsString::from("-n"));
    }
    if opts.force {
        args.push(OsString::from("-f"));
    }
    if opts.disable_prefetch {
        args.push(OsString::from("-P"));
    }
    args.push(device.as_os_str().to_owned());
    args
}

/// Create an XFS filesystem on device. Returns the formatter's output.
pub fn format_xfs(device: &Path, force: bool) -> DirectCsiResult<String> {
    execute_cmd(Command::new(get_executable(MKFS_XFS)?).args(mkfs_args(device, force)))
        .map_err(|err| DirectCsiError::FormatFailed(err.to_string()))
}

/// Write uuid into the XFS superblock of device.
pub fn set_xfs_uuid(device: &Path, uuid: &str) -> DirectCsiResult<()> {
    execute_cmd(Command::new(get_executable(XFS_ADMIN)?).args(xfs_admin_args(device, uuid)))
        .map(|_| ())
        .map_err(|err| DirectCsiError::UuidSetFailed(err.to_string()))
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RepairOptions {
    pub force: bool,
    pub disable_prefetch: bool,
    pub dry_run: bool,
}

fn forward_lines<R>(reader: R, sender: mpsc::Sender<String>)
where
    R: Read,
{
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) => {
                if sender.send(line).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

/// Run xfs_repair on device, passing every line it prints on stdout or
/// stderr to sink as soon as it is complete.
///
/// If cancel becomes true the child is killed and an error is returned.
pub fn xfs_repair(
    device: &Path,
    opts: RepairOptions,
    sink: &mut dyn FnMut(&str),
    cancel: &AtomicBool,
) -> DirectCsiResult<()> {
    let mut cmd = Command::new(get_executable(XFS_REPAIR)?);
    cmd.args(xfs_repair_args(device, opts))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let cmd_str = format!("{cmd:?}");
    let mut child = cmd
        .spawn()
        .map_err(|err| DirectCsiError::CommandExecutionFailure {
            cmd: cmd_str.clone(),
            err,
        })?;

    let (sender, receiver) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let sender = sender.clone();
        readers.push(thread::spawn(move || forward_lines(stdout, sender)));
    }
    if let Some(stderr) = child.stderr.take() {
        let sender = sender.clone();
        readers.push(thread::spawn(move || forward_lines(stderr, sender)));
    }
    drop(sender);

    loop {
        if cancel.load(Ordering::Relaxed) {
            if let Err(err) = child.kill() {
                warn!("Failed to kill {cmd_str}: {err}");
            }
            let _ = child.wait();
            return Err(DirectCsiError::RepairFailed(format!(
                "{cmd_str} was cancelled"
            )));
        }
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => sink(&line),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    for reader in readers {
        let _ = reader.join();
    }

    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(DirectCsiError::RepairFailed(format!(
            "{cmd_str} exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    /// The argument vectors are bound by the host tooling and must not
    /// change shape.
    fn test_argument_layout() {
        let dev = Path::new("/dev/sdb");
        assert_eq!(
            strings(mkfs_args(dev, true)),
            vec!["-f", "-i", "maxpct=50", "/dev/sdb"]
        );
        assert_eq!(
            strings(mkfs_args(dev, false)),
            vec!["-i", "maxpct=50", "/dev/sdb"]
        );
        assert_eq!(
            strings(xfs_admin_args(dev, "d9877501-e1b5-4bac-b73f-178b29974ed5")),
            vec!["-U", "d9877501-e1b5-4bac-b73f-178b29974ed5", "/dev/sdb"]
        );
        assert_eq!(
            strings(xfs_repair_args(
                dev,
                RepairOptions {
                    force: true,
                    disable_prefetch: true,
                    dry_run: true,
                }
            )),
            vec!["-n", "-f", "-P", "/dev/sdb"]
        );
        assert_eq!(
            strings(xfs_repair_args(dev, RepairOptions::default())),
            vec!["/dev/sdb"]
        );
    }

    #[test]
    fn test_forward_lines() {
        let (sender, receiver) = mpsc::channel();
        forward_lines("Phase 1\nPhase 2\n".as_bytes(), sender);
        assert_eq!(receiver.iter().collect::<Vec<_>>(), vec!["Phase 1", "Phase 2"]);
    }
}
