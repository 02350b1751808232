// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, num, path::PathBuf, str};

pub type DirectCsiResult<T> = Result<T, DirectCsiError>;

/// A stable, fieldless discriminant for every error the node agent can
/// produce. Callers decide between retry, drop and shutdown by kind.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum_macros::AsRefStr, strum_macros::Display)]
pub enum ErrorKind {
    DeviceNotFound,
    MalformedUdev,
    MountPointBusy,
    DeviceAlreadyMounted,
    UnknownMountFlag,
    InvalidMountFlags,
    FsNotFound,
    FormatFailed,
    UuidSetFailed,
    RepairFailed,
    StillMounted,
    Conflict,
    AlreadyExists,
    NotFound,
    Transient,
    Fatal,
    Other,
}

#[derive(Debug)]
pub enum DirectCsiError {
    Msg(String),
    Chained(String, Box<DirectCsiError>),

    DeviceNotFound(String),
    MalformedUdev(String),
    MountPointBusy {
        target: PathBuf,
        mounted_source: String,
    },
    DeviceAlreadyMounted {
        source: PathBuf,
        mountpoint: PathBuf,
    },
    UnknownMountFlag(String),
    InvalidMountFlags(String),
    FsNotFound,
    FormatFailed(String),
    UuidSetFailed(String),
    RepairFailed(String),
    StillMounted(usize),
    Conflict(String),
    AlreadyExists(String),
    NotFound(String),
    Transient(String),
    Fatal(String),

    CommandExecutionFailure {
        cmd: String,
        err: io::Error,
    },
    CommandFailure {
        cmd: String,
        stdout: String,
        stderr: String,
    },

    Io(io::Error),
    Nix(nix::Error),
    Uuid(uuid::Error),
    Serde(serde_json::Error),
    ParseInt(num::ParseIntError),
    Utf8(str::Utf8Error),
    Join(tokio::task::JoinError),
}

impl DirectCsiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DirectCsiError::Chained(_, err) => err.kind(),
            DirectCsiError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            DirectCsiError::MalformedUdev(_) => ErrorKind::MalformedUdev,
            DirectCsiError::MountPointBusy { .. } => ErrorKind::MountPointBusy,
            DirectCsiError::DeviceAlreadyMounted { .. } => ErrorKind::DeviceAlreadyMounted,
            DirectCsiError::UnknownMountFlag(_) => ErrorKind::UnknownMountFlag,
            DirectCsiError::InvalidMountFlags(_) => ErrorKind::InvalidMountFlags,
            DirectCsiError::FsNotFound => ErrorKind::FsNotFound,
            DirectCsiError::FormatFailed(_) => ErrorKind::FormatFailed,
            DirectCsiError::UuidSetFailed(_) => ErrorKind::UuidSetFailed,
            DirectCsiError::RepairFailed(_) => ErrorKind::RepairFailed,
            DirectCsiError::StillMounted(_) => ErrorKind::StillMounted,
            DirectCsiError::Conflict(_) => ErrorKind::Conflict,
            DirectCsiError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            DirectCsiError::NotFound(_) => ErrorKind::NotFound,
            DirectCsiError::Transient(_) => ErrorKind::Transient,
            DirectCsiError::Fatal(_) => ErrorKind::Fatal,
            DirectCsiError::Io(err) => match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => ErrorKind::Transient,
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                _ => ErrorKind::Other,
            },
            DirectCsiError::Nix(errno) => match errno {
                nix::Error::EINTR | nix::Error::EAGAIN => ErrorKind::Transient,
                nix::Error::ENOENT | nix::Error::ENXIO | nix::Error::ENODEV => {
                    ErrorKind::DeviceNotFound
                }
                _ => ErrorKind::Other,
            },
            _ => ErrorKind::Other,
        }
    }

    /// Errors for which re-queueing the triggering event may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DeviceNotFound
                | ErrorKind::MountPointBusy
                | ErrorKind::DeviceAlreadyMounted
                | ErrorKind::Conflict
                | ErrorKind::Transient
                | ErrorKind::NotFound
                | ErrorKind::Other
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Wrap this error with some context.
    pub fn chain(self, msg: impl Into<String>) -> DirectCsiError {
        DirectCsiError::Chained(msg.into(), Box::new(self))
    }
}

impl fmt::Display for DirectCsiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectCsiError::Msg(s) => write!(f, "{s}"),
            DirectCsiError::Chained(s, err) => write!(f, "{s}; {err}"),
            DirectCsiError::DeviceNotFound(s) => write!(f, "device not found: {s}"),
            DirectCsiError::MalformedUdev(s) => write!(f, "malformed udev data: {s}"),
            DirectCsiError::MountPointBusy {
                target,
                mounted_source,
            } => write!(
                f,
                "mount point {} is busy; already mounted from {}",
                target.display(),
                mounted_source
            ),
            DirectCsiError::DeviceAlreadyMounted { source, mountpoint } => write!(
                f,
                "device {} is already mounted at {}",
                source.display(),
                mountpoint.display()
            ),
            DirectCsiError::UnknownMountFlag(s) => write!(f, "unknown mount flag {s}"),
            DirectCsiError::InvalidMountFlags(s) => write!(f, "invalid mount flags: {s}"),
            DirectCsiError::FsNotFound => write!(f, "filesystem not found"),
            DirectCsiError::FormatFailed(s) => write!(f, "format failed: {s}"),
            DirectCsiError::UuidSetFailed(s) => write!(f, "setting filesystem UUID failed: {s}"),
            DirectCsiError::RepairFailed(s) => write!(f, "repair failed: {s}"),
            DirectCsiError::StillMounted(n) => {
                write!(f, "unable to run xfs repair; {n} volume mounts still mounted")
            }
            DirectCsiError::Conflict(s) => write!(f, "conflict: {s}"),
            DirectCsiError::AlreadyExists(s) => write!(f, "{s} already exists"),
            DirectCsiError::NotFound(s) => write!(f, "{s} not found"),
            DirectCsiError::Transient(s) => write!(f, "transient error: {s}"),
            DirectCsiError::Fatal(s) => write!(f, "fatal error: {s}"),
            DirectCsiError::CommandExecutionFailure { cmd, err } => {
                write!(f, "failed to execute command {cmd}: {err}")
            }
            DirectCsiError::CommandFailure {
                cmd,
                stdout,
                stderr,
            } => write!(
                f,
                "command {cmd} failed; stdout: {}, stderr: {}",
                stdout.trim(),
                stderr.trim()
            ),
            DirectCsiError::Io(err) => write!(f, "IO error: {err}"),
            DirectCsiError::Nix(err) => write!(f, "Nix error: {err}"),
            DirectCsiError::Uuid(err) => write!(f, "Uuid error: {err}"),
            DirectCsiError::Serde(err) => write!(f, "Serde error: {err}"),
            DirectCsiError::ParseInt(err) => write!(f, "Integer parse error: {err}"),
            DirectCsiError::Utf8(err) => write!(f, "Utf8 error: {err}"),
            DirectCsiError::Join(err) => write!(f, "Thread joining error: {err}"),
        }
    }
}

impl Error for DirectCsiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DirectCsiError::Chained(_, err) => Some(err),
            DirectCsiError::CommandExecutionFailure { err, .. } | DirectCsiError::Io(err) => {
                Some(err)
            }
            DirectCsiError::Nix(err) => Some(err),
            DirectCsiError::Uuid(err) => Some(err),
            DirectCsiError::Serde(err) => Some(err),
            DirectCsiError::ParseInt(err) => Some(err),
            DirectCsiError::Utf8(err) => Some(err),
            DirectCsiError::Join(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DirectCsiError {
    fn from(err: io::Error) -> DirectCsiError {
        DirectCsiError::Io(err)
    }
}

impl From<nix::Error> for DirectCsiError {
    fn from(err: nix::Error) -> DirectCsiError {
        DirectCsiError::Nix(err)
    }
}

impl From<uuid::Error> for DirectCsiError {
    fn from(err: uuid::Error) -> DirectCsiError {
        DirectCsiError::Uuid(err)
    }
}

impl From<serde_json::Error> for DirectCsiError {
    fn from(err: serde_json::Error) -> DirectCsiError {
        DirectCsiError::Serde(err)
    }
}

impl From<num::ParseIntError> for DirectCsiError {
    fn from(err: num::ParseIntError) -> DirectCsiError {
        DirectCsiError::ParseInt(err)
    }
}

impl From<str::Utf8Error> for DirectCsiError {
    fn from(err: str::Utf8Error) -> DirectCsiError {
        DirectCsiError::Utf8(err)
    }
}

impl From<tokio::task::JoinError> for DirectCsiError {
    fn from(err: tokio::task::JoinError) -> DirectCsiError {
        DirectCsiError::Join(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Verify that chained errors report the kind of their innermost cause.
    fn test_chained_kind() {
        let err = DirectCsiError::StillMounted(3).chain("repair of drive abc");
        assert_eq!(err.kind(), ErrorKind::StillMounted);
        assert!(err.to_string().contains("3 volume mounts"));
    }

    #[test]
    fn test_retryable_and_fatal() {
        assert!(DirectCsiError::Conflict("drive".into()).is_retryable());
        assert!(DirectCsiError::Nix(nix::Error::EINTR).is_retryable());
        assert!(!DirectCsiError::MalformedUdev("x".into()).is_retryable());
        assert!(DirectCsiError::Fatal("bind".into()).is_fatal());
        assert!(!DirectCsiError::Fatal("bind".into()).is_retryable());
    }
}
