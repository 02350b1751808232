// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Listen for udev's rebroadcast of kernel uevents.

use std::{
    collections::HashMap,
    os::fd::{AsRawFd, OwnedFd},
    sync::atomic::{AtomicBool, Ordering},
};

use byteorder::{BigEndian, ByteOrder, NativeEndian};
use nix::{
    errno::Errno,
    sys::{
        socket::{
            bind, recv, setsockopt, socket, sockopt::ReceiveTimeout, AddressFamily, MsgFlags,
            NetlinkAddr, SockFlag, SockProtocol, SockType,
        },
        time::{TimeVal, TimeValLike},
    },
    unistd::getpid,
};

use crate::{
    engine::types::{Action, DeviceEvent, UdevData},
    node::errors::{DirectCsiError, DirectCsiResult},
};

const LIBUDEV_PREFIX: &[u8] = b"libudev\0";
const LIBUDEV_MAGIC: u32 = 0xfeed_cafe;
const MIN_MSG_LEN: usize = 40;
const MIN_PAYLOAD_OFFSET: usize = 17;

/// Multicast group udevd rebroadcasts processed events on.
const UDEV_GROUP: u32 = 2;

const READ_STEP: usize = 4096;

/// Split a libudev netlink message into its properties.
pub fn parse_uevent_map(msg: &[u8]) -> DirectCsiResult<HashMap<String, String>> {
    if msg.len() < MIN_MSG_LEN {
        return Err(DirectCsiError::MalformedUdev(format!(
            "message of {} bytes is too short",
            msg.len()
        )));
    }
    if !msg.starts_with(LIBUDEV_PREFIX) {
        return Err(DirectCsiError::MalformedUdev(
            "libudev signature not found".into(),
        ));
    }

    // The magic is in network byte order; the rest of the header is not.
    let magic = BigEndian::read_u32(&msg[8..12]);
    if magic != LIBUDEV_MAGIC {
        return Err(DirectCsiError::MalformedUdev(format!(
            "libudev magic mismatch; expected {LIBUDEV_MAGIC:#x}, got {magic:#x}"
        )));
    }

    let offset = usize::try_from(NativeEndian::read_u32(&msg[16..20]))
        .map_err(|_| DirectCsiError::MalformedUdev("payload offset out of range".into()))?;
    if offset < MIN_PAYLOAD_OFFSET {
        return Err(DirectCsiError::MalformedUdev(format!(
            "payload offset {offset} is less than {MIN_PAYLOAD_OFFSET}"
        )));
    }
    if offset > msg.len() {
        return Err(DirectCsiError::MalformedUdev(format!(
            "payload offset {offset} is beyond message length {}",
            msg.len()
        )));
    }

    Ok(msg[offset..]
        .split(|b| *b == 0)
        .filter(|field| !field.is_empty())
        .map(|field| {
            let field = String::from_utf8_lossy(field);
            match field.split_once('=') {
                Some((key, value)) => (key.to_owned(), value.to_owned()),
                None => (field.into_owned(), String::new()),
            }
        })
        .collect())
}

/// Decode a message into a device event.
///
/// Returns None for events that do not concern block devices or whose
/// action is not one the agent reconciles.
pub fn parse_uevent(msg: &[u8]) -> DirectCsiResult<Option<DeviceEvent>> {
    let map = parse_uevent_map(msg)?;

    if map.get("SUBSYSTEM").map(|s| s.as_str()) != Some("block") {
        return Ok(None);
    }

    let action = match map.get("ACTION").map(|a| a.parse::<Action>()) {
        Some(Ok(action @ (Action::Add | Action::Change | Action::Remove))) => action,
        other => {
            trace!("Ignoring block uevent with action {other:?}");
            return Ok(None);
        }
    };

    let udev = UdevData::from_event_map(&map)?;
    Ok(Some(DeviceEvent::new(action, udev)))
}

/// A bound NETLINK_KOBJECT_UEVENT socket.
pub struct UeventListener {
    fd: OwnedFd,
}

impl UeventListener {
    /// Open and bind the socket. Any failure here is fatal to the agent.
    pub fn bind() -> DirectCsiResult<UeventListener> {
        let fatal = |what: &str, err: Errno| DirectCsiError::Fatal(format!("{what}: {err}"));

        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| fatal("unable to create uevent socket", e))?;

        let pid = u32::try_from(getpid().as_raw())
            .map_err(|_| DirectCsiError::Fatal("negative process id".into()))?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(pid, UDEV_GROUP))
            .map_err(|e| fatal("unable to bind uevent socket", e))?;

        // Wake up periodically so a shutdown request is noticed.
        setsockopt(&fd, ReceiveTimeout, &TimeVal::seconds(1))
            .map_err(|e| fatal("unable to set uevent socket timeout", e))?;

        Ok(UeventListener { fd })
    }

    /// Read one whole message, or None if the receive timed out.
    ///
    /// The message is peeked with a growing buffer first, since a
    /// truncated datagram cannot be read again.
    pub fn read_msg(&self) -> DirectCsiResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; READ_STEP];
        let len = loop {
            match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::MSG_PEEK) {
                Ok(n) if n < buf.len() => break n,
                Ok(_) => buf.resize(buf.len() + READ_STEP, 0),
                Err(Errno::EAGAIN | Errno::EINTR) => return Ok(None),
                Err(err) => return Err(DirectCsiError::Fatal(format!("uevent peek: {err}"))),
            }
        };

        buf.truncate(len);
        let n = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())
            .map_err(|err| DirectCsiError::Fatal(format!("uevent read: {err}")))?;
        if n != len {
            return Err(DirectCsiError::Transient(format!(
                "short uevent read; expected {len} bytes, got {n}"
            )));
        }
        Ok(Some(buf))
    }

    /// Block until the next block device event, or None once
    /// should_exit is set.
    pub fn next_event(&self, should_exit: &AtomicBool) -> DirectCsiResult<Option<DeviceEvent>> {
        while !should_exit.load(Ordering::Relaxed) {
            let Some(msg) = self.read_msg()? else {
                continue;
            };
            match parse_uevent(&msg) {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => {}
                Err(err) => warn!("Dropping uevent: {err}"),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: u32, fields: &[&str]) -> Vec<u8> {
        let mut msg = vec![0u8; 1024];
        msg[..8].copy_from_slice(LIBUDEV_PREFIX);
        BigEndian::write_u32(&mut msg[8..12], LIBUDEV_MAGIC);
        NativeEndian::write_u32(&mut msg[16..20], offset);
        let mut pos = offset as usize;
        for field in fields {
            msg[pos..pos + field.len()].copy_from_slice(field.as_bytes());
            pos += field.len() + 1;
        }
        msg
    }

    #[test]
    /// A change event for a disk decodes into a device event.
    fn test_parse_change_event() {
        let msg = message(
            40,
            &[
                "ACTION=change",
                "SUBSYSTEM=block",
                "DEVPATH=/devices/virtual/block/sdb",
                "DEVNAME=sdb",
                "MAJOR=8",
                "MINOR=16",
                "ID_FS_UUID=abc",
            ],
        );
        let event = parse_uevent(&msg).unwrap().unwrap();
        assert_eq!(event.action, Action::Change);
        assert_eq!(event.devpath, "/devices/virtual/block/sdb");
        assert_eq!(event.udev.uevent_fsuuid, "abc");
        assert_eq!(event.udev.path, "/dev/sdb");
        assert_eq!((event.udev.major, event.udev.minor), (8, 16));
    }

    #[test]
    fn test_uninteresting_events() {
        let net = message(40, &["ACTION=add", "SUBSYSTEM=net", "DEVPATH=/devices/x"]);
        assert!(parse_uevent(&net).unwrap().is_none());

        let bind = message(
            40,
            &["ACTION=bind", "SUBSYSTEM=block", "DEVPATH=/devices/x", "MAJOR=8", "MINOR=0"],
        );
        assert!(parse_uevent(&bind).unwrap().is_none());
    }

    #[test]
    /// Header violations are all malformed messages.
    fn test_malformed_headers() {
        assert_matches!(
            parse_uevent_map(&[0u8; 16]),
            Err(DirectCsiError::MalformedUdev(_))
        );

        let mut bad_magic = message(40, &[]);
        BigEndian::write_u32(&mut bad_magic[8..12], 0xdead_beef);
        assert_matches!(
            parse_uevent_map(&bad_magic),
            Err(DirectCsiError::MalformedUdev(_))
        );

        assert_matches!(
            parse_uevent_map(&message(16, &[])),
            Err(DirectCsiError::MalformedUdev(_))
        );

        let mut beyond = message(40, &[]);
        NativeEndian::write_u32(&mut beyond[16..20], 4096);
        assert_matches!(
            parse_uevent_map(&beyond),
            Err(DirectCsiError::MalformedUdev(_))
        );

        let mut kernel = message(40, &["ACTION=add"]);
        kernel[..8].copy_from_slice(b"add@/dev");
        assert_matches!(
            parse_uevent_map(&kernel),
            Err(DirectCsiError::MalformedUdev(_))
        );
    }

    #[test]
    /// A block event without a device number is rejected.
    fn test_missing_major() {
        let msg = message(
            40,
            &["ACTION=add", "SUBSYSTEM=block", "DEVPATH=/devices/x", "MINOR=0"],
        );
        assert_matches!(parse_uevent(&msg), Err(DirectCsiError::MalformedUdev(_)));
    }
}
