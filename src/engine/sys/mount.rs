// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mount, bind mount and unmount over a parsed view of the host's mount
//! table.

use std::{
    collections::HashMap,
    fs::{create_dir_all, read_to_string},
    path::{Path, PathBuf},
    str::FromStr,
};

use nix::{
    mount::{mount as nix_mount, umount2, MntFlags, MsFlags},
    sys::statvfs::statvfs,
};
use retry::{delay::Fixed, retry_with_index};

use crate::{
    engine::sys::blockfile::major_minor,
    node::errors::{DirectCsiError, DirectCsiResult},
};

/// One line of a mountinfo file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub major: u32,
    pub minor: u32,
    pub root: String,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub fs_type: String,
    pub source: String,
    pub super_options: Vec<String>,
}

// mountinfo escapes space, tab, newline and backslash as octal.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(value) = u8::try_from(value) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn split_options(field: &str) -> Vec<String> {
    field
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
        .collect()
}

impl FromStr for MountEntry {
    type Err = DirectCsiError;

    fn from_str(line: &str) -> DirectCsiResult<MountEntry> {
        let malformed = || DirectCsiError::Msg(format!("malformed mountinfo line: {line}"));
        let (head, tail) = line.split_once(" - ").ok_or_else(malformed)?;

        let head = head.split_whitespace().collect::<Vec<_>>();
        let tail = tail.split_whitespace().collect::<Vec<_>>();
        if head.len() < 6 || tail.len() < 2 {
            return Err(malformed());
        }

        let (major, minor) = head[2].split_once(':').ok_or_else(malformed)?;

        Ok(MountEntry {
            mount_id: head[0].parse()?,
            parent_id: head[1].parse()?,
            major: major.parse()?,
            minor: minor.parse()?,
            root: unescape(head[3]),
            mount_point: unescape(head[4]),
            mount_options: split_options(head[5]),
            fs_type: tail[0].to_owned(),
            source: unescape(tail[1]),
            super_options: tail.get(2).map(|s| split_options(s)).unwrap_or_default(),
        })
    }
}

/// A multi-keyed index over the mount table, built fresh for each query.
#[derive(Debug, Default)]
pub struct MountView {
    entries: Vec<MountEntry>,
    by_mount_point: HashMap<String, Vec<usize>>,
    by_source: HashMap<String, Vec<usize>>,
    by_major_minor: HashMap<(u32, u32), Vec<usize>>,
    by_root: HashMap<String, Vec<usize>>,
}

impl MountView {
    pub fn parse(content: &str) -> DirectCsiResult<MountView> {
        let mut view = MountView::default();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry = line.parse::<MountEntry>()?;
            let index = view.entries.len();
            view.by_mount_point
                .entry(entry.mount_point.clone())
                .or_default()
                .push(index);
            view.by_source
                .entry(entry.source.clone())
                .or_default()
                .push(index);
            view.by_major_minor
                .entry((entry.major, entry.minor))
                .or_default()
                .push(index);
            view.by_root.entry(entry.root.clone()).or_default().push(index);
            view.entries.push(entry);
        }
        Ok(view)
    }

    pub fn read(mountinfo: &Path) -> DirectCsiResult<MountView> {
        MountView::parse(&read_to_string(mountinfo)?)
    }

    fn lookup<'a>(&'a self, indices: Option<&'a Vec<usize>>) -> Vec<&'a MountEntry> {
        indices
            .map(|indices| indices.iter().map(|i| &self.entries[*i]).collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn by_mount_point(&self, mount_point: &str) -> Vec<&MountEntry> {
        self.lookup(self.by_mount_point.get(mount_point))
    }

    pub fn by_source(&self, source: &str) -> Vec<&MountEntry> {
        self.lookup(self.by_source.get(source))
    }

    pub fn by_major_minor(&self, major: u32, minor: u32) -> Vec<&MountEntry> {
        self.lookup(self.by_major_minor.get(&(major, minor)))
    }

    pub fn by_root(&self, root: &str) -> Vec<&MountEntry> {
        self.lookup(self.by_root.get(root))
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        target
            .to_str()
            .map(|t| self.by_mount_point.contains_key(t))
            .unwrap_or(false)
    }
}

/// The mount flag vocabulary accepted from callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MountFlag {
    Remount,
    Bind,
    Shared,
    Private,
    Slave,
    Unbindable,
    Move,
    Dirsync,
    Mand,
    Noatime,
    Nodev,
    Nodiratime,
    Noexec,
    Nosuid,
    Ro,
    Relatime,
    Recursive,
    Silent,
    Strictatime,
    Sync,
}

impl MountFlag {
    fn ms_flag(self) -> MsFlags {
        match self {
            MountFlag::Remount => MsFlags::MS_REMOUNT,
            MountFlag::Bind => MsFlags::MS_BIND,
            MountFlag::Shared => MsFlags::MS_SHARED,
            MountFlag::Private => MsFlags::MS_PRIVATE,
            MountFlag::Slave => MsFlags::MS_SLAVE,
            MountFlag::Unbindable => MsFlags::MS_UNBINDABLE,
            MountFlag::Move => MsFlags::MS_MOVE,
            MountFlag::Dirsync => MsFlags::MS_DIRSYNC,
            MountFlag::Mand => MsFlags::MS_MANDLOCK,
            MountFlag::Noatime => MsFlags::MS_NOATIME,
            MountFlag::Nodev => MsFlags::MS_NODEV,
            MountFlag::Nodiratime => MsFlags::MS_NODIRATIME,
            MountFlag::Noexec => MsFlags::MS_NOEXEC,
            MountFlag::Nosuid => MsFlags::MS_NOSUID,
            MountFlag::Ro => MsFlags::MS_RDONLY,
            MountFlag::Relatime => MsFlags::MS_RELATIME,
            MountFlag::Recursive => MsFlags::MS_REC,
            MountFlag::Silent => MsFlags::MS_SILENT,
            MountFlag::Strictatime => MsFlags::MS_STRICTATIME,
            MountFlag::Sync => MsFlags::MS_SYNCHRONOUS,
        }
    }

    fn is_propagation(self) -> bool {
        matches!(
            self,
            MountFlag::Shared | MountFlag::Private | MountFlag::Slave | MountFlag::Unbindable
        )
    }
}

fn verify_flags(flags: &[MountFlag]) -> DirectCsiResult<()> {
    let invalid = |what: &str| {
        DirectCsiError::InvalidMountFlags(format!(
            "{what}: {}",
            flags.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",")
        ))
    };

    if flags.contains(&MountFlag::Remount)
        && !flags.iter().all(|f| {
            matches!(
                f,
                MountFlag::Remount
                    | MountFlag::Mand
                    | MountFlag::Nodev
                    | MountFlag::Nodiratime
                    | MountFlag::Noatime
                    | MountFlag::Noexec
                    | MountFlag::Nosuid
                    | MountFlag::Relatime
                    | MountFlag::Ro
                    | MountFlag::Strictatime
            )
        })
    {
        return Err(invalid("unsupported flag for remount"));
    }

    if flags.contains(&MountFlag::Bind)
        && !flags
            .iter()
            .all(|f| matches!(f, MountFlag::Bind | MountFlag::Recursive | MountFlag::Ro))
    {
        return Err(invalid("unsupported flag for bind mount"));
    }

    if flags.iter().any(|f| f.is_propagation()) {
        if flags.len() > 2 {
            return Err(invalid("redundant or multiple mount propagation flags"));
        }
        if !flags
            .iter()
            .all(|f| f.is_propagation() || *f == MountFlag::Recursive)
        {
            return Err(invalid("unsupported flag for mount propagation"));
        }
    }

    Ok(())
}

/// Map flag tokens onto kernel mount flags. Unknown tokens and
/// incompatible combinations are rejected.
pub fn parse_mount_flags<S>(tokens: &[S]) -> DirectCsiResult<MsFlags>
where
    S: AsRef<str>,
{
    let flags = tokens
        .iter()
        .map(|t| {
            t.as_ref()
                .parse::<MountFlag>()
                .map_err(|_| DirectCsiError::UnknownMountFlag(t.as_ref().to_owned()))
        })
        .collect::<DirectCsiResult<Vec<_>>>()?;
    verify_flags(&flags)?;
    Ok(flags
        .iter()
        .fold(MsFlags::empty(), |acc, f| acc | f.ms_flag()))
}

/// Decide whether mounting source on target is needed.
///
/// Returns false if source is already mounted on target. source_devno is
/// the device number of source when it is a block device; it catches the
/// same device mounted through a different node.
pub fn check_mount(
    view: &MountView,
    source: &Path,
    source_devno: Option<(u32, u32)>,
    target: &Path,
) -> DirectCsiResult<bool> {
    let source_str = source.to_string_lossy();
    let target_str = target.to_string_lossy();

    let same_source = |entry: &MountEntry| {
        entry.source == source_str
            || source_devno
                .map(|(major, minor)| entry.major == major && entry.minor == minor)
                .unwrap_or(false)
    };

    if let Some(entry) = view.by_mount_point(&target_str).last().copied() {
        if same_source(entry) {
            return Ok(false);
        }
        return Err(DirectCsiError::MountPointBusy {
            target: target.to_owned(),
            mounted_source: entry.source.clone(),
        });
    }

    let elsewhere = match source_devno {
        Some((major, minor)) => view.by_major_minor(major, minor),
        None => view.by_source(&source_str),
    };
    if let Some(entry) = elsewhere.first() {
        return Err(DirectCsiError::DeviceAlreadyMounted {
            source: source.to_owned(),
            mountpoint: PathBuf::from(&entry.mount_point),
        });
    }

    Ok(true)
}

/// Mount source on target unless it is already mounted there.
pub fn mount<S>(
    mountinfo: &Path,
    source: &Path,
    target: &Path,
    fstype: &str,
    flags: &[S],
    super_flags: &[S],
) -> DirectCsiResult<()>
where
    S: AsRef<str>,
{
    let ms_flags = parse_mount_flags(flags)?;
    let view = MountView::read(mountinfo)?;
    let devno = major_minor(source).ok();
    if !check_mount(&view, source, devno, target)? {
        debug!(
            "{} is already mounted at {}",
            source.display(),
            target.display()
        );
        return Ok(());
    }

    create_dir_all(target)?;
    let data = super_flags
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    debug!(
        "Mounting {} at {} with flags {:?} and options {}",
        source.display(),
        target.display(),
        ms_flags,
        data
    );
    nix_mount(
        Some(source),
        target,
        Some(fstype),
        ms_flags,
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )?;
    Ok(())
}

/// Decide whether bind mounting the directory source on target is needed.
///
/// The mount holding source determines the device and root a bind of it
/// shows in the mount table. Returns false if target already shows that
/// pair, and MountPointBusy if target holds anything else.
pub fn check_bind_mount(view: &MountView, source: &Path, target: &Path) -> DirectCsiResult<bool> {
    let target_str = target.to_string_lossy();
    let Some(held) = view.by_mount_point(&target_str).last().copied() else {
        return Ok(true);
    };

    let backing = view
        .entries()
        .iter()
        .filter_map(|entry| {
            source
                .strip_prefix(&entry.mount_point)
                .ok()
                .map(|rest| (entry, rest))
        })
        .max_by_key(|(entry, _)| entry.mount_point.len());
    let same = match backing {
        Some((entry, rest)) => {
            held.major == entry.major
                && held.minor == entry.minor
                && Path::new(&held.root) == Path::new(&entry.root).join(rest)
        }
        None => held.source == source.to_string_lossy(),
    };

    if same {
        Ok(false)
    } else {
        Err(DirectCsiError::MountPointBusy {
            target: target.to_owned(),
            mounted_source: held.source.clone(),
        })
    }
}

/// Bind mount source on target unless it is already bound there.
pub fn bind_mount(
    mountinfo: &Path,
    source: &Path,
    target: &Path,
    fstype: &str,
    recursive: bool,
    read_only: bool,
    super_flags: &[String],
) -> DirectCsiResult<()> {
    let view = MountView::read(mountinfo)?;
    if !check_bind_mount(&view, source, target)? {
        debug!(
            "{} is already bound at {}",
            source.display(),
            target.display()
        );
        return Ok(());
    }

    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    let data = super_flags.join(",");

    create_dir_all(target)?;
    nix_mount(
        Some(source),
        target,
        Some(fstype),
        flags,
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UnmountFlags {
    pub force: bool,
    pub detach: bool,
    pub expire: bool,
}

impl UnmountFlags {
    pub fn force_detach() -> UnmountFlags {
        UnmountFlags {
            force: true,
            detach: true,
            expire: false,
        }
    }

    fn mnt_flags(self) -> MntFlags {
        let mut flags = MntFlags::empty();
        if self.force {
            flags |= MntFlags::MNT_FORCE;
        }
        if self.detach {
            flags |= MntFlags::MNT_DETACH;
        }
        if self.expire {
            flags |= MntFlags::MNT_EXPIRE;
        }
        flags
    }
}

/// Unmount target. A target that is not mounted is left alone.
pub fn unmount(mountinfo: &Path, target: &Path, flags: UnmountFlags) -> DirectCsiResult<()> {
    let view = MountView::read(mountinfo)?;
    if !view.is_mounted(target) {
        debug!("{} is not mounted", target.display());
        return Ok(());
    }

    retry_with_index(Fixed::from_millis(100).take(2), |i| {
        trace!("Unmount attempt {} of {}", i, target.display());
        umount2(target, flags.mnt_flags())
    })
    .map_err(|e| DirectCsiError::from(e.error))
}

/// Total and free bytes of the filesystem mounted at path.
#[allow(clippy::useless_conversion)]
pub fn statfs(path: &Path) -> DirectCsiResult<(u64, u64)> {
    let stat = statvfs(path)?;
    let fragment = u64::from(stat.fragment_size());
    Ok((
        u64::from(stat.blocks()) * fragment,
        u64::from(stat.blocks_available()) * fragment,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
30 22 8:16 / /var/lib/direct-csi/mnt/d9877501-e1b5-4bac-b73f-178b29974ed5 rw,relatime shared:9 - xfs /var/lib/direct-csi/devices/d9877501-e1b5-4bac-b73f-178b29974ed5 rw,attr2,inode64,prjquota
31 22 8:16 /vol-1 /var/lib/kubelet/pods/abc/volumes/my\\040vol rw,relatime shared:9 - xfs /var/lib/direct-csi/devices/d9877501-e1b5-4bac-b73f-178b29974ed5 rw,prjquota
";

    #[test]
    /// Each index resolves to the expected entries.
    fn test_parse_view() {
        let view = MountView::parse(MOUNTINFO).unwrap();
        assert_eq!(view.entries().len(), 3);
        assert_eq!(view.by_major_minor(8, 16).len(), 2);
        assert_eq!(view.by_root("/vol-1").len(), 1);
        assert_eq!(
            view.by_mount_point("/var/lib/kubelet/pods/abc/volumes/my vol")
                .len(),
            1
        );
        let entry = view
            .by_mount_point("/var/lib/direct-csi/mnt/d9877501-e1b5-4bac-b73f-178b29974ed5")[0];
        assert_eq!(entry.fs_type, "xfs");
        assert!(entry.super_options.contains(&"prjquota".to_owned()));
        assert_eq!(entry.mount_options, vec!["rw", "relatime"]);
    }

    #[test]
    fn test_malformed_line() {
        assert!(MountView::parse("22 1 8:1 / /").is_err());
    }

    #[test]
    fn test_check_mount() {
        let view = MountView::parse(MOUNTINFO).unwrap();
        let pin = Path::new("/var/lib/direct-csi/devices/d9877501-e1b5-4bac-b73f-178b29974ed5");
        let target = Path::new("/var/lib/direct-csi/mnt/d9877501-e1b5-4bac-b73f-178b29974ed5");

        // Already in the desired state.
        assert_matches!(check_mount(&view, pin, Some((8, 16)), target), Ok(false));

        // Target held by someone else.
        assert_matches!(
            check_mount(&view, Path::new("/dev/sdc"), Some((8, 32)), target),
            Err(DirectCsiError::MountPointBusy { .. })
        );

        // Device mounted somewhere else.
        assert_matches!(
            check_mount(&view, pin, Some((8, 16)), Path::new("/mnt/other")),
            Err(DirectCsiError::DeviceAlreadyMounted { .. })
        );

        assert_matches!(
            check_mount(&view, Path::new("/dev/sdc"), Some((8, 32)), Path::new("/mnt/x")),
            Ok(true)
        );
    }

    #[test]
    /// 1. A target already showing the source's device and root needs
    ///    nothing.
    /// 2. A target holding anything else is busy.
    /// 3. A free target needs the bind.
    fn test_check_bind_mount() {
        let view = MountView::parse(MOUNTINFO).unwrap();
        let source =
            Path::new("/var/lib/direct-csi/mnt/d9877501-e1b5-4bac-b73f-178b29974ed5/vol-1");
        let target = Path::new("/var/lib/kubelet/pods/abc/volumes/my vol");

        assert_matches!(check_bind_mount(&view, source, target), Ok(false));

        let other =
            Path::new("/var/lib/direct-csi/mnt/d9877501-e1b5-4bac-b73f-178b29974ed5/vol-2");
        assert_matches!(
            check_bind_mount(&view, other, target),
            Err(DirectCsiError::MountPointBusy { .. })
        );
        assert_matches!(
            check_bind_mount(&view, Path::new("/home/data"), target),
            Err(DirectCsiError::MountPointBusy { .. })
        );

        assert_matches!(
            check_bind_mount(&view, source, Path::new("/var/lib/kubelet/pods/def")),
            Ok(true)
        );
    }

    #[test]
    fn test_flag_validation() {
        assert_eq!(
            parse_mount_flags(&["bind", "recursive"]).unwrap(),
            MsFlags::MS_BIND | MsFlags::MS_REC
        );
        assert_matches!(
            parse_mount_flags(&["noatime", "bogus"]),
            Err(DirectCsiError::UnknownMountFlag(ref f)) if f == "bogus"
        );
        assert_matches!(
            parse_mount_flags(&["remount", "bind"]),
            Err(DirectCsiError::InvalidMountFlags(_))
        );
        assert_matches!(
            parse_mount_flags(&["shared", "private", "recursive"]),
            Err(DirectCsiError::InvalidMountFlags(_))
        );
        assert!(parse_mount_flags::<&str>(&[]).unwrap().is_empty());
    }

    proptest! {
        #[test]
        /// Any combination of plain flags parses and sets exactly the
        /// corresponding kernel bits.
        fn plain_flags_parse(
            mask in 0u8..32,
        ) {
            let vocab = [
                ("noatime", MsFlags::MS_NOATIME),
                ("nodev", MsFlags::MS_NODEV),
                ("noexec", MsFlags::MS_NOEXEC),
                ("nosuid", MsFlags::MS_NOSUID),
                ("ro", MsFlags::MS_RDONLY),
            ];
            let mut tokens = Vec::new();
            let mut expected = MsFlags::empty();
            for (i, (token, flag)) in vocab.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    tokens.push(*token);
                    expected |= *flag;
                }
            }
            prop_assert_eq!(parse_mount_flags(&tokens[..]).unwrap(), expected);
        }
    }
}
