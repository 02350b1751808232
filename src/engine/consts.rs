// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

pub const GROUP: &str = "direct.csi.min.io";
pub const VERSION: &str = "v1beta3";

pub const APP_ROOT_DIR: &str = "/var/lib/direct-csi";
pub const MOUNT_ROOT: &str = "/var/lib/direct-csi/mnt";
pub const DEVICE_PIN_ROOT: &str = "/var/lib/direct-csi/devices";
/// Drive and volume records kept by the file backed store.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/direct-csi/drives.json";

// Mounts made by older releases live under this root. They are honoured
// when reading or unmounting, but never created.
pub const LEGACY_APP_ROOT_DIR: &str = "/var/lib/direct-csi/legacy";

pub const HOST_DEV_ROOT: &str = "/dev";
pub const SYS_ROOT: &str = "/sys";
pub const PROC_ROOT: &str = "/proc";
pub const UDEV_DATA_DIR: &str = "/run/udev/data";

pub const DATA_PROTECTION_FINALIZER: &str = "direct.csi.min.io/data-protection";
pub const VOLUME_FINALIZER_PREFIX: &str = "direct.csi.min.io.volume/";

pub const NODE_LABEL: &str = "direct.csi.min.io/node";
pub const PATH_LABEL: &str = "direct.csi.min.io/path";
pub const ACCESS_TIER_LABEL: &str = "direct.csi.min.io/access-tier";
pub const VERSION_LABEL: &str = "direct.csi.min.io/version";
pub const CREATED_BY_LABEL: &str = "direct.csi.min.io/created-by";
pub const DRIVE_PATH_LABEL: &str = "direct.csi.min.io/drive-path";
pub const CREATED_BY: &str = "directcsi-node";

pub const XFS: &str = "xfs";
pub const PROJECT_QUOTA_OPTION: &str = "prjquota";
pub const XFS_MAX_INODE_PERCENT: &str = "maxpct=50";

/// 16 MiB
pub const MIN_SUPPORTED_DEVICE_SIZE: u64 = 16 * 1024 * 1024;

/// Capacity values within this many bytes of each other compare equal.
pub const CAPACITY_TOLERANCE: u64 = 1024 * 1024;

pub const SECTOR_SIZE: u64 = 512;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Upper bound on the number of objects fetched per list request.
pub const MAX_LIST_OBJECTS: usize = 40;
