// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Recognize a filesystem from its on-disk superblock.

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    engine::consts::XFS,
    node::errors::{DirectCsiError, DirectCsiResult},
};

pub const EXT4: &str = "ext4";
pub const VFAT: &str = "vfat";
pub const SWAP: &str = "swap";

const XFS_MAGIC: u32 = 0x5846_5342;
const XFS_SB_LEN: usize = 152;

const EXT4_SB_OFFSET: u64 = 1024;
const EXT4_SB_LEN: usize = 1024;
const EXT4_MAGIC: u16 = 0xef53;
const EXT4_DYNAMIC_REV: u32 = 1;
const EXT4_INCOMPAT_64BIT: u32 = 0x80;

const FAT32_BOOT_LEN: usize = 512;
const FAT32_MAGIC: &[u8] = b"FAT32   ";
const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG: u32 = 0xaa55_0000;

const SWAP_SIGNATURES: [&[u8]; 2] = [b"SWAPSPACE2", b"SWAP-SPACE"];
const SWAP_HEADER_OFFSET: usize = 1024;

/// Identity and capacity of a recognized filesystem.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FsInfo {
    pub fs_type: String,
    pub uuid: String,
    pub total_capacity: u64,
    pub free_capacity: u64,
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)
}

fn uuid_string(bytes: &[u8]) -> DirectCsiResult<String> {
    Ok(Uuid::from_slice(bytes)?.hyphenated().to_string())
}

pub fn probe_xfs<R: Read + Seek>(reader: &mut R) -> DirectCsiResult<FsInfo> {
    let mut buf = [0u8; XFS_SB_LEN];
    read_at(reader, 0, &mut buf)?;

    if BigEndian::read_u32(&buf[0..4]) != XFS_MAGIC {
        return Err(DirectCsiError::FsNotFound);
    }

    let block_size = u64::from(BigEndian::read_u32(&buf[4..8]));
    let data_blocks = BigEndian::read_u64(&buf[8..16]);
    let free_blocks = BigEndian::read_u64(&buf[144..152]);

    Ok(FsInfo {
        fs_type: XFS.to_owned(),
        uuid: uuid_string(&buf[32..48])?,
        total_capacity: data_blocks.saturating_mul(block_size),
        free_capacity: free_blocks.saturating_mul(block_size),
    })
}

pub fn probe_ext4<R: Read + Seek>(reader: &mut R) -> DirectCsiResult<FsInfo> {
    let mut buf = [0u8; EXT4_SB_LEN];
    read_at(reader, EXT4_SB_OFFSET, &mut buf)?;

    if LittleEndian::read_u16(&buf[0x38..0x3a]) != EXT4_MAGIC {
        return Err(DirectCsiError::FsNotFound);
    }

    let log_block_size = LittleEndian::read_u32(&buf[0x18..0x1c]);
    let block_size = log_block_size
        .checked_add(10)
        .and_then(|shift| 1u64.checked_shl(shift))
        .ok_or_else(|| DirectCsiError::Msg(format!("bad ext4 block size log {log_block_size}")))?;

    let mut blocks = u64::from(LittleEndian::read_u32(&buf[0x04..0x08]));
    let mut free_blocks = u64::from(LittleEndian::read_u32(&buf[0x0c..0x10]));
    if LittleEndian::read_u32(&buf[0x60..0x64]) & EXT4_INCOMPAT_64BIT != 0 {
        blocks |= u64::from(LittleEndian::read_u32(&buf[0x150..0x154])) << 32;
        free_blocks |= u64::from(LittleEndian::read_u32(&buf[0x158..0x15c])) << 32;
    }

    // Revision 0 superblocks carry no UUID.
    let uuid = if LittleEndian::read_u32(&buf[0x4c..0x50]) == EXT4_DYNAMIC_REV {
        uuid_string(&buf[0x68..0x78])?
    } else {
        Uuid::nil().hyphenated().to_string()
    };

    Ok(FsInfo {
        fs_type: EXT4.to_owned(),
        uuid,
        total_capacity: blocks.saturating_mul(block_size),
        free_capacity: free_blocks.saturating_mul(block_size),
    })
}

/// The volume serial is only 32 bits; hash it into a stable UUID.
fn fat32_uuid(serial: &[u8]) -> DirectCsiResult<String> {
    let digest = Sha256::digest(serial);
    uuid_string(&digest[..16])
}

pub fn probe_fat32<R: Read + Seek>(reader: &mut R) -> DirectCsiResult<FsInfo> {
    let mut boot = [0u8; FAT32_BOOT_LEN];
    read_at(reader, 0, &mut boot)?;

    if &boot[0x52..0x5a] != FAT32_MAGIC {
        return Err(DirectCsiError::FsNotFound);
    }

    let sector_size = u64::from(LittleEndian::read_u16(&boot[11..13]));
    let cluster_sectors = u64::from(boot[13]);
    let total_sectors = u64::from(LittleEndian::read_u32(&boot[32..36]));
    let fsinfo_sector = u64::from(LittleEndian::read_u16(&boot[48..50]));

    let mut fsinfo = [0u8; 512];
    read_at(reader, fsinfo_sector * sector_size, &mut fsinfo)?;
    if LittleEndian::read_u32(&fsinfo[0..4]) != FSINFO_LEAD_SIG
        || LittleEndian::read_u32(&fsinfo[484..488]) != FSINFO_STRUCT_SIG
        || LittleEndian::read_u32(&fsinfo[508..512]) != FSINFO_TRAIL_SIG
    {
        debug!("FAT32 boot sector found but FSInfo signatures do not match");
        return Err(DirectCsiError::FsNotFound);
    }
    let free_clusters = u64::from(LittleEndian::read_u32(&fsinfo[488..492]));

    Ok(FsInfo {
        fs_type: VFAT.to_owned(),
        uuid: fat32_uuid(&boot[67..71])?,
        total_capacity: total_sectors * sector_size,
        free_capacity: free_clusters * cluster_sectors * sector_size,
    })
}

fn swap_page_sizes() -> impl Iterator<Item = u64> {
    [0x1000, 0x2000, 0x4000, 0x10000].into_iter()
}

pub fn probe_swap<R: Read + Seek>(reader: &mut R) -> DirectCsiResult<FsInfo> {
    for page_size in swap_page_sizes() {
        let mut signature = [0u8; 10];
        match read_at(reader, page_size - 10, &mut signature) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        if !SWAP_SIGNATURES.contains(&&signature[..]) {
            continue;
        }

        // Only version 2 headers carry a UUID and a size.
        let mut info = FsInfo {
            fs_type: SWAP.to_owned(),
            ..Default::default()
        };
        if &signature[..] == SWAP_SIGNATURES[0] {
            let mut header = [0u8; 28];
            read_at(reader, SWAP_HEADER_OFFSET as u64, &mut header)?;
            let last_page = u64::from(LittleEndian::read_u32(&header[4..8]));
            info.uuid = uuid_string(&header[12..28])?;
            info.total_capacity = (last_page + 1) * page_size;
        }
        return Ok(info);
    }
    Err(DirectCsiError::FsNotFound)
}

/// Try each known filesystem in turn.
///
/// Short reads mean the device is too small to hold that superblock and
/// count as "not found".
pub fn probe_fs<R: Read + Seek>(reader: &mut R) -> DirectCsiResult<FsInfo> {
    type Prober<R> = fn(&mut R) -> DirectCsiResult<FsInfo>;
    let probers: [(&str, Prober<R>); 4] = [
        (XFS, probe_xfs),
        (EXT4, probe_ext4),
        (VFAT, probe_fat32),
        (SWAP, probe_swap),
    ];

    for (name, prober) in probers {
        match prober(reader) {
            Ok(info) => return Ok(info),
            Err(DirectCsiError::FsNotFound) => {}
            Err(DirectCsiError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                trace!("Device too short for a {name} superblock");
            }
            Err(err) => return Err(err),
        }
    }
    Err(DirectCsiError::FsNotFound)
}
