// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Block size and hardware serial number queries.

use std::{
    fs::File,
    os::{fd::AsRawFd, raw::c_void},
    ptr,
};

use libc::{c_int, c_uchar, c_uint, c_ushort};

use crate::node::errors::{DirectCsiError, DirectCsiResult};

ioctl_read!(blkbszget, 0x12, 112, libc::size_t);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);

const SG_IO: u32 = 0x2285;
const SG_DXFER_FROM_DEV: c_int = -3;
const SG_INFO_OK_MASK: c_uint = 0x1;
const SG_TIMEOUT_MS: c_uint = 2000;

/// sg_io_hdr_t from <scsi/sg.h>.
#[repr(C)]
pub struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: c_uchar,
    mx_sb_len: c_uchar,
    iovec_count: c_ushort,
    dxfer_len: c_uint,
    dxferp: *mut c_void,
    cmdp: *mut c_uchar,
    sbp: *mut c_uchar,
    timeout: c_uint,
    flags: c_uint,
    pack_id: c_int,
    usr_ptr: *mut c_void,
    status: c_uchar,
    masked_status: c_uchar,
    msg_status: c_uchar,
    sb_len_wr: c_uchar,
    host_status: c_ushort,
    driver_status: c_ushort,
    resid: c_int,
    duration: c_uint,
    info: c_uint,
}

ioctl_readwrite_bad!(sg_io, SG_IO, SgIoHdr);

/// struct nvme_passthru_cmd from <linux/nvme_ioctl.h>.
#[repr(C)]
#[derive(Default)]
pub struct NvmePassthruCmd {
    opcode: u8,
    flags: u8,
    rsvd1: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    metadata: u64,
    addr: u64,
    metadata_len: u32,
    data_len: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
    timeout_ms: u32,
    result: u32,
}

ioctl_readwrite!(nvme_admin_cmd, b'N', 0x41, NvmePassthruCmd);

const NVME_ADMIN_IDENTIFY: u8 = 0x06;
const NVME_IDENTIFY_CNS_CONTROLLER: u32 = 0x01;
const NVME_IDENTIFY_DATA_LEN: u32 = 4096;

/// (logical, physical) block sizes of the open device.
pub fn block_sizes(file: &File) -> DirectCsiResult<(u64, u64)> {
    let mut logical: c_int = 0;
    let mut physical: libc::size_t = 0;
    // SAFETY: both calls write a single integer through a valid pointer.
    unsafe {
        blksszget(file.as_raw_fd(), &mut logical)?;
        blkbszget(file.as_raw_fd(), &mut physical)?;
    }
    Ok((
        u64::try_from(logical).map_err(|_| DirectCsiError::Msg("negative block size".into()))?,
        u64::try_from(physical).map_err(|_| DirectCsiError::Msg("block size overflow".into()))?,
    ))
}

fn trim_serial(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_owned()
}

/// Parse the unit serial number VPD page (0x80).
pub fn parse_unit_serial_page(page: &[u8]) -> Option<String> {
    if page.len() < 4 || page[1] != 0x80 {
        return None;
    }
    let len = usize::from(page[3]);
    let end = (4 + len).min(page.len());
    Some(trim_serial(&page[4..end])).filter(|s| !s.is_empty())
}

/// Serial number from a SCSI INQUIRY for the unit serial number page.
pub fn scsi_serial(file: &File) -> DirectCsiResult<String> {
    let mut cdb: [u8; 6] = [0x12, 0x01, 0x80, 0x00, 0xff, 0x00];
    let mut response = [0u8; 255];
    let mut sense = [0u8; 32];

    let mut hdr = SgIoHdr {
        interface_id: c_int::from(b'S'),
        dxfer_direction: SG_DXFER_FROM_DEV,
        cmd_len: 6,
        mx_sb_len: 32,
        iovec_count: 0,
        dxfer_len: 255,
        dxferp: response.as_mut_ptr().cast(),
        cmdp: cdb.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: SG_TIMEOUT_MS,
        flags: 0,
        pack_id: 0,
        usr_ptr: ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };

    // SAFETY: every pointer in hdr refers to a live buffer of the declared
    // length for the duration of the call.
    unsafe {
        sg_io(file.as_raw_fd(), &mut hdr)?;
    }

    if hdr.info & SG_INFO_OK_MASK != 0 {
        return Err(DirectCsiError::Msg(format!(
            "SCSI status {:#04x}, host status {:#06x}, driver status {:#06x}",
            hdr.status, hdr.host_status, hdr.driver_status
        )));
    }

    parse_unit_serial_page(&response)
        .ok_or_else(|| DirectCsiError::Msg("empty unit serial number page".into()))
}

/// Serial number from an NVMe identify controller command.
pub fn nvme_serial(file: &File) -> DirectCsiResult<String> {
    let mut data = [0u8; NVME_IDENTIFY_DATA_LEN as usize];
    let mut cmd = NvmePassthruCmd {
        opcode: NVME_ADMIN_IDENTIFY,
        addr: data.as_mut_ptr() as u64,
        data_len: NVME_IDENTIFY_DATA_LEN,
        cdw10: NVME_IDENTIFY_CNS_CONTROLLER,
        ..Default::default()
    };

    // SAFETY: cmd.addr points at a buffer of cmd.data_len bytes that
    // outlives the call.
    unsafe {
        nvme_admin_cmd(file.as_raw_fd(), &mut cmd)?;
    }

    // Bytes 4..24 of the identify controller data hold the serial number.
    Some(trim_serial(&data[4..24]))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DirectCsiError::Msg("empty NVMe serial number".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout() {
        assert_eq!(std::mem::size_of::<NvmePassthruCmd>(), 72);
    }

    #[test]
    fn test_parse_unit_serial_page() {
        let mut page = vec![0x00, 0x80, 0x00, 0x0a];
        page.extend_from_slice(b"  QM00002 ");
        page.extend_from_slice(&[0; 8]);
        assert_eq!(parse_unit_serial_page(&page), Some("QM00002".to_owned()));
        assert_eq!(parse_unit_serial_page(&[0x00, 0x83, 0x00, 0x00]), None);
        assert_eq!(parse_unit_serial_page(&[0x00, 0x80, 0x00, 0x00]), None);
    }
}
