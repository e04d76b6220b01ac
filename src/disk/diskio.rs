//! The lower layer API that FatFs expects, forwarding to a [`BlockDevice`].
//! Only drive 0 exists.

use bitflags::bitflags;

use super::BlockDevice;

bitflags! {
    /// `DSTATUS`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DiskStatus: u8 {
        const NOINIT = 0x01;
        const NODISK = 0x02;
        const PROTECT = 0x04;
    }
}

/// `DRESULT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DiskResult {
    Ok = 0,
    /// Hard error while reading or writing
    Error = 1,
    WriteProtected = 2,
    NotReady = 3,
    ParameterError = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoctlCommand {
    /// Flush pending writes. Writes are never cached, so there is nothing to do.
    Sync,
    GetSectorCount,
    GetSectorSize,
    /// Erase block size, in sectors
    GetBlockSize,
    Other(u8),
}

impl From<u8> for IoctlCommand {
    fn from(command: u8) -> Self {
        match command {
            0 => Self::Sync,
            1 => Self::GetSectorCount,
            2 => Self::GetSectorSize,
            3 => Self::GetBlockSize,
            command => Self::Other(command),
        }
    }
}

pub fn disk_status(device: &mut impl BlockDevice, drive: u8) -> DiskStatus {
    if drive != 0 {
        return DiskStatus::NOINIT | DiskStatus::NODISK;
    }
    let mut status = DiskStatus::empty();
    status.set(DiskStatus::NOINIT, !device.status());
    status.set(DiskStatus::PROTECT, device.is_write_protected());
    status
}

pub fn disk_initialize(device: &mut impl BlockDevice, drive: u8) -> DiskStatus {
    if drive != 0 {
        return DiskStatus::NOINIT | DiskStatus::NODISK;
    }
    let mut status = DiskStatus::empty();
    status.set(DiskStatus::NOINIT, !device.init());
    status.set(DiskStatus::PROTECT, device.is_write_protected());
    status
}

pub fn disk_read(
    device: &mut impl BlockDevice,
    drive: u8,
    buffer: &mut [u8],
    sector: u32,
    count: u32,
) -> DiskResult {
    if drive != 0 || count == 0 {
        return DiskResult::ParameterError;
    }
    if !device.status() {
        return DiskResult::NotReady;
    }
    if device.read_blocks(buffer, sector, count) {
        DiskResult::Ok
    } else {
        DiskResult::Error
    }
}

pub fn disk_write(
    device: &mut impl BlockDevice,
    drive: u8,
    buffer: &[u8],
    sector: u32,
    count: u32,
) -> DiskResult {
    if drive != 0 || count == 0 {
        return DiskResult::ParameterError;
    }
    if !device.status() {
        return DiskResult::NotReady;
    }
    if device.is_write_protected() {
        return DiskResult::WriteProtected;
    }
    if device.write_blocks(buffer, sector, count) {
        DiskResult::Ok
    } else {
        DiskResult::Error
    }
}

/// The queries answer through `buffer`, which must be present for them
pub fn disk_ioctl(
    device: &mut impl BlockDevice,
    drive: u8,
    command: IoctlCommand,
    buffer: Option<&mut u32>,
) -> DiskResult {
    if drive != 0 {
        return DiskResult::ParameterError;
    }
    let value = match command {
        IoctlCommand::Sync => return DiskResult::Ok,
        IoctlCommand::GetSectorCount => device.block_count(),
        IoctlCommand::GetSectorSize => device.block_size(),
        IoctlCommand::GetBlockSize => device.erase_sector_size(),
        IoctlCommand::Other(command) => {
            debug!("unknown ioctl command {}", command);
            return DiskResult::ParameterError;
        }
    };
    match buffer {
        Some(buffer) => {
            *buffer = value;
            DiskResult::Ok
        }
        None => DiskResult::ParameterError,
    }
}
