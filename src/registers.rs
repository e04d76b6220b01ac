//! Decoding of the CSD, CID and SCR registers.
//!
//! All registers are sent MSB first, so the raw bytes are read as big endian integers and the bit
//! positions below are the ones from the SD physical layer specification.

use bitfield::bitfield;
use bitflags::bitflags;

/// Every card reports its size in 512 byte blocks after [`Csd::decode`], whatever its native block length is
pub const BLOCK_SIZE: u32 = 512;
const BLOCK_SIZE_LOG2: u8 = 9;

/// Transfer rate units of `TRAN_SPEED`, in kbit/s
const TRANSFER_RATE_UNIT_KBIT: [u32; 4] = [100, 1_000, 10_000, 100_000];
/// Time values of `TRAN_SPEED`, multiplied by 1000
const TRANSFER_TIME_VALUE: [u32; 16] = [
    0, 1000, 1200, 1300, 1500, 2000, 2500, 3000, 3500, 4000, 4500, 5000, 5500, 6000, 7000, 8000,
];

bitfield! {
    /// CSD structure version 1.0 (standard capacity)
    pub struct CsdV1(u128);

    u8; pub get_csd_structure, set_csd_structure: 127, 126;
    u8; pub get_taac, set_taac: 119, 112;
    u8; pub get_nsac, set_nsac: 111, 104;
    u8; pub get_tran_speed, set_tran_speed: 103, 96;
    u16; pub get_ccc, set_ccc: 95, 84;
    u8; pub get_read_bl_len, set_read_bl_len: 83, 80;
    bool; pub get_read_bl_partial, set_read_bl_partial: 79;
    bool; pub get_write_blk_misalign, set_write_blk_misalign: 78;
    bool; pub get_read_blk_misalign, set_read_blk_misalign: 77;
    bool; pub get_dsr_imp, set_dsr_imp: 76;
    u16; pub get_c_size, set_c_size: 73, 62;
    u8; pub get_vdd_r_curr_min, set_vdd_r_curr_min: 61, 59;
    u8; pub get_vdd_r_curr_max, set_vdd_r_curr_max: 58, 56;
    u8; pub get_vdd_w_curr_min, set_vdd_w_curr_min: 55, 53;
    u8; pub get_vdd_w_curr_max, set_vdd_w_curr_max: 52, 50;
    u8; pub get_c_size_mult, set_c_size_mult: 49, 47;
    bool; pub get_erase_blk_en, set_erase_blk_en: 46;
    u8; pub get_sector_size, set_sector_size: 45, 39;
    u8; pub get_wp_grp_size, set_wp_grp_size: 38, 32;
    bool; pub get_wp_grp_enable, set_wp_grp_enable: 31;
    u8; pub get_r2w_factor, set_r2w_factor: 28, 26;
    u8; pub get_write_bl_len, set_write_bl_len: 25, 22;
    bool; pub get_write_bl_partial, set_write_bl_partial: 21;
    bool; pub get_file_format_grp, set_file_format_grp: 15;
    bool; pub get_copy, set_copy: 14;
    bool; pub get_perm_write_protect, set_perm_write_protect: 13;
    bool; pub get_tmp_write_protect, set_tmp_write_protect: 12;
    u8; pub get_file_format, set_file_format: 11, 10;
    u8; pub get_crc, set_crc: 7, 1;
}

bitfield! {
    /// CSD structure version 2.0 (SDHC and SDXC).
    /// Only the fields that moved compared to [`CsdV1`] are listed.
    pub struct CsdV2(u128);

    u8; pub get_csd_structure, set_csd_structure: 127, 126;
    u32; pub get_c_size, set_c_size: 69, 48;
}

impl CsdV2 {
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.get_c_size()) + 1) * 512 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CsdVersion {
    /// Standard capacity, byte addressed
    V1,
    /// High or extended capacity, block addressed
    V2,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CsdFlags: u16 {
        const READ_BLOCK_PARTIAL = 1 << 0;
        const WRITE_BLOCK_MISALIGN = 1 << 1;
        const READ_BLOCK_MISALIGN = 1 << 2;
        const DSR_IMPLEMENTED = 1 << 3;
        const ERASE_BLOCK_ENABLED = 1 << 4;
        const WRITE_PROTECT_GROUP_ENABLED = 1 << 5;
        const WRITE_BLOCK_PARTIAL = 1 << 6;
        const FILE_FORMAT_GROUP = 1 << 7;
        const COPY = 1 << 8;
        const PERMANENT_WRITE_PROTECT = 1 << 9;
        const TEMPORARY_WRITE_PROTECT = 1 << 10;
    }
}

/// Largest `C_SIZE` of a version 2.0 CSD, for a 2 TB card
const MAX_V2_DEVICE_SIZE: u32 = 0x3F_FEFF;

/// Why a CSD could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InvalidCsd {
    /// The structure field holds a value that no SD card uses
    UnknownStructure(u8),
    /// `C_SIZE` of a version 2.0 CSD is past the largest card size
    DeviceSizeOutOfRange(u32),
}

/// Card Specific Data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd {
    pub version: CsdVersion,
    /// Data read access time 1
    pub taac: u8,
    /// Data read access time 2, in units of 100 clock cycles
    pub nsac: u8,
    pub transfer_speed: u8,
    pub card_command_classes: u16,
    /// log2 of the native read block length
    pub read_block_length: u8,
    pub flags: CsdFlags,
    /// `C_SIZE`
    pub device_size: u32,
    /// `C_SIZE_MULT`, always 0 for [`CsdVersion::V2`]
    pub device_size_multiplier: u8,
    pub read_current_vdd_min: u8,
    pub read_current_vdd_max: u8,
    pub write_current_vdd_min: u8,
    pub write_current_vdd_max: u8,
    /// `SECTOR_SIZE`, the size of an erasable sector in write blocks, minus one
    pub erase_sector_size: u8,
    pub write_protect_group_size: u8,
    pub write_speed_factor: u8,
    /// log2 of the native write block length
    pub write_block_length: u8,
    pub file_format: u8,
    /// Normalized to [`BLOCK_SIZE`]
    pub block_count: u32,
}

impl Csd {
    /// Decodes an SD card CSD, picking the layout from the structure field
    pub fn decode(raw: &[u8; 16]) -> Result<Self, InvalidCsd> {
        match CsdV1(u128::from_be_bytes(*raw)).get_csd_structure() {
            0 => Ok(Self::decode_v1(raw)),
            1 => Self::decode_v2(raw),
            structure => Err(InvalidCsd::UnknownStructure(structure)),
        }
    }

    /// MMC cards use structure values 2 and 3, but keep the capacity fields where SD version 1.0 has them
    pub fn decode_mmc(raw: &[u8; 16]) -> Self {
        Self::decode_v1(raw)
    }

    fn decode_common(csd: &CsdV1, version: CsdVersion) -> Self {
        let mut flags = CsdFlags::empty();
        flags.set(CsdFlags::READ_BLOCK_PARTIAL, csd.get_read_bl_partial());
        flags.set(CsdFlags::WRITE_BLOCK_MISALIGN, csd.get_write_blk_misalign());
        flags.set(CsdFlags::READ_BLOCK_MISALIGN, csd.get_read_blk_misalign());
        flags.set(CsdFlags::DSR_IMPLEMENTED, csd.get_dsr_imp());
        flags.set(CsdFlags::ERASE_BLOCK_ENABLED, csd.get_erase_blk_en());
        flags.set(CsdFlags::WRITE_PROTECT_GROUP_ENABLED, csd.get_wp_grp_enable());
        flags.set(CsdFlags::WRITE_BLOCK_PARTIAL, csd.get_write_bl_partial());
        flags.set(CsdFlags::FILE_FORMAT_GROUP, csd.get_file_format_grp());
        flags.set(CsdFlags::COPY, csd.get_copy());
        flags.set(CsdFlags::PERMANENT_WRITE_PROTECT, csd.get_perm_write_protect());
        flags.set(CsdFlags::TEMPORARY_WRITE_PROTECT, csd.get_tmp_write_protect());

        Self {
            version,
            taac: csd.get_taac(),
            nsac: csd.get_nsac(),
            transfer_speed: csd.get_tran_speed(),
            card_command_classes: csd.get_ccc(),
            read_block_length: csd.get_read_bl_len(),
            flags,
            device_size: 0,
            device_size_multiplier: 0,
            read_current_vdd_min: 0,
            read_current_vdd_max: 0,
            write_current_vdd_min: 0,
            write_current_vdd_max: 0,
            erase_sector_size: csd.get_sector_size(),
            write_protect_group_size: csd.get_wp_grp_size(),
            write_speed_factor: csd.get_r2w_factor(),
            write_block_length: csd.get_write_bl_len(),
            file_format: csd.get_file_format(),
            block_count: 0,
        }
    }

    fn decode_v1(raw: &[u8; 16]) -> Self {
        let csd = CsdV1(u128::from_be_bytes(*raw));
        let mut decoded = Self::decode_common(&csd, CsdVersion::V1);
        decoded.device_size = csd.get_c_size().into();
        decoded.device_size_multiplier = csd.get_c_size_mult();
        decoded.read_current_vdd_min = csd.get_vdd_r_curr_min();
        decoded.read_current_vdd_max = csd.get_vdd_r_curr_max();
        decoded.write_current_vdd_min = csd.get_vdd_w_curr_min();
        decoded.write_current_vdd_max = csd.get_vdd_w_curr_max();

        // Count in native blocks, then rescale to 512 byte blocks
        let native_blocks =
            u64::from(decoded.device_size + 1) << (decoded.device_size_multiplier + 2);
        let bytes = native_blocks << decoded.read_block_length;
        decoded.block_count = (bytes >> BLOCK_SIZE_LOG2) as u32;
        decoded
    }

    fn decode_v2(raw: &[u8; 16]) -> Result<Self, InvalidCsd> {
        let bits = u128::from_be_bytes(*raw);
        let device_size = CsdV2(bits).get_c_size();
        if device_size > MAX_V2_DEVICE_SIZE {
            return Err(InvalidCsd::DeviceSizeOutOfRange(device_size));
        }
        let mut decoded = Self::decode_common(&CsdV1(bits), CsdVersion::V2);
        decoded.device_size = device_size;
        // Units of 512 KiB
        decoded.block_count = (device_size + 1) * 1024;
        Ok(decoded)
    }

    /// Either the permanent or the temporary write protection is set
    pub fn is_write_protected(&self) -> bool {
        self.flags.intersects(
            CsdFlags::PERMANENT_WRITE_PROTECT | CsdFlags::TEMPORARY_WRITE_PROTECT,
        )
    }

    /// SDXC cards are the ones with more than 32 GB, which only fit in a version 2.0 CSD
    pub fn is_extended_capacity(&self) -> bool {
        self.version == CsdVersion::V2 && self.device_size >= 0xFFFF
    }

    pub fn card_capacity_bytes(&self) -> u64 {
        u64::from(self.block_count) * u64::from(BLOCK_SIZE)
    }

    /// Size of the erase unit in 512 byte blocks
    pub fn erase_sector_blocks(&self) -> u32 {
        let write_blocks = u32::from(self.erase_sector_size) + 1;
        if self.write_block_length >= BLOCK_SIZE_LOG2 {
            write_blocks << (self.write_block_length - BLOCK_SIZE_LOG2)
        } else {
            write_blocks
        }
    }

    /// The fastest clock the card supports in default speed mode, from `TRAN_SPEED`.
    /// `None` if the field uses a reserved encoding.
    pub fn max_transfer_rate_hz(&self) -> Option<u32> {
        let unit = TRANSFER_RATE_UNIT_KBIT.get(usize::from(self.transfer_speed & 0x07))?;
        let value = TRANSFER_TIME_VALUE[usize::from((self.transfer_speed >> 3) & 0x0F)];
        match value {
            0 => None,
            value => Some(unit * value),
        }
    }
}

bitfield! {
    pub struct CidBits(u128);

    u8; pub get_mid, set_mid: 127, 120;
    u16; pub get_oid, set_oid: 119, 104;
    u64; pub get_pnm, set_pnm: 103, 64;
    u8; pub get_prv, set_prv: 63, 56;
    u32; pub get_psn, set_psn: 55, 24;
    u16; pub get_mdt, set_mdt: 19, 8;
    u8; pub get_crc, set_crc: 7, 1;
}

/// Card Identification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    /// Two ASCII characters
    pub oem_id: u16,
    pub product_name: [u8; 5],
    /// BCD major.minor
    pub product_revision: u8,
    pub serial_number: u32,
    /// Year offset from 2000 in bits 11:4, month in bits 3:0
    pub manufacturing_date: u16,
}

impl Cid {
    pub fn decode(raw: &[u8; 16]) -> Self {
        let cid = CidBits(u128::from_be_bytes(*raw));
        let mut product_name = [0; 5];
        product_name.copy_from_slice(&raw[3..8]);
        Self {
            manufacturer_id: cid.get_mid(),
            oem_id: cid.get_oid(),
            product_name,
            product_revision: cid.get_prv(),
            serial_number: cid.get_psn(),
            manufacturing_date: cid.get_mdt(),
        }
    }

    pub fn product_name(&self) -> Option<&str> {
        core::str::from_utf8(&self.product_name).ok()
    }

    pub fn manufacturing_year(&self) -> u16 {
        2000 + (self.manufacturing_date >> 4)
    }

    /// 1 to 12
    pub fn manufacturing_month(&self) -> u8 {
        (self.manufacturing_date & 0x0F) as u8
    }

    /// First day of the manufacturing month
    #[cfg(feature = "chrono")]
    pub fn manufacturing_date(&self) -> Option<chrono::NaiveDate> {
        use num_traits::FromPrimitive;

        let month = chrono::Month::from_u8(self.manufacturing_month())?;
        chrono::NaiveDate::from_ymd_opt(
            self.manufacturing_year().into(),
            month.number_from_month(),
            1,
        )
    }
}

bitfield! {
    pub struct ScrBits(u64);

    u8; pub get_scr_structure, set_scr_structure: 63, 60;
    u8; pub get_sd_spec, set_sd_spec: 59, 56;
    bool; pub get_data_stat_after_erase, set_data_stat_after_erase: 55;
    u8; pub get_sd_security, set_sd_security: 54, 52;
    u8; pub get_sd_bus_widths, set_sd_bus_widths: 51, 48;
    bool; pub get_sd_spec3, set_sd_spec3: 47;
    u8; pub get_ex_security, set_ex_security: 46, 43;
    u8; pub get_cmd_support, set_cmd_support: 33, 32;
    u32; pub get_reserved, set_reserved: 31, 0;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScrFlags: u8 {
        const DATA_STATUS_AFTER_ERASE = 1 << 0;
        const SD_SPECIFICATION_3 = 1 << 1;
    }
}

/// SD Configuration Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scr {
    pub structure: u8,
    pub sd_specification: u8,
    pub flags: ScrFlags,
    pub security: u8,
    /// Bit 0: 1 bit bus, bit 2: 4 bit bus
    pub bus_widths: u8,
    pub extended_security: u8,
    /// Bit 1: CMD23, bit 0: CMD20
    pub command_support: u8,
    pub reserved_for_manufacturer: u32,
}

impl Scr {
    pub fn decode(raw: &[u8; 8]) -> Self {
        let scr = ScrBits(u64::from_be_bytes(*raw));
        let mut flags = ScrFlags::empty();
        flags.set(ScrFlags::DATA_STATUS_AFTER_ERASE, scr.get_data_stat_after_erase());
        flags.set(ScrFlags::SD_SPECIFICATION_3, scr.get_sd_spec3());
        Self {
            structure: scr.get_scr_structure(),
            sd_specification: scr.get_sd_spec(),
            flags,
            security: scr.get_sd_security(),
            bus_widths: scr.get_sd_bus_widths(),
            extended_security: scr.get_ex_security(),
            command_support: scr.get_cmd_support(),
            reserved_for_manufacturer: scr.get_reserved(),
        }
    }

    pub fn supports_4_bit_bus(&self) -> bool {
        self.bus_widths & 0b0100 != 0
    }

    pub fn supports_set_block_count(&self) -> bool {
        self.command_support & 0b10 != 0
    }
}
