//! A simulated SD card that answers SPI mode commands byte by byte

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    convert::Infallible,
    rc::Rc,
};

use crc::{CRC_16_XMODEM, Crc};
use embedded_hal::{digital, spi};
use spi_sd_blockdev::{Clock, Config, FrequencyRejected, SdCard, SpiTransport};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub const CSD_V1: [u8; 16] = [
    0x00, 0x26, 0x00, 0x32, 0x5F, 0x59, 0x83, 0xC8, 0xAD, 0xDB, 0xCF, 0xFF, 0xD2, 0x40, 0x40, 0xA5,
];
pub const CSD_V1_BLOCKS: u32 = 1_984_000;
pub const CSD_V2: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x1D, 0x69, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x8B,
];
pub const CSD_V2_BLOCKS: u32 = 7_710_720;
pub const CSD_SDXC: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x01, 0xDC, 0x9F, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x01,
];
pub const CSD_SDXC_BLOCKS: u32 = (0x1DC9F + 1) * 1024;
/// Structure 2, the rest laid out like [`CSD_V1`]
pub const CSD_MMC: [u8; 16] = [
    0x90, 0x26, 0x00, 0x32, 0x5F, 0x59, 0x83, 0xC8, 0xAD, 0xDB, 0xCF, 0xFF, 0xD2, 0x40, 0x40, 0xA5,
];
pub const CID: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x38, 0x47, 0x80, 0x12, 0x34, 0x56, 0x78, 0x01, 0x5A, 0x01,
];
pub const SCR: [u8; 8] = [0x02, 0x35, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];

const OCR_VOLTAGES: u32 = 0x00FF_8000;
const OCR_POWER_UP: u32 = 1 << 31;
const OCR_CCS: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    SdV1,
    SdV2,
    Sdhc,
    Sdxc,
    Mmc,
}

impl Profile {
    fn knows_cmd8(self) -> bool {
        matches!(self, Self::SdV2 | Self::Sdhc | Self::Sdxc)
    }

    fn is_high_capacity(self) -> bool {
        matches!(self, Self::Sdhc | Self::Sdxc)
    }

    fn csd(self) -> [u8; 16] {
        match self {
            Self::SdV1 | Self::SdV2 => CSD_V1,
            Self::Sdhc => CSD_V2,
            Self::Sdxc => CSD_SDXC,
            Self::Mmc => CSD_MMC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub index: u8,
    pub argument: u32,
    /// Preceded by CMD55
    pub app: bool,
}

enum WriteState {
    Idle,
    WaitingForToken { block: u32, multi: bool },
    Receiving { block: u32, multi: bool, data: Vec<u8> },
}

/// The contents of blocks that were never written
pub fn pattern(block: u32) -> [u8; 512] {
    let mut data = [0; 512];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (block as u8).wrapping_mul(31) ^ (i as u8) ^ ((i >> 8) as u8);
    }
    data
}

pub struct FakeCard {
    pub profile: Profile,
    pub csd: [u8; 16],
    pub present: bool,
    pub idle_forever: bool,
    /// How many ACMD41 / CMD1 the card answers with idle before it is ready
    pub op_cond_polls: u32,
    pub echo_override: Option<u8>,
    /// Answer to every data block instead of the real data response token
    pub reject_writes: Option<u8>,
    /// Send this token instead of the start block token when this block is read
    pub fail_read_at: Option<(u32, u8)>,
    pub corrupt_read_crc: bool,
    /// Hold MISO low whenever there is nothing else to send
    pub busy: bool,
    /// R1 that CMD12 answers with
    pub stop_r1: u8,

    pub commands: Vec<Sent>,
    pub bytes_exchanged: usize,
    pub stop_tokens: usize,
    pub frequencies: Vec<u32>,
    pub storage: HashMap<u32, [u8; 512]>,

    selected: bool,
    spi_mode: bool,
    ready: bool,
    app_command: bool,
    polls: u32,
    output: VecDeque<u8>,
    frame: Vec<u8>,
    streaming: Option<u32>,
    write: WriteState,
}

impl FakeCard {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            csd: profile.csd(),
            present: true,
            idle_forever: false,
            op_cond_polls: 3,
            echo_override: None,
            reject_writes: None,
            fail_read_at: None,
            corrupt_read_crc: false,
            busy: false,
            stop_r1: 0x00,
            commands: Vec::new(),
            bytes_exchanged: 0,
            stop_tokens: 0,
            frequencies: Vec::new(),
            storage: HashMap::new(),
            selected: false,
            spi_mode: false,
            ready: false,
            app_command: false,
            polls: 0,
            output: VecDeque::new(),
            frame: Vec::new(),
            streaming: None,
            write: WriteState::Idle,
        }
    }

    pub fn indexes(&self) -> Vec<u8> {
        self.commands.iter().map(|sent| sent.index).collect()
    }

    pub fn block(&self, block: u32) -> [u8; 512] {
        self.storage
            .get(&block)
            .copied()
            .unwrap_or_else(|| pattern(block))
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        self.bytes_exchanged += 1;
        if !self.present || !self.selected {
            return 0xFF;
        }
        let idle = if self.busy { 0x00 } else { 0xFF };
        let miso = self.output.pop_front().unwrap_or(idle);
        self.receive(mosi);
        miso
    }

    fn receive(&mut self, mosi: u8) {
        match &mut self.write {
            WriteState::Receiving { data, .. } => {
                data.push(mosi);
                if data.len() == 512 + 2 {
                    self.finish_block();
                }
                return;
            }
            WriteState::WaitingForToken { block, multi } => {
                let (block, multi) = (*block, *multi);
                match mosi {
                    0xFE if !multi => {
                        self.write = WriteState::Receiving {
                            block,
                            multi,
                            data: Vec::new(),
                        }
                    }
                    0xFC if multi => {
                        self.write = WriteState::Receiving {
                            block,
                            multi,
                            data: Vec::new(),
                        }
                    }
                    0xFD if multi => {
                        self.stop_tokens += 1;
                        self.write = WriteState::Idle;
                        self.output.extend([0x00, 0x00]);
                    }
                    _ => {}
                }
                return;
            }
            WriteState::Idle => {}
        }

        if !self.frame.is_empty() || mosi & 0xC0 == 0x40 {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let frame: Vec<u8> = self.frame.drain(..).collect();
                let argument = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                self.command(frame[0] & 0x3F, argument);
            }
        } else if mosi == 0xFF && self.output.is_empty() {
            if let Some(block) = self.streaming {
                self.streaming = Some(block + 1);
                self.queue_block(block);
            }
        }
    }

    fn finish_block(&mut self) {
        let WriteState::Receiving { block, multi, data } =
            std::mem::replace(&mut self.write, WriteState::Idle)
        else {
            return;
        };
        let (payload, crc) = data.split_at(512);
        let token = match self.reject_writes {
            Some(token) => token,
            None if u16::from_be_bytes([crc[0], crc[1]]) != CRC16.checksum(payload) => 0x0B,
            None => 0x05,
        };
        if token == 0x05 {
            let mut stored = [0; 512];
            stored.copy_from_slice(payload);
            self.storage.insert(block, stored);
        }
        self.output.extend([token, 0x00, 0x00, 0x00]);
        if multi {
            self.write = WriteState::WaitingForToken {
                block: if token == 0x05 { block + 1 } else { block },
                multi,
            };
        }
    }

    fn r1(&self) -> u8 {
        if self.ready { 0x00 } else { 0x01 }
    }

    fn respond(&mut self, bytes: &[u8]) {
        // One byte of command response time
        self.output.push_back(0xFF);
        self.output.extend(bytes);
    }

    fn queue_data(&mut self, data: &[u8]) {
        let mut crc = CRC16.checksum(data);
        if self.corrupt_read_crc {
            crc ^= 0xFFFF;
        }
        self.output.push_back(0xFF);
        self.output.push_back(0xFE);
        self.output.extend(data);
        self.output.extend(crc.to_be_bytes());
    }

    fn queue_block(&mut self, block: u32) {
        match self.fail_read_at {
            Some((failing, token)) if failing == block => {
                self.output.extend([0xFF, token]);
                self.streaming = None;
            }
            _ => {
                let data = self.block(block);
                self.queue_data(&data);
            }
        }
    }

    fn block_index(&self, argument: u32) -> Option<u32> {
        if self.profile.is_high_capacity() {
            Some(argument)
        } else if argument % 512 == 0 {
            Some(argument / 512)
        } else {
            None
        }
    }

    fn op_cond(&mut self) -> u8 {
        if !self.idle_forever && !self.ready {
            self.polls += 1;
            if self.polls >= self.op_cond_polls {
                self.ready = true;
            }
        }
        self.r1()
    }

    fn command(&mut self, index: u8, argument: u32) {
        let app = std::mem::take(&mut self.app_command);
        self.commands.push(Sent {
            index,
            argument,
            app,
        });
        if index == 0 {
            self.spi_mode = true;
            self.ready = false;
            self.polls = 0;
            self.streaming = None;
            self.write = WriteState::Idle;
            self.respond(&[0x01]);
            return;
        }
        if !self.spi_mode {
            return;
        }

        match (app, index) {
            (_, 8) if self.profile.knows_cmd8() => {
                let echo = self.echo_override.unwrap_or(argument as u8);
                let voltage = ((argument >> 8) & 0x0F) as u8;
                self.respond(&[0x01, 0x00, 0x00, voltage, echo]);
            }
            (_, 55) if self.profile == Profile::Mmc => self.respond(&[0x05]),
            (_, 55) => {
                self.app_command = true;
                let r1 = self.r1();
                self.respond(&[r1]);
            }
            (true, 41) => {
                let r1 = self.op_cond();
                self.respond(&[r1]);
            }
            (false, 1) if self.profile == Profile::Mmc => {
                let r1 = self.op_cond();
                self.respond(&[r1]);
            }
            (_, 58) if self.profile == Profile::Mmc => self.respond(&[0x05]),
            (_, 58) => {
                let mut ocr = OCR_VOLTAGES;
                if self.ready {
                    ocr |= OCR_POWER_UP;
                    if self.profile.is_high_capacity() {
                        ocr |= OCR_CCS;
                    }
                }
                let mut response = vec![self.r1()];
                response.extend(ocr.to_be_bytes());
                self.respond(&response);
            }
            (false, 16) => self.respond(&[0x00]),
            (false, 9) => {
                self.respond(&[0x00]);
                let csd = self.csd;
                self.queue_data(&csd);
            }
            (false, 10) => {
                self.respond(&[0x00]);
                self.queue_data(&CID);
            }
            (true, 51) => {
                self.respond(&[0x00]);
                self.queue_data(&SCR);
            }
            (false, 13) => self.respond(&[0x00, 0x00]),
            (false, 17) => match self.block_index(argument) {
                Some(block) => {
                    self.respond(&[0x00]);
                    self.queue_block(block);
                }
                None => self.respond(&[0x20]),
            },
            (false, 18) => match self.block_index(argument) {
                Some(block) => {
                    self.respond(&[0x00]);
                    self.streaming = Some(block);
                }
                None => self.respond(&[0x20]),
            },
            (false, 12) => {
                self.streaming = None;
                self.output.clear();
                // Stuff byte, R1, then busy
                self.output.extend([0xFF, self.stop_r1, 0x00, 0x00]);
            }
            (false, 24 | 25) => match self.block_index(argument) {
                Some(block) => {
                    self.respond(&[0x00]);
                    self.write = WriteState::WaitingForToken {
                        block,
                        multi: index == 25,
                    };
                }
                None => self.respond(&[0x20]),
            },
            (true, 23) => self.respond(&[0x00]),
            _ => {
                let r1 = self.r1() | 0x04;
                self.respond(&[r1]);
            }
        }
    }
}

pub type SharedCard = Rc<RefCell<FakeCard>>;

pub struct FakeBus {
    card: SharedCard,
    max_hz: u32,
}

impl spi::ErrorType for FakeBus {
    type Error = Infallible;
}

impl spi::SpiBus<u8> for FakeBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut card = self.card.borrow_mut();
        for word in words {
            *word = card.exchange(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        let mut card = self.card.borrow_mut();
        for word in words {
            card.exchange(*word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        let mut card = self.card.borrow_mut();
        for i in 0..read.len().max(write.len()) {
            let miso = card.exchange(write.get(i).copied().unwrap_or(0xFF));
            if let Some(word) = read.get_mut(i) {
                *word = miso;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut card = self.card.borrow_mut();
        for word in words {
            *word = card.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl SpiTransport for FakeBus {
    fn max_frequency(&self) -> u32 {
        self.max_hz
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), FrequencyRejected> {
        if hz > self.max_hz {
            return Err(FrequencyRejected(hz));
        }
        self.card.borrow_mut().frequencies.push(hz);
        Ok(())
    }
}

pub struct FakeCs {
    card: SharedCard,
}

impl digital::ErrorType for FakeCs {
    type Error = Infallible;
}

impl digital::OutputPin for FakeCs {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.card.borrow_mut().selected = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut card = self.card.borrow_mut();
        card.selected = false;
        card.output.clear();
        card.frame.clear();
        Ok(())
    }
}

/// Moves one millisecond forward every time it is read
#[derive(Default)]
pub struct TickClock(Cell<u32>);

impl Clock for TickClock {
    fn now_millis(&self) -> u32 {
        let now = self.0.get();
        self.0.set(now.wrapping_add(1));
        now
    }
}

pub struct Harness {
    pub card: SharedCard,
    pub bus: RefCell<FakeBus>,
}

impl Harness {
    pub fn new(card: FakeCard) -> Self {
        let card = Rc::new(RefCell::new(card));
        let bus = RefCell::new(FakeBus {
            card: card.clone(),
            max_hz: 50_000_000,
        });
        Self { card, bus }
    }

    pub fn with_profile(profile: Profile) -> Self {
        Self::new(FakeCard::new(profile))
    }

    pub fn sd_card(&self) -> SdCard<'_, RefCell<FakeBus>, FakeCs, TickClock> {
        self.sd_card_with_config(Config::default())
    }

    pub fn sd_card_with_config(
        &self,
        config: Config,
    ) -> SdCard<'_, RefCell<FakeBus>, FakeCs, TickClock> {
        SdCard::with_config(
            &self.bus,
            FakeCs {
                card: self.card.clone(),
            },
            TickClock::default(),
            config,
        )
    }

    /// Runs `f` on the simulated card
    pub fn fake<R>(&self, f: impl FnOnce(&mut FakeCard) -> R) -> R {
        f(&mut self.card.borrow_mut())
    }
}
