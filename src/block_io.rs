use embedded_hal::digital::OutputPin;

use crate::{
    BLOCK_SIZE, Card, CardFlags, CardKind, Command, Error, R1, R2Byte2, ResponseType,
    START_BLOCK_TOKEN, START_MULTI_BLOCK_WRITE_TOKEN, STOP_TRANSMISSION_TOKEN, SpiTransport,
    clock::Clock,
    command::{Link, LinkError, acmd, cmd},
};

/// Checks a transfer request against the card before any bus traffic happens.
/// Returns how many bytes of the buffer take part in the transfer.
pub(crate) fn validate<BusError, CsError>(
    card: &Card,
    buffer_len: usize,
    start: u32,
    count: u32,
) -> Result<usize, Error<BusError, CsError>> {
    if !card.is_operational() {
        return Err(Error::NotInitialized);
    }
    let len = (count as usize)
        .checked_mul(BLOCK_SIZE as usize)
        .filter(|&len| len <= buffer_len)
        .ok_or(Error::BufferSize)?;
    match start.checked_add(count) {
        Some(end) if end <= card.block_count() => Ok(len),
        _ => Err(Error::OutOfRange),
    }
}

/// SDSC cards and MMC are byte addressed, SDHC and SDXC are block addressed
pub(crate) fn block_address(card: &Card, block: u32) -> u32 {
    if card.flags.contains(CardFlags::HIGH_CAPACITY) {
        block
    } else {
        block * BLOCK_SIZE
    }
}

impl<S: SpiTransport, Cs: OutputPin, C: Clock> Link<'_, S, Cs, C> {
    /// `buffer` must already be validated to hold a whole number of blocks, at least one
    pub(crate) fn read_blocks(
        &mut self,
        card: &Card,
        buffer: &mut [u8],
        start: u32,
    ) -> Result<(), LinkError<S, Cs>> {
        let address = block_address(card, start);
        if buffer.len() == BLOCK_SIZE as usize {
            return self.transaction(|link| {
                link.expect_ready(&Command::r1(cmd::READ_SINGLE_BLOCK, address))?;
                link.read_data(buffer)
            });
        }

        let timeout = self.config.command_timeout_ms;
        self.transaction(|link| {
            link.expect_ready(&Command::r1(cmd::READ_MULTIPLE_BLOCK, address))?;
            let result = buffer
                .chunks_exact_mut(BLOCK_SIZE as usize)
                .try_for_each(|block| link.read_data(block));
            // The card keeps sending blocks until it is told to stop, even after an error
            let stop = link.send_command(
                &Command::new(cmd::STOP_TRANSMISSION, 0, ResponseType::R1b),
                timeout,
            );
            result?;
            let r1 = stop?.r1();
            if !r1.is_empty() {
                warn!("CMD12 rejected: 0b{:08b}", r1.bits());
                return Err(Error::ResponseError(r1));
            }
            Ok(())
        })
    }

    /// `buffer` must already be validated to hold a whole number of blocks, at least one
    pub(crate) fn write_blocks(
        &mut self,
        card: &Card,
        buffer: &[u8],
        start: u32,
    ) -> Result<(), LinkError<S, Cs>> {
        let address = block_address(card, start);
        let timeout = self.config.command_timeout_ms;
        if buffer.len() == BLOCK_SIZE as usize {
            return self.transaction(|link| {
                link.expect_ready(&Command::r1(cmd::WRITE_BLOCK, address))?;
                link.write_data(START_BLOCK_TOKEN, buffer)?;
                // Programming
                link.wait_ready(timeout)
            });
        }

        let count = (buffer.len() / BLOCK_SIZE as usize) as u32;
        let pre_erase = self.config.pre_erase && card.kind != CardKind::Mmc;
        self.transaction(|link| {
            if pre_erase {
                let r1 = link
                    .send_app_command(&Command::r1(acmd::SET_WR_BLK_ERASE_COUNT, count), timeout)?
                    .r1();
                if !r1.is_empty() {
                    return Err(Error::ResponseError(r1));
                }
            }
            link.expect_ready(&Command::r1(cmd::WRITE_MULTIPLE_BLOCK, address))?;
            let result = buffer
                .chunks_exact(BLOCK_SIZE as usize)
                .try_for_each(|block| link.write_data(START_MULTI_BLOCK_WRITE_TOKEN, block));
            let stop = link
                .write_data(STOP_TRANSMISSION_TOKEN, &[])
                .and_then(|()| link.wait_ready(timeout));
            result?;
            stop
        })
    }

    /// CMD13, mostly useful to find out why a write failed
    pub(crate) fn card_status(&mut self) -> Result<(R1, R2Byte2), LinkError<S, Cs>> {
        let timeout = self.config.command_timeout_ms;
        let response = self.transaction(|link| {
            link.send_command(&Command::new(cmd::SEND_STATUS, 0, ResponseType::R2), timeout)
        })?;
        Ok((
            response.r1(),
            R2Byte2::from_bits_retain(response.bytes()[1]),
        ))
    }
}
