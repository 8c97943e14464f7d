use bincode::{Decode, Encode, config};
use log::debug;

use super::Emulator;
use super::apu::Apu;
use super::bus::RAM_SIZE;
use super::controller::Controller;
use super::cpu::Cpu;
use super::mapper::MapperState;
use super::ppu::Ppu;
use crate::error::{EmulatorError, StateError};

const MAGIC: &[u8; 4] = b"FCST";
pub const STATE_VERSION: u16 = 1;
const HEADER_SIZE: usize = MAGIC.len() + 2;

impl Emulator {
    /// Serializes the complete machine. The cartridge ROM itself is not
    /// included; a state only loads back onto the same mapper.
    pub fn save_state(&self) -> Result<Vec<u8>, EmulatorError> {
        let mapper = self.bus.mapper.as_ref().ok_or(EmulatorError::NoCartridge)?;
        let mut out = Vec::with_capacity(64 * 1024);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());

        put(&mut out, &self.bus.ram)?;
        put(&mut out, &mapper.snapshot())?;
        put(&mut out, &self.bus.controller)?;
        put(&mut out, &self.cpu)?;
        put(&mut out, &self.bus.ppu)?;
        put(&mut out, &self.bus.apu)?;
        if mapper.chr_is_ram() {
            put(&mut out, &mapper.chr())?;
        }

        debug!("Saved state ({} bytes)", out.len());
        Ok(out)
    }

    /// Restores a state produced by `save_state`. Nothing is modified unless
    /// the whole blob decodes and matches the installed cartridge.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), EmulatorError> {
        let mapper = self.bus.mapper.as_ref().ok_or(EmulatorError::NoCartridge)?;

        if data.len() < HEADER_SIZE || &data[..MAGIC.len()] != MAGIC {
            return Err(StateError::BadMagic.into());
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != STATE_VERSION {
            return Err(StateError::Version {
                found: version,
                expected: STATE_VERSION,
            }
            .into());
        }

        let mut reader = &data[HEADER_SIZE..];
        let ram: [u8; RAM_SIZE] = take(&mut reader)?;
        let mapper_state: MapperState = take(&mut reader)?;
        if mapper_state.kind.id() != mapper.id() {
            return Err(StateError::MapperMismatch {
                saved: mapper_state.kind.id(),
                installed: mapper.id(),
            }
            .into());
        }
        let controller: Controller = take(&mut reader)?;
        let cpu: Cpu = take(&mut reader)?;
        let ppu: Ppu = take(&mut reader)?;
        ppu.check_invariants().map_err(StateError::Corrupt)?;
        let apu: Apu = take(&mut reader)?;
        let chr_ram = if mapper.chr_is_ram() {
            let chr: Vec<u8> = take(&mut reader)?;
            if chr.len() != mapper.chr().len() {
                return Err(StateError::ChrSizeMismatch {
                    saved: chr.len(),
                    installed: mapper.chr().len(),
                }
                .into());
            }
            Some(chr)
        } else {
            None
        };

        self.bus.ram = ram;
        self.bus.controller = controller;
        self.cpu = cpu;
        self.bus.ppu = ppu;
        self.bus.apu = apu;
        if let Some(mapper) = self.bus.mapper.as_mut() {
            mapper.restore(mapper_state);
            if let Some(chr) = chr_ram {
                mapper.restore_chr_ram(chr);
            }
        }

        debug!("Loaded state ({} bytes)", data.len());
        self.push_event("State loaded");
        Ok(())
    }
}

fn put<T: Encode + ?Sized>(out: &mut Vec<u8>, value: &T) -> Result<(), StateError> {
    bincode::encode_into_std_write(value, out, config::standard())?;
    Ok(())
}

fn take<T: Decode<()>>(reader: &mut &[u8]) -> Result<T, StateError> {
    Ok(bincode::decode_from_std_read(reader, config::standard())?)
}
