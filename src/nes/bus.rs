use log::trace;

use super::apu::Apu;
use super::controller::Controller;
use super::mapper::Mapper;
use super::ppu::Ppu;

pub const RAM_SIZE: usize = 2048;

/// CPU address space. Owns every device the CPU can reach; the CPU itself
/// only sees `read`/`write`.
pub struct Bus {
    pub(crate) ram: [u8; RAM_SIZE],
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) controller: Controller,
    pub(crate) mapper: Option<Mapper>,
    open_bus: u8,
    oam_dma: bool,
}

impl Bus {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            ram: [0; RAM_SIZE],
            ppu: Ppu::new(),
            apu: Apu::new(sample_rate),
            controller: Controller::new(),
            mapper: None,
            open_bus: 0,
            oam_dma: false,
        }
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => match self.mapper.as_mut() {
                Some(mapper) => self.ppu.read_register(0x2000 + (addr & 0x0007), mapper),
                None => self.open_bus,
            },
            0x4015 => self.apu.read_status(),
            0x4016 => (self.open_bus & 0xE0) | self.controller.read(),
            0x4017 => self.open_bus & 0xE0,
            0x4000..=0x401F => self.open_bus,
            _ => self
                .mapper
                .as_ref()
                .map_or(self.open_bus, |mapper| mapper.cpu_read(addr)),
        };
        self.open_bus = value;
        value
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        self.open_bus = value;
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => {
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.write_register(0x2000 + (addr & 0x0007), value, mapper);
                }
            }
            0x4014 => self.oam_dma(value),
            0x4016 => self.controller.write(value),
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(addr, value),
            0x4018..=0x401F => {}
            _ => {
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_write(addr, value);
                }
            }
        }
    }

    pub fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi = self.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    /// Reads a little-endian pointer without carrying into the high byte,
    /// reproducing the indirect-JMP page wrap.
    pub fn read_u16_wrapped(&mut self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.read(hi_addr) as u16;
        (hi << 8) | lo
    }

    /// Side-effect-free read used by the disassembler and DMC fetches.
    pub fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x4020..=0xFFFF => self.mapper.as_ref().map_or(0, |mapper| mapper.cpu_read(addr)),
            _ => 0,
        }
    }

    /// True once after a $4014 write; the CPU turns it into stall cycles.
    pub fn take_oam_dma(&mut self) -> bool {
        std::mem::take(&mut self.oam_dma)
    }

    /// Advances the PPU one dot. Returns true when a frame completed.
    pub fn step_ppu(&mut self) -> bool {
        match self.mapper.as_mut() {
            Some(mapper) => self.ppu.step(mapper),
            None => false,
        }
    }

    /// Level of the shared IRQ line.
    pub fn irq_line(&self) -> bool {
        self.apu.irq_pending() || self.mapper.as_ref().is_some_and(Mapper::irq_pending)
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        for offset in 0..256u16 {
            let value = self.read(base | offset);
            self.ppu.write_oam(value);
        }
        self.oam_dma = true;
        trace!("OAM DMA from page ${page:02X}");
    }
}
