use bincode::{Decode, Encode};

use super::cartridge::Cartridge;

const PRG_RAM_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    SingleLower,
    SingleUpper,
    FourScreen,
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        _ => "Unsupported",
    }
}

/// Per-variant bank registers. Everything here is serialized into save-states.
#[derive(Debug, Clone, Encode, Decode)]
pub enum MapperKind {
    Nrom,
    Uxrom { bank: u8 },
    Cnrom { chr_bank: u8 },
    Mmc1(Mmc1),
    Mmc3(Mmc3),
}

impl MapperKind {
    pub fn id(&self) -> u8 {
        match self {
            MapperKind::Nrom => 0,
            MapperKind::Mmc1(_) => 1,
            MapperKind::Uxrom { .. } => 2,
            MapperKind::Cnrom { .. } => 3,
            MapperKind::Mmc3(_) => 4,
        }
    }
}

/// Snapshot of everything a mapper mutates, minus CHR-RAM which is saved as
/// its own section.
#[derive(Debug, Clone, Encode, Decode)]
pub struct MapperState {
    pub kind: MapperKind,
    pub mirroring: Mirroring,
    pub prg_ram: Vec<u8>,
}

/// A cartridge plus the bank-switching circuitry that sits in front of it.
#[derive(Debug, Clone)]
pub struct Mapper {
    kind: MapperKind,
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    mirroring: Mirroring,
    hardwired_four_screen: bool,
}

impl Mapper {
    /// Cartridges are validated at parse time, so any id outside 0..=4 has
    /// already been rejected; it falls back to NROM here.
    pub fn new(cart: Cartridge) -> Self {
        let prg_len = cart.prg_rom.len();
        let chr_len = cart.chr_data.len();
        let kind = match cart.mapper_id {
            1 => MapperKind::Mmc1(Mmc1::new(prg_len, chr_len)),
            2 => MapperKind::Uxrom { bank: 0 },
            3 => MapperKind::Cnrom { chr_bank: 0 },
            4 => MapperKind::Mmc3(Mmc3::new(prg_len, chr_len)),
            _ => MapperKind::Nrom,
        };
        let mut mapper = Self {
            kind,
            prg_rom: cart.prg_rom,
            chr: cart.chr_data,
            chr_is_ram: cart.chr_is_ram,
            prg_ram: vec![0; PRG_RAM_SIZE],
            mirroring: cart.mirroring,
            hardwired_four_screen: cart.mirroring == Mirroring::FourScreen,
        };
        if let MapperKind::Mmc1(mmc1) = &mapper.kind {
            mapper.mirroring = mmc1.mirroring();
        }
        mapper
    }

    pub fn id(&self) -> u8 {
        self.kind.id()
    }

    pub fn kind(&self) -> &MapperKind {
        &self.kind
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    pub fn prg_rom(&self) -> &[u8] {
        &self.prg_rom
    }

    pub fn chr_is_ram(&self) -> bool {
        self.chr_is_ram
    }

    pub fn chr(&self) -> &[u8] {
        &self.chr
    }

    pub fn cpu_read(&self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[(addr - 0x6000) as usize],
            0x8000..=0xFFFF => {
                let index = self.prg_index(addr);
                self.prg_rom.get(index).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[(addr - 0x6000) as usize] = value,
            0x8000..=0xFFFF => self.write_register(addr, value),
            _ => {}
        }
    }

    pub fn ppu_read(&self, addr: u16) -> u8 {
        let index = self.chr_index(addr & 0x1FFF);
        self.chr.get(index).copied().unwrap_or(0)
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        if !self.chr_is_ram {
            return;
        }
        let index = self.chr_index(addr & 0x1FFF);
        if let Some(slot) = self.chr.get_mut(index) {
            *slot = value;
        }
    }

    /// Scanline counter clock. Only MMC3 reacts.
    pub fn irq_tick(&mut self) {
        if let MapperKind::Mmc3(mmc3) = &mut self.kind {
            mmc3.clock_scanline();
        }
    }

    pub fn irq_pending(&self) -> bool {
        matches!(&self.kind, MapperKind::Mmc3(mmc3) if mmc3.irq_pending)
    }

    pub fn snapshot(&self) -> MapperState {
        MapperState {
            kind: self.kind.clone(),
            mirroring: self.mirroring,
            prg_ram: self.prg_ram.clone(),
        }
    }

    /// Caller has already checked that `state.kind` matches this cartridge.
    pub fn restore(&mut self, state: MapperState) {
        self.kind = state.kind;
        self.mirroring = state.mirroring;
        if state.prg_ram.len() == self.prg_ram.len() {
            self.prg_ram = state.prg_ram;
        }
    }

    pub fn restore_chr_ram(&mut self, data: Vec<u8>) {
        if self.chr_is_ram && data.len() == self.chr.len() {
            self.chr = data;
        }
    }

    fn prg_index(&self, addr: u16) -> usize {
        let prg_len = self.prg_rom.len();
        let offset = (addr - 0x8000) as usize;
        match &self.kind {
            MapperKind::Nrom => offset % prg_len.max(1),
            MapperKind::Uxrom { bank } => {
                let banks = bank_count(prg_len, 0x4000);
                let bank = if offset < 0x4000 {
                    *bank as usize % banks
                } else {
                    banks - 1
                };
                bank * 0x4000 + (offset & 0x3FFF)
            }
            MapperKind::Cnrom { .. } => offset % prg_len.max(1),
            MapperKind::Mmc1(mmc1) => mmc1.prg_offsets[offset / 0x4000] + (offset & 0x3FFF),
            MapperKind::Mmc3(mmc3) => mmc3.prg_offsets[offset / 0x2000] + (offset & 0x1FFF),
        }
    }

    fn chr_index(&self, addr: u16) -> usize {
        let offset = addr as usize;
        match &self.kind {
            MapperKind::Nrom | MapperKind::Uxrom { .. } => offset,
            MapperKind::Cnrom { chr_bank } => {
                let banks = bank_count(self.chr.len(), 0x2000);
                (*chr_bank as usize % banks) * 0x2000 + offset
            }
            MapperKind::Mmc1(mmc1) => mmc1.chr_offsets[offset / 0x1000] + (offset & 0x0FFF),
            MapperKind::Mmc3(mmc3) => mmc3.chr_offsets[offset / 0x0400] + (offset & 0x03FF),
        }
    }

    fn write_register(&mut self, addr: u16, value: u8) {
        let prg_len = self.prg_rom.len();
        let chr_len = self.chr.len();
        match &mut self.kind {
            MapperKind::Nrom => {}
            MapperKind::Uxrom { bank } => *bank = value & 0x0F,
            MapperKind::Cnrom { chr_bank } => *chr_bank = value,
            MapperKind::Mmc1(mmc1) => {
                if mmc1.write(addr, value, prg_len, chr_len) {
                    self.mirroring = mmc1.mirroring();
                }
            }
            MapperKind::Mmc3(mmc3) => {
                let mirroring = mmc3.write(addr, value, prg_len, chr_len);
                if let (Some(mirroring), false) = (mirroring, self.hardwired_four_screen) {
                    self.mirroring = mirroring;
                }
            }
        }
    }
}

fn bank_count(len: usize, bank_size: usize) -> usize {
    (len / bank_size).max(1)
}

/// Serial-port mapper: five one-bit writes fill a register chosen by A13/A14.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Mmc1 {
    shift: u8,
    shift_count: u8,
    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
    prg_offsets: [usize; 2],
    chr_offsets: [usize; 2],
}

impl Mmc1 {
    fn new(prg_len: usize, chr_len: usize) -> Self {
        let mut mmc1 = Self {
            shift: 0x10,
            shift_count: 0,
            control: 0x0C,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
            prg_offsets: [0; 2],
            chr_offsets: [0; 2],
        };
        mmc1.update_offsets(prg_len, chr_len);
        mmc1
    }

    /// Returns true when a register load completed and banking changed.
    fn write(&mut self, addr: u16, value: u8, prg_len: usize, chr_len: usize) -> bool {
        if (value & 0x80) != 0 {
            self.shift = 0x10;
            self.shift_count = 0;
            self.control |= 0x0C;
            self.update_offsets(prg_len, chr_len);
            return true;
        }

        self.shift = (self.shift >> 1) | ((value & 0x01) << 4);
        self.shift_count += 1;
        if self.shift_count < 5 {
            return false;
        }

        let loaded = self.shift & 0x1F;
        match (addr & 0x6000) >> 13 {
            0 => self.control = loaded,
            1 => self.chr_bank0 = loaded,
            2 => self.chr_bank1 = loaded,
            _ => self.prg_bank = loaded & 0x0F,
        }
        self.shift = 0x10;
        self.shift_count = 0;
        self.update_offsets(prg_len, chr_len);
        true
    }

    fn mirroring(&self) -> Mirroring {
        match self.control & 0x03 {
            0 => Mirroring::SingleLower,
            1 => Mirroring::SingleUpper,
            2 => Mirroring::Vertical,
            _ => Mirroring::Horizontal,
        }
    }

    fn update_offsets(&mut self, prg_len: usize, chr_len: usize) {
        let prg_banks = bank_count(prg_len, 0x4000);
        let prg = self.prg_bank as usize % prg_banks;
        let (first, second) = match (self.control >> 2) & 0x03 {
            0 | 1 => (prg & !1, (prg & !1) | 1),
            2 => (0, prg),
            _ => (prg, prg_banks - 1),
        };
        self.prg_offsets = [
            (first % prg_banks) * 0x4000,
            (second % prg_banks) * 0x4000,
        ];

        let chr_banks = bank_count(chr_len, 0x1000);
        let (low, high) = if (self.control & 0x10) == 0 {
            let bank = self.chr_bank0 as usize & !1;
            (bank, bank | 1)
        } else {
            (self.chr_bank0 as usize, self.chr_bank1 as usize)
        };
        self.chr_offsets = [
            (low % chr_banks) * 0x1000,
            (high % chr_banks) * 0x1000,
        ];
    }
}

/// Eight bank registers behind even/odd register pairs plus a scanline IRQ counter.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Mmc3 {
    registers: [u8; 8],
    register_index: u8,
    prg_mode: u8,
    chr_mode: u8,
    prg_offsets: [usize; 4],
    chr_offsets: [usize; 8],
    irq_reload: u8,
    irq_counter: u8,
    irq_enabled: bool,
    irq_pending: bool,
}

impl Mmc3 {
    fn new(prg_len: usize, chr_len: usize) -> Self {
        let mut mmc3 = Self {
            registers: [0; 8],
            register_index: 0,
            prg_mode: 0,
            chr_mode: 0,
            prg_offsets: [0; 4],
            chr_offsets: [0; 8],
            irq_reload: 0,
            irq_counter: 0,
            irq_enabled: false,
            irq_pending: false,
        };
        mmc3.update_offsets(prg_len, chr_len);
        mmc3
    }

    /// Returns a new mirroring mode when $A000 was written.
    fn write(&mut self, addr: u16, value: u8, prg_len: usize, chr_len: usize) -> Option<Mirroring> {
        let even = (addr & 1) == 0;
        match (addr, even) {
            (0x8000..=0x9FFF, true) => {
                self.prg_mode = (value >> 6) & 1;
                self.chr_mode = (value >> 7) & 1;
                self.register_index = value & 0x07;
                self.update_offsets(prg_len, chr_len);
            }
            (0x8000..=0x9FFF, false) => {
                self.registers[self.register_index as usize] = value;
                self.update_offsets(prg_len, chr_len);
            }
            (0xA000..=0xBFFF, true) => {
                return Some(if (value & 1) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                });
            }
            (0xA000..=0xBFFF, false) => {}
            (0xC000..=0xDFFF, true) => self.irq_reload = value,
            (0xC000..=0xDFFF, false) => self.irq_counter = 0,
            (_, true) => {
                self.irq_enabled = false;
                self.irq_pending = false;
            }
            (_, false) => self.irq_enabled = true,
        }
        None
    }

    fn clock_scanline(&mut self) {
        if self.irq_counter == 0 {
            self.irq_counter = self.irq_reload;
        } else {
            self.irq_counter -= 1;
            if self.irq_counter == 0 && self.irq_enabled {
                self.irq_pending = true;
            }
        }
    }

    fn update_offsets(&mut self, prg_len: usize, chr_len: usize) {
        let prg_banks = bank_count(prg_len, 0x2000);
        let prg = |bank: usize| (bank % prg_banks) * 0x2000;
        let second_last = prg_banks.saturating_sub(2);
        let last = prg_banks - 1;
        let r6 = self.registers[6] as usize;
        let r7 = self.registers[7] as usize;
        self.prg_offsets = if self.prg_mode == 0 {
            [prg(r6), prg(r7), prg(second_last), prg(last)]
        } else {
            [prg(second_last), prg(r7), prg(r6), prg(last)]
        };

        let chr_banks = bank_count(chr_len, 0x0400);
        let chr = |bank: u8| (bank as usize % chr_banks) * 0x0400;
        let r = self.registers;
        let two_k = [
            chr(r[0] & 0xFE),
            chr(r[0] | 0x01),
            chr(r[1] & 0xFE),
            chr(r[1] | 0x01),
        ];
        let one_k = [chr(r[2]), chr(r[3]), chr(r[4]), chr(r[5])];
        self.chr_offsets = if self.chr_mode == 0 {
            [
                two_k[0], two_k[1], two_k[2], two_k[3], one_k[0], one_k[1], one_k[2], one_k[3],
            ]
        } else {
            [
                one_k[0], one_k[1], one_k[2], one_k[3], two_k[0], two_k[1], two_k[2], two_k[3],
            ]
        };
    }
}
