use bincode::{Decode, Encode};

use super::mapper::{Mapper, Mirroring};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

pub const DOTS_PER_SCANLINE: u16 = 341;
pub const SCANLINES_PER_FRAME: u16 = 262;
pub const PRE_RENDER_SCANLINE: u16 = 261;
pub const VBLANK_SCANLINE: u16 = 241;

const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

pub const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
pub const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
pub const STATUS_VBLANK: u8 = 0x80;

const MMC3_CLOCK_DOT: u16 = 260;

/// 2C02 picture unit. The frame buffer holds one master-palette index
/// (0..=63) per pixel; converting to RGB is left to the consumer.
#[derive(Clone, Encode, Decode)]
pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam: [u8; 256],
    vram: [u8; 4096],
    palette_ram: [u8; 32],

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,
    read_buffer: u8,
    open_bus: u8,

    scanline: u16,
    dot: u16,
    odd_frame: bool,
    nmi_pending: bool,
    nmi_line: bool,
    vblank_suppress: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    sprite_count: usize,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_x: [u8; 8],
    sprite_attributes: [u8; 8],
    sprite_indices: [u8; 8],

    frame_buffer: Vec<u8>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            vram: [0; 4096],
            palette_ram: [0x0F; 32],
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            read_buffer: 0,
            open_bus: 0,
            scanline: PRE_RENDER_SCANLINE,
            dot: 0,
            odd_frame: false,
            nmi_pending: false,
            nmi_line: false,
            vblank_suppress: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_x: [0; 8],
            sprite_attributes: [0; 8],
            sprite_indices: [0; 8],
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
        }
    }

    /// Power-on state. Memories (VRAM, OAM, palette) are cleared too.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Checks fields a decoded state could put out of range. Returns the
    /// name of the first offending field.
    pub(crate) fn check_invariants(&self) -> Result<(), &'static str> {
        if self.sprite_count > 8 {
            return Err("sprite_count");
        }
        if self.frame_buffer.len() != FRAME_WIDTH * FRAME_HEIGHT {
            return Err("frame_buffer");
        }
        if self.scanline >= SCANLINES_PER_FRAME {
            return Err("scanline");
        }
        if self.dot >= DOTS_PER_SCANLINE {
            return Err("dot");
        }
        if self.fine_x > 7 {
            return Err("fine_x");
        }
        Ok(())
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn dot(&self) -> u16 {
        self.dot
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn odd_frame(&self) -> bool {
        self.odd_frame
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    pub fn read_register(&mut self, addr: u16, mapper: &mut Mapper) -> u8 {
        let value = match addr {
            0x2002 => {
                // Reading one dot before VBlank suppresses it for this frame.
                if self.scanline == VBLANK_SCANLINE && self.dot == 1 {
                    self.vblank_suppress = true;
                }
                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.update_nmi_line();
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = self.ppu_read(ppu_addr, mapper);
                let result = if ppu_addr >= 0x3F00 {
                    // Palette reads are direct; the buffer gets the nametable byte underneath.
                    self.read_buffer = self.ppu_read(ppu_addr - 0x1000, mapper);
                    value
                } else {
                    std::mem::replace(&mut self.read_buffer, value)
                };
                self.increment_vram_addr_cpu_access();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn write_register(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        self.open_bus = value;
        match addr {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
                self.update_nmi_line();
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => self.write_oam(value),
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x73E0)
                        | (((value as u16) & 0x07) << 12)
                        | (((value as u16) >> 3) << 5);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | value as u16;
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                self.ppu_write(ppu_addr, value, mapper);
                self.increment_vram_addr_cpu_access();
            }
            _ => {}
        }
    }

    /// One OAM byte at the current OAM address; used by $2004 and OAM DMA.
    pub fn write_oam(&mut self, value: u8) {
        self.oam[self.oam_addr as usize] = value;
        self.oam_addr = self.oam_addr.wrapping_add(1);
    }

    /// Advances one dot. Returns true when this dot completed a frame.
    pub fn step(&mut self, mapper: &mut Mapper) -> bool {
        let visible_line = self.scanline < 240;
        let pre_render = self.scanline == PRE_RENDER_SCANLINE;
        let render_line = visible_line || pre_render;
        let rendering_enabled = self.rendering_enabled();

        if pre_render && self.dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.vblank_suppress = false;
            self.update_nmi_line();
        }

        if self.scanline == VBLANK_SCANLINE && self.dot == 1 {
            if !self.vblank_suppress {
                self.status |= STATUS_VBLANK;
            }
            self.vblank_suppress = false;
            self.update_nmi_line();
        }

        if visible_line && (1..=256).contains(&self.dot) {
            self.render_pixel((self.dot - 1) as usize, self.scanline as usize);
        }

        if render_line && rendering_enabled {
            if (1..=256).contains(&self.dot) || (321..=336).contains(&self.dot) {
                self.shift_background_registers();
                self.fetch_background(mapper);
            }

            if visible_line && (1..=256).contains(&self.dot) {
                self.shift_sprite_registers();
            }

            if self.dot == 256 {
                self.increment_y();
            }

            if self.dot == 257 {
                self.load_background_shifters();
                self.copy_horizontal_bits();
                if visible_line {
                    self.evaluate_sprites(mapper);
                } else {
                    self.clear_sprites();
                }
            }

            if pre_render && (280..=304).contains(&self.dot) {
                self.copy_vertical_bits();
            }

            if self.dot == 338 || self.dot == 340 {
                self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
            }

            if self.dot == MMC3_CLOCK_DOT {
                mapper.irq_tick();
            }
        }

        // Odd frames drop the last pre-render dot while rendering.
        if pre_render && rendering_enabled && self.odd_frame && self.dot == 339 {
            self.dot = 0;
            self.scanline = 0;
            self.odd_frame = false;
            return true;
        }

        self.dot += 1;
        if self.dot >= DOTS_PER_SCANLINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline >= SCANLINES_PER_FRAME {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
                return true;
            }
        }
        false
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn update_nmi_line(&mut self) {
        let line = (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0;
        if line && !self.nmi_line {
            self.nmi_pending = true;
        }
        self.nmi_line = line;
    }

    fn fetch_background(&mut self, mapper: &mut Mapper) {
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        let fine_y = (self.v >> 12) & 0x07;

        match (self.dot - 1) & 0x07 {
            0 => {
                self.load_background_shifters();
                self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
            }
            2 => {
                let addr = 0x23C0
                    | (self.v & 0x0C00)
                    | ((self.v >> 4) & 0x0038)
                    | ((self.v >> 2) & 0x0007);
                let attr = self.ppu_read(addr, mapper);
                let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                self.next_tile_attr = (attr >> shift) & 0x03;
            }
            4 => {
                let addr = table + (self.next_tile_id as u16) * 16 + fine_y;
                self.next_tile_lsb = self.ppu_read(addr, mapper);
            }
            6 => {
                let addr = table + (self.next_tile_id as u16) * 16 + fine_y + 8;
                self.next_tile_msb = self.ppu_read(addr, mapper);
            }
            7 => self.increment_coarse_x(),
            _ => {}
        }
    }

    fn render_pixel(&mut self, x: usize, y: usize) {
        let (bg_pixel, bg_palette) = self.background_sample(x);
        let (spr_pixel, spr_palette, spr_behind_bg) = self.sprite_sample(x);

        if bg_pixel != 0 && x != 255 && self.sprite0_opaque(x) {
            self.status |= STATUS_SPRITE_ZERO_HIT;
        }

        let palette_index = match (bg_pixel != 0, spr_pixel != 0) {
            (false, false) => 0,
            (false, true) => 0x10 | (spr_palette << 2) | spr_pixel,
            (true, false) => (bg_palette << 2) | bg_pixel,
            (true, true) if spr_behind_bg => (bg_palette << 2) | bg_pixel,
            (true, true) => 0x10 | (spr_palette << 2) | spr_pixel,
        };

        let color = self.palette_ram[palette_ram_index(palette_index as u16)] & 0x3F;
        self.frame_buffer[y * FRAME_WIDTH + x] = color;
    }

    fn background_sample(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 {
            return (0, 0);
        }
        if x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0 {
            return (0, 0);
        }

        let bit = 0x8000u16 >> self.fine_x;
        let p0 = ((self.bg_shift_pattern_lo & bit) != 0) as u8;
        let p1 = ((self.bg_shift_pattern_hi & bit) != 0) as u8;
        let a0 = ((self.bg_shift_attr_lo & bit) != 0) as u8;
        let a1 = ((self.bg_shift_attr_hi & bit) != 0) as u8;
        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    fn sprites_visible_at(&self, x: usize) -> bool {
        (self.mask & MASK_SHOW_SPRITES) != 0 && (x >= 8 || (self.mask & MASK_SHOW_SPRITE_LEFT) != 0)
    }

    fn sprite_pixel(&self, slot: usize) -> u8 {
        let p0 = (self.sprite_patterns_lo[slot] & 0x80) >> 7;
        let p1 = (self.sprite_patterns_hi[slot] & 0x80) >> 6;
        p0 | p1
    }

    /// First opaque sprite in evaluation order wins.
    fn sprite_sample(&self, x: usize) -> (u8, u8, bool) {
        if !self.sprites_visible_at(x) {
            return (0, 0, false);
        }
        (0..self.sprite_count)
            .filter(|&slot| self.sprite_x[slot] == 0)
            .find_map(|slot| {
                let pixel = self.sprite_pixel(slot);
                (pixel != 0).then(|| {
                    let attributes = self.sprite_attributes[slot];
                    (pixel, attributes & 0x03, (attributes & 0x20) != 0)
                })
            })
            .unwrap_or((0, 0, false))
    }

    fn sprite0_opaque(&self, x: usize) -> bool {
        self.sprites_visible_at(x)
            && (0..self.sprite_count).any(|slot| {
                self.sprite_indices[slot] == 0
                    && self.sprite_x[slot] == 0
                    && self.sprite_pixel(slot) != 0
            })
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo <<= 1;
        self.bg_shift_attr_hi <<= 1;
    }

    fn shift_sprite_registers(&mut self) {
        for slot in 0..self.sprite_count {
            if self.sprite_x[slot] > 0 {
                self.sprite_x[slot] -= 1;
            } else {
                self.sprite_patterns_lo[slot] <<= 1;
                self.sprite_patterns_hi[slot] <<= 1;
            }
        }
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;
        let fill = |set: bool| if set { 0x00FF } else { 0x0000 };
        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | fill((self.next_tile_attr & 0x01) != 0);
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | fill((self.next_tile_attr & 0x02) != 0);
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v = self.v.wrapping_add(0x1000);
            return;
        }

        self.v &= !0x7000;
        let y = match (self.v & 0x03E0) >> 5 {
            29 => {
                self.v ^= 0x0800;
                0
            }
            31 => 0,
            y => y + 1,
        };
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn clear_sprites(&mut self) {
        self.sprite_count = 0;
        self.sprite_patterns_lo = [0; 8];
        self.sprite_patterns_hi = [0; 8];
        self.sprite_x = [0; 8];
        self.sprite_attributes = [0; 8];
        self.sprite_indices = [0; 8];
    }

    /// Selects up to eight sprites covering the next scanline, scanning OAM
    /// from the current OAM address, and fetches their pattern rows.
    fn evaluate_sprites(&mut self, mapper: &mut Mapper) {
        self.clear_sprites();

        let sprite_height: u16 = if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        };

        // OAMADDR need not be 4-aligned; the scan wraps through OAM.
        let start = self.oam_addr as usize;
        let oam_at = |n: usize, k: usize| (start + 4 * n + k) & 0xFF;
        for n in 0..64 {
            let top = self.oam[oam_at(n, 0)] as u16;
            if self.scanline < top || self.scanline - top >= sprite_height {
                continue;
            }

            if self.sprite_count == 8 {
                self.status |= STATUS_SPRITE_OVERFLOW;
                break;
            }

            let tile_index = self.oam[oam_at(n, 1)];
            let attributes = self.oam[oam_at(n, 2)];
            let mut row = self.scanline - top;
            if (attributes & 0x80) != 0 {
                row = sprite_height - 1 - row;
            }

            let (table, tile) = if sprite_height == 16 {
                (
                    ((tile_index & 0x01) as u16) * 0x1000,
                    ((tile_index & 0xFE) as u16) + row / 8,
                )
            } else if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                (0x1000, tile_index as u16)
            } else {
                (0x0000, tile_index as u16)
            };

            let addr = table + tile * 16 + (row & 0x07);
            let mut low = self.ppu_read(addr, mapper);
            let mut high = self.ppu_read(addr + 8, mapper);
            if (attributes & 0x40) != 0 {
                low = low.reverse_bits();
                high = high.reverse_bits();
            }

            let slot = self.sprite_count;
            self.sprite_patterns_lo[slot] = low;
            self.sprite_patterns_hi[slot] = high;
            self.sprite_x[slot] = self.oam[oam_at(n, 3)];
            self.sprite_attributes[slot] = attributes;
            self.sprite_indices[slot] = n as u8;
            self.sprite_count += 1;
        }
    }

    fn increment_vram_addr_cpu_access(&mut self) {
        let render_line = self.scanline < 240 || self.scanline == PRE_RENDER_SCANLINE;
        if self.rendering_enabled() && render_line {
            self.increment_coarse_x();
            self.increment_y();
        } else if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            self.v = self.v.wrapping_add(32);
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn ppu_read(&mut self, addr: u16, mapper: &mut Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_read(addr),
            0x2000..=0x3EFF => self.vram[nametable_index(addr, mapper.mirroring())],
            _ => self.palette_ram[palette_ram_index(addr)],
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => self.vram[nametable_index(addr, mapper.mirroring())] = value,
            _ => self.palette_ram[palette_ram_index(addr)] = value,
        }
    }
}

/// $3F10/$3F14/$3F18/$3F1C alias the background entries below them.
fn palette_ram_index(addr: u16) -> usize {
    let index = (addr & 0x1F) as usize;
    if index >= 16 && (index & 0x03) == 0 {
        index - 16
    } else {
        index
    }
}

fn nametable_index(addr: u16, mirroring: Mirroring) -> usize {
    let index = ((addr - 0x2000) & 0x0FFF) as usize;
    let table = index / 0x400;
    let offset = index % 0x400;

    let physical = match mirroring {
        Mirroring::Horizontal => table >> 1,
        Mirroring::Vertical => table & 1,
        Mirroring::SingleLower => 0,
        Mirroring::SingleUpper => 1,
        Mirroring::FourScreen => table,
    };
    physical * 0x400 + offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::Cartridge;

    fn make_mapper(mirroring: Mirroring) -> Mapper {
        Mapper::new(Cartridge {
            mapper_id: 0,
            mirroring,
            has_battery: false,
            prg_rom: vec![0; 0x8000],
            chr_data: vec![0; 0x2000],
            chr_is_ram: true,
        })
    }

    fn set_vram_addr(ppu: &mut Ppu, mapper: &mut Mapper, addr: u16) {
        ppu.write_register(0x2006, (addr >> 8) as u8, mapper);
        ppu.write_register(0x2006, addr as u8, mapper);
    }

    #[test]
    fn vblank_sets_at_scanline_241_dot_1() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        assert_eq!(ppu.status() & STATUS_VBLANK, 0);

        while !(ppu.scanline() == VBLANK_SCANLINE && ppu.dot() == 1) {
            ppu.step(&mut mapper);
            assert_eq!(ppu.status() & STATUS_VBLANK, 0);
        }
        ppu.step(&mut mapper);
        assert_ne!(ppu.status() & STATUS_VBLANK, 0);

        let value = ppu.read_register(0x2002, &mut mapper);
        assert_ne!(value & STATUS_VBLANK, 0);
        assert_eq!(ppu.status() & STATUS_VBLANK, 0);
    }

    #[test]
    fn pre_render_clears_vblank() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        while !(ppu.scanline() == VBLANK_SCANLINE && ppu.dot() == 2) {
            ppu.step(&mut mapper);
        }
        assert_ne!(ppu.status() & STATUS_VBLANK, 0);
        while !(ppu.scanline() == PRE_RENDER_SCANLINE && ppu.dot() == 2) {
            ppu.step(&mut mapper);
        }
        assert_eq!(ppu.status() & STATUS_VBLANK, 0);
    }

    #[test]
    fn nmi_raised_on_vblank_when_enabled() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        ppu.write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        let mut dots = 0;
        while !ppu.take_nmi() {
            ppu.step(&mut mapper);
            dots += 1;
            assert!(dots < 100_000);
        }
        assert_eq!((ppu.scanline(), ppu.dot()), (VBLANK_SCANLINE, 2));
    }

    #[test]
    fn frame_cadence_with_rendering_enabled() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        ppu.write_register(0x2001, MASK_SHOW_BG, &mut mapper);

        // Align to a frame boundary first.
        while !ppu.step(&mut mapper) {}

        let mut lengths = Vec::new();
        for _ in 0..4 {
            let mut dots = 1u32;
            while !ppu.step(&mut mapper) {
                dots += 1;
            }
            lengths.push(dots);
        }
        let full = u32::from(DOTS_PER_SCANLINE) * u32::from(SCANLINES_PER_FRAME);
        assert!(lengths.contains(&full));
        assert!(lengths.contains(&(full - 1)));
        assert_eq!(lengths.iter().sum::<u32>(), 2 * full + 2 * (full - 1));
    }

    #[test]
    fn frame_cadence_without_rendering_is_fixed() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        while !ppu.step(&mut mapper) {}
        for _ in 0..2 {
            let mut dots = 1u32;
            while !ppu.step(&mut mapper) {
                dots += 1;
            }
            assert_eq!(dots, 89_342);
        }
    }

    #[test]
    fn ppudata_reads_are_buffered_except_palette() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Vertical);
        set_vram_addr(&mut ppu, &mut mapper, 0x2000);
        ppu.write_register(0x2007, 0xAB, &mut mapper);
        ppu.write_register(0x2007, 0xCD, &mut mapper);

        set_vram_addr(&mut ppu, &mut mapper, 0x2000);
        let _ = ppu.read_register(0x2007, &mut mapper);
        assert_eq!(ppu.read_register(0x2007, &mut mapper), 0xAB);
        assert_eq!(ppu.read_register(0x2007, &mut mapper), 0xCD);

        set_vram_addr(&mut ppu, &mut mapper, 0x3F01);
        ppu.write_register(0x2007, 0x21, &mut mapper);
        set_vram_addr(&mut ppu, &mut mapper, 0x3F01);
        assert_eq!(ppu.read_register(0x2007, &mut mapper), 0x21);
    }

    #[test]
    fn palette_mirrors_sprite_backdrop_entries() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Vertical);
        set_vram_addr(&mut ppu, &mut mapper, 0x3F10);
        ppu.write_register(0x2007, 0x2A, &mut mapper);
        set_vram_addr(&mut ppu, &mut mapper, 0x3F00);
        assert_eq!(ppu.read_register(0x2007, &mut mapper), 0x2A);
        assert_eq!(palette_ram_index(0x3F14), 0x04);
        assert_eq!(palette_ram_index(0x3F15), 0x15);
    }

    #[test]
    fn nametable_mirroring_modes() {
        assert_eq!(nametable_index(0x2400, Mirroring::Horizontal), 0x000);
        assert_eq!(nametable_index(0x2800, Mirroring::Horizontal), 0x400);
        assert_eq!(nametable_index(0x2400, Mirroring::Vertical), 0x400);
        assert_eq!(nametable_index(0x2800, Mirroring::Vertical), 0x000);
        assert_eq!(nametable_index(0x2C05, Mirroring::SingleLower), 0x005);
        assert_eq!(nametable_index(0x2005, Mirroring::SingleUpper), 0x405);
        assert_eq!(nametable_index(0x2C00, Mirroring::FourScreen), 0xC00);
        assert_eq!(nametable_index(0x3000, Mirroring::Vertical), 0x000);
    }

    #[test]
    fn sprite_overflow_on_ninth_sprite() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);
        ppu.write_register(0x2003, 0, &mut mapper);
        for i in 0..64u8 {
            let y = if i < 9 { 10 } else { 0xF0 };
            for byte in [y, 0, 0, i] {
                ppu.write_register(0x2004, byte, &mut mapper);
            }
        }
        ppu.write_register(0x2003, 0, &mut mapper);

        while !(ppu.scanline() == 12 && ppu.dot() == 0) {
            ppu.step(&mut mapper);
        }
        assert_ne!(ppu.status() & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn sprite_zero_hit_when_both_opaque() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        // Tile 1: solid low plane.
        for row in 0..8 {
            mapper.ppu_write(0x0010 + row, 0xFF);
        }
        // Whole first nametable uses tile 1.
        set_vram_addr(&mut ppu, &mut mapper, 0x2000);
        for _ in 0..960 {
            ppu.write_register(0x2007, 1, &mut mapper);
        }
        // Sprite 0 at (40, 31) using tile 1.
        ppu.write_register(0x2003, 0, &mut mapper);
        for byte in [30, 1, 0, 40] {
            ppu.write_register(0x2004, byte, &mut mapper);
        }
        for _ in 1..64 {
            for byte in [0xF0, 0, 0, 0] {
                ppu.write_register(0x2004, byte, &mut mapper);
            }
        }
        ppu.write_register(0x2003, 0, &mut mapper);
        set_vram_addr(&mut ppu, &mut mapper, 0x2000);
        ppu.write_register(0x2001, MASK_SHOW_BG | MASK_SHOW_SPRITES | 0x06, &mut mapper);

        // Run past the pre-render line into the visible frame.
        while !ppu.step(&mut mapper) {}
        while !(ppu.scanline() == 40 && ppu.dot() == 0) {
            ppu.step(&mut mapper);
        }
        assert_ne!(ppu.status() & STATUS_SPRITE_ZERO_HIT, 0);
    }

    #[test]
    fn backdrop_fills_frame_when_rendering_disabled() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        set_vram_addr(&mut ppu, &mut mapper, 0x3F00);
        ppu.write_register(0x2007, 0x21, &mut mapper);
        while !ppu.step(&mut mapper) {}
        while !ppu.step(&mut mapper) {}
        assert!(ppu.frame_buffer().iter().all(|&c| c == 0x21));
    }

    fn fill_oam(ppu: &mut Ppu, mapper: &mut Mapper, sprites: &[[u8; 4]]) {
        ppu.write_register(0x2003, 0, mapper);
        for i in 0..64 {
            let sprite = sprites.get(i).copied().unwrap_or([0xF0, 0, 0, 0]);
            for byte in sprite {
                ppu.write_register(0x2004, byte, mapper);
            }
        }
    }

    fn run_to(ppu: &mut Ppu, mapper: &mut Mapper, scanline: u16) {
        while !(ppu.scanline() == scanline && ppu.dot() == 0) {
            ppu.step(mapper);
        }
    }

    #[test]
    fn unaligned_oam_address_wraps_during_evaluation() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);
        // OAM is all zero, so every entry covers lines 0..8.
        ppu.write_register(0x2003, 0xFD, &mut mapper);

        run_to(&mut ppu, &mut mapper, 2);
        assert_eq!(ppu.sprite_count, 8);
        assert_ne!(ppu.status() & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn evaluation_starts_at_oam_address_and_wraps() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        fill_oam(&mut ppu, &mut mapper, &[[10, 0, 0, 5]]);
        ppu.write_register(0x2003, 0x08, &mut mapper);
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);

        run_to(&mut ppu, &mut mapper, 11);
        assert_eq!(ppu.sprite_count, 1);
        // Entry 0 is reached last, 62 entries after $08.
        assert_eq!(ppu.sprite_indices[0], 62);
        assert_eq!(ppu.sprite_x[0], 5);
    }

    #[test]
    fn tall_sprite_vertical_flip_selects_bottom_tile() {
        let mut ppu = Ppu::new();
        let mut mapper = make_mapper(Mirroring::Horizontal);
        // Tile $03: odd index picks the $1000 table, tiles 2 and 3.
        mapper.ppu_write(0x1037, 0xA5);
        mapper.ppu_write(0x103F, 0x3C);
        mapper.ppu_write(0x1020, 0x81);
        fill_oam(&mut ppu, &mut mapper, &[[20, 0x03, 0x80, 0]]);
        ppu.write_register(0x2000, CTRL_SPRITE_SIZE_16, &mut mapper);
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);

        // Top row of the sprite shows the last row of the bottom tile.
        run_to(&mut ppu, &mut mapper, 21);
        assert_eq!(ppu.sprite_count, 1);
        assert_eq!(ppu.sprite_patterns_lo[0], 0xA5);
        assert_eq!(ppu.sprite_patterns_hi[0], 0x3C);

        // Bottom row shows the first row of the top tile.
        run_to(&mut ppu, &mut mapper, 36);
        assert_eq!(ppu.sprite_patterns_lo[0], 0x81);
    }

    #[test]
    fn invariant_check_flags_out_of_range_fields() {
        let mut ppu = Ppu::new();
        assert_eq!(ppu.check_invariants(), Ok(()));
        ppu.sprite_count = 9;
        assert_eq!(ppu.check_invariants(), Err("sprite_count"));

        let mut ppu = Ppu::new();
        ppu.frame_buffer.truncate(100);
        assert_eq!(ppu.check_invariants(), Err("frame_buffer"));
    }
}

#[cfg(test)]
impl Ppu {
    pub(crate) fn force_sprite_count(&mut self, count: usize) {
        self.sprite_count = count;
    }
}
