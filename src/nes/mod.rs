pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod mapper;
pub mod opcodes;
pub mod ppu;
pub mod savestate;

use anyhow::Result;
use log::{info, trace, warn};
use std::{collections::VecDeque, fmt::Write as _, path::Path};

use apu::DMC_DMA_STALL_CYCLES;
use bus::Bus;
use cartridge::{Cartridge, PRG_BANK_SIZE};
use controller::Button;
use cpu::{Cpu, CpuRegisters, IRQ_VECTOR, NMI_VECTOR, RESET_VECTOR};
use mapper::{Mapper, mapper_name};
use ppu::Ppu;

use crate::config::EmulatorConfig;
use crate::error::EmulatorError;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

const MAX_EVENTS: usize = 512;
const FRAME_STEP_GUARD: usize = 10_000_000;

pub type FrameCallback = Box<dyn FnMut(&[u8]) + Send>;
pub type SampleCallback = Box<dyn FnMut(f32) + Send>;

/// The whole console. Cpu, Ppu, Apu and the cartridge advance in lockstep
/// from `step`; nothing in here blocks or spawns.
pub struct Emulator {
    pub(crate) cpu: Cpu,
    pub(crate) bus: Bus,
    frame_count: u64,
    frame_parity: bool,
    frame_callback: Option<FrameCallback>,
    sample_callback: Option<SampleCallback>,
    events: VecDeque<String>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(&EmulatorConfig::default())
    }
}

impl Emulator {
    pub fn new(config: &EmulatorConfig) -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(config.sample_rate),
            frame_count: 0,
            frame_parity: false,
            frame_callback: None,
            sample_callback: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn has_cartridge(&self) -> bool {
        self.bus.mapper.is_some()
    }

    pub fn mapper_name(&self) -> &'static str {
        self.bus
            .mapper
            .as_ref()
            .map_or("No cartridge", |mapper| mapper_name(mapper.id()))
    }

    pub fn frame_buffer(&self) -> &[u8] {
        self.bus.ppu.frame_buffer()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn cpu(&self) -> CpuRegisters {
        self.cpu.registers()
    }

    pub fn ppu(&self) -> &Ppu {
        &self.bus.ppu
    }

    pub fn halted(&self) -> bool {
        self.cpu.halted()
    }

    pub fn set_frame_callback(&mut self, callback: impl FnMut(&[u8]) + Send + 'static) {
        self.frame_callback = Some(Box::new(callback));
    }

    pub fn set_sample_callback(&mut self, callback: impl FnMut(f32) + Send + 'static) {
        self.sample_callback = Some(Box::new(callback));
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.bus.controller.set_button(button, pressed);
    }

    pub fn set_controller_state(&mut self, buttons: u8) {
        self.bus.controller.set_state(buttons);
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.insert_cartridge(cart);
        Ok(())
    }

    pub fn load_rom(&mut self, bytes: &[u8]) -> Result<(), EmulatorError> {
        let cart = Cartridge::from_bytes(bytes)?;
        self.insert_cartridge(cart);
        Ok(())
    }

    /// Installs a cartridge into a powered-off console and resets it.
    pub fn insert_cartridge(&mut self, cart: Cartridge) {
        let name = mapper_name(cart.mapper_id);
        info!(
            "Inserted {name} cartridge (mapper {}, {} KiB PRG, {} KiB CHR{})",
            cart.mapper_id,
            cart.prg_rom.len() / 1024,
            cart.chr_data.len() / 1024,
            if cart.chr_is_ram { " RAM" } else { "" },
        );
        self.bus.mapper = Some(Mapper::new(cart));
        self.bus.ram = [0; bus::RAM_SIZE];
        self.frame_count = 0;
        self.events.clear();
        self.push_event(format!("Cartridge inserted: {name}"));
        self.power_cycle();
    }

    /// Ejects the cartridge and drops all mapper state with it.
    pub fn remove_cartridge(&mut self) {
        if self.bus.mapper.take().is_some() {
            info!("Cartridge removed");
            self.push_event("Cartridge removed");
        }
    }

    /// Soft reset. Work RAM survives; every chip returns to power-on state.
    pub fn reset(&mut self) -> Result<(), EmulatorError> {
        if !self.has_cartridge() {
            return Err(EmulatorError::NoCartridge);
        }
        self.power_cycle();
        Ok(())
    }

    fn power_cycle(&mut self) {
        self.frame_parity = false;
        self.bus.ppu.reset();
        self.bus.apu.reset();
        self.cpu.reset(&mut self.bus);
        info!("Reset, PC=${:04X}", self.cpu.registers().pc);
        self.push_event(format!("CPU reset, PC=${:04X}", self.cpu.registers().pc));
    }

    /// One CPU step followed by the matching PPU dots and APU cycles.
    pub fn step(&mut self) -> Result<u32, EmulatorError> {
        if !self.has_cartridge() {
            return Err(EmulatorError::NoCartridge);
        }

        let was_halted = self.cpu.halted();
        let cycles = self.cpu.step(&mut self.bus);
        if self.cpu.halted() && !was_halted {
            self.push_event(format!("CPU halted at ${:04X}", self.cpu.registers().pc));
        }

        for _ in 0..cycles {
            self.clock_devices();
        }
        self.cpu.set_irq(self.bus.irq_line());
        Ok(cycles)
    }

    /// Runs until the PPU finishes the current frame.
    pub fn step_frame(&mut self) -> Result<(), EmulatorError> {
        let parity = self.frame_parity;
        for _ in 0..FRAME_STEP_GUARD {
            self.step()?;
            if self.frame_parity != parity {
                return Ok(());
            }
        }
        warn!("Frame did not complete within {FRAME_STEP_GUARD} CPU steps");
        self.push_event(format!("Frame guard tripped at {FRAME_STEP_GUARD} CPU steps"));
        Ok(())
    }

    fn clock_devices(&mut self) {
        for _ in 0..3 {
            if self.bus.step_ppu() {
                self.complete_frame();
            }
            if self.bus.ppu.take_nmi() {
                self.cpu.trigger_nmi();
                trace!(
                    "NMI at scanline {} dot {}",
                    self.bus.ppu.scanline(),
                    self.bus.ppu.dot()
                );
            }
        }

        if let Some(sample) = self.bus.apu.step() {
            if let Some(callback) = self.sample_callback.as_mut() {
                callback(sample);
            }
        }

        if let Some(addr) = self.bus.apu.take_dmc_dma_request() {
            let value = self.bus.peek(addr);
            self.bus.apu.complete_dmc_dma(value);
            self.cpu.add_idle_cycles(DMC_DMA_STALL_CYCLES);
            trace!("DMC DMA ${addr:04X} -> ${value:02X}");
        }
    }

    fn complete_frame(&mut self) {
        self.frame_count += 1;
        self.frame_parity = !self.frame_parity;
        if let Some(callback) = self.frame_callback.as_mut() {
            callback(self.bus.ppu.frame_buffer());
        }
    }

    /// Latest events first.
    pub fn recent_events(&self, limit: usize) -> Vec<String> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    pub(crate) fn push_event<S: Into<String>>(&mut self, event: S) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event.into());
    }

    /// Linear listing of the installed PRG-ROM, headed by the CPU vectors.
    ///
    /// Up to 32 KiB the PRG is shown where it sits in the CPU window. Larger
    /// images are listed per 16 KiB bank under a `; bank N` marker; the last
    /// bank is addressed from $C000 and the others from $8000, which is where
    /// the fixed-last-bank layouts put them. Instructions are decoded across
    /// bank boundaries without resynchronizing.
    pub fn disassemble(&self) -> Result<String, EmulatorError> {
        let mapper = self.bus.mapper.as_ref().ok_or(EmulatorError::NoCartridge)?;
        let vector = |addr: u16| {
            u16::from_le_bytes([mapper.cpu_read(addr), mapper.cpu_read(addr.wrapping_add(1))])
        };
        let reset = vector(RESET_VECTOR);

        let mut out = String::new();
        let _ = writeln!(out, "; NMI vector:   ${:04X}", vector(NMI_VECTOR));
        let _ = writeln!(out, "; RESET vector: ${reset:04X}");
        let _ = writeln!(out, "; IRQ vector:   ${:04X}", vector(IRQ_VECTOR));
        out.push('\n');

        let prg = mapper.prg_rom();
        let banked = prg.len() > 2 * PRG_BANK_SIZE;
        let last_bank = prg.len().saturating_sub(1) / PRG_BANK_SIZE;
        let mut base = 0x8000 + (prg.len() % 0x8000) as u16;
        if reset < base {
            base = 0x8000;
        }

        let mut offset = 0usize;
        let mut previous = None;
        let mut current_bank = None;
        while offset < prg.len() {
            let opcode = prg[offset];
            if opcode == 0 && previous == Some(0) {
                break;
            }
            previous = Some(opcode);
            let size = opcodes::instruction_size(opcode);
            let end = (offset + size).min(prg.len());
            let pc = if banked {
                let bank = offset / PRG_BANK_SIZE;
                if current_bank != Some(bank) {
                    current_bank = Some(bank);
                    let _ = writeln!(out, "; bank {bank} (PRG ${offset:05X})");
                }
                let window = if bank == last_bank { 0xC000 } else { 0x8000 };
                window + (offset % PRG_BANK_SIZE) as u16
            } else {
                base.wrapping_add(offset as u16)
            };
            let _ = writeln!(out, "{}", opcodes::disassemble_one(&prg[offset..end], pc));
            offset += size;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::rom_with_program;
    use std::sync::{Arc, Mutex};

    fn emulator_with(program: &[u8]) -> Emulator {
        let mut emu = Emulator::default();
        emu.load_rom(&rom_with_program(program)).unwrap();
        emu
    }

    #[test]
    fn stepping_without_cartridge_is_an_error() {
        let mut emu = Emulator::default();
        assert!(matches!(emu.step(), Err(EmulatorError::NoCartridge)));
        assert!(matches!(emu.step_frame(), Err(EmulatorError::NoCartridge)));
        assert!(matches!(emu.reset(), Err(EmulatorError::NoCartridge)));
        assert!(matches!(emu.disassemble(), Err(EmulatorError::NoCartridge)));
    }

    #[test]
    fn rejects_bad_rom_before_installing() {
        let mut emu = Emulator::default();
        assert!(matches!(
            emu.load_rom(b"not a rom at all"),
            Err(EmulatorError::Cartridge(_))
        ));
        assert!(!emu.has_cartridge());
    }

    #[test]
    fn step_frame_fires_one_frame_callback() {
        // JMP $8000
        let mut emu = emulator_with(&[0x4C, 0x00, 0x80]);
        let frames = Arc::new(Mutex::new(0usize));
        let seen = Arc::clone(&frames);
        emu.set_frame_callback(move |buffer| {
            assert_eq!(buffer.len(), ppu::FRAME_WIDTH * ppu::FRAME_HEIGHT);
            *seen.lock().unwrap() += 1;
        });

        emu.step_frame().unwrap();
        emu.step_frame().unwrap();
        assert_eq!(*frames.lock().unwrap(), 2);
        assert_eq!(emu.frame_count(), 2);
    }

    #[test]
    fn samples_are_delivered_through_callback() {
        let mut emu = emulator_with(&[0x4C, 0x00, 0x80]);
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&samples);
        emu.set_sample_callback(move |sample| sink.lock().unwrap().push(sample));
        emu.step_frame().unwrap();
        // About 735 samples per frame at 44.1 kHz.
        let count = samples.lock().unwrap().len();
        assert!((700..=760).contains(&count), "got {count}");
    }

    #[test]
    fn vblank_nmi_reaches_cpu() {
        // LDA #$80; STA $2000; loop: JMP loop. NMI handler at $9000: INX; RTI.
        let mut image = rom_with_program(&[0xA9, 0x80, 0x8D, 0x00, 0x20, 0x4C, 0x05, 0x80]);
        image[16 + 0x1000] = 0xE8;
        image[16 + 0x1001] = 0x40;
        let mut emu = Emulator::default();
        emu.load_rom(&image).unwrap();
        for _ in 0..3 {
            emu.step_frame().unwrap();
        }
        assert!(emu.cpu().x >= 2);
    }

    #[test]
    fn stp_keeps_frames_running() {
        let mut emu = emulator_with(&[0x02]);
        emu.step_frame().unwrap();
        assert!(emu.halted());
        assert_eq!(emu.frame_count(), 1);
        assert!(
            emu.recent_events(4)
                .iter()
                .any(|event| event.contains("halted"))
        );

        emu.reset().unwrap();
        assert!(!emu.halted());
    }

    #[test]
    fn reset_keeps_ram_and_insert_clears_it() {
        let mut emu = emulator_with(&[0xA9, 0x42, 0x85, 0x10, 0x4C, 0x04, 0x80]);
        emu.step().unwrap();
        emu.step().unwrap();
        assert_eq!(emu.bus.peek(0x0010), 0x42);

        emu.reset().unwrap();
        assert_eq!(emu.bus.peek(0x0010), 0x42);
        assert_eq!(emu.cpu().pc, 0x8000);

        emu.load_rom(&rom_with_program(&[0xEA])).unwrap();
        assert_eq!(emu.bus.peek(0x0010), 0x00);
    }

    #[test]
    fn remove_cartridge_then_reinsert() {
        let mut emu = emulator_with(&[0x4C, 0x00, 0x80]);
        emu.step_frame().unwrap();
        emu.remove_cartridge();
        assert!(!emu.has_cartridge());
        assert!(emu.step().is_err());

        emu.load_rom(&rom_with_program(&[0x4C, 0x00, 0x80])).unwrap();
        assert_eq!(emu.frame_count(), 0);
        emu.step_frame().unwrap();
        assert_eq!(emu.frame_count(), 1);
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut emu = Emulator::default();
        for i in 0..(MAX_EVENTS + 10) {
            emu.push_event(format!("event {i}"));
        }
        let events = emu.recent_events(usize::MAX);
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0], format!("event {}", MAX_EVENTS + 9));
        assert!(emu.recent_events(0).is_empty());
    }

    #[test]
    fn large_prg_listing_is_labelled_by_bank() {
        // 64K UxROM: bank 0 starts with LDA #$01, fixed bank 3 with JMP $C000.
        let mut prg = vec![0xEA; 4 * PRG_BANK_SIZE];
        prg[..2].copy_from_slice(&[0xA9, 0x01]);
        prg[3 * PRG_BANK_SIZE..3 * PRG_BANK_SIZE + 3].copy_from_slice(&[0x4C, 0x00, 0xC0]);
        let reset = prg.len() - 4;
        prg[reset..reset + 2].copy_from_slice(&[0x00, 0xC0]);
        let mut emu = Emulator::default();
        emu.load_rom(&cartridge::build_ines(2, 0, &prg, &[])).unwrap();

        let listing = emu.disassemble().unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines[1], "; RESET vector: $C000");
        assert_eq!(lines[4], "; bank 0 (PRG $00000)");
        assert_eq!(lines[5], "$8000  A9 01     LDA #$01");
        assert!(lines.contains(&"; bank 1 (PRG $04000)"));
        let fixed = lines
            .iter()
            .position(|line| *line == "; bank 3 (PRG $0C000)")
            .unwrap();
        assert_eq!(lines[fixed + 1], "$C000  4C 00 C0  JMP $C000");
    }

    #[test]
    fn disassembly_listing() {
        // LDA #$01; STA $0200; BRK; BRK. The second BRK ends the walk.
        let emu = emulator_with(&[0xA9, 0x01, 0x8D, 0x00, 0x02, 0x00, 0x00]);
        let listing = emu.disassemble().unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines[0], "; NMI vector:   $9000");
        assert_eq!(lines[1], "; RESET vector: $8000");
        assert_eq!(lines[2], "; IRQ vector:   $9100");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "$8000  A9 01     LDA #$01");
        assert_eq!(lines[5], "$8002  8D 00 02  STA $0200");
        assert_eq!(lines[6], "$8005  00        BRK");
        assert_eq!(lines.len(), 7);
    }
}
