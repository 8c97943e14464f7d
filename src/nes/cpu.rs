use bincode::{Decode, Encode};
use log::warn;

use super::bus::Bus;
use super::opcodes::{AddressingMode, CYCLES, MNEMONICS, MODES, Mnemonic, PAGE_CYCLES, SIZES};
use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

const INTERRUPT_CYCLES: u32 = 7;
const STP_CYCLES: u32 = 2;
const OAM_DMA_CYCLES: u32 = 513;

/// Register snapshot for hosts and debuggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub sp: u8,
    pub pc: u16,
    pub cycles: u64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Cpu {
    a: u8,
    x: u8,
    y: u8,
    p: u8,
    sp: u8,
    pc: u16,
    cycles: u64,
    idle_cycles: u32,
    nmi_pending: bool,
    irq_pending: bool,
    halted: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            cycles: 0,
            idle_cycles: 0,
            nmi_pending: false,
            irq_pending: false,
            halted: false,
        }
    }

    pub fn reset(&mut self, bus: &mut Bus) {
        self.sp = 0xFD;
        self.p = FLAG_INTERRUPT | FLAG_UNUSED;
        self.cycles = 0;
        self.idle_cycles = 0;
        self.nmi_pending = false;
        self.irq_pending = false;
        self.halted = false;
        self.pc = bus.read_u16(RESET_VECTOR);
    }

    pub fn registers(&self) -> CpuRegisters {
        CpuRegisters {
            a: self.a,
            x: self.x,
            y: self.y,
            p: self.p,
            sp: self.sp,
            pc: self.pc,
            cycles: self.cycles,
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn trigger_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Drives the level-sensitive IRQ input.
    pub fn set_irq(&mut self, level: bool) {
        self.irq_pending = level;
    }

    pub fn add_idle_cycles(&mut self, cycles: u32) {
        self.idle_cycles = self.idle_cycles.saturating_add(cycles);
    }

    /// Runs one idle cycle, or services a pending interrupt and executes
    /// one instruction. Returns the CPU cycles consumed.
    pub fn step(&mut self, bus: &mut Bus) -> u32 {
        if self.idle_cycles > 0 {
            self.idle_cycles -= 1;
            self.cycles += 1;
            return 1;
        }

        if self.halted {
            self.cycles += STP_CYCLES as u64;
            return STP_CYCLES;
        }

        let mut cycles = 0;

        if self.nmi_pending {
            self.nmi_pending = false;
            self.interrupt(bus, NMI_VECTOR);
            cycles += INTERRUPT_CYCLES;
        } else if self.irq_pending && !self.get_flag(FLAG_INTERRUPT) {
            self.interrupt(bus, IRQ_VECTOR);
            cycles += INTERRUPT_CYCLES;
        }

        cycles += self.execute(bus);
        self.cycles += cycles as u64;

        // Parity is taken after the triggering instruction has been charged.
        if bus.take_oam_dma() {
            self.idle_cycles += OAM_DMA_CYCLES + (self.cycles & 1) as u32;
        }
        cycles
    }

    fn execute(&mut self, bus: &mut Bus) -> u32 {
        let opcode_pc = self.pc;
        let opcode = bus.read(opcode_pc) as usize;
        let mode = MODES[opcode];
        let (addr, page_crossed) = self.resolve(bus, mode);
        self.pc = self.pc.wrapping_add(SIZES[opcode] as u16);

        let mut cycles = CYCLES[opcode] as u32;
        if page_crossed && mode != AddressingMode::Relative {
            cycles += PAGE_CYCLES[opcode] as u32;
        }

        cycles + self.dispatch(bus, MNEMONICS[opcode], mode, addr, page_crossed, opcode_pc)
    }

    /// Effective address for `mode` and whether indexing crossed a page.
    /// Relative resolves to the branch target.
    fn resolve(&mut self, bus: &mut Bus, mode: AddressingMode) -> (u16, bool) {
        let operand = self.pc.wrapping_add(1);
        match mode {
            AddressingMode::Implicit | AddressingMode::Accumulator => (0, false),
            AddressingMode::Immediate => (operand, false),
            AddressingMode::ZeroPage => (bus.read(operand) as u16, false),
            AddressingMode::ZeroPageX => (bus.read(operand).wrapping_add(self.x) as u16, false),
            AddressingMode::ZeroPageY => (bus.read(operand).wrapping_add(self.y) as u16, false),
            AddressingMode::Relative => {
                let offset = bus.read(operand) as i8;
                let next = self.pc.wrapping_add(2);
                let target = next.wrapping_add(offset as i16 as u16);
                (target, crosses_page(next, target))
            }
            AddressingMode::Absolute => (bus.read_u16(operand), false),
            AddressingMode::AbsoluteX => indexed(bus.read_u16(operand), self.x),
            AddressingMode::AbsoluteY => indexed(bus.read_u16(operand), self.y),
            AddressingMode::Indirect => {
                let ptr = bus.read_u16(operand);
                (bus.read_u16_wrapped(ptr), false)
            }
            AddressingMode::IndexedIndirect => {
                let zp = bus.read(operand).wrapping_add(self.x);
                (read_zp_u16(bus, zp), false)
            }
            AddressingMode::IndirectIndexed => {
                let zp = bus.read(operand);
                indexed(read_zp_u16(bus, zp), self.y)
            }
        }
    }

    /// Executes the operation and returns any cycles beyond the table cost.
    fn dispatch(
        &mut self,
        bus: &mut Bus,
        mnemonic: Mnemonic,
        mode: AddressingMode,
        addr: u16,
        page_crossed: bool,
        opcode_pc: u16,
    ) -> u32 {
        match mnemonic {
            Mnemonic::Adc => {
                let value = self.load(bus, mode, addr);
                self.adc(value);
            }
            Mnemonic::Sbc => {
                let value = self.load(bus, mode, addr);
                self.sbc(value);
            }
            Mnemonic::And => {
                self.a &= self.load(bus, mode, addr);
                self.update_zn(self.a);
            }
            Mnemonic::Ora => {
                self.a |= self.load(bus, mode, addr);
                self.update_zn(self.a);
            }
            Mnemonic::Eor => {
                self.a ^= self.load(bus, mode, addr);
                self.update_zn(self.a);
            }
            Mnemonic::Bit => {
                let value = self.load(bus, mode, addr);
                self.bit(value);
            }
            Mnemonic::Cmp => {
                let value = self.load(bus, mode, addr);
                self.compare(self.a, value);
            }
            Mnemonic::Cpx => {
                let value = self.load(bus, mode, addr);
                self.compare(self.x, value);
            }
            Mnemonic::Cpy => {
                let value = self.load(bus, mode, addr);
                self.compare(self.y, value);
            }

            Mnemonic::Lda => {
                self.a = self.load(bus, mode, addr);
                self.update_zn(self.a);
            }
            Mnemonic::Ldx => {
                self.x = self.load(bus, mode, addr);
                self.update_zn(self.x);
            }
            Mnemonic::Ldy => {
                self.y = self.load(bus, mode, addr);
                self.update_zn(self.y);
            }
            Mnemonic::Sta => bus.write(addr, self.a),
            Mnemonic::Stx => bus.write(addr, self.x),
            Mnemonic::Sty => bus.write(addr, self.y),

            Mnemonic::Asl => self.modify(bus, mode, addr, Self::asl),
            Mnemonic::Lsr => self.modify(bus, mode, addr, Self::lsr),
            Mnemonic::Rol => self.modify(bus, mode, addr, Self::rol),
            Mnemonic::Ror => self.modify(bus, mode, addr, Self::ror),
            Mnemonic::Inc => self.modify(bus, mode, addr, |cpu, v| {
                let out = v.wrapping_add(1);
                cpu.update_zn(out);
                out
            }),
            Mnemonic::Dec => self.modify(bus, mode, addr, |cpu, v| {
                let out = v.wrapping_sub(1);
                cpu.update_zn(out);
                out
            }),

            Mnemonic::Inx => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            Mnemonic::Iny => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            Mnemonic::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
            }
            Mnemonic::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }
            Mnemonic::Tax => {
                self.x = self.a;
                self.update_zn(self.x);
            }
            Mnemonic::Tay => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            Mnemonic::Txa => {
                self.a = self.x;
                self.update_zn(self.a);
            }
            Mnemonic::Tya => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            Mnemonic::Tsx => {
                self.x = self.sp;
                self.update_zn(self.x);
            }
            Mnemonic::Txs => self.sp = self.x,

            Mnemonic::Clc => self.set_flag(FLAG_CARRY, false),
            Mnemonic::Sec => self.set_flag(FLAG_CARRY, true),
            Mnemonic::Cli => self.set_flag(FLAG_INTERRUPT, false),
            Mnemonic::Sei => self.set_flag(FLAG_INTERRUPT, true),
            Mnemonic::Cld => self.set_flag(FLAG_DECIMAL, false),
            Mnemonic::Sed => self.set_flag(FLAG_DECIMAL, true),
            Mnemonic::Clv => self.set_flag(FLAG_OVERFLOW, false),

            Mnemonic::Bcc => return self.branch(!self.get_flag(FLAG_CARRY), addr, page_crossed),
            Mnemonic::Bcs => return self.branch(self.get_flag(FLAG_CARRY), addr, page_crossed),
            Mnemonic::Bne => return self.branch(!self.get_flag(FLAG_ZERO), addr, page_crossed),
            Mnemonic::Beq => return self.branch(self.get_flag(FLAG_ZERO), addr, page_crossed),
            Mnemonic::Bpl => {
                return self.branch(!self.get_flag(FLAG_NEGATIVE), addr, page_crossed);
            }
            Mnemonic::Bmi => return self.branch(self.get_flag(FLAG_NEGATIVE), addr, page_crossed),
            Mnemonic::Bvc => {
                return self.branch(!self.get_flag(FLAG_OVERFLOW), addr, page_crossed);
            }
            Mnemonic::Bvs => return self.branch(self.get_flag(FLAG_OVERFLOW), addr, page_crossed),

            Mnemonic::Jmp => self.pc = addr,
            Mnemonic::Jsr => {
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = addr;
            }
            Mnemonic::Rts => self.pc = self.pop_u16(bus).wrapping_add(1),
            Mnemonic::Rti => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus);
            }
            Mnemonic::Brk => {
                self.push_u16(bus, self.pc.wrapping_add(1));
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = bus.read_u16(IRQ_VECTOR);
            }
            Mnemonic::Pha => self.push(bus, self.a),
            Mnemonic::Php => self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED),
            Mnemonic::Pla => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            Mnemonic::Plp => self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED,

            Mnemonic::Nop => {}
            Mnemonic::Stp => {
                self.pc = opcode_pc;
                if !self.halted {
                    warn!("CPU halted by STP at ${opcode_pc:04X}");
                }
                self.halted = true;
                return STP_CYCLES;
            }

            Mnemonic::Slo => self.modify(bus, mode, addr, |cpu, v| {
                let out = cpu.asl(v);
                cpu.a |= out;
                cpu.update_zn(cpu.a);
                out
            }),
            Mnemonic::Rla => self.modify(bus, mode, addr, |cpu, v| {
                let out = cpu.rol(v);
                cpu.a &= out;
                cpu.update_zn(cpu.a);
                out
            }),
            Mnemonic::Sre => self.modify(bus, mode, addr, |cpu, v| {
                let out = cpu.lsr(v);
                cpu.a ^= out;
                cpu.update_zn(cpu.a);
                out
            }),
            Mnemonic::Rra => self.modify(bus, mode, addr, |cpu, v| {
                let out = cpu.ror(v);
                cpu.adc(out);
                out
            }),
            Mnemonic::Dcp => self.modify(bus, mode, addr, |cpu, v| {
                let out = v.wrapping_sub(1);
                cpu.compare(cpu.a, out);
                out
            }),
            Mnemonic::Isc => self.modify(bus, mode, addr, |cpu, v| {
                let out = v.wrapping_add(1);
                cpu.sbc(out);
                out
            }),
            Mnemonic::Lax => {
                let value = self.load(bus, mode, addr);
                self.a = value;
                self.x = value;
                self.update_zn(value);
            }
            Mnemonic::Sax => bus.write(addr, self.a & self.x),
            Mnemonic::Anc => {
                self.a &= self.load(bus, mode, addr);
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x80) != 0);
            }
            Mnemonic::Alr => {
                self.a &= self.load(bus, mode, addr);
                self.a = self.lsr(self.a);
            }
            Mnemonic::Arr => {
                let value = self.load(bus, mode, addr);
                let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.a = ((self.a & value) >> 1) | carry_in;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x40) != 0);
                self.set_flag(
                    FLAG_OVERFLOW,
                    (((self.a >> 6) & 0x01) ^ ((self.a >> 5) & 0x01)) != 0,
                );
            }
            Mnemonic::Axs => {
                let value = self.load(bus, mode, addr);
                let in_ax = self.a & self.x;
                self.set_flag(FLAG_CARRY, in_ax >= value);
                self.x = in_ax.wrapping_sub(value);
                self.update_zn(self.x);
            }
            Mnemonic::Xaa => {
                let value = self.load(bus, mode, addr);
                self.a = (self.a | 0xEE) & self.x & value;
                self.update_zn(self.a);
            }
            Mnemonic::Las => {
                let value = self.load(bus, mode, addr) & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.update_zn(value);
            }
            Mnemonic::Tas => {
                self.sp = self.a & self.x;
                bus.write(addr, self.sp & high_byte_plus_one(addr));
            }
            Mnemonic::Ahx => bus.write(addr, self.a & self.x & high_byte_plus_one(addr)),
            Mnemonic::Shx => bus.write(addr, self.x & high_byte_plus_one(addr)),
            Mnemonic::Shy => bus.write(addr, self.y & high_byte_plus_one(addr)),
        }
        0
    }

    fn interrupt(&mut self, bus: &mut Bus, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, (self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = bus.read_u16(vector);
    }

    fn load(&mut self, bus: &mut Bus, mode: AddressingMode, addr: u16) -> u8 {
        match mode {
            AddressingMode::Accumulator => self.a,
            _ => bus.read(addr),
        }
    }

    /// Read-modify-write on the accumulator or memory.
    fn modify(
        &mut self,
        bus: &mut Bus,
        mode: AddressingMode,
        addr: u16,
        op: impl FnOnce(&mut Self, u8) -> u8,
    ) {
        let value = self.load(bus, mode, addr);
        let out = op(self, value);
        match mode {
            AddressingMode::Accumulator => self.a = out,
            _ => bus.write(addr, out),
        }
    }

    fn branch(&mut self, condition: bool, target: u16, page_crossed: bool) -> u32 {
        if !condition {
            return 0;
        }
        self.pc = target;
        1 + u32::from(page_crossed)
    }

    fn push(&mut self, bus: &mut Bus, value: u8) {
        bus.write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut Bus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_u16(&mut self, bus: &mut Bus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16(&mut self, bus: &mut Bus) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    fn adc(&mut self, value: u8) {
        let carry_in = u16::from(self.get_flag(FLAG_CARRY));
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.get_flag(FLAG_CARRY));
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

fn crosses_page(a: u16, b: u16) -> bool {
    (a & 0xFF00) != (b & 0xFF00)
}

fn indexed(base: u16, index: u8) -> (u16, bool) {
    let addr = base.wrapping_add(index as u16);
    (addr, crosses_page(base, addr))
}

fn read_zp_u16(bus: &mut Bus, addr: u8) -> u16 {
    let lo = bus.read(addr as u16) as u16;
    let hi = bus.read(addr.wrapping_add(1) as u16) as u16;
    (hi << 8) | lo
}

fn high_byte_plus_one(addr: u16) -> u8 {
    ((addr >> 8) as u8).wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::{Cartridge, rom_with_program};
    use crate::nes::mapper::Mapper;

    fn setup(program: &[u8]) -> (Cpu, Bus) {
        setup_with(program, |_| {})
    }

    fn setup_with(program: &[u8], patch: impl FnOnce(&mut Vec<u8>)) -> (Cpu, Bus) {
        let mut image = rom_with_program(program);
        patch(&mut image);
        let cart = Cartridge::from_bytes(&image).unwrap();
        let mut bus = Bus::new(44_100);
        bus.mapper = Some(Mapper::new(cart));
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    /// Offset of CPU address `addr` inside the iNES image built by
    /// `rom_with_program` (16-byte header, 32K PRG at $8000).
    fn image_offset(addr: u16) -> usize {
        16 + (addr - 0x8000) as usize
    }

    #[test]
    fn reset_state() {
        let (cpu, _) = setup(&[0xEA]);
        let regs = cpu.registers();
        assert_eq!(regs.pc, 0x8000);
        assert_eq!(regs.sp, 0xFD);
        assert_eq!(regs.p, 0x24);
        assert_eq!(regs.cycles, 0);
        assert!(!cpu.halted());
    }

    #[test]
    fn lda_then_adc() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x05, 0x69, 0x03]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.step(&mut bus), 2);
        let regs = cpu.registers();
        assert_eq!(regs.a, 0x08);
        assert_eq!(regs.p & (FLAG_CARRY | FLAG_ZERO | FLAG_NEGATIVE), 0);
    }

    #[test]
    fn adc_sets_overflow_and_sbc_borrows() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x50, 0x69, 0x50, 0x38, 0xA9, 0x05, 0xE9, 0x07]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        let regs = cpu.registers();
        assert_eq!(regs.a, 0xA0);
        assert_ne!(regs.p & FLAG_OVERFLOW, 0);
        assert_ne!(regs.p & FLAG_NEGATIVE, 0);

        cpu.step(&mut bus);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        let regs = cpu.registers();
        assert_eq!(regs.a, 0xFE);
        assert_eq!(regs.p & FLAG_CARRY, 0);
    }

    #[test]
    fn inc_wraps_memory_to_zero() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0xFF, 0x85, 0x10, 0xE6, 0x10]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(bus.read(0x0010), 0x00);
        assert_ne!(cpu.registers().p & FLAG_ZERO, 0);
    }

    #[test]
    fn jsr_rts_round_trip() {
        let (mut cpu, mut bus) = setup_with(&[0x20, 0x00, 0x90, 0xEA], |image| {
            image[image_offset(0x9000)] = 0x60;
        });
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.registers().pc, 0x9000);
        assert_eq!(cpu.registers().sp, 0xFB);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.registers().pc, 0x8003);
        assert_eq!(cpu.registers().sp, 0xFD);
    }

    #[test]
    fn indexed_read_page_cross_costs_a_cycle() {
        let (mut cpu, mut bus) = setup(&[0xA2, 0x01, 0xBD, 0xFF, 0x80, 0xBD, 0x00, 0x80]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.step(&mut bus), 4);
    }

    #[test]
    fn branch_timing() {
        // BNE +2 taken, then BEQ not taken.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x01, 0xD0, 0x00, 0xF0, 0x10]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 3);
        assert_eq!(cpu.registers().pc, 0x8004);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.registers().pc, 0x8006);
    }

    #[test]
    fn branch_across_page_costs_two_extra() {
        let (mut cpu, mut bus) = setup_with(&[0x4C, 0xF0, 0x80], |image| {
            // $80F0: BNE +$20 with Z clear lands on $8112.
            image[image_offset(0x80F0)] = 0xD0;
            image[image_offset(0x80F1)] = 0x20;
        });
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.registers().pc, 0x8112);
    }

    #[test]
    fn indirect_jmp_wraps_within_page() {
        let (mut cpu, mut bus) = setup(&[0x6C, 0xFF, 0x02]);
        bus.write(0x02FF, 0x34);
        bus.write(0x0200, 0x12);
        bus.write(0x0300, 0x56);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.registers().pc, 0x1234);
    }

    #[test]
    fn brk_pushes_return_and_rti_restores() {
        let (mut cpu, mut bus) = setup_with(&[0x00, 0xEA, 0xEA], |image| {
            image[image_offset(0x9100)] = 0x40;
        });
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.registers().pc, 0x9100);
        assert_eq!(bus.read(0x01FD), 0x80);
        assert_eq!(bus.read(0x01FC), 0x02);
        assert_eq!(bus.read(0x01FB) & (FLAG_BREAK | FLAG_UNUSED), 0x30);
        assert_ne!(cpu.registers().p & FLAG_INTERRUPT, 0);

        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.registers().pc, 0x8002);
        assert_eq!(cpu.registers().p & FLAG_BREAK, 0);
    }

    #[test]
    fn nmi_serviced_before_next_instruction() {
        let (mut cpu, mut bus) = setup_with(&[0xEA], |image| {
            image[image_offset(0x9000)] = 0xE8;
        });
        cpu.trigger_nmi();
        assert_eq!(cpu.step(&mut bus), 7 + 2);
        assert_eq!(cpu.registers().pc, 0x9001);
        assert_eq!(cpu.registers().x, 1);
        assert_eq!(bus.read(0x01FB) & FLAG_BREAK, 0);
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        let (mut cpu, mut bus) = setup_with(&[0xEA, 0x58, 0xEA], |image| {
            image[image_offset(0x9100)] = 0xEA;
        });
        cpu.set_irq(true);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().pc, 0x8001);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().pc, 0x8002);
        assert_eq!(cpu.step(&mut bus), 7 + 2);
        assert_eq!(cpu.registers().pc, 0x9101);
    }

    #[test]
    fn oam_dma_stall_depends_on_cycle_parity() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x02, 0x8D, 0x14, 0x40]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.idle_cycles, 513);
        let mut stalled = 0;
        while cpu.idle_cycles > 0 {
            assert_eq!(cpu.step(&mut bus), 1);
            stalled += 1;
        }
        assert_eq!(stalled, 513);

        let (mut cpu, mut bus) = setup(&[0xA5, 0x00, 0x8D, 0x14, 0x40]);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().cycles, 3);
        cpu.step(&mut bus);
        assert_eq!(cpu.idle_cycles, 514);

        // LDX #$14; LDA #$02; STA $4000,X: the 5-cycle store ends on cycle 9.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x14, 0xA9, 0x02, 0x9D, 0x00, 0x40]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.registers().cycles, 9);
        assert_eq!(cpu.idle_cycles, 514);
    }

    #[test]
    fn stp_halts_in_place() {
        let (mut cpu, mut bus) = setup(&[0x02, 0xEA]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert!(cpu.halted());
        assert_eq!(cpu.registers().pc, 0x8000);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.registers().pc, 0x8000);

        cpu.reset(&mut bus);
        assert!(!cpu.halted());
    }

    #[test]
    fn stack_ops_and_flags() {
        // LDA #$80; PHA; LDA #$00; PLA; PHP; PLP
        let (mut cpu, mut bus) = setup(&[0xA9, 0x80, 0x48, 0xA9, 0x00, 0x68, 0x08, 0x28]);
        for _ in 0..4 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.registers().a, 0x80);
        assert_ne!(cpu.registers().p & FLAG_NEGATIVE, 0);
        cpu.step(&mut bus);
        assert_eq!(bus.read(0x01FD) & FLAG_BREAK, FLAG_BREAK);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().p & FLAG_BREAK, 0);
        assert_eq!(cpu.registers().sp, 0xFD);
    }

    #[test]
    fn undocumented_lax_sax_dcp_axs() {
        let (mut cpu, mut bus) = setup(&[
            0xA7, 0x20, // LAX $20
            0x87, 0x21, // SAX $21
            0xC7, 0x22, // DCP $22
            0xA9, 0x0F, // LDA #$0F
            0xA2, 0x3C, // LDX #$3C
            0xCB, 0x04, // AXS #$04
        ]);
        bus.write(0x0020, 0x5A);
        bus.write(0x0022, 0x5B);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0x5A);
        assert_eq!(cpu.registers().x, 0x5A);
        cpu.step(&mut bus);
        assert_eq!(bus.read(0x0021), 0x5A);
        cpu.step(&mut bus);
        assert_eq!(bus.read(0x0022), 0x5A);
        assert_ne!(cpu.registers().p & FLAG_ZERO, 0);
        assert_ne!(cpu.registers().p & FLAG_CARRY, 0);

        cpu.step(&mut bus);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().x, 0x08);
        assert_ne!(cpu.registers().p & FLAG_CARRY, 0);
    }

    #[test]
    fn shift_ops_on_accumulator() {
        // LDA #$81; ASL A; ROR A
        let (mut cpu, mut bus) = setup(&[0xA9, 0x81, 0x0A, 0x6A]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0x02);
        assert_ne!(cpu.registers().p & FLAG_CARRY, 0);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0x81);
        assert_eq!(cpu.registers().p & FLAG_CARRY, 0);
    }
}
