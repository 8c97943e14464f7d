use bincode::{Decode, Encode};
use std::f32::consts::PI;

pub const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const MIN_SAMPLE_RATE: u32 = 8_000;

/// DMC sample fetches steal this many CPU cycles.
pub const DMC_DMA_STALL_CYCLES: u32 = 4;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

const FC_4STEP_Q1: u32 = 7_457;
const FC_4STEP_Q2_H2: u32 = 14_913;
const FC_4STEP_Q3: u32 = 22_371;
const FC_4STEP_Q4_H4_IRQ: u32 = 29_829;
const FC_4STEP_RESET: u32 = 29_830;

const FC_5STEP_Q1: u32 = 7_457;
const FC_5STEP_Q2_H2: u32 = 14_913;
const FC_5STEP_Q3: u32 = 22_371;
const FC_5STEP_Q4_H4: u32 = 37_281;
const FC_5STEP_RESET: u32 = 37_282;

/// Non-linear pulse mixer, indexed by `pulse1 + pulse2`.
pub const PULSE_TABLE: [f32; 31] = {
    let mut table = [0.0f32; 31];
    let mut i = 1;
    while i < 31 {
        table[i] = 95.52 / (8128.0 / i as f32 + 100.0);
        i += 1;
    }
    table
};

/// Triangle/noise/DMC mixer, indexed by `3 * triangle + 2 * noise + dmc`.
pub const TND_TABLE: [f32; 203] = {
    let mut table = [0.0f32; 203];
    let mut i = 1;
    while i < 203 {
        table[i] = 163.67 / (24329.0 / i as f32 + 100.0);
        i += 1;
    }
    table
};

#[derive(Clone, Encode, Decode)]
pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    frame_counter: u32,
    frame_mode_5_step: bool,
    frame_irq_inhibit: bool,
    frame_irq_flag: bool,
    frame_counter_write_pending: bool,
    frame_counter_write_value: u8,
    frame_counter_write_delay: u8,

    cpu_cycle: u64,
    sample_rate: u32,

    hp90: HighPass,
    hp440: HighPass,
    lp14k: LowPass,
    dmc_dma_request: Option<u16>,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(MIN_SAMPLE_RATE);
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DmcChannel::new(),
            frame_counter: 0,
            frame_mode_5_step: false,
            frame_irq_inhibit: false,
            frame_irq_flag: false,
            frame_counter_write_pending: false,
            frame_counter_write_value: 0,
            frame_counter_write_delay: 0,
            cpu_cycle: 0,
            sample_rate,
            hp90: HighPass::new(90.0, sample_rate),
            hp440: HighPass::new(440.0, sample_rate),
            lp14k: LowPass::new(14_000.0, sample_rate),
            dmc_dma_request: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),

            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),

            0x4010 => self.dmc.write_control(value),
            0x4011 => self.dmc.write_output_level(value),
            0x4012 => self.dmc.write_sample_addr(value),
            0x4013 => self.dmc.write_sample_length(value),

            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if self.dmc.playback_active() {
            status |= 0x10;
        }
        if self.frame_irq_flag {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }

        self.frame_irq_flag = false;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq_flag || self.dmc.irq_flag
    }

    /// Advances one CPU cycle. Returns a filtered sample whenever the
    /// running cycle count crosses an output-sample boundary.
    pub fn step(&mut self) -> Option<f32> {
        let cycles_per_sample = CPU_CLOCK_HZ / self.sample_rate as f64;
        let before = (self.cpu_cycle as f64 / cycles_per_sample) as u64;
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);
        let after = (self.cpu_cycle as f64 / cycles_per_sample) as u64;

        if self.frame_counter_write_pending {
            self.frame_counter_write_delay = self.frame_counter_write_delay.saturating_sub(1);
            if self.frame_counter_write_delay == 0 {
                self.apply_frame_counter_write(self.frame_counter_write_value);
                self.frame_counter_write_pending = false;
            }
        }

        if (self.cpu_cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
        }
        self.noise.clock_timer();
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        self.request_dmc_dma();

        self.clock_frame_counter();

        (after != before).then(|| {
            let mixed = self.mix_sample();
            self.apply_output_filters(mixed)
        })
    }

    pub fn take_dmc_dma_request(&mut self) -> Option<u16> {
        self.dmc_dma_request.take()
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.dmc.consume_dma_byte(value);
        self.request_dmc_dma();
    }

    fn request_dmc_dma(&mut self) {
        if self.dmc.needs_dma() && self.dmc_dma_request.is_none() {
            self.dmc_dma_request = Some(self.dmc.current_addr);
        }
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;

        self.pulse1.set_enabled((value & 0x01) != 0);
        self.pulse2.set_enabled((value & 0x02) != 0);

        self.triangle.enabled = (value & 0x04) != 0;
        if !self.triangle.enabled {
            self.triangle.length_counter = 0;
        }

        self.noise.enabled = (value & 0x08) != 0;
        if !self.noise.enabled {
            self.noise.length_counter = 0;
        }

        self.dmc.enabled = (value & 0x10) != 0;
        if !self.dmc.enabled {
            self.dmc.stop();
        } else if !self.dmc.playback_active() {
            self.dmc.restart_sample();
            self.request_dmc_dma();
        }
    }

    fn write_frame_counter(&mut self, value: u8) {
        if (value & 0x40) != 0 {
            self.frame_irq_flag = false;
        }
        self.frame_counter_write_pending = true;
        self.frame_counter_write_value = value;
        self.frame_counter_write_delay = if (self.cpu_cycle & 1) == 0 { 3 } else { 4 };
    }

    fn apply_frame_counter_write(&mut self, value: u8) {
        self.frame_mode_5_step = (value & 0x80) != 0;
        self.frame_irq_inhibit = (value & 0x40) != 0;
        if self.frame_irq_inhibit {
            self.frame_irq_flag = false;
        }
        self.frame_counter = 0;
        if self.frame_mode_5_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter = self.frame_counter.wrapping_add(1);

        if self.frame_mode_5_step {
            match self.frame_counter {
                FC_5STEP_Q1 | FC_5STEP_Q3 => self.clock_quarter_frame(),
                FC_5STEP_Q2_H2 | FC_5STEP_Q4_H4 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                FC_5STEP_RESET => self.frame_counter = 0,
                _ => {}
            }
        } else {
            match self.frame_counter {
                FC_4STEP_Q1 | FC_4STEP_Q3 => self.clock_quarter_frame(),
                FC_4STEP_Q2_H2 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                FC_4STEP_Q4_H4_IRQ => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                    self.raise_frame_irq();
                }
                FC_4STEP_RESET => {
                    self.raise_frame_irq();
                    self.frame_counter = 0;
                }
                _ => {}
            }
        }
    }

    fn raise_frame_irq(&mut self) {
        if !self.frame_irq_inhibit {
            self.frame_irq_flag = true;
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.envelope.clock(self.pulse1.length_halt);
        self.pulse2.envelope.clock(self.pulse2.length_halt);
        self.triangle.clock_linear_counter();
        self.noise.envelope.clock(self.noise.length_halt);
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length_and_sweep();
        self.pulse2.clock_length_and_sweep();
        self.triangle.clock_length_counter();
        self.noise.clock_length_counter();
    }

    fn mix_sample(&self) -> f32 {
        mix(
            self.pulse1.output(),
            self.pulse2.output(),
            self.triangle.output(),
            self.noise.output(),
            self.dmc.output(),
        )
    }

    fn apply_output_filters(&mut self, sample: f32) -> f32 {
        let sample = self.hp90.apply(sample);
        let sample = self.hp440.apply(sample);
        self.lp14k.apply(sample).clamp(-1.0, 1.0)
    }
}

pub fn mix(pulse1: u8, pulse2: u8, triangle: u8, noise: u8, dmc: u8) -> f32 {
    let pulse_index = (pulse1 as usize + pulse2 as usize).min(PULSE_TABLE.len() - 1);
    let tnd_index =
        (3 * triangle as usize + 2 * noise as usize + dmc as usize).min(TND_TABLE.len() - 1);
    PULSE_TABLE[pulse_index] + TND_TABLE[tnd_index]
}

#[derive(Clone, Copy, Encode, Decode)]
struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let dt = 1.0 / sample_rate as f32;
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, sample: f32) -> f32 {
        let out = self.alpha * (self.prev_out + sample - self.prev_in);
        self.prev_in = sample;
        self.prev_out = out;
        out
    }
}

#[derive(Clone, Copy, Encode, Decode)]
struct LowPass {
    alpha: f32,
    prev_out: f32,
}

impl LowPass {
    fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let dt = 1.0 / sample_rate as f32;
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: dt / (rc + dt),
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, sample: f32) -> f32 {
        self.prev_out += self.alpha * (sample - self.prev_out);
        self.prev_out
    }
}

/// Volume envelope shared by the pulse and noise channels.
#[derive(Clone, Copy, Default, Encode, Decode)]
struct Envelope {
    constant_volume: bool,
    volume: u8,
    start: bool,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
        self.start = true;
    }

    fn clock(&mut self, looping: bool) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.volume;
            return;
        }

        if self.divider == 0 {
            self.divider = self.volume;
            if self.decay == 0 {
                if looping {
                    self.decay = 15;
                }
            } else {
                self.decay -= 1;
            }
        } else {
            self.divider -= 1;
        }
    }

    fn output(&self) -> u8 {
        if self.constant_volume {
            self.volume
        } else {
            self.decay
        }
    }
}

#[derive(Clone, Copy, Encode, Decode)]
struct PulseChannel {
    enabled: bool,
    channel1: bool,
    duty: u8,
    duty_step: u8,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,
    length_halt: bool,
    envelope: Envelope,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl PulseChannel {
    fn new(channel1: bool) -> Self {
        Self {
            enabled: false,
            channel1,
            duty: 0,
            duty_step: 0,
            timer_period: 0,
            timer_counter: 0,
            length_counter: 0,
            length_halt: false,
            envelope: Envelope::default(),
            sweep_enabled: false,
            sweep_period: 1,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn write_control(&mut self, value: u8) {
        self.duty = (value >> 6) & 0x03;
        self.length_halt = (value & 0x20) != 0;
        self.envelope.write(value);
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = (value & 0x80) != 0;
        self.sweep_period = ((value >> 4) & 0x07) + 1;
        self.sweep_negate = (value & 0x08) != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.duty_step = 0;
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_length_and_sweep(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }

        if self.sweep_divider == 0 && self.sweep_enabled {
            self.apply_sweep();
        }
        if self.sweep_divider == 0 || self.sweep_reload {
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn apply_sweep(&mut self) {
        if self.sweep_shift == 0 {
            return;
        }
        let target = self.sweep_target_period();
        if target <= 0x07FF {
            self.timer_period = target;
        }
    }

    /// Sweep overflow and periods below 8 mute the channel.
    fn output(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || DUTY_TABLE[self.duty as usize][self.duty_step as usize] == 0
            || self.timer_period < 8
            || self.sweep_target_period() > 0x07FF
        {
            return 0;
        }
        self.envelope.output()
    }

    fn sweep_target_period(&self) -> u16 {
        if self.sweep_shift == 0 {
            return self.timer_period;
        }
        let change = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            // Pulse 1 negates with one's complement.
            let extra = u16::from(self.channel1);
            self.timer_period.wrapping_sub(change + extra)
        } else {
            self.timer_period.wrapping_add(change)
        }
    }
}

#[derive(Clone, Copy, Encode, Decode)]
struct TriangleChannel {
    enabled: bool,
    control_flag: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload_flag: bool,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,
    seq_step: u8,
}

impl TriangleChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            control_flag: false,
            linear_reload_value: 0,
            linear_counter: 0,
            linear_reload_flag: false,
            timer_period: 0,
            timer_counter: 0,
            length_counter: 0,
            seq_step: 0,
        }
    }

    fn write_linear(&mut self, value: u8) {
        self.control_flag = (value & 0x80) != 0;
        self.linear_reload_value = value & 0x7F;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.linear_reload_flag = true;
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }

        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    fn clock_length_counter(&mut self) {
        if !self.control_flag && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            if self.length_counter > 0 && self.linear_counter > 0 && self.timer_period > 1 {
                self.seq_step = (self.seq_step + 1) & 0x1F;
            }
        } else {
            self.timer_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || self.linear_counter == 0
            || self.timer_period < 2
        {
            0
        } else {
            TRI_TABLE[self.seq_step as usize]
        }
    }
}

#[derive(Clone, Copy, Encode, Decode)]
struct NoiseChannel {
    enabled: bool,
    length_halt: bool,
    envelope: Envelope,

    mode: bool,
    timer_period: u16,
    timer_counter: u16,
    shift_register: u16,
    length_counter: u8,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            length_halt: false,
            envelope: Envelope::default(),
            mode: false,
            timer_period: NOISE_PERIOD_TABLE[0],
            timer_counter: 0,
            shift_register: 1,
            length_counter: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.length_halt = (value & 0x20) != 0;
        self.envelope.write(value);
    }

    fn write_period(&mut self, value: u8) {
        self.mode = (value & 0x80) != 0;
        self.timer_period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            let tap = if self.mode { 6 } else { 1 };
            let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x0001;
            self.shift_register >>= 1;
            self.shift_register |= feedback << 14;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_length_counter(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 || (self.shift_register & 0x0001) != 0 {
            return 0;
        }
        self.envelope.output()
    }
}

#[derive(Clone, Copy, Encode, Decode)]
struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    loop_flag: bool,
    timer_period: u16,
    timer_counter: u16,
    output_level: u8,
    sample_addr: u8,
    sample_length: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
    dma_pending: bool,
    dma_delay: u8,
}

impl DmcChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            loop_flag: false,
            timer_period: DMC_RATE_TABLE[0],
            timer_counter: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0,
            sample_length: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
            dma_pending: false,
            dma_delay: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.irq_enabled = (value & 0x80) != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.loop_flag = (value & 0x40) != 0;
        self.timer_period = DMC_RATE_TABLE[(value & 0x0F) as usize];
        if self.timer_counter == 0 || self.timer_counter > self.timer_period {
            self.timer_counter = self.timer_period;
        }
    }

    fn write_output_level(&mut self, value: u8) {
        self.output_level = value & 0x7F;
    }

    fn write_sample_addr(&mut self, value: u8) {
        self.sample_addr = value;
    }

    fn write_sample_length(&mut self, value: u8) {
        self.sample_length = value;
    }

    fn restart_sample(&mut self) {
        self.current_addr = 0xC000 | ((self.sample_addr as u16) << 6);
        self.bytes_remaining = ((self.sample_length as u16) << 4) | 0x0001;
        if self.sample_buffer.is_none() {
            self.schedule_dma(2);
        }
    }

    fn playback_active(&self) -> bool {
        self.bytes_remaining > 0
    }

    fn needs_dma(&self) -> bool {
        self.enabled && self.dma_pending && self.dma_delay == 0
    }

    fn stop(&mut self) {
        self.bytes_remaining = 0;
        self.dma_pending = false;
        self.dma_delay = 0;
    }

    fn consume_dma_byte(&mut self, byte: u8) {
        self.dma_pending = false;
        self.dma_delay = 0;
        self.sample_buffer = Some(byte);
        if self.bytes_remaining == 0 {
            return;
        }

        self.current_addr = if self.current_addr == 0xFFFF {
            0x8000
        } else {
            self.current_addr + 1
        };
        self.bytes_remaining -= 1;

        if self.bytes_remaining == 0 {
            if self.loop_flag {
                self.restart_sample();
            } else if self.irq_enabled {
                self.irq_flag = true;
            }
        }
    }

    fn clock_output_unit(&mut self) {
        if !self.silence {
            if (self.shift_register & 0x01) != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }

        self.shift_register >>= 1;
        self.bits_remaining = self.bits_remaining.saturating_sub(1);

        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            match self.sample_buffer.take() {
                Some(sample) => {
                    self.shift_register = sample;
                    self.silence = false;
                    self.schedule_dma(1);
                }
                None => self.silence = true,
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.dma_pending && self.dma_delay > 0 {
            self.dma_delay -= 1;
        }

        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
        }
        self.timer_counter -= 1;
        if self.timer_counter == 0 {
            self.clock_output_unit();
        }
    }

    fn schedule_dma(&mut self, delay: u8) {
        if self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0 {
            self.dma_pending = true;
            self.dma_delay = delay;
        }
    }

    fn output(&self) -> u8 {
        self.output_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cycles(apu: &mut Apu, cycles: u32) -> Vec<f32> {
        (0..cycles).filter_map(|_| apu.step()).collect()
    }

    #[test]
    fn silence_mixes_to_table_origin() {
        assert_eq!(mix(0, 0, 0, 0, 0), PULSE_TABLE[0] + TND_TABLE[0]);
        assert_eq!(PULSE_TABLE[0], 0.0);
        assert_eq!(TND_TABLE[0], 0.0);

        let apu = Apu::default();
        assert_eq!(apu.mix_sample(), PULSE_TABLE[0] + TND_TABLE[0]);
    }

    #[test]
    fn mixer_tables_are_monotonic() {
        assert!(PULSE_TABLE.windows(2).all(|w| w[0] < w[1]));
        assert!(TND_TABLE.windows(2).all(|w| w[0] < w[1]));
        assert!((PULSE_TABLE[30] - 0.2575).abs() < 0.001);
        assert!((TND_TABLE[202] - 0.7425).abs() < 0.001);
    }

    #[test]
    fn sample_cadence_follows_sample_rate() {
        let mut apu = Apu::new(44_100);
        let samples = run_cycles(&mut apu, CPU_CLOCK_HZ as u32);
        assert!((44_099..=44_101).contains(&samples.len()));

        let mut apu = Apu::new(1_000);
        assert_eq!(apu.sample_rate(), MIN_SAMPLE_RATE);
        let samples = run_cycles(&mut apu, CPU_CLOCK_HZ as u32);
        assert!((7_999..=8_001).contains(&samples.len()));
    }

    #[test]
    fn length_counter_reported_and_cleared_by_disable() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.read_status() & 0x01, 0x01);
        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.read_status() & 0x01, 0x00);
    }

    #[test]
    fn four_step_sequencer_raises_frame_irq() {
        let mut apu = Apu::default();
        run_cycles(&mut apu, FC_4STEP_Q4_H4_IRQ - 1);
        assert!(!apu.irq_pending());
        run_cycles(&mut apu, 2);
        assert!(apu.irq_pending());
        assert_eq!(apu.read_status() & 0x40, 0x40);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn irq_inhibit_and_five_step_mode_suppress_frame_irq() {
        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x40);
        run_cycles(&mut apu, FC_4STEP_RESET * 2);
        assert!(!apu.irq_pending());

        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x80);
        run_cycles(&mut apu, FC_5STEP_RESET * 2);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn length_counter_expires_on_half_frames() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x08);
        // Length index 3 loads a count of 2.
        apu.write_register(0x400F, 3 << 3);
        assert_eq!(apu.read_status() & 0x08, 0x08);
        run_cycles(&mut apu, FC_4STEP_Q2_H2 + 1);
        assert_eq!(apu.read_status() & 0x08, 0x08);
        run_cycles(&mut apu, FC_4STEP_Q4_H4_IRQ - FC_4STEP_Q2_H2);
        assert_eq!(apu.read_status() & 0x08, 0x00);
    }

    #[test]
    fn dmc_requests_sample_bytes_and_raises_irq() {
        let mut apu = Apu::default();
        apu.write_register(0x4010, 0x80);
        apu.write_register(0x4012, 0x00);
        apu.write_register(0x4013, 0x00);
        apu.write_register(0x4015, 0x10);
        assert_eq!(apu.read_status() & 0x10, 0x10);

        let mut request = None;
        for _ in 0..8 {
            apu.step();
            request = apu.take_dmc_dma_request();
            if request.is_some() {
                break;
            }
        }
        assert_eq!(request, Some(0xC000));
        apu.complete_dmc_dma(0xAA);
        assert!(apu.irq_pending());
        assert_eq!(apu.read_status() & 0x90, 0x80);

        apu.write_register(0x4015, 0x00);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn pulse_produces_audible_output() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0xBF);
        apu.write_register(0x4002, 0xFD);
        apu.write_register(0x4003, 0x00);
        let samples = run_cycles(&mut apu, 20_000);
        assert!(samples.iter().any(|s| s.abs() > 0.01));
    }
}
