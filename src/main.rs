use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use famicore::nes::cartridge::{CHR_BANK_SIZE, PRG_BANK_SIZE, build_ines};
use famicore::{Emulator, EmulatorConfig};
use sha1::{Digest, Sha1};

#[derive(Debug, Clone)]
struct Config {
    rom: Option<PathBuf>,
    frames: u32,
    config: Option<PathBuf>,
    save_state: Option<PathBuf>,
    expect_hash: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 600,
            config: None,
            save_state: None,
            expect_hash: None,
        }
    }
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom roms/smb.nes")?;
                cfg.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 600")?;
                cfg.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--config" => {
                let value = args
                    .next()
                    .context("--config requires a path to a JSON file")?;
                cfg.config = Some(PathBuf::from(value));
            }
            "--save-state" => {
                let value = args
                    .next()
                    .context("--save-state requires an output path")?;
                cfg.save_state = Some(PathBuf::from(value));
            }
            "--hash" => {
                let value = args
                    .next()
                    .context("--hash requires the expected frame SHA-1 in hex")?;
                cfg.expect_hash = Some(value.to_ascii_lowercase());
            }
            "--help" | "-h" => {
                println!(
                    "famicore\n\n\
Usage:\n\
  cargo run --release -- [options]\n\n\
Options:\n\
  --rom <path>          iNES ROM to run (default: built-in self-check cartridge)\n\
  --frames <n>          Frames to run (default 600)\n\
  --config <path>       JSON emulator config\n\
  --save-state <path>   Write a save-state after the run\n\
  --hash <sha1>         Fail unless the final frame hashes to this value\n\
  -h, --help            Show this help\n"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(cfg)
}

/// NROM cartridge that enables rendering and a square wave, then spins.
fn self_check_rom() -> Vec<u8> {
    let program = [
        0xA9, 0x1E, // LDA #$1E
        0x8D, 0x01, 0x20, // STA $2001
        0xA9, 0x01, // LDA #$01
        0x8D, 0x15, 0x40, // STA $4015
        0xA9, 0xBF, // LDA #$BF
        0x8D, 0x00, 0x40, // STA $4000
        0xA9, 0xFD, // LDA #$FD
        0x8D, 0x02, 0x40, // STA $4002
        0xA9, 0x00, // LDA #$00
        0x8D, 0x03, 0x40, // STA $4003
        0x4C, 0x19, 0x80, // JMP *
    ];
    let mut prg = vec![0xEA; 2 * PRG_BANK_SIZE];
    prg[..program.len()].copy_from_slice(&program);
    prg[0x7FFA..].copy_from_slice(&[0x19, 0x80, 0x00, 0x80, 0x19, 0x80]);
    let chr: Vec<u8> = (0..CHR_BANK_SIZE).map(|i| (i * 7) as u8).collect();
    build_ines(0, 0x01, &prg, &chr)
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let cfg = parse_args()?;

    let config = match &cfg.config {
        Some(path) => EmulatorConfig::load(path)?,
        None => EmulatorConfig::default(),
    };

    let mut emu = Emulator::new(&config);
    match &cfg.rom {
        Some(path) => emu.load_rom_from_path(path)?,
        None => emu
            .load_rom(&self_check_rom())
            .context("failed to load self-check cartridge")?,
    }

    let audio = Arc::new(Mutex::new((Sha1::new(), 0u64)));
    let sink = Arc::clone(&audio);
    emu.set_sample_callback(move |sample| {
        if let Ok(mut guard) = sink.lock() {
            guard.0.update(sample.to_le_bytes());
            guard.1 += 1;
        }
    });

    let start = Instant::now();
    for _ in 0..cfg.frames {
        emu.step_frame()?;
    }
    let elapsed = start.elapsed();

    let frame_hash = hex(&Sha1::digest(emu.frame_buffer()));
    let (audio_hash, samples) = {
        let guard = audio
            .lock()
            .map_err(|_| anyhow::anyhow!("audio hash lock poisoned"))?;
        (hex(&guard.0.clone().finalize()), guard.1)
    };
    let regs = emu.cpu();

    println!("Run Summary");
    println!("- mapper: {}", emu.mapper_name());
    println!("- frames: {}", emu.frame_count());
    println!("- cpu cycles: {}", regs.cycles);
    println!("- pc: ${:04X}{}", regs.pc, if emu.halted() { " (halted)" } else { "" });
    println!("- samples: {samples} @ {} Hz", config.sample_rate);
    println!("- frame sha1: {frame_hash}");
    println!("- audio sha1: {audio_hash}");
    println!(
        "- speed: {:.1} fps",
        emu.frame_count() as f64 / elapsed.as_secs_f64().max(1e-9)
    );

    if let Some(path) = &cfg.save_state {
        let state = emu.save_state()?;
        fs::write(path, &state)
            .with_context(|| format!("failed to write save-state: {}", path.display()))?;
        println!("- save-state: {} ({} bytes)", path.display(), state.len());
    }

    if let Some(expected) = &cfg.expect_hash {
        if *expected != frame_hash {
            anyhow::bail!("frame hash mismatch: expected {expected}, got {frame_hash}");
        }
        println!("- hash check: ok");
    }

    Ok(())
}
