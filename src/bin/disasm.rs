use anyhow::{Context, Result};
use famicore::{Emulator, EmulatorConfig};
use std::path::PathBuf;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: famicore_disasm <rom.nes>");
        println!();
        println!("Prints the CPU vectors and a linear listing of PRG-ROM.");
        return Ok(());
    }

    let rom_path = PathBuf::from(&args[1]);
    let mut emu = Emulator::new(&EmulatorConfig::default());
    emu.load_rom_from_path(&rom_path)?;

    let listing = emu
        .disassemble()
        .with_context(|| format!("failed to disassemble {}", rom_path.display()))?;
    print!("{listing}");
    Ok(())
}
