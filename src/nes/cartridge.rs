use anyhow::{Context, Result};
use std::{fs, path::Path};

use super::mapper::Mirroring;
use crate::error::CartridgeError;

pub const PRG_BANK_SIZE: usize = 16 * 1024;
pub const CHR_BANK_SIZE: usize = 8 * 1024;
const HEADER_SIZE: usize = 16;
const TRAINER_SIZE: usize = 512;

const FLAGS6_VERTICAL: u8 = 0x01;
const FLAGS6_BATTERY: u8 = 0x02;
const FLAGS6_TRAINER: u8 = 0x04;
const FLAGS6_FOUR_SCREEN: u8 = 0x08;

/// Immutable result of parsing an iNES 1.0 image.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("failed to parse ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CartridgeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CartridgeError::TooSmall(bytes.len()));
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(CartridgeError::BadMagic);
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        if (flags7 & 0x0C) == 0x08 {
            return Err(CartridgeError::Nes2Unsupported);
        }
        if (flags7 & 0x0F) != 0 {
            return Err(CartridgeError::UnsupportedVersion(flags7));
        }

        let mapper_id = (flags6 >> 4) | (flags7 & 0xF0);
        if mapper_id > 4 {
            return Err(CartridgeError::UnsupportedMapper(mapper_id));
        }

        let mirroring = if (flags6 & FLAGS6_FOUR_SCREEN) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & FLAGS6_VERTICAL) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let prg_size = bytes[4] as usize * PRG_BANK_SIZE;
        let chr_size = bytes[5] as usize * CHR_BANK_SIZE;
        if prg_size == 0 {
            return Err(CartridgeError::EmptyPrg);
        }

        let mut cursor = HEADER_SIZE;
        if (flags6 & FLAGS6_TRAINER) != 0 {
            cursor = take(bytes, cursor, TRAINER_SIZE, "trainer")?;
        }

        let prg_end = take(bytes, cursor, prg_size, "PRG")?;
        let prg_rom = bytes[cursor..prg_end].to_vec();
        cursor = prg_end;

        let (chr_data, chr_is_ram) = if chr_size == 0 {
            (vec![0; CHR_BANK_SIZE], true)
        } else {
            let chr_end = take(bytes, cursor, chr_size, "CHR")?;
            (bytes[cursor..chr_end].to_vec(), false)
        };

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery: (flags6 & FLAGS6_BATTERY) != 0,
            prg_rom,
            chr_data,
            chr_is_ram,
        })
    }

    pub fn prg_banks(&self) -> usize {
        self.prg_rom.len() / PRG_BANK_SIZE
    }
}

fn take(
    bytes: &[u8],
    cursor: usize,
    len: usize,
    section: &'static str,
) -> Result<usize, CartridgeError> {
    let end = cursor + len;
    if bytes.len() < end {
        return Err(CartridgeError::Truncated {
            section,
            expected: len,
            actual: bytes.len().saturating_sub(cursor),
        });
    }
    Ok(end)
}

/// Builds an iNES 1.0 image in memory. Used by tests and by the runner's
/// self-check mode.
pub fn build_ines(mapper_id: u8, flags6_low: u8, prg: &[u8], chr: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(HEADER_SIZE + prg.len() + chr.len());
    image.extend_from_slice(b"NES\x1A");
    image.push((prg.len() / PRG_BANK_SIZE) as u8);
    image.push((chr.len() / CHR_BANK_SIZE) as u8);
    image.push(((mapper_id & 0x0F) << 4) | (flags6_low & 0x0F));
    image.push(mapper_id & 0xF0);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(prg);
    image.extend_from_slice(chr);
    image
}

/// 32K NROM image with `program` at $8000, padded with NOPs. Vectors:
/// NMI $9000, RESET $8000, IRQ/BRK $9100.
#[cfg(test)]
pub(crate) fn rom_with_program(program: &[u8]) -> Vec<u8> {
    let mut prg = vec![0xEA; 2 * PRG_BANK_SIZE];
    prg[..program.len()].copy_from_slice(program);
    prg[0x7FFA..].copy_from_slice(&[0x00, 0x90, 0x00, 0x80, 0x00, 0x91]);
    build_ines(0, 0, &prg, &[0; CHR_BANK_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nrom_header() {
        let image = build_ines(0, 0x01 | 0x02, &[0xEA; PRG_BANK_SIZE], &[0x11; CHR_BANK_SIZE]);
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert_eq!(cart.mapper_id, 0);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        assert!(cart.has_battery);
        assert!(!cart.chr_is_ram);
        assert_eq!(cart.prg_banks(), 1);
        assert_eq!(cart.chr_data[0], 0x11);
    }

    #[test]
    fn missing_chr_means_chr_ram() {
        let image = build_ines(2, 0, &[0; 2 * PRG_BANK_SIZE], &[]);
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr_data.len(), CHR_BANK_SIZE);
        assert_eq!(cart.mirroring, Mirroring::Horizontal);
    }

    #[test]
    fn skips_trainer() {
        let mut image = build_ines(0, FLAGS6_TRAINER, &[], &[]);
        image[4] = 1;
        image.extend_from_slice(&[0xFF; TRAINER_SIZE]);
        image.extend_from_slice(&[0x42; PRG_BANK_SIZE]);
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert_eq!(cart.prg_rom[0], 0x42);
    }

    #[test]
    fn four_screen_overrides_mirroring_bit() {
        let image = build_ines(4, FLAGS6_FOUR_SCREEN | FLAGS6_VERTICAL, &[0; PRG_BANK_SIZE], &[]);
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert_eq!(cart.mirroring, Mirroring::FourScreen);
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(
            Cartridge::from_bytes(b"NES"),
            Err(CartridgeError::TooSmall(3))
        ));

        let mut image = build_ines(0, 0, &[0; PRG_BANK_SIZE], &[]);
        image[0] = b'X';
        assert!(matches!(
            Cartridge::from_bytes(&image),
            Err(CartridgeError::BadMagic)
        ));

        let mut image = build_ines(0, 0, &[0; PRG_BANK_SIZE], &[]);
        image[7] |= 0x08;
        assert!(matches!(
            Cartridge::from_bytes(&image),
            Err(CartridgeError::Nes2Unsupported)
        ));

        let mut image = build_ines(0, 0, &[0; PRG_BANK_SIZE], &[]);
        image[7] |= 0x01;
        assert!(matches!(
            Cartridge::from_bytes(&image),
            Err(CartridgeError::UnsupportedVersion(_))
        ));

        let image = build_ines(7, 0, &[0; PRG_BANK_SIZE], &[]);
        assert!(matches!(
            Cartridge::from_bytes(&image),
            Err(CartridgeError::UnsupportedMapper(7))
        ));
    }

    #[test]
    fn rejects_truncated_prg() {
        let mut image = build_ines(0, 0, &[0; PRG_BANK_SIZE], &[]);
        image.truncate(HEADER_SIZE + 100);
        match Cartridge::from_bytes(&image) {
            Err(CartridgeError::Truncated {
                section,
                expected,
                actual,
            }) => {
                assert_eq!(section, "PRG");
                assert_eq!(expected, PRG_BANK_SIZE);
                assert_eq!(actual, 100);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
