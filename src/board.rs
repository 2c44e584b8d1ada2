//! Board revision lookup, used to pick the GPIO chip when none is configured.

use std::env;
use std::fs;

use serde::Serialize;

use crate::error::GpioError;

pub const REVISION_ENV: &str = "RGPIO_REVISION";
pub const CHIP_ENV: &str = "RGPIO_CHIP";
const DEVICE_TREE_REVISION: &str = "/proc/device-tree/system/linux,revision";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardInfo {
    pub p1_revision: u8,
    pub revision: String,
    pub model: &'static str,
    pub manufacturer: &'static str,
    pub processor: &'static str,
    pub ram: &'static str,
}

impl BoardInfo {
    /// Reads the revision from `RGPIO_REVISION` (hex) or the device tree.
    pub fn detect() -> Result<Self, GpioError> {
        let revision = match env::var(REVISION_ENV) {
            Ok(hex) => u32::from_str_radix(hex.trim().trim_start_matches("0x"), 16)
                .map_err(|e| GpioError::Config(format!("{REVISION_ENV}={hex}: {e}")))?,
            Err(_) => Self::read_device_tree()?,
        };
        Self::from_revision(revision)
    }

    fn read_device_tree() -> Result<u32, GpioError> {
        let not_a_pi = || GpioError::Config("this module can only be run on a Raspberry Pi".into());
        let bytes = fs::read(DEVICE_TREE_REVISION).map_err(|_| not_a_pi())?;
        let raw: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(not_a_pi)?;
        match u32::from_be_bytes(raw) {
            0 => Err(not_a_pi()),
            revision => Ok(revision),
        }
    }

    pub fn from_revision(revision: u32) -> Result<Self, GpioError> {
        if (revision >> 23) & 0x1 == 0 {
            return Err(GpioError::Config(format!(
                "old-style revision code {revision:x} is not supported"
            )));
        }
        let board_type = (revision >> 4) & 0xff;

        Ok(Self {
            p1_revision: match board_type {
                0x00 | 0x01 => 2,
                0x06 | 0x0a | 0x10 | 0x14 => 0,
                _ => 3,
            },
            revision: format!("{revision:x}"),
            model: match board_type {
                0x00 => "Model A",
                0x01 => "Model B",
                0x02 => "Model A+",
                0x03 => "Model B+",
                0x04 => "Pi 2 Model B",
                0x05 => "Alpha",
                0x06 => "Compute Module 1",
                0x08 => "Pi 3 Model B",
                0x09 => "Zero",
                0x0a => "Compute Module 3",
                0x0c => "Zero W",
                0x0d => "Pi 3 Model B+",
                0x0e => "Pi 3 Model A+",
                0x10 => "Compute Module 3+",
                0x11 => "Pi 4 Model B",
                0x12 => "Zero 2 W",
                0x13 => "Pi 400",
                0x14 => "Compute Module 4",
                0x17 => "Pi 5 Model B",
                _ => "Unknown",
            },
            manufacturer: match (revision >> 16) & 0xf {
                0 => "Sony UK",
                1 => "Egoman",
                2 | 4 => "Embest",
                3 => "Sony Japan",
                5 => "Stadium",
                _ => "Unknown",
            },
            processor: match (revision >> 12) & 0xf {
                0 => "BCM2835",
                1 => "BCM2836",
                2 => "BCM2837",
                3 => "BCM2711",
                4 => "BCM2712",
                _ => "Unknown",
            },
            ram: match (revision >> 20) & 0x7 {
                0 => "256M",
                1 => "512M",
                2 => "1GB",
                3 => "2GB",
                4 => "4GB",
                5 => "8GB",
                6 => "16GB",
                _ => "Unknown",
            },
        })
    }

    /// The header GPIOs sit on chip 4 on BCM2712 boards, chip 0 elsewhere.
    pub fn gpio_chip(&self) -> u32 {
        if self.processor == "BCM2712" { 4 } else { 0 }
    }
}
