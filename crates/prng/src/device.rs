//! Compute devices and the generators bound to them.

use std::fmt;

use rand::{CryptoRng, RngCore};

use crate::{ThreefryKey, ThreefryRng};

/// Compute device that noise tensors are produced for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host CPU.
    #[default]
    Cpu,
    /// Accelerator identified by its ordinal.
    Accelerator {
        /// Device index.
        ordinal: u32,
    },
}

impl Device {
    /// Stream identifier mixed into the key so each device draws its own stream.
    fn stream_id(self) -> u64 {
        match self {
            Device::Cpu => 0,
            Device::Accelerator { ordinal } => (1 << 32) | ordinal as u64,
        }
    }

    /// Obtain a generator bound to this device, seeded with `seed`.
    pub fn generator(self, seed: i64) -> DeviceGenerator {
        let key = ThreefryKey::from_seed(seed).fold_in(self.stream_id());
        DeviceGenerator {
            device: self,
            rng: key.to_rng(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator { ordinal } => write!(f, "accel:{ordinal}"),
        }
    }
}

/// A Threefry stream owned by a single device.
#[derive(Debug)]
pub struct DeviceGenerator {
    device: Device,
    rng: ThreefryRng,
}

impl DeviceGenerator {
    /// The device this generator is bound to.
    pub fn device(&self) -> Device {
        self.device
    }
}

impl RngCore for DeviceGenerator {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

impl CryptoRng for DeviceGenerator {}
