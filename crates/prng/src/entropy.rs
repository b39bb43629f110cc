//! Operating-system entropy for seeding noise generators.

/// Failure to read from the operating system's entropy source.
#[derive(Debug, thiserror::Error)]
#[error("OS entropy source failed: {0}")]
pub struct EntropyError(#[from] getrandom::Error);

/// Read 8 bytes of OS entropy and interpret them as a big-endian signed seed.
pub fn os_seed() -> Result<i64, EntropyError> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(seed_from_bytes(bytes))
}

fn seed_from_bytes(bytes: [u8; 8]) -> i64 {
    i64::from_be_bytes(bytes)
}
