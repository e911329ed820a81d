use libdeflater::{DecompressionError, Decompressor};

use crate::error::{Error, Result};

/// Helper to decompress a zlib stream to a buffer of known size. `addr` is the address of the
/// chunk, used in errors.
pub fn decompress(compressed: &[u8], out: &mut [u8], addr: u64) -> Result<usize> {
    let cap = out.len();
    let mut de = Decompressor::new();
    de.zlib_decompress(compressed, out).map_err(|e| match e {
        DecompressionError::InsufficientSpace => Error::format(
            addr,
            format!("chunk inflates to more than {cap} bytes"),
        ),
        _ => Error::format(addr, "could not decompress chunk"),
    })
}
