//! Reversing the filter pipeline of a stored chunk.
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::format::checksum::fletcher32;
use crate::format::messages::{Filter, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SHUFFLE};

pub mod byteorder;
pub mod gzip;
pub mod shuffle;

/// Check that every filter in the pipeline can be reversed.
pub fn check_supported(filters: &[Filter]) -> Result<()> {
    for f in filters {
        if !matches!(f.id, FILTER_DEFLATE | FILTER_SHUFFLE | FILTER_FLETCHER32) {
            return Err(Error::Unsupported(format!(
                "filter {} ({})",
                f.id,
                f.name.as_deref().unwrap_or("unnamed")
            )));
        }
    }
    Ok(())
}

/// Undo the filters applied to a stored chunk, last filter first. Filters whose bit is set in
/// `mask` were skipped when the chunk was written.
///
/// `expected` is the size of the unfiltered chunk and `element_size` the word size used by the
/// shuffle filter.
pub fn unfilter(
    filters: &[Filter],
    mask: u32,
    data: Bytes,
    expected: usize,
    element_size: usize,
    addr: u64,
) -> Result<Bytes> {
    let mut data = data;

    for (i, f) in filters.iter().enumerate().rev() {
        if i < 32 && mask & (1 << i) != 0 {
            continue;
        }

        data = match f.id {
            FILTER_FLETCHER32 => verify_fletcher32(data, addr)?,
            FILTER_DEFLATE => {
                // Checksums applied before compression are still attached.
                let checksums = filters[..i]
                    .iter()
                    .filter(|f| f.id == FILTER_FLETCHER32)
                    .count();
                let mut out = vec![0u8; expected + 4 * checksums];
                let n = gzip::decompress(&data, &mut out, addr)?;
                out.truncate(n);
                Bytes::from(out)
            }
            FILTER_SHUFFLE => {
                let wsz = f
                    .values
                    .first()
                    .map(|v| *v as usize)
                    .unwrap_or(element_size);
                Bytes::from(shuffle::unshuffle(&data, wsz))
            }
            id => {
                return Err(Error::Unsupported(format!("filter {id}")));
            }
        };
    }

    if data.len() != expected {
        return Err(Error::format(
            addr,
            format!(
                "chunk decodes to {} bytes, expected {expected}",
                data.len()
            ),
        ));
    }

    Ok(data)
}

/// Verify and strip the trailing Fletcher-32 checksum. The checksum is accepted in either byte
/// order since old files stored it swapped.
fn verify_fletcher32(data: Bytes, addr: u64) -> Result<Bytes> {
    if data.len() < 4 {
        return Err(Error::format(addr, "chunk too short for Fletcher-32 checksum"));
    }

    let n = data.len() - 4;
    let stored = u32::from_le_bytes([data[n], data[n + 1], data[n + 2], data[n + 3]]);
    let computed = fletcher32(&data[..n]);

    if stored != computed && stored.swap_bytes() != computed {
        return Err(Error::format(
            addr,
            format!("Fletcher-32 mismatch (stored {stored:#010x}, computed {computed:#010x})"),
        ));
    }

    Ok(data.slice(..n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdeflater::{CompressionLvl, Compressor};

    fn filter(id: u16, values: Vec<u32>) -> Filter {
        Filter {
            id,
            name: None,
            flags: 0,
            values,
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut c = Compressor::new(CompressionLvl::default());
        let mut z = vec![0; c.zlib_compress_bound(data.len())];
        let n = c.zlib_compress(data, &mut z).unwrap();
        z.truncate(n);
        z
    }

    fn with_fletcher(mut data: Vec<u8>) -> Vec<u8> {
        let sum = fletcher32(&data);
        data.extend_from_slice(&sum.to_le_bytes());
        data
    }

    #[test]
    fn shuffle_deflate_fletcher() {
        let raw = (0..1000u32).flat_map(|i| (i as f32).to_le_bytes()).collect::<Vec<_>>();
        let stored = with_fletcher(deflate(&shuffle::shuffle(&raw, 4)));

        let pipeline = [
            filter(FILTER_SHUFFLE, vec![4]),
            filter(FILTER_DEFLATE, vec![6]),
            filter(FILTER_FLETCHER32, vec![]),
        ];

        let out = unfilter(&pipeline, 0, stored.clone().into(), raw.len(), 4, 0).unwrap();
        assert_eq!(&out[..], &raw[..]);

        let mut corrupt = stored;
        corrupt[10] ^= 0xff;
        assert!(unfilter(&pipeline, 0, corrupt.into(), raw.len(), 4, 0).is_err());
    }

    #[test]
    fn masked_filters_are_skipped() {
        let raw = vec![7u8; 64];
        let pipeline = [filter(FILTER_DEFLATE, vec![])];

        let out = unfilter(&pipeline, 0b1, raw.clone().into(), 64, 1, 0).unwrap();
        assert_eq!(&out[..], &raw[..]);

        let out = unfilter(&pipeline, 0, deflate(&raw).into(), 64, 1, 0).unwrap();
        assert_eq!(&out[..], &raw[..]);
    }

    #[test]
    fn swapped_fletcher() {
        let raw = vec![1u8, 2, 3, 4, 5];
        let mut stored = raw.clone();
        stored.extend_from_slice(&fletcher32(&raw).to_be_bytes());

        let out = verify_fletcher32(stored.into(), 0).unwrap();
        assert_eq!(&out[..], &raw[..]);
    }

    #[test]
    fn unsupported_filters() {
        assert!(check_supported(&[filter(FILTER_DEFLATE, vec![])]).is_ok());
        assert!(check_supported(&[filter(32001, vec![])])
            .unwrap_err()
            .is_unsupported());
    }

    #[test]
    fn size_mismatch() {
        assert!(unfilter(&[], 0, vec![0u8; 10].into(), 12, 4, 0).is_err());
    }
}
