/// Shuffle bytes as the HDF5 shuffle filter does:
///
/// https://support.hdfgroup.org/ftp/HDF5//documentation/doc1.6/TechNotes/shuffling-algorithm-report.pdf
///
/// The shuffling algorithm re-arranges `bytes` with the following steps:
///
/// 1. put the first byte of each number in the first chunk
/// 2. put the second byte of each number in the second chunk
/// 3. repeat for size of number (e.g. 4 for i32).
///
/// Quoting the above:
///
/// For 5 32-bit integers: 1, 23, 43, 56, 35
///
/// they are laid out as following on a big-endian machine:
///
/// original: 0x00 0x00 0x00 0x01 0x00 0x00 0x00 0x17 0x00 0x00 0x00 0x2B 0x00 0x00 0x00 0x38 0x00 0x00 0x00 0x23
/// shuffled: 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x01 0x17 0x2B 0x38 0x23
pub fn shuffle(src: &[u8], wsz: usize) -> Vec<u8> {
    if wsz <= 1 {
        return src.to_vec();
    }

    let n = src.len() / wsz;
    let mut dest = src.to_vec();

    for i in 0..wsz {
        for j in 0..n {
            dest[i * n + j] = src[j * wsz + i];
        }
    }

    dest
}

fn unshuffle_n<const N: usize>(src: &[u8], dest: &mut [u8]) {
    let n = src.len() / N;

    for (j, d) in dest[..n * N].chunks_exact_mut(N).enumerate() {
        for (i, b) in d.iter_mut().enumerate() {
            *b = src[i * n + j];
        }
    }
}

/// Inverse of `shuffle` for word size `wsz` (e.g. `4` for `int32`). Trailing bytes that do not
/// make up a whole word are left in place, as the HDF5 library does.
pub fn unshuffle(src: &[u8], wsz: usize) -> Vec<u8> {
    let mut dest = src.to_vec();

    match wsz {
        0 | 1 => (),
        2 => unshuffle_n::<2>(src, &mut dest),
        4 => unshuffle_n::<4>(src, &mut dest),
        8 => unshuffle_n::<8>(src, &mut dest),
        _ => {
            let n = src.len() / wsz;
            for i in 0..wsz {
                for j in 0..n {
                    dest[j * wsz + i] = src[i * n + j];
                }
            }
        }
    }

    dest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_hdf5_example() {
        let v = [1i32, 23, 43, 56, 35]
            .iter()
            .flat_map(|i| i.to_be_bytes())
            .collect::<Vec<_>>();

        assert_eq!(
            v,
            [
                0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x17, 0x00, 0x00, 0x00, 0x2B, 0x00, 0x00,
                0x00, 0x38, 0x00, 0x00, 0x00, 0x23
            ]
        );

        let d = shuffle(&v, 4);

        assert_eq!(
            d,
            [
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x01, 0x17, 0x2B, 0x38, 0x23,
            ]
        );

        assert_eq!(unshuffle(&d, 4), v);
    }

    #[test]
    fn odd_word_sizes_and_trailing_bytes() {
        use rand::{thread_rng, Rng};

        let v: Vec<u8> = (0..3 * 100 + 2).map(|_| thread_rng().gen()).collect();

        for wsz in [2, 3, 4, 8] {
            assert_eq!(unshuffle(&shuffle(&v, wsz), wsz), v, "word size {wsz}");
        }
    }
}
