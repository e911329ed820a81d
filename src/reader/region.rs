//! Copying the overlap of decoded chunks into a destination box.
use crate::error::{Error, Result};
use crate::idx::{DatasetDescriptor, TypedArray};

/// Row-major strides of `shape`.
fn strides(shape: &[u64]) -> Vec<u64> {
    let mut s = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        s[i] = s[i + 1] * shape[i + 1];
    }
    s
}

/// Copy the part of the chunk at `coord` that falls inside the box at `start` with `count`
/// elements per dimension. `dst` holds the box in row-major order. Parts of the box outside the
/// dataset are left untouched.
pub fn copy_chunk<T: Copy>(
    ds: &DatasetDescriptor,
    coord: &[u64],
    chunk: &[T],
    start: &[u64],
    count: &[u64],
    dst: &mut [T],
) {
    let rank = ds.rank();

    if rank == 0 {
        if let (Some(d), Some(s)) = (dst.first_mut(), chunk.first()) {
            *d = *s;
        }
        return;
    }

    let mut lo = Vec::with_capacity(rank);
    let mut hi = Vec::with_capacity(rank);
    for d in 0..rank {
        let origin = coord[d] * ds.chunk_dims[d];
        let l = start[d].max(origin);
        let h = start[d]
            .saturating_add(count[d])
            .min(origin + ds.chunk_dims[d])
            .min(ds.shape[d]);
        if l >= h {
            return;
        }
        lo.push(l);
        hi.push(h);
    }

    let dst_strides = strides(count);

    let run = (hi[rank - 1] - lo[rank - 1]) as usize;
    let outer = &hi[..rank - 1];
    let rows: u64 = outer.iter().zip(&lo).map(|(h, l)| h - l).product();

    let mut idx = lo.clone();
    for _ in 0..rows {
        let src = ds.offset_in_chunk(coord, &idx) as usize;
        let dst_at = (0..rank)
            .map(|d| (idx[d] - start[d]) * dst_strides[d])
            .sum::<u64>() as usize;

        dst[dst_at..dst_at + run].copy_from_slice(&chunk[src..src + run]);

        // Next row: odometer over all but the last dimension.
        for d in (0..rank - 1).rev() {
            idx[d] += 1;
            if idx[d] < hi[d] {
                break;
            }
            idx[d] = lo[d];
        }
    }
}

/// As [`copy_chunk`] for type-erased arrays, which must be of the same type.
pub fn copy_typed(
    ds: &DatasetDescriptor,
    coord: &[u64],
    chunk: &TypedArray,
    start: &[u64],
    count: &[u64],
    dst: &mut TypedArray,
) -> Result<()> {
    use TypedArray::*;

    let expected = ds.chunk_len() as usize;
    if chunk.len() < expected {
        return Err(Error::format(
            ds.addr,
            format!(
                "{}: chunk {:?} holds {} elements, expected {}",
                ds.path,
                coord,
                chunk.len(),
                expected
            ),
        ));
    }

    macro_rules! copy {
        ($($v:ident),*) => {
            match (chunk, dst) {
                $(($v(c), $v(d)) => copy_chunk(ds, coord, c, start, count, d),)*
                (c, d) => {
                    return Err(Error::Invalid(format!(
                        "copying {} chunk into {} array",
                        c.dtype(),
                        d.dtype()
                    )))
                }
            }
        };
    }

    copy!(Int8, Int16, Int32, Int64, UInt8, UInt16, UInt32, UInt64, Float16, Float32, Float64);

    Ok(())
}
