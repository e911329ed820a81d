use byteorder::{BigEndian, ByteOrder, LittleEndian};
use half::f16;
use serde::{Deserialize, Serialize};

/// Byte order of stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    BE,
    LE,
}

/// Values that can be decoded from their stored representation.
pub trait FromStored: Sized + Copy + Default {
    /// Size of one stored value in bytes.
    const SIZE: usize;

    /// Decode `dst.len()` values from `src`, which must hold exactly that many.
    fn read_into(src: &[u8], order: Order, dst: &mut [Self]);
}

macro_rules! from_stored {
    ($t:ty, $read:ident) => {
        impl FromStored for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_into(src: &[u8], order: Order, dst: &mut [Self]) {
                match order {
                    Order::BE => BigEndian::$read(src, dst),
                    Order::LE => LittleEndian::$read(src, dst),
                }
            }
        }
    };
}

from_stored!(u16, read_u16_into);
from_stored!(u32, read_u32_into);
from_stored!(u64, read_u64_into);
from_stored!(i16, read_i16_into);
from_stored!(i32, read_i32_into);
from_stored!(i64, read_i64_into);
from_stored!(f32, read_f32_into);
from_stored!(f64, read_f64_into);

impl FromStored for u8 {
    const SIZE: usize = 1;

    fn read_into(src: &[u8], _order: Order, dst: &mut [Self]) {
        dst.copy_from_slice(src);
    }
}

impl FromStored for i8 {
    const SIZE: usize = 1;

    fn read_into(src: &[u8], _order: Order, dst: &mut [Self]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s as i8;
        }
    }
}

impl FromStored for f16 {
    const SIZE: usize = 2;

    fn read_into(src: &[u8], order: Order, dst: &mut [Self]) {
        let mut bits = vec![0u16; dst.len()];
        u16::read_into(src, order, &mut bits);
        for (d, b) in dst.iter_mut().zip(bits) {
            *d = f16::from_bits(b);
        }
    }
}

/// Decode a buffer of stored values. Trailing bytes that do not make up a whole value are
/// ignored.
pub fn decode<T: FromStored>(src: &[u8], order: Order) -> Vec<T> {
    let n = src.len() / T::SIZE;
    let mut dst = vec![T::default(); n];
    T::read_into(&src[..n * T::SIZE], order, &mut dst);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_and_little_endian() {
        let b = [0x3f, 0x80, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00];
        assert_eq!(decode::<f32>(&b, Order::BE), [1.0, 2.0]);

        let l = 1.5f64.to_le_bytes();
        assert_eq!(decode::<f64>(&l, Order::LE), [1.5]);

        assert_eq!(decode::<i16>(&[0xff, 0xfe], Order::BE), [-2]);
        assert_eq!(decode::<u16>(&[0x01, 0x02, 0x03], Order::LE), [0x0201]);
        assert_eq!(decode::<i8>(&[0xff, 1], Order::LE), [-1, 1]);
    }

    #[test]
    fn half_floats() {
        let v = decode::<f16>(&f16::from_f32(0.5).to_bits().to_be_bytes(), Order::BE);
        assert_eq!(v[0].to_f32(), 0.5);
    }
}
