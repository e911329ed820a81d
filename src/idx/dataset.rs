use bytes::Bytes;
use half::f16;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use strength_reduce::StrengthReducedU64;

use crate::error::{Error, Result};
use crate::filters::byteorder::{decode, FromStored, Order};
use crate::format::layout::Layout;
use crate::format::messages::{Dataspace, Filter, StringPadding, TypeMessage};
use crate::format::Sizes;

/// Maximum dimension of an unlimited dataspace dimension.
const UNLIMITED: u64 = u64::MAX;

/// Element type of a dataset.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,

    /// Fixed length strings of the given size in bytes.
    FixedString(u32),

    /// Variable length strings stored in the global heap.
    VarString,
}

impl Datatype {
    /// Decode a datatype message. Returns the byte order of numeric types (little endian for
    /// strings).
    pub fn from_message(t: &TypeMessage) -> Result<(Datatype, Order)> {
        use Datatype::*;

        Ok(match *t {
            TypeMessage::Integer {
                size,
                signed,
                order,
            } => {
                let dtype = match (size, signed) {
                    (1, true) => Int8,
                    (2, true) => Int16,
                    (4, true) => Int32,
                    (8, true) => Int64,
                    (1, false) => UInt8,
                    (2, false) => UInt16,
                    (4, false) => UInt32,
                    (8, false) => UInt64,
                    (size, _) => {
                        return Err(Error::Unsupported(format!("{size} byte integers")));
                    }
                };
                (dtype, order)
            }
            TypeMessage::Float { size, order } => {
                let dtype = match size {
                    2 => Float16,
                    4 => Float32,
                    8 => Float64,
                    size => return Err(Error::Unsupported(format!("{size} byte floats"))),
                };
                (dtype, order)
            }
            TypeMessage::FixedString { size, .. } => (FixedString(size), Order::LE),
            TypeMessage::VarString { .. } => (VarString, Order::LE),
            TypeMessage::Other { class, .. } => {
                return Err(Error::Unsupported(format!("datatype class {class}")));
            }
        })
    }

    /// Size in bytes of numeric elements.
    pub fn size(&self) -> Option<usize> {
        use Datatype::*;

        match self {
            Int8 | UInt8 => Some(1),
            Int16 | UInt16 | Float16 => Some(2),
            Int32 | UInt32 | Float32 => Some(4),
            Int64 | UInt64 | Float64 => Some(8),
            FixedString(_) | VarString => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.size().is_some()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Datatype::Float16 | Datatype::Float32 | Datatype::Float64)
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Datatype::*;

        match self {
            Int8 => write!(f, "int8"),
            Int16 => write!(f, "int16"),
            Int32 => write!(f, "int32"),
            Int64 => write!(f, "int64"),
            UInt8 => write!(f, "uint8"),
            UInt16 => write!(f, "uint16"),
            UInt32 => write!(f, "uint32"),
            UInt64 => write!(f, "uint64"),
            Float16 => write!(f, "float16"),
            Float32 => write!(f, "float32"),
            Float64 => write!(f, "float64"),
            FixedString(n) => write!(f, "string[{n}]"),
            VarString => write!(f, "string"),
        }
    }
}

/// Decoded values of one chunk or region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedArray {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float16(Vec<f16>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// Apply `$e` to the vector inside any variant of a `TypedArray`.
macro_rules! with_values {
    ($a:expr, $v:ident => $e:expr) => {
        match $a {
            TypedArray::Int8($v) => $e,
            TypedArray::Int16($v) => $e,
            TypedArray::Int32($v) => $e,
            TypedArray::Int64($v) => $e,
            TypedArray::UInt8($v) => $e,
            TypedArray::UInt16($v) => $e,
            TypedArray::UInt32($v) => $e,
            TypedArray::UInt64($v) => $e,
            TypedArray::Float16($v) => $e,
            TypedArray::Float32($v) => $e,
            TypedArray::Float64($v) => $e,
        }
    };
}
pub(crate) use with_values;

impl TypedArray {
    /// Decode stored numeric values.
    pub fn decode(dtype: Datatype, order: Order, data: &[u8]) -> Result<TypedArray> {
        use Datatype::*;

        Ok(match dtype {
            Int8 => TypedArray::Int8(decode(data, order)),
            Int16 => TypedArray::Int16(decode(data, order)),
            Int32 => TypedArray::Int32(decode(data, order)),
            Int64 => TypedArray::Int64(decode(data, order)),
            UInt8 => TypedArray::UInt8(decode(data, order)),
            UInt16 => TypedArray::UInt16(decode(data, order)),
            UInt32 => TypedArray::UInt32(decode(data, order)),
            UInt64 => TypedArray::UInt64(decode(data, order)),
            Float16 => TypedArray::Float16(decode(data, order)),
            Float32 => TypedArray::Float32(decode(data, order)),
            Float64 => TypedArray::Float64(decode(data, order)),
            FixedString(_) | VarString => {
                return Err(Error::Unsupported(format!("{dtype} as numeric array")))
            }
        })
    }

    /// `n` copies of `fill` (stored representation), or of the sentinel of the type when no
    /// fill value is given.
    pub fn filled(
        dtype: Datatype,
        order: Order,
        n: usize,
        fill: Option<&[u8]>,
    ) -> Result<TypedArray> {
        match (fill, dtype.size()) {
            (Some(f), Some(sz)) if f.len() >= sz => {
                let one = TypedArray::decode(dtype, order, &f[..sz])?;
                Ok(with_values!(one, v => match v.first() {
                    Some(x) => vec![*x; n].into(),
                    None => TypedArray::sentinel(dtype, n),
                }))
            }
            _ => Ok(TypedArray::sentinel(dtype, n)),
        }
    }

    /// NaN for floats, zero for integers.
    fn sentinel(dtype: Datatype, n: usize) -> TypedArray {
        use Datatype::*;

        match dtype {
            Int8 => TypedArray::Int8(vec![0; n]),
            Int16 => TypedArray::Int16(vec![0; n]),
            Int32 => TypedArray::Int32(vec![0; n]),
            Int64 => TypedArray::Int64(vec![0; n]),
            UInt16 => TypedArray::UInt16(vec![0; n]),
            UInt32 => TypedArray::UInt32(vec![0; n]),
            UInt64 => TypedArray::UInt64(vec![0; n]),
            Float16 => TypedArray::Float16(vec![f16::NAN; n]),
            Float32 => TypedArray::Float32(vec![f32::NAN; n]),
            Float64 => TypedArray::Float64(vec![f64::NAN; n]),
            UInt8 | FixedString(_) | VarString => TypedArray::UInt8(vec![0; n]),
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Datatype {
        match self {
            TypedArray::Int8(_) => Datatype::Int8,
            TypedArray::Int16(_) => Datatype::Int16,
            TypedArray::Int32(_) => Datatype::Int32,
            TypedArray::Int64(_) => Datatype::Int64,
            TypedArray::UInt8(_) => Datatype::UInt8,
            TypedArray::UInt16(_) => Datatype::UInt16,
            TypedArray::UInt32(_) => Datatype::UInt32,
            TypedArray::UInt64(_) => Datatype::UInt64,
            TypedArray::Float16(_) => Datatype::Float16,
            TypedArray::Float32(_) => Datatype::Float32,
            TypedArray::Float64(_) => Datatype::Float64,
        }
    }

    /// Values converted to `f64`, lossy for 64 bit integers.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            TypedArray::Float16(v) => v.iter().map(|x| x.to_f64()).collect(),
            TypedArray::Int64(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::UInt64(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::Int8(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::Int16(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::Int32(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::UInt8(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::UInt16(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::UInt32(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::Float32(v) => v.iter().map(|x| *x as f64).collect(),
            TypedArray::Float64(v) => v.clone(),
        }
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    pub fn into_vec<T: Element>(self) -> Option<Vec<T>> {
        T::unwrap(self)
    }
}

/// Numeric element types of a `TypedArray`.
pub trait Element: FromStored + fmt::Debug + Send + Sync + 'static {
    const DTYPE: Datatype;

    fn slice(a: &TypedArray) -> Option<&[Self]>;
    fn unwrap(a: TypedArray) -> Option<Vec<Self>>;
}

macro_rules! element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: Datatype = Datatype::$variant;

            fn slice(a: &TypedArray) -> Option<&[Self]> {
                match a {
                    TypedArray::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn unwrap(a: TypedArray) -> Option<Vec<Self>> {
                match a {
                    TypedArray::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }

        impl From<Vec<$t>> for TypedArray {
            fn from(v: Vec<$t>) -> Self {
                TypedArray::$variant(v)
            }
        }
    };
}

element!(i8, Int8);
element!(i16, Int16);
element!(i32, Int32);
element!(i64, Int64);
element!(u8, UInt8);
element!(u16, UInt16);
element!(u32, UInt32);
element!(u64, UInt64);
element!(f16, Float16);
element!(f32, Float32);
element!(f64, Float64);

/// Trim a stored fixed length string according to its padding.
pub fn trim_string(b: &[u8], padding: StringPadding) -> String {
    let end = match padding {
        StringPadding::NullTerminated | StringPadding::NullPadded => {
            b.iter().position(|&c| c == 0).unwrap_or(b.len())
        }
        StringPadding::SpacePadded => b.iter().rposition(|&c| c != b' ').map_or(0, |p| p + 1),
    };
    String::from_utf8_lossy(&b[..end]).into_owned()
}

/// Everything needed to read a dataset, decoded from its object header.
#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub path: String,

    /// Address of the object header.
    pub addr: u64,
    pub shape: Vec<u64>,
    pub max_shape: Option<Vec<u64>>,
    pub dtype: Datatype,
    pub order: Order,

    /// Padding of string types.
    pub padding: Option<StringPadding>,

    /// Size of one stored element in bytes.
    pub element_size: u32,

    /// Chunk shape. The whole dataset is one chunk for contiguous and compact layouts.
    pub chunk_dims: Vec<u64>,
    pub layout: Layout,
    pub filters: Vec<Filter>,

    /// Stored representation of the fill value, if defined.
    pub fill_value: Option<Bytes>,

    chunk_shape_reduced: Vec<StrengthReducedU64>,

    /// Chunk grid fixed array and implicit indices are laid out over: that of the maximum
    /// dimensions, where they are fixed.
    index_grid: Vec<u64>,

    /// Number of chunks spanned by one step in each dimension of the index grid.
    scaled_dim_sz: Vec<u64>,

    /// Number of elements spanned by one step in each dimension of a chunk.
    chunk_dim_sz: Vec<u64>,
}

/// Row-major strides of `shape`.
fn strides(shape: &[u64]) -> Vec<u64> {
    let mut d = shape
        .iter()
        .rev()
        .scan(1, |p, &c| {
            let sz = *p;
            *p *= c;
            Some(sz)
        })
        .collect::<Vec<u64>>();
    d.reverse();
    d
}

impl DatasetDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: &str,
        addr: u64,
        space: &Dataspace,
        dtype_msg: &TypeMessage,
        layout: Layout,
        filters: Vec<Filter>,
        fill_value: Option<Bytes>,
        sizes: Sizes,
    ) -> Result<DatasetDescriptor> {
        let (dtype, order) = Datatype::from_message(dtype_msg)?;

        let padding = match dtype_msg {
            TypeMessage::FixedString { padding, .. } | TypeMessage::VarString { padding } => {
                Some(*padding)
            }
            _ => None,
        };

        let shape = space.dims().to_vec();
        let max_shape = match space {
            Dataspace::Simple { max_dims, .. } => max_dims.clone(),
            _ => None,
        };

        let (chunk_dims, element_size) = match &layout {
            Layout::Chunked {
                chunk_dims,
                element_size,
                ..
            } => {
                if chunk_dims.len() != shape.len() {
                    return Err(Error::format(
                        addr,
                        format!(
                            "chunk rank {} differs from dataspace rank {}",
                            chunk_dims.len(),
                            shape.len()
                        ),
                    ));
                }
                if chunk_dims.iter().any(|c| *c == 0) {
                    return Err(Error::format(addr, "chunk dimension of size zero"));
                }
                (chunk_dims.clone(), *element_size)
            }
            _ => (
                shape.iter().map(|d| (*d).max(1)).collect(),
                dtype_msg.size(sizes),
            ),
        };

        let index_grid = match &max_shape {
            Some(max) if max.len() == shape.len() => max
                .iter()
                .zip(&shape)
                .zip(&chunk_dims)
                .map(|((m, d), z)| {
                    let extent = if *m == UNLIMITED { *d } else { (*m).max(*d) };
                    extent.div_ceil(*z)
                })
                .collect::<Vec<_>>(),
            _ => shape
                .iter()
                .zip(&chunk_dims)
                .map(|(d, z)| d.div_ceil(*z))
                .collect(),
        };

        let product = |v: &[u64], init: u64| v.iter().try_fold(init, |n, d| n.checked_mul(*d));
        if product(&shape, element_size as u64).is_none()
            || product(&chunk_dims, element_size as u64).is_none()
            || product(&index_grid, 1).is_none()
        {
            return Err(Error::format(
                addr,
                format!("dataset of {shape:?} in chunks of {chunk_dims:?} is too large"),
            ));
        }

        Ok(DatasetDescriptor {
            path: path.to_string(),
            addr,
            chunk_shape_reduced: chunk_dims.iter().map(|c| StrengthReducedU64::new(*c)).collect(),
            scaled_dim_sz: strides(&index_grid),
            index_grid,
            chunk_dim_sz: strides(&chunk_dims),
            shape,
            max_shape,
            dtype,
            order,
            padding,
            element_size,
            chunk_dims,
            layout,
            filters,
            fill_value,
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements in dataset.
    pub fn size(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Dataset contains a single scalar value.
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.layout, Layout::Chunked { .. })
    }

    /// Elements in one chunk.
    pub fn chunk_len(&self) -> u64 {
        self.chunk_dims.iter().product()
    }

    /// Bytes in one unfiltered chunk.
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_len() * self.element_size as u64
    }

    /// Number of chunks along each dimension.
    pub fn grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunk_dims)
            .map(|(d, z)| d.div_ceil(*z))
            .collect()
    }

    pub fn num_chunks(&self) -> u64 {
        self.grid().iter().product()
    }

    /// Chunk grid coordinate of the chunk containing the element at `indices`.
    pub fn chunk_coord(&self, indices: &[u64]) -> Vec<u64> {
        debug_assert_eq!(indices.len(), self.chunk_shape_reduced.len());

        indices
            .iter()
            .zip(&self.chunk_shape_reduced)
            .map(|(&i, &ch)| i / ch)
            .collect()
    }

    /// Chunk grid of the maximum dimensions, or of the current ones where a dimension is
    /// unlimited.
    pub fn index_grid(&self) -> &[u64] {
        &self.index_grid
    }

    /// Position of `coord` in the row-major index grid.
    pub fn chunk_linear(&self, coord: &[u64]) -> u64 {
        coord
            .iter()
            .zip(&self.scaled_dim_sz)
            .fold(0, |offset, (c, sz)| offset + c * sz)
    }

    /// Offset in elements of `indices` (absolute) within the chunk at `coord`.
    pub fn offset_in_chunk(&self, coord: &[u64], indices: &[u64]) -> u64 {
        indices
            .iter()
            .zip(coord)
            .zip(&self.chunk_dims)
            .zip(&self.chunk_dim_sz)
            .fold(0, |start, (((i, c), z), sz)| start + (i - c * z) * sz)
    }

    /// Whether `coord` is inside the chunk grid.
    pub fn valid_coord(&self, coord: &[u64]) -> bool {
        coord.len() == self.rank() && coord.iter().zip(self.grid()).all(|(c, g)| *c < g)
    }

    /// Coordinates of all chunks intersecting the box at `start` with `count` elements per
    /// dimension, clipped to the dataset.
    pub fn chunks_in(&self, start: &[u64], count: &[u64]) -> Vec<Vec<u64>> {
        if self.is_scalar() {
            return vec![vec![]];
        }

        let mut first = Vec::with_capacity(self.rank());
        let mut last = Vec::with_capacity(self.rank());

        for ((s, c), d) in start.iter().zip(count).zip(&self.shape) {
            let end = s.saturating_add(*c).min(*d);
            if *s >= end {
                return Vec::new();
            }
            first.push(*s);
            last.push(end - 1);
        }

        self.chunk_coord(&first)
            .into_iter()
            .zip(self.chunk_coord(&last))
            .map(|(a, b)| a..=b)
            .multi_cartesian_product()
            .collect()
    }

    /// Coordinates of every chunk in the grid.
    pub fn all_chunks(&self) -> Vec<Vec<u64>> {
        self.chunks_in(&vec![0; self.rank()], &self.shape)
    }

    /// Array of `n` sentinel values: the fill value if defined, otherwise NaN or zero.
    pub fn sentinel(&self, n: usize) -> Result<TypedArray> {
        TypedArray::filled(self.dtype, self.order, n, self.fill_value.as_deref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::layout::IndexKind;

    pub(crate) fn test_dataset(shape: &[u64], chunk: &[u64]) -> DatasetDescriptor {
        bounded_dataset(shape, None, chunk).unwrap()
    }

    pub(crate) fn bounded_dataset(
        shape: &[u64],
        max: Option<&[u64]>,
        chunk: &[u64],
    ) -> Result<DatasetDescriptor> {
        DatasetDescriptor::new(
            "/test",
            0,
            &Dataspace::Simple {
                dims: shape.to_vec(),
                max_dims: max.map(|m| m.to_vec()),
            },
            &TypeMessage::Float {
                size: 4,
                order: Order::LE,
            },
            Layout::Chunked {
                chunk_dims: chunk.to_vec(),
                element_size: 4,
                index: IndexKind::BTreeV1,
                index_addr: 0x800,
            },
            vec![],
            None,
            Sizes::default(),
        )
    }

    #[test]
    fn chunk_geometry() {
        let d = test_dataset(&[1000, 1000], &[512, 512]);

        assert_eq!(d.grid(), [2, 2]);
        assert_eq!(d.num_chunks(), 4);
        assert_eq!(d.chunk_len(), 512 * 512);
        assert_eq!(d.chunk_coord(&[0, 0]), [0, 0]);
        assert_eq!(d.chunk_coord(&[511, 512]), [0, 1]);
        assert_eq!(d.chunk_coord(&[999, 999]), [1, 1]);
        assert_eq!(d.chunk_linear(&[1, 0]), 2);
        assert_eq!(d.offset_in_chunk(&[1, 1], &[513, 515]), 512 + 3);
        assert!(d.valid_coord(&[1, 1]));
        assert!(!d.valid_coord(&[2, 0]));
    }

    #[test]
    fn chunks_in_region() {
        let d = test_dataset(&[1000, 1000], &[512, 512]);

        assert_eq!(d.chunks_in(&[0, 0], &[100, 100]), [[0, 0]]);
        assert_eq!(d.chunks_in(&[900, 900], &[100, 100]), [[1, 1]]);
        assert_eq!(
            d.chunks_in(&[500, 0], &[20, 600]),
            [[0, 0], [0, 1], [1, 0], [1, 1]]
        );

        // Overhang is clipped.
        assert_eq!(d.chunks_in(&[900, 900], &[500, 500]), [[1, 1]]);
        assert!(d.chunks_in(&[1000, 0], &[10, 10]).is_empty());
        assert!(d.chunks_in(&[0, 0], &[0, 10]).is_empty());

        // Boxes running off the end of the address space are clipped too.
        assert_eq!(d.chunks_in(&[600, 0], &[u64::MAX, 1]), [[1, 0]]);
        assert!(d.chunks_in(&[u64::MAX, 0], &[2, 2]).is_empty());

        assert_eq!(d.all_chunks().len(), 4);
    }

    #[test]
    fn index_grid_of_maximum_dimensions() {
        let d = bounded_dataset(&[20, 10], Some(&[20, 20]), &[10, 10]).unwrap();
        assert_eq!(d.grid(), [2, 1]);
        assert_eq!(d.index_grid(), [2, 2]);
        assert_eq!(d.chunk_linear(&[1, 0]), 2);

        // Unlimited dimensions follow the current extent.
        let d = bounded_dataset(&[20, 10], Some(&[UNLIMITED, 30]), &[10, 10]).unwrap();
        assert_eq!(d.index_grid(), [2, 3]);
        assert_eq!(d.chunk_linear(&[1, 0]), 3);
    }

    #[test]
    fn oversized_dataspace() {
        let r = bounded_dataset(&[u64::MAX / 2, 4], None, &[10, 10]);
        assert!(matches!(r, Err(Error::Format { .. })));

        let r = bounded_dataset(&[10, 10], None, &[u64::MAX / 2, 10]);
        assert!(matches!(r, Err(Error::Format { .. })));
    }

    #[test]
    fn rank_mismatch() {
        let r = DatasetDescriptor::new(
            "/x",
            0x40,
            &Dataspace::Simple {
                dims: vec![10, 10],
                max_dims: None,
            },
            &TypeMessage::Float {
                size: 4,
                order: Order::LE,
            },
            Layout::Chunked {
                chunk_dims: vec![10],
                element_size: 4,
                index: IndexKind::BTreeV1,
                index_addr: 0,
            },
            vec![],
            None,
            Sizes::default(),
        );
        assert!(matches!(r, Err(Error::Format { addr: 0x40, .. })));
    }

    #[test]
    fn contiguous_is_one_chunk() {
        let d = DatasetDescriptor::new(
            "/c",
            0,
            &Dataspace::Simple {
                dims: vec![3, 4],
                max_dims: None,
            },
            &TypeMessage::Integer {
                size: 2,
                signed: false,
                order: Order::BE,
            },
            Layout::Contiguous {
                addr: 0x100,
                size: Some(24),
            },
            vec![],
            None,
            Sizes::default(),
        )
        .unwrap();

        assert_eq!(d.chunk_dims, [3, 4]);
        assert_eq!(d.element_size, 2);
        assert_eq!(d.num_chunks(), 1);
        assert_eq!(d.dtype, Datatype::UInt16);
    }

    #[test]
    fn sentinels() {
        let d = test_dataset(&[2, 2], &[2, 2]);
        let s = d.sentinel(3).unwrap();
        assert!(s.as_slice::<f32>().unwrap().iter().all(|v| v.is_nan()));

        let fill = (-9999.0f32).to_le_bytes();
        let s = TypedArray::filled(Datatype::Float32, Order::LE, 2, Some(&fill)).unwrap();
        assert_eq!(s, TypedArray::Float32(vec![-9999.0, -9999.0]));

        let s = TypedArray::filled(Datatype::Int16, Order::LE, 2, None).unwrap();
        assert_eq!(s, TypedArray::Int16(vec![0, 0]));
    }

    #[test]
    fn strings() {
        assert_eq!(trim_string(b"EPSG\0\0", StringPadding::NullPadded), "EPSG");
        assert_eq!(trim_string(b"ab  ", StringPadding::SpacePadded), "ab");
        assert_eq!(trim_string(b"abc", StringPadding::NullTerminated), "abc");
    }

    #[test]
    fn unsupported_types() {
        assert!(Datatype::from_message(&TypeMessage::Other { class: 6, size: 8 })
            .unwrap_err()
            .is_unsupported());
        assert!(Datatype::from_message(&TypeMessage::Integer {
            size: 3,
            signed: true,
            order: Order::LE
        })
        .is_err());
    }
}
