//! Selections of a dataset for region reads.
//!
//! A selection may extend past the end of the dataset; cells outside hold the sentinel of the
//! dataset.
use std::ops::{Range, RangeFrom, RangeFull, RangeInclusive, RangeTo, RangeToInclusive};

use anyhow::{anyhow, ensure, Result};

/// An extent of a dimension.
///
/// ```rust
/// # use h5range::extent::Extent;
/// fn take_extent(e: impl Into<Extent>) {}
/// take_extent(3u64);
/// take_extent(..);
/// take_extent(..5u64);
/// take_extent(3..74u64);
/// take_extent(3..=74u64);
/// // Start at 3 with 74 elements
/// take_extent((3u64, 74u64));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// From `start` to the end of the dimension.
    Slice { start: u64 },

    /// `start..end`
    SliceEnd { start: u64, end: u64 },

    /// `count` elements from `start`.
    SliceCount { start: u64, count: u64 },

    /// A single index.
    Index(u64),
}

impl Extent {
    /// Start and count along a dimension of size `dimsize`.
    fn start_count(&self, dimsize: u64) -> (u64, u64) {
        match *self {
            Extent::Index(i) => (i, 1),
            Extent::Slice { start } => (start, dimsize.saturating_sub(start)),
            Extent::SliceEnd { start, end } => (start, end.saturating_sub(start)),
            Extent::SliceCount { start, count } => (start, count),
        }
    }
}

impl From<u64> for Extent {
    fn from(i: u64) -> Self {
        Extent::Index(i)
    }
}

impl From<RangeFrom<u64>> for Extent {
    fn from(r: RangeFrom<u64>) -> Self {
        Extent::Slice { start: r.start }
    }
}

impl From<Range<u64>> for Extent {
    fn from(r: Range<u64>) -> Self {
        Extent::SliceEnd {
            start: r.start,
            end: r.end,
        }
    }
}

impl From<RangeTo<u64>> for Extent {
    fn from(r: RangeTo<u64>) -> Self {
        Extent::SliceEnd { start: 0, end: r.end }
    }
}

impl From<RangeToInclusive<u64>> for Extent {
    fn from(r: RangeToInclusive<u64>) -> Self {
        Extent::SliceEnd {
            start: 0,
            end: r.end.saturating_add(1),
        }
    }
}

impl From<RangeInclusive<u64>> for Extent {
    fn from(r: RangeInclusive<u64>) -> Self {
        Extent::SliceEnd {
            start: *r.start(),
            end: r.end().saturating_add(1),
        }
    }
}

impl From<RangeFull> for Extent {
    fn from(_: RangeFull) -> Self {
        Extent::Slice { start: 0 }
    }
}

impl From<(u64, u64)> for Extent {
    fn from((start, count): (u64, u64)) -> Self {
        Extent::SliceCount { start, count }
    }
}

/// A selection in a dataset, one `Extent` per dimension.
///
/// ```rust
/// # use h5range::extent::{Extent, Extents};
/// fn take_extents(extents: impl Into<Extents>) {}
/// // Everything
/// take_extents(..);
/// // The first 10 rows and the first 2 columns
/// take_extents([..10u64, ..2]);
/// take_extents([(0u64, 10u64), (0, 2)]);
/// // Mixed kinds of extents
/// take_extents(vec![Extent::Index(4), (5u64..).into()]);
/// // Start and count
/// take_extents((&[1u64, 2][..], &[3u64, 2][..]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Extents {
    #[default]
    All,
    Extent(Vec<Extent>),
}

impl From<RangeFull> for Extents {
    fn from(_: RangeFull) -> Self {
        Extents::All
    }
}

impl From<Vec<Extent>> for Extents {
    fn from(v: Vec<Extent>) -> Self {
        Extents::Extent(v)
    }
}

impl From<&Extents> for Extents {
    fn from(e: &Extents) -> Self {
        e.clone()
    }
}

macro_rules! impl_extents_from {
    ($item: ty) => {
        impl<const N: usize> From<[$item; N]> for Extents {
            fn from(a: [$item; N]) -> Self {
                Extents::Extent(a.into_iter().map(Extent::from).collect())
            }
        }

        impl From<Vec<$item>> for Extents {
            fn from(v: Vec<$item>) -> Self {
                Extents::Extent(v.into_iter().map(Extent::from).collect())
            }
        }
    };
}

impl_extents_from!(u64);
impl_extents_from!(Range<u64>);
impl_extents_from!(RangeFrom<u64>);
impl_extents_from!(RangeTo<u64>);
impl_extents_from!(RangeToInclusive<u64>);
impl_extents_from!(RangeInclusive<u64>);
impl_extents_from!(RangeFull);
impl_extents_from!((u64, u64));

impl From<(&[u64], &[u64])> for Extents {
    /// Start and count. Pairs beyond the shorter of the two are dropped, which `resolve` then
    /// reports as a rank mismatch.
    fn from((start, count): (&[u64], &[u64])) -> Self {
        Extents::Extent(
            start
                .iter()
                .zip(count)
                .map(|(&start, &count)| Extent::SliceCount { start, count })
                .collect(),
        )
    }
}

impl<T, Din, Dout> TryFrom<&ndarray::SliceInfo<T, Din, Dout>> for Extents
where
    T: AsRef<[ndarray::SliceInfoElem]>,
    Din: ndarray::Dimension,
    Dout: ndarray::Dimension,
{
    type Error = anyhow::Error;

    fn try_from(s: &ndarray::SliceInfo<T, Din, Dout>) -> Result<Self> {
        use ndarray::SliceInfoElem;

        let elems: &[SliceInfoElem] = s.as_ref();

        elems
            .iter()
            .map(|e| match *e {
                SliceInfoElem::Slice { start, end, step } => {
                    ensure!(step == 1, "strides are not supported");
                    let start = u64::try_from(start)?;
                    Ok(match end {
                        Some(end) => Extent::SliceEnd {
                            start,
                            end: u64::try_from(end)?,
                        },
                        None => Extent::Slice { start },
                    })
                }
                SliceInfoElem::Index(i) => Ok(Extent::Index(u64::try_from(i)?)),
                SliceInfoElem::NewAxis => Err(anyhow!("new axes are not supported")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Extents::Extent)
    }
}

impl Extents {
    /// Start and count per dimension of a dataset with `shape`. The selection may run past the
    /// end of the dataset, but its end must be addressable.
    pub fn resolve(&self, shape: &[u64]) -> Result<(Vec<u64>, Vec<u64>)> {
        match self {
            Extents::All => Ok((vec![0; shape.len()], shape.to_vec())),
            Extents::Extent(e) => {
                ensure!(
                    e.len() == shape.len(),
                    "selection of rank {} for dataset of rank {}",
                    e.len(),
                    shape.len()
                );

                e.iter()
                    .zip(shape)
                    .map(|(e, d)| {
                        let (start, count) = e.start_count(*d);
                        ensure!(
                            start.checked_add(count).is_some(),
                            "selection of {count} elements from {start} overflows"
                        );
                        Ok((start, count))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(|v| v.into_iter().unzip())
            }
        }
    }
}
