mod common;

use common::{Dataset, Dtype, Group, TestSource, UNDEF};
use h5range::format::layout::{IndexKind, Layout};
use h5range::source::MemorySource;
use h5range::{Reader, ReaderOptions};
use std::sync::Arc;

fn fixed(i: &[u64]) -> f64 {
    (i[0] * 1000 + i[1]) as f64
}

fn growing(i: &[u64]) -> f64 {
    (i[0] * 7 + i[1] * 3) as f64
}

fn grids() -> Group {
    Group::new()
        .insert(
            "/grids/fixed",
            Dataset::numeric(Dtype::F32, &[1000, 500], fixed)
                .chunked(&[256, 256])
                .max_shape(&[1000, 1000])
                .deflate(4),
        )
        .insert(
            "/grids/growing",
            Dataset::numeric(Dtype::I32, &[300, 200], growing)
                .chunked(&[128, 128])
                .max_shape(&[UNDEF, UNDEF])
                .shuffle()
                .deflate(2),
        )
        .insert(
            "/grids/plain",
            Dataset::numeric(Dtype::F64, &[64, 64], |i| (i[0] + i[1]) as f64)
                .chunked(&[32, 32])
                .allocate(&[&[0, 0], &[1, 1]]),
        )
        .insert(
            "/meta/small",
            Dataset::numeric(Dtype::I16, &[5], |i| i[0] as f64 * 2.),
        )
}

async fn open(f: Vec<u8>) -> Reader {
    Reader::open(Arc::new(MemorySource::new("latest.h5", f)), ReaderOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn listing() {
    let src = TestSource::new("latest.h5", common::write_latest(&grids()));
    let r = Reader::open(src.clone(), ReaderOptions::default()).await.unwrap();

    let datasets = r.list_datasets().await.unwrap();
    let paths = datasets.iter().map(|d| d.path.as_str()).collect::<Vec<_>>();
    assert_eq!(
        paths,
        ["/grids/fixed", "/grids/growing", "/grids/plain", "/meta/small"]
    );

    let fixed = &datasets[0];
    assert_eq!(fixed.shape, [1000, 500]);
    assert_eq!(fixed.max_shape.as_deref(), Some(&[1000u64, 1000][..]));
    assert_eq!(fixed.index_grid(), [4, 4]);
    assert!(matches!(
        fixed.layout,
        Layout::Chunked {
            index: IndexKind::FixedArray { .. },
            ..
        }
    ));

    let growing = &datasets[1];
    assert_eq!(growing.index_grid(), [3, 2]);
    assert!(matches!(
        growing.layout,
        Layout::Chunked {
            index: IndexKind::BTreeV2 { .. },
            ..
        }
    ));

    // Everything listed from the metadata area.
    assert_eq!(src.request_count(), 1);
}

#[tokio::test]
async fn fixed_array_over_maximum_dimensions() {
    let r = open(common::write_latest(&grids())).await;

    let index = r.chunk_index("/grids/fixed").await.unwrap();
    assert_eq!(index.len(), 4 * 2);
    assert_eq!(index.get(&[3, 1]).unwrap().offset, [768, 256]);

    let v = r.read_region("/grids/fixed", 250, 240, 20, 30).await.unwrap();
    let v = v.as_slice::<f32>().unwrap();
    for i in 0..20 {
        for j in 0..30 {
            assert_eq!(v[i * 30 + j], fixed(&[250 + i as u64, 240 + j as u64]) as f32);
        }
    }

    // Inside the maximum dimensions but past the current ones.
    let v = r.read_region("/grids/fixed", 990, 495, 10, 10).await.unwrap();
    let v = v.as_slice::<f32>().unwrap();
    assert_eq!(v[0], fixed(&[990, 495]) as f32);
    assert!(v[5].is_nan());

    let unfiltered = r.chunk_index("/grids/plain").await.unwrap();
    assert_eq!(unfiltered.len(), 2);
    assert_eq!(unfiltered.get(&[1, 1]).unwrap().size, 32 * 32 * 8);
    assert!(unfiltered.get(&[0, 1]).is_none());

    let v = r.read_region("/grids/plain", 31, 31, 2, 2).await.unwrap();
    let v = v.as_slice::<f64>().unwrap();
    assert_eq!(v[0], 62.);
    assert!(v[1].is_nan());
    assert_eq!(v[3], 64.);
}

#[tokio::test]
async fn btree_v2_chunks() {
    let r = open(common::write_latest(&grids())).await;

    let index = r.chunk_index("/grids/growing").await.unwrap();
    assert_eq!(index.len(), 3 * 2);

    let v = r.read_region("/grids/growing", 100, 100, 200, 100).await.unwrap();
    let v = v.as_slice::<i32>().unwrap();
    for i in 0..200 {
        for j in 0..100 {
            assert_eq!(v[i * 100 + j], growing(&[100 + i as u64, 100 + j as u64]) as i32);
        }
    }

    let c = r.read_chunk("/grids/growing", 2, 1).await.unwrap().unwrap();
    assert_eq!(c.as_slice::<i32>().unwrap()[0], growing(&[256, 128]) as i32);
}

#[tokio::test]
async fn contiguous_datasets_and_headers() {
    let r = open(common::write_latest(&grids())).await;

    let v = r.read_slice("/meta/small", ..).await.unwrap();
    assert_eq!(v.as_slice::<i16>().unwrap(), [0, 2, 4, 6, 8]);

    let ds = r.dataset("/meta/small").await.unwrap();
    assert!(matches!(ds.layout, Layout::Contiguous { .. }));
    assert!(r.dataset("/grids/missing").await.is_err());
}
