//! Read a chunk or a region of a dataset and summarize the values.
use anyhow::ensure;
use clap::Parser;
use h5range::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path or http(s) URL of the file.
    input: String,

    /// Path of the dataset in the file.
    dataset: String,

    /// Chunk coordinate: `row,col`.
    #[arg(long, value_delimiter = ',', conflicts_with = "region")]
    chunk: Option<Vec<u64>>,

    /// Region: `row,col,height,width`.
    #[arg(long, value_delimiter = ',')]
    region: Option<Vec<u64>>,

    /// Print the values.
    #[arg(short, long)]
    values: bool,
}

fn summarize(values: &[f64]) {
    let finite = values.iter().copied().filter(|v| v.is_finite()).collect::<Vec<_>>();

    println!("count: {} ({} finite)", values.len(), finite.len());
    if !finite.is_empty() {
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        println!("min: {min}, max: {max}, mean: {mean}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let r = if args.input.starts_with("http://") || args.input.starts_with("https://") {
        Reader::open_url(&args.input, ReaderOptions::default()).await?
    } else {
        Reader::open_path(&args.input, ReaderOptions::default()).await?
    };

    let ds = r.dataset(&args.dataset).await?;
    println!(
        "{}: {:?} {} in chunks of {:?}",
        ds.path, ds.shape, ds.dtype, ds.chunk_dims
    );

    let values = match (&args.chunk, &args.region) {
        (Some(c), _) => {
            ensure!(c.len() == 2, "--chunk takes row,col");
            match r.read_chunk(&ds.path, c[0], c[1]).await? {
                Some(a) => a.to_f64(),
                None => {
                    println!("chunk {c:?} is not allocated");
                    return Ok(());
                }
            }
        }
        (None, Some(g)) => {
            ensure!(g.len() == 4, "--region takes row,col,height,width");
            r.read_region(&ds.path, g[0], g[1], g[2], g[3]).await?.to_f64()
        }
        (None, None) => match r.read_small_dataset(&ds.path).await? {
            Value::Numeric(a) => a.to_f64(),
            Value::Strings(s) => {
                for v in s {
                    println!("{v}");
                }
                return Ok(());
            }
        },
    };

    summarize(&values);
    if args.values {
        println!("{values:?}");
    }

    let s = r.streaming_stats();
    println!(
        "{} bytes in {} requests ({} failed), {:.1} Mbps, concurrency {}",
        s.total_bytes, s.total_requests, s.failed_requests, s.avg_mbps, s.concurrency
    );

    Ok(())
}
