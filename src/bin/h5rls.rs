//! List the datasets of a HDF5 file, local or behind a URL.
use clap::Parser;
use h5range::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path or http(s) URL of the file.
    input: String,

    /// Also list the attributes of each dataset.
    #[arg(short, long)]
    attributes: bool,
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

    let d = r.discover().await?;

    println!("{:50} {:>20} {:10} {:>16} filters:", "path:", "shape:", "type:", "chunks:");
    for ds in &d.datasets {
        let filters = ds
            .filters
            .iter()
            .map(|f| f.name.clone().unwrap_or_else(|| format!("#{}", f.id)))
            .collect::<Vec<_>>();

        println!(
            "{:50} {:>20} {:10} {:>16} {}",
            ds.path,
            format!("{:?}", ds.shape),
            ds.dtype.to_string(),
            format!("{:?}", ds.chunk_dims),
            filters.join(",")
        );

        if args.attributes {
            for a in r.attributes(&ds.path).await? {
                println!("{:4}@{} = {:?}", "", a.name, a.value);
            }
        }
    }

    for (path, e) in &d.failures {
        eprintln!("{path}: {e}");
    }

    eprintln!("{:?}", r.streaming_stats());

    Ok(())
}
