use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use dgscore::data::histogram::Histogram;
use dgsslice::config::{PolarizedSliceRequest, SliceRequest};
use dgsslice::slice::slicer::Slicer;
use dgsslice::store::ArtifactStore;

#[derive(Parser)]
#[command(author, version, about = "Normalized, background-subtracted slices of spectrometer event data")]
struct Cli {
    /// Directory holding the event sets and receiving the results
    #[arg(long, global = true, default_value = ".", value_hint = ValueHint::DirPath)]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reduce one event set into a histogram
    Slice(RequestArgs),

    /// Flipping-ratio corrected spin-flip / non-spin-flip pair
    Polarized(RequestArgs),

    /// List the artifacts in the store directory
    List,
}

#[derive(Args)]
struct RequestArgs {
    /// Slice request (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    request: PathBuf,

    /// Keep the result in memory only
    #[arg(long)]
    no_persist: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn print_summary(name: &str, histogram: &Histogram) {
    let dims: Vec<String> = histogram.axes.iter().map(|a| format!("{}: {}", a.name, a.n_bins())).collect();
    println!(
        "{:<16} shape [{}]  finite bins {}/{}  total {:.6e}",
        name,
        dims.join(", "),
        histogram.finite_bins(),
        histogram.n_bins(),
        histogram.total_signal()
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cli = Cli::parse();
    let mut slicer = Slicer::new(ArtifactStore::with_directory(&cli.store));

    match cli.command {
        Command::Slice(args) => {
            let request = SliceRequest::from_json_file(&args.request)?;
            let histogram = slicer.make_slice(&request)?;
            print_summary(&request.name, &histogram);
            if !args.no_persist {
                let path = slicer.store().persist(&request.name)?;
                println!("written to {}", path.display());
            }
        }
        Command::Polarized(args) => {
            let request = PolarizedSliceRequest::from_json_file(&args.request)?;
            let (sf, nsf) = slicer.make_paired_slice(&request)?;
            let names = [format!("{}_SF", request.name), format!("{}_NSF", request.name)];
            print_summary(&names[0], &sf);
            print_summary(&names[1], &nsf);
            if !args.no_persist {
                for name in &names {
                    let path = slicer.store().persist(name)?;
                    println!("written to {}", path.display());
                }
            }
        }
        Command::List => {
            for name in slicer.store().names_on_disk()? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}
