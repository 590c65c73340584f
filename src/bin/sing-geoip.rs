//! sing-geoip: CLI tool for regenerating country code GeoIP databases.

use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use memmap2::Mmap;
use sing_geoip::{pipeline, CodeReader, GithubReleases, ReleaseConfig, Result};

#[derive(Parser)]
#[command(name = "sing-geoip")]
#[command(author = "Kaitu.io")]
#[command(version)]
#[command(about = "Regenerate country code GeoIP databases from upstream MaxMind DB releases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the latest upstream release and write the full and lite databases
    Release {
        /// YAML release configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Upstream repository (owner/name)
        #[arg(short, long)]
        repository: Option<String>,

        /// Output file of the full database
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output file of the lite database
        #[arg(long)]
        lite_output: Option<PathBuf>,

        /// GitHub access token
        #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Convert a local MaxMind DB file
    Convert {
        /// Input database, plain or gzip compressed
        #[arg(short, long)]
        input: PathBuf,

        /// Output database
        #[arg(short, long)]
        output: PathBuf,

        /// Only include these codes (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        codes: Vec<String>,
    },

    /// Print the code stored for IP addresses
    Lookup {
        /// Generated database
        #[arg(short, long)]
        database: PathBuf,

        /// Addresses to look up
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Release {
            config,
            repository,
            output,
            lite_output,
            token,
        } => release(config.as_deref(), repository, output, lite_output, token),
        Commands::Convert {
            input,
            output,
            codes,
        } => convert(&input, &output, &codes),
        Commands::Lookup { database, ips } => lookup(&database, &ips),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn release(
    config: Option<&Path>,
    repository: Option<String>,
    output: Option<PathBuf>,
    lite_output: Option<PathBuf>,
    token: Option<String>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => ReleaseConfig::load(path)?,
        None => ReleaseConfig::default(),
    };
    if let Some(repository) = repository {
        config.repository = repository;
    }
    if let Some(output) = output {
        config.output = output;
    }
    if let Some(lite_output) = lite_output {
        config.lite_output = lite_output;
    }

    let source = GithubReleases::new(token)?;
    for variant in config.variants() {
        let summary = pipeline::release(&source, &variant)?;
        println!("{}  {}", summary.sha256, summary.output.display());
    }
    Ok(())
}

fn convert(input: &Path, output: &Path, codes: &[String]) -> Result<()> {
    let file = File::open(input)?;
    let mmap = unsafe { Mmap::map(&file)? };

    let summary = pipeline::convert(&mmap, codes, output)?;
    println!(
        "Converted {:?} -> {:?} ({} networks, {} codes)",
        input, output, summary.networks, summary.codes
    );
    Ok(())
}

fn lookup(database: &Path, ips: &[IpAddr]) -> Result<()> {
    let reader = CodeReader::open(database)?;
    for ip in ips {
        let code = reader.lookup(*ip)?;
        println!("{}\t{}", ip, code.as_deref().unwrap_or("-"));
    }
    Ok(())
}
