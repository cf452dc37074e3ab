use clap::{Args, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use linkdrop::commands::PeerOptions;
use linkdrop::config::TransferConfig;
use linkdrop::networking::PeerPlatform;

#[derive(Parser)]
#[command(name = "linkdrop")]
#[command(about = "Encrypted file transfer over a freshly formed local link", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with transfer settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files or folders
    Send {
        /// Files or folders to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        link: LinkArgs,
    },
    /// Receive files into a directory
    Receive {
        /// Destination directory
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,

        #[command(flatten)]
        link: LinkArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Platform {
    Android,
    Apple,
}

impl From<Platform> for PeerPlatform {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Android => PeerPlatform::Android,
            Platform::Apple => PeerPlatform::Apple,
        }
    }
}

#[derive(Args)]
struct LinkArgs {
    /// Platform of the other device; decides which side hosts
    #[arg(long, value_enum, default_value = "android")]
    peer_platform: Platform,

    /// Address of the peer (needed when this device joins)
    #[arg(long)]
    peer: Option<IpAddr>,

    /// Link credential (generated when hosting, prompted when joining)
    #[arg(long)]
    credential: Option<String>,

    /// Port to listen on or connect to (default: 3290)
    #[arg(short, long)]
    port: Option<u16>,

    /// Plaintext bytes per encrypted chunk
    #[arg(long)]
    chunk_size: Option<usize>,
}

impl LinkArgs {
    fn into_options(self, config_path: Option<&PathBuf>) -> Result<PeerOptions, Box<dyn Error>> {
        let mut config = match config_path {
            Some(path) => TransferConfig::from_file(path)?,
            None => TransferConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        config.validate()?;

        Ok(PeerOptions {
            peer_platform: self.peer_platform.into(),
            peer_addr: self.peer,
            credential: self.credential,
            config,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Send { paths, link } => {
            let options = link.into_options(cli.config.as_ref())?;
            linkdrop::commands::send::run(&paths, options).await?;
        }
        Commands::Receive { dest, link } => {
            let options = link.into_options(cli.config.as_ref())?;
            linkdrop::commands::receive::run(&dest, options).await?;
        }
    }

    Ok(())
}
