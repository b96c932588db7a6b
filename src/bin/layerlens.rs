use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use layerlens::oci::{ImageRef, Platform};
use layerlens::{Config, Image, ImageBrowser};

/// Browse container image contents straight from the registry.
#[derive(Parser)]
#[command(name = "layerlens", version, about)]
struct Cli {
    /// YAML config file (defaults plus LAYERLENS_* variables when omitted)
    #[arg(long, global = true, env = "LAYERLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Registry host[:port] for references that do not name one
    #[arg(long, global = true)]
    registry: Option<String>,

    #[arg(long, global = true)]
    username: Option<String>,

    /// Environment variable holding the registry password
    #[arg(long, global = true)]
    password_env: Option<String>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List repositories
    Catalog,
    /// List the tags of a repository
    Tags {
        repository: String,
    },
    /// Print the images a reference resolves to, as JSON
    Inspect {
        image: String,
    },
    /// List every file visible in the image
    Ls(ImageArgs),
    /// Show which layer provides a path
    Find {
        #[command(flatten)]
        image: ImageArgs,
        path: String,
    },
    /// Write a file from the image to stdout
    Cat {
        #[command(flatten)]
        image: ImageArgs,
        path: String,
    },
}

#[derive(Args)]
struct ImageArgs {
    /// Image reference: [registry/]repository[:tag|@digest]
    image: String,

    /// os/arch[/variant]; defaults to the host platform
    #[arg(long)]
    platform: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(host) = &cli.registry {
        config.registry.host = host.clone();
    }
    if let Some(user) = &cli.username {
        config.registry.username = Some(user.clone());
    }
    if let Some(var) = &cli.password_env {
        config.registry.password = None;
        config.registry.password_env = Some(var.clone());
    }
    config.validate()?;

    match &cli.command {
        Command::Catalog => {
            let browser = ImageBrowser::new(&config)?;
            for repo in browser.catalog().await? {
                println!("{repo}");
            }
        }
        Command::Tags { repository } => {
            let image_ref = resolve_ref(&mut config, repository)?;
            let browser = ImageBrowser::new(&config)?;
            for tag in browser.tags(&image_ref.repository).await? {
                println!("{tag}");
            }
        }
        Command::Inspect { image } => {
            let image_ref = resolve_ref(&mut config, image)?;
            let browser = ImageBrowser::new(&config)?;
            let images = browser
                .images(&image_ref.repository, &image_ref.reference)
                .await?;
            println!("{}", serde_json::to_string_pretty(&images)?);
        }
        Command::Ls(args) => {
            let (browser, image_ref, image) = open_image(&mut config, args).await?;
            let mut out = io::stdout().lock();
            for entry in browser.list_files(&image_ref.repository, &image).await? {
                writeln!(out, "{} {} {}", entry.depth, entry.digest, entry.path)?;
            }
        }
        Command::Find { image: args, path } => {
            let (browser, image_ref, image) = open_image(&mut config, args).await?;
            let entry = browser
                .find_file(&image_ref.repository, &image, path)
                .await?;
            println!("{} {} {}", entry.depth, entry.digest, entry.path);
        }
        Command::Cat { image: args, path } => {
            let (browser, image_ref, image) = open_image(&mut config, args).await?;
            let data = browser
                .read_file(&image_ref.repository, &image, path)
                .await?;
            let mut out = io::stdout().lock();
            out.write_all(&data)?;
            out.flush()?;
        }
    }

    Ok(())
}

/// Parse `raw` against the configured registry. A reference that names its
/// own registry switches the config to it, without the configured credentials.
fn resolve_ref(config: &mut Config, raw: &str) -> Result<ImageRef, Box<dyn std::error::Error>> {
    let image_ref = ImageRef::parse_with_registry(raw, &config.registry.host)?;
    config.switch_registry(&image_ref.registry);
    Ok(image_ref)
}

async fn open_image(
    config: &mut Config,
    args: &ImageArgs,
) -> Result<(ImageBrowser, ImageRef, Image), Box<dyn std::error::Error>> {
    let platform = args.platform.as_deref().map(Platform::parse).transpose()?;
    let image_ref = resolve_ref(config, &args.image)?;
    let browser = ImageBrowser::new(config)?;
    let image = browser
        .image(&image_ref.repository, &image_ref.reference, platform.as_ref())
        .await?;
    Ok((browser, image_ref, image))
}
