//! dscload - a dyld shared cache loader.
//!
//! Inspect a shared cache, list and load its images, and dump exported
//! symbols without a full analysis host attached.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dscload::{
    fast_get_backing_cache_count, CapturingHost, FilePool, LoadSettings, SharedCacheController,
    SymbolKind,
};

/// A dyld shared cache loader.
#[derive(Parser, Debug)]
#[command(name = "dscload")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=error, 1=warn, 2=info, 3=debug)
    #[arg(short, long, default_value = "1", global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show cache format and backing cache layout
    Info {
        /// Path to the primary cache file
        cache: PathBuf,
    },

    /// List images in the cache
    Images {
        /// Filter install names by substring match
        #[arg(short, long)]
        filter: Option<String>,

        /// Show header addresses
        #[arg(short = 'A', long)]
        addresses: bool,

        /// Path to the primary cache file
        cache: PathBuf,
    },

    /// Load an image and report what it materializes
    Load {
        /// Install name or basename of the image
        #[arg(short, long)]
        image: String,

        /// Skip Objective-C post-processing
        #[arg(long)]
        skip_objc: bool,

        /// Path to the primary cache file
        cache: PathBuf,
    },

    /// Dump exported symbols from every image's export trie
    Symbols {
        /// Filter install names by substring match
        #[arg(short, long)]
        filter: Option<String>,

        /// Path to the primary cache file
        cache: PathBuf,
    },

    /// Look up the region and image containing an address
    Lookup {
        /// Address (hex, e.g. 0x180000000)
        address: String,

        /// Path to the primary cache file
        cache: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Info { cache } => cmd_info(cache),
        Commands::Images {
            cache,
            filter,
            addresses,
        } => cmd_images(cache, filter, addresses),
        Commands::Load {
            cache,
            image,
            skip_objc,
        } => cmd_load(cache, image, skip_objc),
        Commands::Symbols { cache, filter } => cmd_symbols(cache, filter),
        Commands::Lookup { cache, address } => cmd_lookup(cache, address),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Opens the cache with a fresh in-memory host.
fn open_cache(cache: &std::path::Path) -> Result<(CapturingHost, SharedCacheController)> {
    if !cache.exists() {
        bail!("cache file not found: {}", cache.display());
    }

    let mut host = CapturingHost::new(1);
    let pool = Arc::new(FilePool::default());
    let settings = LoadSettings {
        // The CLI has no analysis to feed; keep the load lean.
        auto_load_lib_system: false,
        ..LoadSettings::default()
    };
    let controller = SharedCacheController::new(&mut host, cache, pool, settings)
        .with_context(|| format!("failed to open cache {}", cache.display()))?;
    Ok((host, controller))
}

fn cmd_info(cache: PathBuf) -> Result<()> {
    let pool = FilePool::default();
    let backing_count = fast_get_backing_cache_count(&pool, 1, &cache);
    let (_host, controller) = open_cache(&cache)?;

    println!("Cache:    {}", cache.display());
    println!("Backing caches: {backing_count}");
    println!("Images:   {}", controller.images().len());
    if let Some((offset, size)) = controller.objc_optimization_range() {
        println!("ObjC opts: offset {offset:#x}, size {size:#x}");
    }
    println!();

    for backing in controller.backing_caches() {
        let role = if backing.is_primary { "primary" } else { "sub" };
        println!("[{role}] {}", backing.path.display());
        for (i, mapping) in backing.mappings.iter().enumerate() {
            println!(
                "  mapping {i}: {:#x}..{:#x} (file offset {:#x}, prot {:#x}/{:#x})",
                mapping.address,
                mapping.address + mapping.size,
                mapping.file_offset,
                mapping.init_prot,
                mapping.max_prot,
            );
        }
    }
    Ok(())
}

fn cmd_images(cache: PathBuf, filter: Option<String>, addresses: bool) -> Result<()> {
    let (_host, controller) = open_cache(&cache)?;

    let mut names = controller.get_available_images();
    names.sort();

    let mut count = 0usize;
    for name in names {
        if let Some(ref filter) = filter {
            if !name.contains(filter.as_str()) {
                continue;
            }
        }
        count += 1;
        if addresses {
            let address = controller.image_start(&name).unwrap_or(0);
            println!("{address:#014x}  {name}");
        } else {
            println!("{name}");
        }
    }
    eprintln!("{count} images");
    Ok(())
}

fn cmd_load(cache: PathBuf, image: String, skip_objc: bool) -> Result<()> {
    let (mut host, mut controller) = open_cache(&cache)?;

    // Accept basenames the way users type them.
    let install_name = controller
        .get_available_images()
        .into_iter()
        .find(|name| name == &image)
        .or_else(|| {
            controller
                .get_available_images()
                .into_iter()
                .find(|name| name.contains(&image))
        })
        .with_context(|| format!("image not found: {image}"))?;

    if !controller.load_image_with_install_name(&mut host, &install_name, skip_objc) {
        bail!("failed to load {install_name}");
    }

    println!("Loaded {install_name}");
    for region in controller.mapped_regions() {
        println!(
            "  {} at {:#x} (size {:#x}, raw offset {:#x})",
            region.pretty_name, region.start, region.size, region.raw_view_offset_if_loaded,
        );
    }
    println!(
        "{} sections, {} symbols, {} functions queued",
        host.sections.len(),
        host.auto_symbols.len(),
        host.functions.len(),
    );
    Ok(())
}

fn cmd_symbols(cache: PathBuf, filter: Option<String>) -> Result<()> {
    let (mut host, mut controller) = open_cache(&cache)?;

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(format!("walking {} export tries", controller.images().len()));
    bar.enable_steady_tick(std::time::Duration::from_millis(100));

    let symbols = controller.load_all_symbols_and_wait(&mut host);
    bar.finish_and_clear();

    let mut count = 0usize;
    for (install_name, symbol) in symbols {
        if let Some(ref filter) = filter {
            if !install_name.contains(filter.as_str()) {
                continue;
            }
        }
        count += 1;
        let kind = match symbol.kind {
            SymbolKind::Function => "F",
            SymbolKind::Data => "D",
            SymbolKind::External => "E",
        };
        println!("{:#014x} {kind} {} ({install_name})", symbol.address, symbol.name);
    }
    eprintln!("{count} symbols");
    Ok(())
}

fn cmd_lookup(cache: PathBuf, address: String) -> Result<()> {
    let address = address.trim_start_matches("0x");
    let address =
        u64::from_str_radix(address, 16).with_context(|| format!("invalid address {address}"))?;

    let (_host, controller) = open_cache(&cache)?;

    let region = controller.name_for_address(address);
    let image = controller.image_name_for_address(address);

    if region.is_empty() && image.is_empty() {
        bail!("{address:#x} is not covered by any known region");
    }
    if !image.is_empty() {
        println!("image:  {image}");
    }
    if !region.is_empty() {
        println!("region: {region}");
    }
    if let Some(header) = controller.macho_header_for_address(address) {
        println!("install name: {}", header.install_name);
        println!("header: {:#x}", header.text_base);
    }
    Ok(())
}
