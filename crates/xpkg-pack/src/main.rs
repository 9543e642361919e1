//! Packages an extension build directory into an `.xpkg` archive.
//!
//! ```text
//! xpkg-pack --input target/release --output demo.xpkg --plugin libdemo.so
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use xpkg_core::package::{PackageBuilder, PackageReport};

/// Package an extension into an .xpkg archive.
#[derive(Parser, Debug)]
#[command(name = "xpkg-pack")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory holding the manifest, binaries and optional files.
    #[arg(short, long, default_value = ".")]
    input: PathBuf,

    /// Archive to write.
    #[arg(short, long)]
    output: PathBuf,

    /// Manifest file, relative to the input directory.
    #[arg(short, long, default_value = "manifest.json")]
    manifest: PathBuf,

    /// Native extension binary, relative to the input directory.
    #[arg(short, long, default_value = "plugin.so")]
    plugin: PathBuf,

    /// Optional portable binary (plugin.wasm), relative to the input directory.
    #[arg(long)]
    portable: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<PackageReport> {
    let mut builder = PackageBuilder::new(&args.input)
        .manifest(&args.manifest)
        .binary(&args.plugin);
    if let Some(portable) = &args.portable {
        builder = builder.portable(portable);
    }
    builder
        .build(&args.output)
        .with_context(|| format!("failed to package {}", args.input.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "xpkg=debug" } else { "xpkg=warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    let report = run(&args)?;
    tracing::debug!(entries = ?report.entries, "Archive written");

    println!(
        "Packed {} {} -> {}",
        report.manifest.id,
        report.manifest.version,
        report.output.display()
    );
    println!("  entries: {}", report.entries.len());
    println!("  sha256:  {}", report.sha256);
    Ok(())
}
