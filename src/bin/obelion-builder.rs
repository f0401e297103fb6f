use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use obelion_builder::config::ImageSource;
use obelion_builder::{
    interrupt, preflight, Architecture, BuildContext, CustomizationBundle, Pipeline,
    RemasterConfig, SystemHost,
};

#[derive(Parser)]
#[command(name = "obelion-builder", version, about = "Remaster installer ISOs into Obelion images")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build remastered images for the configured architectures
    Build(BuildArgs),
    /// Check host tools and free disk space
    Preflight(CommonArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Work directory for cache, mounts, working trees and output
    #[arg(long, default_value = "work")]
    workdir: PathBuf,

    /// Configuration file (default: user config, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct BuildArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Architectures to build, comma separated (default: all configured)
    #[arg(long, value_delimiter = ',')]
    arch: Vec<Architecture>,

    /// Use cached base images only
    #[arg(long)]
    skip_download: bool,

    /// Keep working trees after a successful build
    #[arg(long)]
    keep_work: bool,

    /// Build architectures concurrently
    #[arg(long)]
    parallel: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    interrupt::install_handlers();

    let result = match cli.command {
        Command::Build(args) => cmd_build(args),
        Command::Preflight(args) => cmd_preflight(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn select_images(config: &RemasterConfig, requested: &[Architecture]) -> Result<Vec<ImageSource>> {
    if requested.is_empty() {
        return Ok(config.images.clone());
    }
    let mut images = Vec::new();
    for arch in requested {
        let image = config
            .image_for(*arch)
            .with_context(|| format!("architecture '{}' is not configured", arch))?;
        if !images.iter().any(|i: &ImageSource| i.arch == *arch) {
            images.push(image.clone());
        }
    }
    Ok(images)
}

fn cmd_build(args: BuildArgs) -> Result<ExitCode> {
    let config = RemasterConfig::load_or_default(args.common.config.as_deref())?;
    let images = select_images(&config, &args.arch)?;
    if images.is_empty() {
        bail!("no architectures to build");
    }

    if !preflight::running_as_root() {
        warn!("not running as root; loop devices and mounts will likely fail");
    }
    preflight::check_required_tools(preflight::REQUIRED_TOOLS)?;

    let bundle = CustomizationBundle::from_sources(&config.customization, &config.distro)
        .context("loading customization bundle")?;

    let mut ctx = BuildContext::new(&args.common.workdir, config.distro.clone());
    ctx.skip_download = args.skip_download;
    ctx.keep_work = args.keep_work;

    let host = SystemHost;
    let report = Pipeline::new(&ctx, &host, &bundle).run_all(&images, args.parallel)?;

    println!(
        "{} {} build summary:",
        config.distro.name, config.distro.version
    );
    print!("{}", report.summary());
    println!("report: {}", ctx.report_path().display());

    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_preflight(args: CommonArgs) -> Result<ExitCode> {
    let config = RemasterConfig::load_or_default(args.config.as_deref())?;
    let ctx = BuildContext::new(&args.workdir, config.distro.clone());

    preflight::check_host_tools()?;
    println!("host tools: ok");

    let needed = preflight::required_space(&config.images, &ctx.iso_cache_dir());
    let available = preflight::check_disk_space(ctx.work_dir(), needed)?;
    println!(
        "disk space: ok ({} MiB free, {} MiB needed)",
        available / 1024 / 1024,
        needed / 1024 / 1024
    );

    if !preflight::running_as_root() {
        println!("warning: not running as root");
    }
    Ok(ExitCode::SUCCESS)
}
