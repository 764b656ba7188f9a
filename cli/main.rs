use anyhow::{Context, Result};
use clap::Parser;
use etdk::config::Config;
use etdk::eraser::{ConsolePresenter, Eraser, KeyPresenter};
use etdk::key_manager::KeyMaterial;
use etdk::platform::{NativePlatform, Platform, TargetKind};
use etdk::target_ops::EncryptionTarget;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// ETDK - Encrypt and Delete Key. Makes data powerless.
///
/// Encrypts a file or an entire block device with AES-256-CBC. The key is
/// displayed once, then securely destroyed.
#[derive(Parser)]
#[command(name = "etdk")]
#[command(author, version, about)]
struct Cli {
    /// File or block device to encrypt (e.g. secret.txt, /dev/sdb)
    target: PathBuf,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Skip the YES confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,

    /// Seconds the key stays on screen before it is wiped (at least 3)
    #[arg(long)]
    pause: Option<u64>,
}

fn main() -> ExitCode {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=etdk=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Returns `Ok(false)` when the operator aborted.
fn run(cli: Cli) -> Result<bool> {
    let mut cfg = Config::load_with_env(cli.config.as_deref())?;
    if let Some(secs) = cli.pause {
        cfg.display_pause_secs = secs;
        cfg.validate().context("invalid --pause")?;
    }

    let platform = NativePlatform;
    let eraser = Eraser::new(&platform, cfg);
    let target = eraser
        .target(&cli.target)
        .with_context(|| format!("cannot access {}", cli.target.display()))?;
    info!(target = %cli.target.display(), kind = target.kind().label(), "ETDK starting");

    print_banner(&target);

    if !cli.yes && !confirm(target.path().display().to_string())? {
        println!("Aborted.");
        return Ok(false);
    }
    println!();

    let total = target
        .size()
        .or_else(|| platform.query_target_size(target.path()).ok());
    let pb = create_progress_bar(total, "Encrypting");

    let mut presenter = BarPresenter {
        bar: &pb,
        inner: ConsolePresenter::new(eraser.config().display_pause()),
    };
    let report = eraser.run(&target, &mut presenter, |p| pb.set_position(p.processed));
    if report.is_err() {
        pb.abandon();
    }
    let report = report.context("encryption failed, key material destroyed")?;

    println!("OPERATION SUCCESSFUL");
    println!();
    println!("Target:         {}", target.path().display());
    println!("Status:         ENCRYPTED (AES-256-CBC, {} bytes)", report.bytes_written);
    println!("Encryption key: SECURELY WIPED FROM MEMORY");
    println!();
    println!("The file/device is now encrypted and permanently unrecoverable - worthless without the key.");
    println!();
    println!("To complete secure deletion process:");
    println!(" 1) You can safely remove the encrypted file with normal methods.");
    println!(" 2) Forget the key if you do not need to recover the data.");
    println!();

    Ok(true)
}

fn print_banner(target: &EncryptionTarget) {
    println!();
    println!("ETDK v{} - Encrypt and Delete Key", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Target: {}", target.path().display());
    println!("Type:   {}", target.kind().label());
    println!("Method: Encrypt-then-Delete-Key");
    println!();

    if let (TargetKind::BlockDevice, Some(size)) = (target.kind(), target.size()) {
        println!("Device size: {:.2} GB ({} bytes)", size as f64 / GIB, size);
        println!();
        println!("Devices must not be mounted, and must not host the running OS.");
        println!();
    }
}

fn confirm(target: String) -> Result<bool> {
    println!(
        "WARNING: This will DESTROY all data on {} if you don't save the key!",
        target
    );
    print!("Type YES to confirm: ");
    io::stdout().flush()?;

    let mut response = String::new();
    io::stdin()
        .read_line(&mut response)
        .context("reading confirmation")?;
    Ok(response.trim_end_matches(['\r', '\n']) == "YES")
}

/// Create a styled progress bar for the encryption pass
fn create_progress_bar(total: Option<u64>, message: &str) -> ProgressBar {
    let pb = match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {bytes} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb
        }
    };
    pb.set_message(message.to_string());
    pb
}

/// Clears the progress bar before the key is shown.
struct BarPresenter<'a> {
    bar: &'a ProgressBar,
    inner: ConsolePresenter,
}

impl KeyPresenter for BarPresenter<'_> {
    fn present(&mut self, key: &mut KeyMaterial) -> etdk::error::Result<()> {
        self.bar.finish_with_message("Encrypted");
        println!();
        self.inner.present(key)
    }
}
