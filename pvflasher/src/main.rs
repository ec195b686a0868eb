use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use pvflasher_core::bmap::{self, Bmap, ChecksumType, CreateOptions};
use pvflasher_core::catalog;
use pvflasher_core::device::{self, Device};
use pvflasher_core::flash::{self, verify, FlashOptions, FlashResult, Phase, ProgressEvent};
use std::io::{stdout, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{tcsetattr, Termios, TCSANOW};

#[derive(Parser)]
#[command(name = "pvflasher")]
#[command(about = "A cross-platform, bmap-aware disk image flasher", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered storage devices
    List,

    /// Write an image to a device, using a bmap when one is available
    Copy {
        /// Image file: raw, compressed, or a tar archive holding one
        image: PathBuf,

        /// Target device (e.g. /dev/sdb or PhysicalDrive2)
        device: PathBuf,

        /// Path to a .bmap file; auto-discovered next to the image if unset
        #[arg(long)]
        bmap: Option<PathBuf>,

        /// Write even if the target has mounted volumes
        #[arg(long)]
        force: bool,

        /// Skip the verification pass after writing
        #[arg(long = "no-verify")]
        no_verify: bool,

        /// Don't eject the device when done
        #[arg(long = "no-eject")]
        no_eject: bool,

        /// Emit newline-delimited JSON progress and a JSON result
        #[arg(long)]
        json: bool,
    },

    /// Create a bmap file from an image
    Create {
        /// Image file to map
        image: PathBuf,

        /// Output path (default: <image>.bmap)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Block size in bytes
        #[arg(short, long, default_value_t = 4096)]
        block_size: u64,
    },

    /// Verify a device against a bmap file
    Verify {
        /// Device to re-read
        device: PathBuf,

        /// The bmap describing what should be on it
        bmap: PathBuf,
    },

    /// Download an official release and flash it interactively
    Install {
        /// Write even if the target has mounted volumes
        #[arg(long)]
        force: bool,

        /// Skip the verification pass after writing
        #[arg(long = "no-verify")]
        no_verify: bool,

        /// Don't eject the device when done
        #[arg(long = "no-eject")]
        no_eject: bool,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it gives a cleaner exit when the user cancels the operation.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original = match Termios::from_fd(fd) {
                Ok(t) => t,
                Err(_) => {
                    return Self {
                        original_termios: None,
                    };
                }
            };

            let mut modified = original;
            modified.c_lflag &= !ECHOCTL;
            if tcsetattr(fd, TCSANOW, &modified).is_ok() {
                Self {
                    original_termios: Some(original),
                }
            } else {
                Self {
                    original_termios: None,
                }
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original).ok();
        }
    }
}

/// A progress bar that re-styles itself when the pipeline changes phase.
struct PhaseBar {
    bar: ProgressBar,
    phase: Option<Phase>,
}

impl PhaseBar {
    fn new() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            phase: None,
        }
    }

    fn update(&mut self, event: &ProgressEvent) {
        if self.phase != Some(event.phase) {
            self.phase = Some(event.phase);
            self.bar.finish_and_clear();
            self.bar = ProgressBar::new(event.bytes_total.max(1));
            let prefix = match event.phase {
                Phase::Extracting => "Extracting",
                Phase::Writing => "Writing",
                Phase::Syncing => "Syncing",
                Phase::Verifying => "Verifying",
                Phase::Ejecting => "Ejecting",
                Phase::Validating => "Validating",
            };
            self.bar.set_prefix(prefix);
            self.bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    )
                    .unwrap()
                    .progress_chars("■ "),
            );
        }
        if event.bytes_total > 0 {
            self.bar.set_length(event.bytes_total);
        }
        self.bar.set_position(event.bytes_processed);
    }

    fn finish(&self, message: &'static str) {
        self.bar.finish_with_message(message);
    }

    fn clear(&self) {
        self.bar.finish_and_clear();
    }
}

fn print_summary(result: &FlashResult) {
    println!(
        "\n✨ Flash completed successfully ({})",
        if result.used_bmap { "bmap copy" } else { "raw copy" }
    );
    println!(
        "   Bytes written: {} ({:.2} MB)",
        result.bytes_written,
        result.bytes_written as f64 / (1024.0 * 1024.0)
    );
    println!("   Duration: {:.2}s", result.duration.as_secs_f64());
    println!(
        "   Average speed: {:.2} MB/s",
        result.average_speed / (1024.0 * 1024.0)
    );
    if !result.verification_done {
        println!("   Verification skipped.");
    }
    if !result.device_ejected {
        println!("   Device not ejected.");
    }
}

fn run_copy(
    image: PathBuf,
    device_path: PathBuf,
    bmap: Option<PathBuf>,
    force: bool,
    no_verify: bool,
    no_eject: bool,
    json: bool,
    running: Arc<AtomicBool>,
) -> Result<()> {
    // Probe the conventional bmap locations unless one was given.
    let bmap_path = match bmap {
        Some(path) => Some(path),
        None => {
            let found = flash::flasher::discover_bmap(&image);
            if let Some(path) = &found {
                if !json {
                    println!("Auto-detected bmap: {}", path.display());
                }
            }
            found
        }
    };

    let opts = FlashOptions {
        image_path: image,
        device_path,
        bmap_path,
        force,
        no_verify,
        no_eject,
    };

    let result = if json {
        flash::run(&opts, &running, |event| {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        })?
    } else {
        let mut bar = PhaseBar::new();
        let outcome = flash::run(&opts, &running, |event| bar.update(&event));
        match outcome {
            Ok(result) => {
                bar.finish("done");
                result
            }
            Err(e) => {
                bar.clear();
                return Err(e.into());
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(())
}

fn run_create(image: PathBuf, output: Option<PathBuf>, block_size: u64) -> Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.bmap", image.display())));

    println!("Creating bmap for {}...", image.display());
    let opts = CreateOptions {
        block_size,
        checksum_type: ChecksumType::Sha256,
    };
    let bmap = bmap::create(&image, &opts)?;
    bmap.save(&output)?;

    println!(
        "Bmap file created: {} ({} of {} blocks mapped)",
        output.display(),
        bmap.mapped_blocks_count,
        bmap.blocks_count
    );
    Ok(())
}

fn run_verify(device_path: PathBuf, bmap_path: PathBuf, running: Arc<AtomicBool>) -> Result<()> {
    let bmap = Bmap::parse(&std::fs::read(&bmap_path)?)?;

    let mut bar = PhaseBar::new();
    let outcome = verify::run(
        &device_path,
        verify::VerifySource::Bmap(&bmap),
        &running,
        |event| bar.update(&event),
    );
    match outcome {
        Ok(()) => {
            bar.finish("done");
            println!("\n✨ Verification passed.");
            Ok(())
        }
        Err(e) => {
            bar.clear();
            Err(e.into())
        }
    }
}

/// Presents an interactive menu and returns the chosen index.
fn select_from(prompt: &str, items: &[String]) -> Result<usize> {
    if items.is_empty() {
        return Err(anyhow!("nothing to select from"));
    }
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(items)
        .default(0)
        .interact()?;
    Ok(selection)
}

fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmation)
}

fn select_target_device() -> Result<Device> {
    let devices = device::list()?;
    if devices.is_empty() {
        return Err(anyhow!(
            "No target devices found. Insert a USB drive or SD card."
        ));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let index = select_from("Select the target device to WRITE to", &items)?;
    Ok(devices[index].clone())
}

fn run_install(
    force: bool,
    no_verify: bool,
    no_eject: bool,
    running: Arc<AtomicBool>,
) -> Result<()> {
    println!("Fetching releases...");
    let releases = catalog::fetch_releases()?;

    let channels: Vec<String> = releases.channels().iter().map(|s| s.to_string()).collect();
    let channel = channels[select_from("Select channel", &channels)?].clone();

    let versions: Vec<String> = releases
        .versions(&channel)
        .iter()
        .map(|s| s.to_string())
        .collect();
    let version = versions[select_from("Select version", &versions)?].clone();

    let release = releases
        .release(&channel, &version)
        .ok_or_else(|| anyhow!("release {}/{} disappeared from the catalog", channel, version))?;
    let devices = release.devices();
    let names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
    let entry = devices[select_from("Select device", &names)?];

    println!(
        "\nSelected: {} / {} / {}",
        style(&channel).cyan(),
        style(&version).cyan(),
        style(&entry.name).cyan()
    );

    let image_url = &entry.full_image.url;
    let expected_sha = &entry.full_image.sha256;
    if image_url.is_empty() {
        return Err(anyhow!("selected release has no full image url"));
    }

    let cache_path = catalog::cached_image_path(image_url)?;
    if catalog::validate_cached_file(&cache_path, expected_sha) {
        println!("Using cached image: {}", cache_path.display());
    } else {
        println!("Downloading image to: {}", cache_path.display());
        let bar = ProgressBar::new(1);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{prefix:12} [{elapsed_precise}] [{bar:40.blue/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .unwrap()
                .progress_chars("■ "),
        );
        bar.set_prefix("Downloading");

        catalog::download_with_sha(image_url, &cache_path, expected_sha, |progress| {
            if progress.phase == "validating" {
                bar.set_prefix("Validating");
            }
            if let Some(total) = progress.total {
                bar.set_length(total);
            }
            bar.set_position(progress.downloaded);
        })?;
        bar.finish_and_clear();
        println!("Download complete and verified.");
    }

    let target = select_target_device()?;

    println!(
        "{} This will erase all data on '{}'.",
        style("WARNING:").red().bold(),
        target.path,
    );
    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Install cancelled.");
        return Ok(());
    }
    println!();

    run_copy(
        cache_path,
        PathBuf::from(&target.path),
        None,
        force,
        no_verify,
        no_eject,
        false,
        running,
    )
}

fn run_list() -> Result<()> {
    let devices = device::list()?;
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Available devices:");
    for device in devices {
        let removable = if device.removable { " (Removable)" } else { "" };
        println!("- {}{}", device, removable);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // This guard is dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cooperative cancellation: Ctrl+C clears the flag and the copy loop
    // stops before its next buffer.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::List => run_list(),
        Commands::Copy {
            image,
            device,
            bmap,
            force,
            no_verify,
            no_eject,
            json,
        } => run_copy(image, device, bmap, force, no_verify, no_eject, json, running),
        Commands::Create {
            image,
            output,
            block_size,
        } => run_create(image, output, block_size),
        Commands::Verify { device, bmap } => run_verify(device, bmap, running),
        Commands::Install {
            force,
            no_verify,
            no_eject,
        } => run_install(force, no_verify, no_eject, running),
    }
}
