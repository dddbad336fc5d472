//! qorepatch CLI - audio prompt patcher for flat Thumb-2 firmware images.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressStyle};
use qorepatch::error::hex_bytes;
use qorepatch::movw::{Movw, MOVW_LEN};
use qorepatch::scanner::EmptySpaceScanner;
use qorepatch::{
    patch_file, FfmpegEncoder, FirmwareImage, PatchConfig, PatchOptions, PayloadSource, ProgressInfo,
    ProgressStage, RawFileSource,
};

/// Inject custom audio prompts into a firmware image.
#[derive(Parser)]
#[command(name = "qorepatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode the prompts and patch them into the firmware
    Patch {
        /// Input firmware image (never modified)
        #[arg(short, long, default_value = "firmware.bin")]
        firmware: PathBuf,

        /// Directory with one source file per prompt (e.g. ID_00.wav)
        #[arg(short, long, default_value = "sounds_src")]
        sounds: PathBuf,

        /// Output file path
        #[arg(short, long, default_value = "firmware_patched.bin")]
        output: PathBuf,

        /// JSON patch table replacing the built-in one
        #[arg(long)]
        table: Option<PathBuf>,

        /// Treat the sound files as already-encoded SBC and skip ffmpeg
        #[arg(long)]
        raw: bool,

        /// ffmpeg binary
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,

        /// Output sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// Seconds to wait for ffmpeg per prompt (0 = no limit)
        #[arg(long, default_value = "60")]
        encoder_timeout: u64,
    },

    /// Locate the free space a patch run would use
    Scan {
        /// Input firmware image
        #[arg(short, long, default_value = "firmware.bin")]
        firmware: PathBuf,

        /// JSON patch table supplying base address and scan settings
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Decode the MOVW size instruction at a virtual address
    Decode {
        /// Input firmware image
        #[arg(short, long, default_value = "firmware.bin")]
        firmware: PathBuf,

        /// Virtual address (hex with 0x prefix, or decimal)
        #[arg(long, value_parser = parse_u32)]
        va: u32,

        /// JSON patch table supplying the base address
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Print the built-in patch table as JSON
    Table,
}

fn main() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Patch {
            firmware,
            sounds,
            output,
            table,
            raw,
            ffmpeg,
            sample_rate,
            encoder_timeout,
        } => {
            let timeout = (encoder_timeout > 0).then(|| Duration::from_secs(encoder_timeout));
            patch(&firmware, &sounds, &output, table.as_deref(), raw, ffmpeg, sample_rate, timeout)
        }
        Commands::Scan { firmware, table } => scan(&firmware, table.as_deref()),
        Commands::Decode { firmware, va, table } => decode(&firmware, va, table.as_deref()),
        Commands::Table => print_table(),
    };

    if let Err(err) = result {
        let code = err
            .downcast_ref::<qorepatch::Error>()
            .map(qorepatch::Error::exit_code)
            .unwrap_or(1);
        tracing::error!("{:#}", err);
        eprintln!("\n[ERROR] operation failed with code {}", code);
        std::process::exit(code);
    }
}

fn load_config(table: Option<&Path>) -> anyhow::Result<PatchConfig> {
    let config = match table {
        Some(path) => PatchConfig::from_json_file(path)?,
        None => PatchConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn patch(
    firmware: &Path,
    sounds: &Path,
    output: &Path,
    table: Option<&Path>,
    raw: bool,
    ffmpeg: PathBuf,
    sample_rate: u32,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    if !firmware.is_file() {
        return Err(qorepatch::Error::Config(format!("file {} not found", firmware.display())).into());
    }
    if !sounds.is_dir() {
        return Err(qorepatch::Error::Config(format!("directory {} not found", sounds.display())).into());
    }

    let config = load_config(table)?;

    let mut source: Box<dyn PayloadSource> = if raw {
        Box::new(RawFileSource::new(sounds))
    } else {
        Box::new(FfmpegEncoder {
            ffmpeg,
            sounds_dir: sounds.to_path_buf(),
            sample_rate,
            timeout,
        })
    };

    // Create progress bar
    let pb = ProgressBar::new(config.targets.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let options = PatchOptions {
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            let msg = match (&info.current_item, info.stage) {
                (_, ProgressStage::PostPatching | ProgressStage::Complete) => info.stage.name().to_string(),
                (Some(item), _) => format!(
                    "{} - {} ({} injected)",
                    info.stage.name(),
                    item,
                    ByteSize::b(info.bytes_injected as u64)
                ),
                (None, _) => info.stage.name().to_string(),
            };
            pb_clone.set_position(info.current as u64);
            pb_clone.set_message(msg);
        })),
        ..Default::default()
    };

    let result = patch_file(&config, firmware, output, source.as_mut(), &options);
    match &result {
        Ok(_) => pb.finish_with_message("Complete"),
        Err(_) => pb.abandon_with_message("Failed"),
    }
    let report = result?;

    let injected: Vec<_> = report.injected().collect();
    println!();
    for inj in &injected {
        println!(
            "{:<12} va 0x{:08X}  {:>10}  ptr 0x{:08X} -> 0x{:08X}  r{} 0x{:X} -> 0x{:X}",
            inj.name,
            inj.va,
            ByteSize::b(inj.size as u64),
            inj.pointer.va,
            inj.pointer.new_value,
            inj.size_fixup.new.rd(),
            inj.size_fixup.old.imm16(),
            inj.size_fixup.new.imm16()
        );
    }
    for name in report.skipped() {
        println!("[SKIP] {}", name);
    }
    println!(
        "\n[SUCCESS] saved: {} ({} prompts, {} injected)",
        output.display(),
        injected.len(),
        ByteSize::b(report.bytes_injected() as u64)
    );

    Ok(())
}

fn scan(firmware: &Path, table: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(table)?;
    let image = FirmwareImage::load(firmware, config.translator())?;
    println!("loading {} ({})", firmware.display(), ByteSize::b(image.len() as u64));

    let scanned = EmptySpaceScanner::new(config.scanner_config()).scan(image.as_bytes())?;
    let translator = image.translator();
    println!(
        "empty run:        0x{:X} .. 0x{:X} ({})",
        scanned.run.start,
        scanned.run.end(),
        ByteSize::b(scanned.run.len as u64)
    );
    println!(
        "injection offset: 0x{:X} (va=0x{:08X}), {} available",
        scanned.injection_offset,
        translator.to_virtual(scanned.injection_offset)?,
        ByteSize::b(scanned.available() as u64)
    );
    Ok(())
}

fn decode(firmware: &Path, va: u32, table: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(table)?;
    let image = FirmwareImage::load(firmware, config.translator())?;

    let offset = image.va_range(va, MOVW_LEN)?.start;
    let bytes = image.read_array::<MOVW_LEN>(offset)?;
    println!("va 0x{:08X} (file_off=0x{:X}): {}", va, offset, hex_bytes(&bytes));

    let insn = Movw::decode(bytes)?;
    println!("{}  (imm16 = {})", insn, insn.imm16());
    Ok(())
}

fn print_table() -> anyhow::Result<()> {
    println!("{}", PatchConfig::default().to_json()?);
    Ok(())
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}
