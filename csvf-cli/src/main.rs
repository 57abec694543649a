use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;

use crate::cli_helpers::UsbAddr;

mod cli_helpers;

#[derive(clap::Parser)]
struct Args {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Args, Clone, Copy)]
struct GlobalOpts {
    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress_bar: bool,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Compile an SVF or XSVF file into CSVF
    Compile(Compile),
    /// Play a (possibly compressed) CSVF file against a JTAG adapter
    Play(Play),
}

#[derive(clap::Args)]
struct Compile {
    input_file: PathBuf,
    output_file: PathBuf,

    /// Emit uncompressed CSVF instead of applying the zero-run codec
    #[arg(long)]
    no_compress: bool,
}

#[derive(clap::Args)]
struct Play {
    csvf_file: PathBuf,

    #[arg(long, default_value = "ftdi")]
    backend: Backend,

    #[arg(long, default_value_t = UsbAddr { vid: 0x0403, pid: 0x6010 })]
    usb: UsbAddr,

    /// The CSVF file is already uncompressed
    #[arg(long)]
    uncompressed: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum Backend {
    #[default]
    Ftdi,
}

fn main() -> Result<()> {
    init_logging()?;
    let Args { global, command } = Args::parse();
    match command {
        CliCommand::Compile(args) => compile(args)?,
        CliCommand::Play(args) => play(global, args)?,
    }
    Ok(())
}

fn compile(args: Compile) -> Result<()> {
    let input = std::fs::read(&args.input_file)?;
    let is_xsvf = args
        .input_file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xsvf"))
        .unwrap_or(false);

    let (csvf, max_buf_size) = if is_xsvf {
        csvf::xsvf_to_csvf(&input)?
    } else {
        csvf::svf_to_csvf(&input)?
    };
    tracing::info!(max_buf_size, bytes = csvf.len(), "compiled");

    let out = if args.no_compress {
        csvf
    } else {
        csvf::compress(&csvf)
    };
    std::fs::write(&args.output_file, out)?;
    Ok(())
}

fn play(global: GlobalOpts, args: Play) -> Result<()> {
    let raw = std::fs::read(&args.csvf_file)?;
    let mut driver = match args.backend {
        Backend::Ftdi => get_device_ftdi(args.usb)?,
    };

    let spinner = (!global.no_progress_bar).then(|| {
        let bar = indicatif::ProgressBar::new_spinner();
        bar.set_message("playing CSVF stream");
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        bar
    });

    let result = if args.uncompressed {
        csvf::play(&prefix_uncompressed(&raw), &mut driver)
    } else {
        csvf::play(&raw, &mut driver)
    };

    if let Some(bar) = spinner {
        bar.finish_with_message(if result.is_ok() { "done" } else { "failed" });
    }
    result?;
    Ok(())
}

/// The player always consumes a zero-run-compressed stream; wrap an already
/// uncompressed one in a single verbatim chunk so it can still be played.
fn prefix_uncompressed(bytes: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00];
    let len = bytes.len() as u32;
    out.push(0x00);
    out.push(0x00);
    out.push(0x00);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    out.push(0x00);
    out
}

fn get_device_ftdi(addr: UsbAddr) -> Result<jtag_io::ftdi::Device> {
    let dev = ::ftdi::find_by_vid_pid(addr.vid, addr.pid)
        .open()
        .map_err(|e| eyre!("opening {addr}: {e}"))?;
    let dev = jtag_io::ftdi::Device::new(dev, &jtag_io::devices::NEXSYS4)
        .map_err(|e| eyre!("initializing {addr}: {e}"))?;
    Ok(dev)
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}
