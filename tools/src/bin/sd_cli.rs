use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use libsdspi::{
    CardType, ControlCode, ControlData, DriveState, DriveStatus, FtdiBackend, SdDisk, StaticSocket,
    SECTOR_SIZE,
};

/// Ticked once per millisecond by the timer thread
static DRIVE: DriveState = DriveState::new();

/// Sectors per read request while dumping
const DUMP_CHUNK_SECTORS: u32 = 8;

#[derive(Parser)]
#[command(name = "sd_cli", version = "1.0")]
struct Args {
    /// FTDI device description
    #[arg(short, long, default_value = "Facet2 FabA+ A")]
    device: String,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Command to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print card type, capacity and registers
    Info,
    /// Copy a sector range to a file
    Dump {
        /// Output file
        output: PathBuf,
        /// First sector
        #[arg(short, long, default_value_t = 0)]
        start: u32,
        /// Number of sectors (default: up to the end of the card)
        #[arg(short, long)]
        count: Option<u32>,
    },
}

fn log_level(verbose: u8) -> log::Level {
    match verbose {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

fn query(disk: &mut SdDisk<'_, FtdiBackend>, code: ControlCode) -> Result<ControlData> {
    Ok(disk.control(code)?)
}

fn sector_count(disk: &mut SdDisk<'_, FtdiBackend>) -> Result<u32> {
    match query(disk, ControlCode::GetSectorCount)? {
        ControlData::SectorCount(n) => Ok(n),
        other => Err(anyhow!("Unexpected answer {other:?}")),
    }
}

fn print_info(disk: &mut SdDisk<'_, FtdiBackend>) -> Result<()> {
    let card_type = disk.card_type();
    println!("[+] Card type: {card_type:?}");

    let sectors = sector_count(disk)?;
    println!(
        "[+] Capacity: {} sectors ({} MiB)",
        sectors,
        sectors as u64 * SECTOR_SIZE as u64 / (1024 * 1024)
    );

    if let ControlData::BlockSize(n) = query(disk, ControlCode::GetBlockSize)? {
        println!("[+] Erase block: {n} sectors");
    }
    if let ControlData::Csd(csd) = query(disk, ControlCode::GetCsd)? {
        println!("[+] CSD: {}", hex::encode_upper(csd.0));
    }
    if let ControlData::Cid(cid) = query(disk, ControlCode::GetCid)? {
        println!("[+] CID: {}", hex::encode_upper(cid));
    }
    if let ControlData::Ocr(ocr) = query(disk, ControlCode::GetOcr)? {
        println!("[+] OCR: {}", hex::encode_upper(ocr.0));
    }
    if card_type.contains(CardType::SD2) {
        if let ControlData::SdStatus(status) = query(disk, ControlCode::GetExtendedStatus)? {
            println!("[+] SD status: {}", hex::encode_upper(status));
        }
    }

    Ok(())
}

fn dump(disk: &mut SdDisk<'_, FtdiBackend>, output: PathBuf, start: u32, count: Option<u32>) -> Result<()> {
    let total = sector_count(disk)?;
    if start >= total {
        return Err(anyhow!("Start sector {start} beyond end of card ({total} sectors)"));
    }
    let count = count.unwrap_or(total - start).min(total - start);

    let progress = ProgressBar::new(count as u64 * SECTOR_SIZE as u64)
        .with_style(
            ProgressStyle::default_spinner()
                .template("[{elapsed_precise}, eta:{eta}] {msg} {bar:40.cyan/blue} {bytes} / {total_bytes} ({binary_bytes_per_sec})")?
        );
    progress.set_message("Reading");

    let mut file = File::create(&output)?;
    let mut buf = vec![0u8; DUMP_CHUNK_SECTORS as usize * SECTOR_SIZE];
    let end = start + count;
    let mut sector = start;
    while sector < end {
        let n = DUMP_CHUNK_SECTORS.min(end - sector);
        let chunk = &mut buf[..n as usize * SECTOR_SIZE];
        disk.read(sector, chunk)?;
        file.write_all(chunk)?;
        sector += n;
        progress.inc(chunk.len() as u64);
    }

    progress.finish();
    println!("[*] Wrote {count} sectors to {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::init_with_level(log_level(args.verbose))?;

    // The adapter has no card-detect wiring
    std::thread::spawn(|| {
        let mut socket = StaticSocket::inserted();
        loop {
            DRIVE.tick(&mut socket);
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let mut backend = FtdiBackend::open(&args.device)?;
    backend.initialize()?;

    let mut disk = SdDisk::new(backend, &DRIVE);
    // Let the ticker clear NO_CARD
    std::thread::sleep(Duration::from_millis(5));

    println!("[+] Initializing card...");
    let status = disk.initialize();
    if status.contains(DriveStatus::NOT_INITIALIZED) {
        return Err(anyhow!("Card initialization failed, status {status:?}"));
    }

    match args.command {
        Command::Info => print_info(&mut disk)?,
        Command::Dump { output, start, count } => dump(&mut disk, output, start, count)?,
    }

    if let Err(e) = disk.control(ControlCode::PowerOff) {
        log::warn!("Power off failed: {e}");
    }
    println!("[*] Done");
    Ok(())
}
