#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use avrisp_loader::image::FileFormat;
use avrisp_loader::{Action, EraseMode, FlashImage, Fuses, Options, Plan, Programmer, Progress};

/// Baud rate of ArduinoISP style programmers
const DEFAULT_BAUD: usize = 115200;
/// Baud rate of bootloaders entered without a reset, such as ATmegaBOOT
const NO_RESET_BAUD: usize = 19200;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Intel HEX (or .bin) file to write, or to read flash into with --read
    #[structopt(parse(from_os_str))]
    file: Option<PathBuf>,

    /// Serial port to connect to
    #[structopt(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate, 115200 or 19200 with --no-reset
    #[structopt(short, long)]
    baud: Option<usize>,

    /// Always erase the chip
    #[structopt(short = "x", long)]
    erase: bool,

    /// Never erase the chip, by default it is erased before writing
    #[structopt(short = "X", long, conflicts_with = "erase")]
    no_erase: bool,

    /// Flash base address override (hex)
    #[structopt(short = "a", long, parse(try_from_str = parse_hex))]
    base: Option<usize>,

    /// Limit on the bytes read or written, such as 4096, 0x1000 or 4KB
    #[structopt(short = "z", long, parse(try_from_str = parse_size))]
    size: Option<usize>,

    /// Read flash into the file instead of writing it
    #[structopt(short, long)]
    read: bool,

    /// Low fuse byte to program (hex)
    #[structopt(long, parse(try_from_str = parse_byte))]
    lfuse: Option<u8>,

    /// High fuse byte to program (hex)
    #[structopt(long, parse(try_from_str = parse_byte))]
    hfuse: Option<u8>,

    /// Extended fuse byte to program (hex)
    #[structopt(long, parse(try_from_str = parse_byte))]
    efuse: Option<u8>,

    /// Lock byte to program (hex)
    #[structopt(long, parse(try_from_str = parse_byte))]
    lock: Option<u8>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_hex(s: &str) -> Result<usize, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    usize::from_str_radix(s, 16)
}

fn parse_byte(s: &str) -> Result<u8, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(s, 16)
}

fn parse_size(s: &str) -> Result<usize, String> {
    if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return usize::from_str_radix(h, 16).map_err(|e| e.to_string());
    }
    if let Ok(v) = s.parse::<usize>() {
        return Ok(v);
    }
    bytefmt::parse(s).map(|v| v as usize).map_err(|e| e.to_string())
}

/// Console progress bar
#[derive(Default)]
struct Bar(Option<ProgressBar>);

impl Progress for Bar {
    fn init(&mut self, _addr: usize, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})")
                .progress_chars("=> "),
        );
        self.0 = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.0 {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.0.take() {
            pb.finish();
        }
    }
}

impl Args {
    fn erase_mode(&self) -> EraseMode {
        match (self.erase, self.no_erase) {
            (true, _) => EraseMode::Always,
            (_, true) => EraseMode::Never,
            _ => EraseMode::Auto,
        }
    }

    fn fuses(&self) -> Fuses {
        Fuses {
            low: self.lfuse,
            high: self.hfuse,
            extended: self.efuse,
            lock: self.lock,
        }
    }

    fn baud(&self) -> usize {
        match self.baud {
            Some(b) => b,
            None if self.options.no_reset => NO_RESET_BAUD,
            None => DEFAULT_BAUD,
        }
    }
}

fn load(path: &Path) -> anyhow::Result<FlashImage> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let image = FileFormat::from_path(path)
        .load(BufReader::new(f))
        .with_context(|| format!("loading {}", path.display()))?;

    info!(
        "Loaded {} ({}) at 0x{:04x}",
        path.display(),
        bytefmt::format(image.len() as u64),
        image.base
    );

    Ok(image)
}

fn run(args: Args) -> anyhow::Result<()> {
    // Files are checked before the port is touched
    let mut output = None;
    let action = match &args.file {
        Some(path) if args.read => {
            let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            output = Some((path.clone(), f));
            Action::Read
        }
        Some(path) => Action::Write(load(path)?),
        None => Action::Probe,
    };

    let plan = Plan {
        erase: args.erase_mode(),
        base: args.base,
        size: args.size,
        fuses: args.fuses(),
        action,
    };
    debug!("Erase {:?}, fuses {:?}", plan.erase, plan.fuses);

    info!("Connecting to {}", args.port);

    let mut p = Programmer::linux(&args.port, args.baud(), args.options.clone())
        .with_context(|| format!("opening serial port {}", args.port))?;

    let report = p.run(&plan, &mut Bar::default())?;

    println!("{}", report.device);
    if let Some(fuses) = &report.fuses {
        println!("{}", fuses);
    }

    if let (Some(image), Some((path, f))) = (&report.image, output) {
        let mut w = BufWriter::new(f);
        FileFormat::from_path(&path)
            .save(&mut w, image)
            .with_context(|| format!("writing {}", path.display()))?;
        w.flush()?;

        println!(
            "Read Flash[{}] into {}",
            bytefmt::format(image.len() as u64),
            path.display()
        );
    }

    if let Action::Write(image) = &plan.action {
        println!("Write Flash[{}] OK", bytefmt::format(image.len() as u64));
    }

    Ok(())
}

fn main() {
    // Parse out arguments
    let args = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(args.log_level, Config::default());

    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
