// jpeg-info: print what the loader sees in a JPEG file
//
// usage: jpeg-info <file> [--decode <out.pnm>] [--size WxH] [--suspend]
//
// Every image in the file is reported (multi-image streams are read
// back to back from the same session). With --decode the last image is
// written as PGM (grayscale) or PPM (everything else, converted to RGB).
// --size picks the scale denominator the way a thumbnailer would.
// --suspend drives the header reader through the suspended path.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use jpeg_stream::source::IoSource;
use jpeg_stream::{ColorSpace, DecodeSession, Error, HeaderOutcome, ImageInfo, LoaderListener, Warning};

// what the header reader reports for bytes that do not start with SOI
const NOT_A_JPEG: &str = "not a JPEG file: starts with something other than SOI";

/// Print what the loader sees in a JPEG file
#[derive(Parser, Debug)]
#[command(name = "jpeg-info", version, about)]
struct Args {
    /// JPEG file (may hold several images back to back)
    input: PathBuf,

    /// Write the last image as PGM/PPM
    #[arg(long, value_name = "OUT.PNM")]
    decode: Option<PathBuf>,

    /// Target size as WxH; picks the scale denominator
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,

    /// Drive the header reader through the suspended path
    #[arg(long)]
    suspend: bool,
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| "size must be WxH (e.g., 320x240)".to_string())?;
    let w = w.parse::<u32>().map_err(|_| "invalid width")?;
    let h = h.parse::<u32>().map_err(|_| "invalid height")?;
    if w == 0 || h == 0 {
        return Err("width and height must be > 0".to_string());
    }
    Ok((w, h))
}

#[derive(Default)]
struct Report {
    warnings: u32,
    rows: u32,
}

impl LoaderListener for Report {
    fn emit_warning(&mut self, warning: Warning) {
        self.warnings += 1;
        warn!("{} (code {})", warning, warning.code());
    }

    fn input_attributes(&mut self, info: &ImageInfo, icc_profile: Option<&[u8]>) {
        println!(
            "  {}x{} components={} jpeg_cs={:?} out_cs={:?}{}",
            info.width,
            info.height,
            info.num_components,
            info.jpeg_color_space,
            info.out_color_space,
            if info.progressive { " progressive" } else { "" }
        );
        if info.saw_adobe_marker {
            println!("  adobe transform={}", info.adobe_transform);
        }
        for (i, c) in info.components().iter().enumerate() {
            println!("  component {} id={} sampling={}x{}", i, c.id, c.h_samp, c.v_samp);
        }
        match icc_profile {
            Some(p) => println!("  icc profile: {} bytes", p.len()),
            None => println!("  icc profile: none"),
        }
    }

    fn output_attributes(&mut self, width: u32, height: u32) {
        println!("  output {}x{}", width, height);
    }

    fn update_progress(&mut self, scanline: u32) {
        self.rows = scanline;
    }
}

fn write_pnm(path: &Path, width: u32, height: u32, components: usize, pixels: &[u8]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let magic = if components == 1 { "P5" } else { "P6" };
    write!(out, "{}\n{} {}\n255\n", magic, width, height)?;
    out.write_all(pixels)?;
    out.flush()
}

fn read_header(session: &mut DecodeSession<'_>, report: &mut Report, suspend: bool) -> jpeg_stream::Result<HeaderOutcome> {
    session.set_suspendable(suspend);
    let mut fills = 0u32;
    let outcome = loop {
        match session.read_header(report)? {
            HeaderOutcome::Suspended => {
                fills += 1;
                session.fill_suspended_buffer(report)?;
            }
            other => break other,
        }
    };
    if suspend {
        info!("header needed {} suspended fills", fills);
    }
    // entropy data is always read blocking
    session.set_suspendable(false);
    Ok(outcome)
}

fn run(args: &Args) -> jpeg_stream::Result<()> {
    let file = File::open(&args.input).map_err(|e| {
        error!("{}: {}", args.input.display(), e);
        Error::Source("cannot open input")
    })?;

    let mut session = DecodeSession::new()?;
    session.set_source(Box::new(IoSource::new(file)));
    let mut report = Report::default();

    let mut index = 0u32;
    while !session.at_end_of_input()? {
        let info = match read_header(&mut session, &mut report, args.suspend) {
            Ok(HeaderOutcome::Ready(info)) => info,
            Ok(HeaderOutcome::TablesOnly | HeaderOutcome::Suspended) => {
                println!("tables-only stream");
                continue;
            }
            Err(Error::Engine(NOT_A_JPEG)) if index > 0 => {
                warn!("ignoring trailing bytes after image {}", index - 1);
                break;
            }
            Err(e) => return Err(e),
        };
        println!("image {}:", index);

        let (dw, dh) = args.size.unwrap_or((info.width, info.height));
        let out_cs = match info.out_color_space {
            ColorSpace::Grayscale => ColorSpace::Grayscale,
            _ => ColorSpace::Rgb,
        };
        let components = session.start_decompression(out_cs, dw, dh, &mut report)?;
        let (w, h) = (session.engine().output_width(), session.engine().output_height());
        let pixels = vec![0u8; w as usize * h as usize * components];
        let pixels = session.decompress(pixels, true, &mut report)?;
        info!("decoded {} rows", report.rows);

        if let Some(path) = &args.decode {
            write_pnm(path, w, h, components, &pixels).map_err(|e| {
                error!("{}: {}", path.display(), e);
                Error::Source("cannot write output")
            })?;
            println!("  wrote {}", path.display());
        }
        index += 1;
    }

    println!("{} image(s), {} warning(s)", index, report.warnings);
    session.dispose();
    if index == 0 {
        return Err(Error::Engine("no image in input"));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
