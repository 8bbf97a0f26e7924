mod ply;

use clap::{ArgGroup, Parser};
use pcz_lib::common::ZSTD_MAX_COMPRESSION_LVL;
use pcz_lib::{decode, decode_async, encode, encode_async, DecodedCloud};
use std::cmp::min;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "Point Cloud Compressor/Decompressor",
    version = "1.0",
    about = "Compresses or decompresses point cloud PLY files"
)]
#[command(group(
    ArgGroup::new("mode").required(true).args(&["compress", "decompress"])
))]
struct Cli {
    #[arg(short = 'e', long = "compress", help = "Enable compression mode.")]
    compress: bool,

    #[arg(short = 'd', long = "decompress", help = "Enable decompression mode.")]
    decompress: bool,

    #[arg(
        short = 's',
        long = "skip-synthesized-colors",
        default_value = "false",
        help = "Omit colors from the output PLY when the container marks them as synthesized defaults (only valid with decompression)."
    )]
    skip_synthesized_colors: bool,

    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input file."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "OUTPUT",
        required = true,
        help = "Path to the output file."
    )]
    output: String,

    #[arg(
        short = 'c',
        long = "compression-level",
        value_name = "LEVEL",
        default_value = "3",
        help = "Set the compression level."
    )]
    compression_level: u32,

    #[arg(
        short = 'w',
        long = "workers",
        value_name = "WORKERS",
        default_value = "3",
        help = "Set the workers count for ZSTD."
    )]
    workers: u32,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Enable asynchronous compression/decompression mode."
    )]
    async_mode: bool,
}

fn compress_ply(
    raw_data: &[u8],
    level: u32,
    workers: u32,
) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let cloud = ply::parse_ply(raw_data)?;
    let mut container = Vec::new();
    encode(&cloud, level, workers, &mut container)?;
    Ok(container)
}

fn decoded_to_ply(
    decoded: &DecodedCloud,
    skip_synthesized_colors: bool,
) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    if decoded.synthesized_color {
        println!("Colors: synthesized default (input had no color attribute)");
    }
    let include_colors = !(skip_synthesized_colors && decoded.synthesized_color);
    let mut out = Vec::new();
    ply::write_ply(&mut out, decoded, include_colors)?;
    Ok(out)
}

/// Writes the result next to the destination first and renames it into
/// place, so a failed run never leaves a partial output file.
fn write_atomic(path: &str, data: &[u8]) -> std::io::Result<()> {
    let tmp = Path::new(path).with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    if cli.skip_synthesized_colors && !cli.decompress {
        eprintln!(
            "Error: --skip-synthesized-colors (-s) can only be used with decompression (-d)."
        );
        process::exit(1);
    }

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    let mode = if cli.async_mode {
        "Asynchronous"
    } else {
        "Synchronous"
    };
    let op = if cli.compress {
        "Compression"
    } else {
        "Decompression"
    };

    // Print the header info.
    print!(
        "Mode: {} {}\nInput: {} | Output: {}",
        mode, op, cli.input, cli.output
    );
    if cli.compress {
        println!(" | Level: {}", cli.compression_level);
    } else {
        println!(
            " | {} synthesized colors in output",
            if cli.skip_synthesized_colors {
                "Excluding"
            } else {
                "Keeping"
            }
        );
    }

    let cmp_level = min(cli.compression_level, ZSTD_MAX_COMPRESSION_LVL);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let start = Instant::now();

    let result: Vec<u8> = if cli.async_mode {
        rt.block_on(async {
            if cli.compress {
                let cloud = ply::parse_ply(&raw_data)?;
                let mut container = Vec::new();
                encode_async(&cloud, cmp_level, cli.workers, &mut container).await?;
                Ok::<Vec<u8>, Box<dyn Error + Send + Sync>>(container)
            } else {
                let decoded = decode_async(&raw_data).await?;
                decoded_to_ply(&decoded, cli.skip_synthesized_colors)
            }
        })?
    } else if cli.compress {
        compress_ply(&raw_data, cmp_level, cli.workers)?
    } else {
        let decoded = decode(&raw_data)?;
        decoded_to_ply(&decoded, cli.skip_synthesized_colors)?
    };

    let elapsed = start.elapsed().as_millis();
    println!("{} Time: {} ms", op, elapsed);

    write_atomic(&cli.output, &result).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", cli.output, e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", cli.output);

    Ok(())
}
