use bucketmap::{
    BucketEntry, BucketMap, BucketMapBuilder, BucketMapInfo, PackedBucketMap,
    PackedBucketMapBuilder, DEFAULT_PAGE_SIZE,
};
use clap::{Parser, Subcommand};
use foldhash::fast::FixedState;
use serde_json::Value;
use std::fs::File;
use std::hash::BuildHasher;
use std::io::{BufReader, Error, ErrorKind, Result};
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => run_info(args),
        Command::Convert(args) => run_convert(args),
        Command::Gen(args) => run_gen(args),
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "bucketmap utility for inspecting and creating map image files",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect a map image file and print basic information
    Info(InfoArgs),
    /// Convert a JSON object of string keys to u64 values into a map image
    Convert(ConvertArgs),
    /// Generate a synthetic range of pairs into a map image
    Gen(GenArgs),
}

#[derive(clap::Args)]
struct InfoArgs {
    /// Path to the map image file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional string key to look up (hashed the same way `convert` does)
    #[arg(short, long)]
    key: Option<String>,

    /// Optional integer key to look up verbatim
    #[arg(short = 'r', long)]
    raw_key: Option<u64>,

    /// Optional bucket index to inspect
    #[arg(short, long)]
    bucket: Option<u64>,
}

#[derive(clap::Args)]
struct ConvertArgs {
    /// Path to the source JSON file containing a string-to-integer object
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Path to the map image file to produce
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Store bit-packed keys instead of full keys
    #[arg(long)]
    packed: bool,

    /// Bucket sizing target in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,
}

#[derive(clap::Args)]
struct GenArgs {
    /// Path to the map image file to produce
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// First key of the generated range (inclusive)
    #[arg(long, default_value_t = 0)]
    from: u64,

    /// Last key of the generated range (exclusive)
    #[arg(long)]
    to: u64,

    /// Store bit-packed keys instead of full keys
    #[arg(long)]
    packed: bool,
}

fn key_hasher() -> FixedState {
    FixedState::with_seed(0)
}

fn run_info(args: InfoArgs) -> Result<()> {
    let image = std::fs::read(&args.input)?;
    let packed = image.last().is_some_and(|footer| footer & 0x80 != 0);

    let lookup = args
        .key
        .as_ref()
        .map(|key| key_hasher().hash_one(key.as_str()))
        .or(args.raw_key);

    let (info, found, slot): (BucketMapInfo, Option<u64>, Option<BucketEntry>) = if packed {
        let map = PackedBucketMap::<u64, u64>::from_bytes(&image)?;
        let index = check_bucket_index(args.bucket, map.info().bucket_count)?;
        (
            map.info(),
            lookup.and_then(|k| map.search(k)),
            index.map(|i| map.bucket(i)),
        )
    } else {
        let map = BucketMap::<u64, u64>::from_bytes(&image)?;
        let index = check_bucket_index(args.bucket, map.info().bucket_count)?;
        (
            map.info(),
            lookup.and_then(|k| map.search(k)),
            index.map(|i| map.bucket(i)),
        )
    };

    print_json(&info)?;
    if let Some(key) = lookup {
        println!("{:#x}: {:?}", key, found);
    }
    if let (Some(index), Some(entry)) = (args.bucket, slot) {
        let json = serde_json::to_string_pretty(&entry)
            .map_err(|e| Error::other(format!("Failed to format JSON: {e}")))?;
        println!("Bucket {} entry:\n{}", index, json);
    }
    Ok(())
}

fn check_bucket_index(index: Option<u64>, bucket_count: usize) -> Result<Option<usize>> {
    match index {
        None => Ok(None),
        Some(i) if (i as usize) < bucket_count => Ok(Some(i as usize)),
        Some(i) => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("Bucket index {} out of range >= {}", i, bucket_count),
        )),
    }
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let entries = load_entries_from_json(&args.input)?;
    let hasher = key_hasher();
    let file = File::create(&args.output)?;

    let info = if args.packed {
        let mut builder = PackedBucketMapBuilder::new(entries.len());
        for (key, value) in &entries {
            builder.add(hasher.hash_one(key.as_str()), *value);
        }
        builder.serialize(file, args.page_size)?
    } else {
        let mut builder = BucketMapBuilder::new(entries.len(), args.page_size);
        for (key, value) in &entries {
            builder.add(hasher.hash_one(key.as_str()), *value);
        }
        builder.serialize(file, args.page_size)?
    };

    print_json(&info)
}

fn run_gen(args: GenArgs) -> Result<()> {
    if args.from > args.to {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("range start {} greater than end {}", args.from, args.to),
        ));
    }

    let file = File::create(&args.output)?;
    let info = if args.packed {
        let mut builder = PackedBucketMapBuilder::new((args.to - args.from) as usize);
        for i in args.from..args.to {
            builder.add(i, i - args.from);
        }
        builder.serialize(file, DEFAULT_PAGE_SIZE)?
    } else {
        let mut builder = BucketMapBuilder::new((args.to - args.from) as usize, DEFAULT_PAGE_SIZE);
        for i in args.from..args.to {
            builder.add(i, i - args.from);
        }
        builder.serialize(file, DEFAULT_PAGE_SIZE)?
    };

    print_json(&info)
}

fn print_json(info: &BucketMapInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info)
        .map_err(|e| Error::other(format!("Failed to format JSON: {e}")))?;
    println!("{}", json);
    Ok(())
}

fn load_entries_from_json(path: &Path) -> Result<Vec<(String, u64)>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let value: Value = serde_json::from_reader(reader)
        .map_err(|e| invalid_json(format!("Failed to parse JSON input: {e}")))?;

    let Value::Object(map) = value else {
        return Err(invalid_json(format!(
            "expected a JSON object of string keys to integers, found {value}"
        )));
    };

    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        let value = value
            .as_u64()
            .ok_or_else(|| invalid_json(format!("value for '{key}' is not a u64: {value}")))?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn invalid_json(message: String) -> Error {
    Error::new(ErrorKind::InvalidData, message)
}
