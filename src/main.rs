use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};

use osm_harvester::aggregate::MemoryMode;
use osm_harvester::bridge;
use osm_harvester::config::{HarvestConfig, RAM_SAFETY_FACTOR};
use osm_harvester::download::{run_with_cache, RunStatus};
use osm_harvester::estimate::{estimate_usage, RamEstimate};
use osm_harvester::grid::BoundingBox;
use osm_harvester::provider::{FeatureProvider, OverpassProvider, TagSet};
use osm_harvester::reprocess::reprocess_file;
use osm_harvester::ResultCache;

fn main() {
    let matches = Command::new("osm-harvester")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Downloads OpenStreetMap features tile by tile, with memory estimation and export")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity (-v info, -vv debug, -vvv trace)"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("estimate")
                .about("Geocode a location and project the memory cost of a full download")
                .arg(location_arg())
                .arg(tags_arg())
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("download")
                .about("Fetch all tiles for a location and aggregate them")
                .arg(location_arg())
                .arg(tags_arg())
                .arg(
                    Arg::new("mode")
                        .short('m')
                        .long("mode")
                        .default_value("ram")
                        .help("Memory mode: ram, disk, stream, merge or manual"),
                )
                .arg(
                    Arg::new("yes")
                        .short('y')
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Proceed with the download after the estimate"),
                )
                .arg(
                    Arg::new("output-dir")
                        .short('o')
                        .long("output-dir")
                        .help("Directory for exported files (default: current directory)"),
                )
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("reprocess")
                .about("Re-load a merged GeoJSON file in parallel chunks, dropping invalid geometries")
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .required(true)
                        .help("Previously finalized GeoJSON feature collection"),
                )
                .arg(
                    Arg::new("partitions")
                        .short('p')
                        .long("partitions")
                        .required(true)
                        .help("Number of partitions to split the file into"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("Write the filtered collection to this path"),
                ),
        )
        .subcommand(
            Command::new("convert")
                .about("Convert a feature collection between GeoJSON and Parquet")
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .required(true)
                        .help("Input file (.geojson or .parquet)"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .required(true)
                        .help("Output file (.geojson or .parquet)"),
                ),
        )
        .get_matches();

    init_tracing(matches.get_count("verbose"));

    let result = match matches.subcommand() {
        Some(("estimate", sub)) => cmd_estimate(sub),
        Some(("download", sub)) => cmd_download(sub),
        Some(("reprocess", sub)) => cmd_reprocess(sub),
        Some(("convert", sub)) => cmd_convert(sub),
        _ => unreachable!("subcommand is required"),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default tracing subscriber failed");
}

fn location_arg() -> Arg {
    Arg::new("location")
        .short('l')
        .long("location")
        .required(true)
        .help("Location to geocode, e.g. 'Manhattan, New York, USA'")
}

fn tags_arg() -> Arg {
    Arg::new("tags")
        .short('t')
        .long("tags")
        .default_value("highway")
        .help("Comma-separated feature tags (e.g. building,highway,landuse,natural,amenity,leisure,railway)")
}

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .help("JSON config file overriding pipeline defaults")
}

fn load_config(matches: &ArgMatches) -> Result<HarvestConfig, Box<dyn Error>> {
    let mut config = match matches.try_get_one::<String>("config") {
        Ok(Some(path)) => HarvestConfig::from_file(Path::new(path))?,
        _ => HarvestConfig::default(),
    };
    if let Ok(Some(dir)) = matches.try_get_one::<String>("output-dir") {
        config.output_dir = PathBuf::from(dir);
    }
    Ok(config)
}

fn parse_tags(matches: &ArgMatches) -> Result<TagSet, Box<dyn Error>> {
    let raw = matches.get_one::<String>("tags").unwrap();
    let tags = TagSet::from_tags(
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    );
    if tags.is_empty() {
        return Err("at least one tag is required".into());
    }
    Ok(tags)
}

fn print_estimate(bbox: &BoundingBox, estimate: &RamEstimate) {
    let to_mb = |bytes: usize| bytes as f64 / (1024.0 * 1024.0);
    println!(
        "Area bounds: {:.4}, {:.4}, {:.4}, {:.4}",
        bbox.north(),
        bbox.south(),
        bbox.east(),
        bbox.west()
    );
    println!("Total tiles: {}", estimate.tile_count);
    println!(
        "Estimated RAM usage: ~{:.2} MB ({:.2} MB with x{} safety factor)",
        to_mb(estimate.projected_total_bytes),
        to_mb(estimate.projected_total_bytes * RAM_SAFETY_FACTOR),
        RAM_SAFETY_FACTOR
    );
}

fn cmd_estimate(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config = load_config(matches)?;
    let tags = parse_tags(matches)?;
    let location = matches.get_one::<String>("location").unwrap();

    let provider = OverpassProvider::new(&config)?;
    let bbox = provider.geocode(location)?;
    let (estimate, _tiles) = estimate_usage(&provider, &bbox, &tags, config.tile_size_deg)?;
    print_estimate(&bbox, &estimate);
    Ok(())
}

fn cmd_download(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config = load_config(matches)?;
    let tags = parse_tags(matches)?;
    let location = matches.get_one::<String>("location").unwrap();
    let mode: MemoryMode = matches.get_one::<String>("mode").unwrap().parse()?;

    let provider = OverpassProvider::new(&config)?;
    let bbox = provider.geocode(location)?;
    let (estimate, tiles) = estimate_usage(&provider, &bbox, &tags, config.tile_size_deg)?;
    print_estimate(&bbox, &estimate);

    let tiles = config.apply_tile_limit(tiles);
    if !matches.get_flag("yes") {
        println!("Re-run with --yes to download {} tiles.", tiles.len());
        return Ok(());
    }

    let cache = ResultCache::new();
    let report = run_with_cache(&provider, &tiles, &tags, mode, &config, &cache)?;

    match &report.status {
        RunStatus::NoFeatures => {
            println!("No features found for the selected tags in this location.");
        }
        RunStatus::Completed(collection) => {
            println!(
                "Downloaded {} features across {} of {} tiles ({} failed, {} empty).",
                report.feature_count,
                report.tiles_with_features,
                report.tiles_total,
                report.tiles_failed,
                report.tiles_empty
            );
            match collection.output_path() {
                Some(path) => println!("Feature collection written to {}", path.display()),
                None => {
                    // Loaded in memory: export the cached serialization.
                    if let Some(entry) = cache.latest() {
                        let path = config.geojson_output_path();
                        std::fs::write(&path, entry.body)?;
                        println!("Feature collection written to {}", path.display());
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_reprocess(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let file = PathBuf::from(matches.get_one::<String>("file").unwrap());
    let partitions: usize = matches
        .get_one::<String>("partitions")
        .unwrap()
        .parse()
        .map_err(|_| "invalid number of partitions")?;

    // One worker per available core, owned by the shell for the process
    // lifetime; the pipeline only submits partitions to it.
    let pool = rayon::ThreadPoolBuilder::new().build()?;
    let records = reprocess_file(&file, partitions, &pool)?;
    println!("Kept {} valid features from {}.", records.len(), file.display());

    if let Some(output) = matches.get_one::<String>("output") {
        let output = PathBuf::from(output);
        bridge::write_geojson_file(&output, &records)?;
        println!("Filtered collection written to {}", output.display());
    }
    Ok(())
}

fn cmd_convert(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = PathBuf::from(matches.get_one::<String>("input").unwrap());
    let output = PathBuf::from(matches.get_one::<String>("output").unwrap());

    let records = if has_extension(&input, "parquet") {
        bridge::read_parquet(&input)?
    } else {
        bridge::read_geojson_file(&input)?
    };

    if has_extension(&output, "parquet") {
        bridge::write_parquet(&output, &records)?;
    } else {
        bridge::write_geojson_file(&output, &records)?;
    }
    println!(
        "Converted {} features: {} -> {}",
        records.len(),
        input.display(),
        output.display()
    );
    Ok(())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
