use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rosalind_stream::source::{
    write_records, BamFilterParams, BamPopulator, BamSource, MappingQualityFilter, RecordSource,
    TextPopulator, TextSource,
};
use rosalind_stream::{
    Deduplicator, GenomeRegion, MergeConfig, MergeCoordinator, RecordStream, SequenceDictionary,
    WindowCache, WindowConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rosalind-stream",
    about = "Merge, deduplicate and window coordinate-sorted alignment streams"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge sorted inputs and print the combined record stream.
    Merge {
        #[command(flatten)]
        inputs: InputArgs,
    },
    /// Sweep every sequence in fixed chunks and report overlapping record counts.
    Window {
        #[command(flatten)]
        inputs: InputArgs,
        /// Bases per overlap query.
        #[arg(long, default_value_t = 1000)]
        chunk: i64,
        /// Chain depth at which a position collapses into an overflow marker.
        #[arg(long, default_value_t = 1000)]
        depth_limit: usize,
        /// Initial number of window slots.
        #[arg(long, default_value_t = 1024)]
        initial_capacity: usize,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Sorted inputs: BAM/SAM/CRAM, or tab-separated record files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Reader threads (defaults to available parallelism).
    #[arg(long)]
    threads: Option<usize>,
    /// Records per packet handed from a reader thread.
    #[arg(long, default_value_t = 100)]
    packet_size: usize,
    /// Packets buffered per reader thread.
    #[arg(long, default_value_t = 4)]
    queue_capacity: usize,
    /// Keep mated duplicates.
    #[arg(long)]
    no_dedup: bool,
    /// Merge inputs even when their sequence dictionaries disagree.
    #[arg(long)]
    ignore_incompatible: bool,
    /// Minimum mapping quality.
    #[arg(long, default_value_t = 0)]
    min_mapq: u8,
    /// Restrict to a region, `name:start-end` (0-based, half-open).
    #[arg(long)]
    region: Option<String>,
    /// Give every text input its own genome origin instead of sharing origin 0.
    #[arg(long)]
    separate_origins: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Merge { inputs } => run_merge(&inputs)?,
        Commands::Window {
            inputs,
            chunk,
            depth_limit,
            initial_capacity,
        } => {
            let config = WindowConfig::default()
                .with_depth_limit(depth_limit)
                .with_initial_capacity(initial_capacity);
            run_window(&inputs, chunk, config)?
        }
    }
    Ok(())
}

fn run_merge(args: &InputArgs) -> Result<()> {
    let (header, mut stream) = open_stream(args)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let mut batch = Vec::with_capacity(1024);
    while let Some(record) = stream.next_record()? {
        batch.push(record);
        if batch.len() == batch.capacity() {
            write_records(&mut out, &header, &batch)?;
            batch.clear();
        }
    }
    write_records(&mut out, &header, &batch)?;
    out.flush()?;

    let counts = stream.counts();
    info!(
        total = counts.total,
        invalid = counts.invalid,
        filtered = counts.filtered,
        duplicate = counts.duplicate,
        output = counts.output,
        bases = counts.total_bases,
        "merge complete"
    );
    Ok(())
}

fn run_window(args: &InputArgs, chunk: i64, config: WindowConfig) -> Result<()> {
    if chunk <= 0 {
        bail!("chunk must be > 0");
    }
    let (header, stream) = open_stream(args)?;
    let mut window = WindowCache::new(stream, 0, config).context("invalid window configuration")?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    for (sequence_id, entry) in header.sequences.iter().enumerate() {
        window.reset_sequence(sequence_id as i32);
        let length = entry.length as i64;
        let mut start = 0;
        while start < length {
            let end = (start + chunk).min(length);
            let hits = window
                .records_overlap(start, end)
                .with_context(|| format!("query {}:{}-{} failed", entry.name, start, end))?;
            let overflow = hits.iter().filter(|record| record.is_overflow()).count();
            writeln!(out, "{}\t{}\t{}\t{}\t{}", entry.name, start, end, hits.len(), overflow)?;
            window.flush(start, end)?;
            start = end;
        }
    }
    out.flush()?;

    let stats = window.stats();
    info!(
        capacity = stats.capacity,
        dropped_overflow = stats.dropped_overflow,
        evicted = stats.evicted,
        skipped = stats.skipped,
        "window sweep complete"
    );
    Ok(())
}

/// Open every input, start the merge and wrap it in deduplication if requested.
fn open_stream(args: &InputArgs) -> Result<(SequenceDictionary, Box<dyn RecordStream>)> {
    let bam_inputs = args.inputs.iter().filter(|path| is_alignment_file(path)).count();
    if bam_inputs != 0 && bam_inputs != args.inputs.len() {
        bail!("cannot mix alignment files and text record files in one merge");
    }

    let mut config = MergeConfig::default()
        .with_packet_size(args.packet_size)
        .with_queue_capacity(args.queue_capacity)
        .with_ignore_incompatible(args.ignore_incompatible);
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }

    let merge = if bam_inputs > 0 {
        let params = BamFilterParams {
            min_mapping_quality: args.min_mapq,
            ..BamFilterParams::default()
        };
        let region = match &args.region {
            Some(text) => {
                let first = BamSource::open(&args.inputs[0], params)
                    .with_context(|| format!("failed to open {}", args.inputs[0].display()))?;
                Some(parse_region(text, first.header())?)
            }
            None => None,
        };
        let sources = args
            .inputs
            .iter()
            .map(|path| {
                let opened = match region {
                    Some(region) => BamSource::open_region(path, region, params),
                    None => BamSource::open(path, params),
                };
                opened.with_context(|| format!("failed to open {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(region) = region {
            config = config.with_region(region);
        }
        MergeCoordinator::new(sources, BamPopulator::new(0), config)?
    } else {
        let sources = args
            .inputs
            .iter()
            .enumerate()
            .map(|(idx, path)| {
                let origin = if args.separate_origins { idx as u32 } else { 0 };
                TextSource::from_path(path)
                    .map(|source| source.with_genome_origin(origin))
                    .with_context(|| format!("failed to open {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        let populator = TextPopulator::new(sources[0].header().clone());
        if let Some(region) = &args.region {
            config = config.with_region(parse_region(region, sources[0].header())?);
        }
        let filter = Arc::new(MappingQualityFilter {
            min_mapping_quality: args.min_mapq,
        });
        MergeCoordinator::with_filter(sources, populator, filter, config)?
    };

    let header = merge.header().clone();
    let stream: Box<dyn RecordStream> = if args.no_dedup {
        Box::new(merge)
    } else {
        Box::new(Deduplicator::new(merge))
    };
    Ok((header, stream))
}

fn is_alignment_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("bam") | Some("sam") | Some("cram")
    )
}

fn parse_region(text: &str, header: &SequenceDictionary) -> Result<GenomeRegion> {
    let (name, span) = text
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("region '{}' must look like name:start-end", text))?;
    let (start, end) = span
        .split_once('-')
        .ok_or_else(|| anyhow!("region '{}' must look like name:start-end", text))?;
    let sequence_id = header
        .sequence_id(name)
        .ok_or_else(|| anyhow!("unknown sequence '{}' in region", name))?;
    let start: i64 = start
        .replace(',', "")
        .parse()
        .with_context(|| format!("invalid region start '{}'", start))?;
    let end: i64 = end
        .replace(',', "")
        .parse()
        .with_context(|| format!("invalid region end '{}'", end))?;
    Ok(GenomeRegion::new(sequence_id, start, end))
}
