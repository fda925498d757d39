//! Survey binning command-line entry point

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use constants::store::CHECKPOINT_FILE;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use survey_binning::analysis::{
    self, ArrayWeights, Histogram, KxKyResponse, LineAxis, OffsetAzimuthHistogram,
    ProfileSegment, RadialResponse, ResponseSettings, SpiderLeg,
};
use survey_binning::logging::init_logging;
use survey_binning::raster_writer::export_all;
use survey_binning::{
    AnalysisStore, BinAddress, BinningEngine, BinningMode, BinningResult, BinningTask, Checkpoint,
    MapBuilder, PointEdits, PointList, ProjectFile, Role, RunOutcome, RunRequest, SurveyGeometry,
    TraceRecord,
};

const PROGRESS_STEPS: u64 = 1000;

#[derive(Parser)]
#[command(name = "survey-binning")]
#[command(about = "Expand survey geometries and bin their traces", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a project's geometry and configuration and print the run plan
    Validate { project: PathBuf },

    /// Bin a project and export rasters
    Bin {
        project: PathBuf,

        /// Write every trace to the analysis store
        #[arg(long)]
        full: bool,

        /// Continue from the last cancelled run's checkpoint
        #[arg(long)]
        resume: bool,

        /// Bin blocks in parallel (basic mode only)
        #[arg(long, conflicts_with_all = ["full", "resume"])]
        parallel: bool,

        /// Raster output directory (default: <project>.maps)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Analysis store directory (overrides the project's)
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Write the deduplicated source and receiver point list
    Points {
        project: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Analyse the traces of one bin, or of a line of bins, from a
    /// complete analysis store
    Query {
        project: PathBuf,

        #[arg(long)]
        inline: Option<u32>,

        #[arg(long)]
        crossline: Option<u32>,

        /// Analyse the whole row (inline) or column (crossline) of bins
        /// through the given index instead of a single bin
        #[arg(long, value_enum)]
        line: Option<LineArg>,

        /// Count each source/receiver pair once
        #[arg(long)]
        unique: bool,

        /// Offset histogram bucket width in metres
        #[arg(long)]
        bucket_width: Option<f64>,

        /// Add the stack response: kx-ky for a bin, radial for a line
        #[arg(long)]
        response: bool,

        /// Largest wavenumber of the response, in cycles per metre
        #[arg(long)]
        k_max: Option<f64>,
    },

    /// Print the kx-ky array response of one of the project's patterns
    Pattern {
        project: PathBuf,

        /// Pattern index in the geometry
        index: usize,

        /// Largest wavenumber, in cycles per metre
        #[arg(long)]
        k_max: Option<f64>,
    },

    /// Delete the project's analysis store
    Invalidate {
        project: PathBuf,

        /// Remove writer and reader locks left behind by crashed processes first
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LineArg {
    Inline,
    Crossline,
}

/// Options of the `query` command
struct QueryOptions {
    inline: Option<u32>,
    crossline: Option<u32>,
    line: Option<LineArg>,
    unique: bool,
    bucket_width: Option<f64>,
    response: bool,
    k_max: Option<f64>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Error: failed to initialise logging: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Validate { project } => validate(&project),
        Command::Bin {
            project,
            full,
            resume,
            parallel,
            out,
            store,
        } => bin(&project, full, resume, parallel, out, store),
        Command::Points { project, out } => points(&project, &out),
        Command::Query {
            project,
            inline,
            crossline,
            line,
            unique,
            bucket_width,
            response,
            k_max,
        } => query(
            &project,
            QueryOptions {
                inline,
                crossline,
                line,
                unique,
                bucket_width,
                response,
                k_max,
            },
        ),
        Command::Pattern {
            project,
            index,
            k_max,
        } => pattern(&project, index, k_max),
        Command::Invalidate { project, force } => invalidate(&project, force),
    }
}

fn load_engine(path: &Path) -> Result<(ProjectFile, BinningEngine), Box<dyn Error>> {
    let project = ProjectFile::load(path)?;
    let edits = match &project.point_edits {
        Some(file) => PointEdits::from_list(&PointList::read_json(file)?),
        None => PointEdits::new(),
    };
    let engine = BinningEngine::new(project.geometry.clone(), project.config.clone(), edits)?;
    Ok((project, engine))
}

fn store_dir(project: &ProjectFile, path: &Path) -> PathBuf {
    project
        .store_dir
        .clone()
        .unwrap_or_else(|| path.with_extension("store"))
}

fn validate(path: &Path) -> Result<(), Box<dyn Error>> {
    let (_, engine) = load_engine(path)?;
    let plan = engine.plan();
    println!("Project is valid: {}", engine.geometry().name);
    println!("  Blocks: {}, templates: {}", plan.blocks, plan.templates);
    println!("  Template instances: {}", plan.instances);
    println!(
        "  Points: {} sources, {} receivers",
        plan.source_points, plan.receiver_points
    );
    println!("  Bins: {} ({} x {})", plan.bins, engine.grid().nx, engine.grid().ny);
    println!("  Traces (upper bound): {}", plan.max_traces);
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    println!(
        "  Full-mode store (upper bound): {:.2} GiB{}",
        plan.full_mode.store_bytes as f64 / GIB,
        if plan.full_mode.is_expensive(true) { " (expensive)" } else { "" }
    );
    println!(
        "  Unique-fold tracking (upper bound): {:.2} GiB{}",
        plan.full_mode.unique_tracking_bytes as f64 / GIB,
        if plan.full_mode.is_expensive(false) { " (expensive)" } else { "" }
    );
    println!("  Fingerprint: {}", engine.fingerprint());
    Ok(())
}

fn bin(
    path: &Path,
    full: bool,
    resume: bool,
    parallel: bool,
    out: Option<PathBuf>,
    store: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let (project, engine) = load_engine(path)?;
    let out = out.unwrap_or_else(|| path.with_extension("maps"));
    std::fs::create_dir_all(&out)?;

    if parallel {
        let result = engine.run_basic_parallel()?;
        return finish(&project, &result, &out);
    }

    let engine = Arc::new(engine);
    let mode = if full {
        BinningMode::Full
    } else {
        BinningMode::Basic
    };
    let store = store.unwrap_or_else(|| store_dir(&project, path));
    let checkpoint_path = match mode {
        BinningMode::Full => store.join(CHECKPOINT_FILE),
        BinningMode::Basic => out.join(CHECKPOINT_FILE),
    };

    let mut request = match mode {
        BinningMode::Full => RunRequest::full(&store),
        BinningMode::Basic => RunRequest::basic(),
    };
    if resume {
        request = request.resuming(Checkpoint::load_matching(&checkpoint_path, engine.fingerprint())?);
    }

    let task = BinningTask::spawn(Arc::clone(&engine), request)?;
    let token = task.control().token();
    ctrlc::set_handler(move || token.cancel())?;

    let pb = ProgressBar::new(PROGRESS_STEPS);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40.green/blue}] {percent}% {msg}")?
            .progress_chars("█▉▊▋▌▍▎▏"),
    );
    pb.set_message("Binning");
    for progress in task.progress().iter() {
        pb.set_position((progress.fraction * PROGRESS_STEPS as f64).round() as u64);
        pb.set_message(progress.message);
    }

    match task.join()? {
        RunOutcome::Completed(result) => {
            pb.finish_with_message("Binning complete");
            finish(&project, &result, &out)
        }
        RunOutcome::Cancelled(checkpoint) => {
            pb.abandon_with_message("Binning cancelled");
            if mode == BinningMode::Basic {
                checkpoint.save(&checkpoint_path)?;
            }
            println!(
                "Cancelled after {} template instances; run again with --resume to continue",
                checkpoint.cursor.instances_done
            );
            println!("Checkpoint: {}", checkpoint_path.display());
            Ok(())
        }
    }
}

fn finish(project: &ProjectFile, result: &BinningResult, out: &Path) -> Result<(), Box<dyn Error>> {
    let stats = &result.stats;
    let summary = &result.summary;
    println!("Binned {} traces", stats.traces_accepted);
    println!(
        "  Pairs considered: {} (outside limits {}, outside grid {}, no reflection {})",
        stats.pairs_considered,
        stats.pairs_outside_limits,
        stats.pairs_outside_grid,
        stats.pairs_no_reflection
    );
    println!(
        "  Points clipped: {}, inactive: {}",
        stats.points_clipped, stats.points_inactive
    );
    println!(
        "  Fold: {} to {} over {} bins",
        summary.min_fold, summary.max_fold, summary.covered_bins
    );
    println!(
        "  Min offset: {:.1} to {:.1}, max offset: {:.1} to {:.1}",
        summary.min_min_offset, summary.max_min_offset, summary.min_max_offset, summary.max_max_offset
    );
    println!(
        "  RMS offset increment: {:.1} to {:.1}",
        summary.min_rms_increment, summary.max_rms_increment
    );
    if let Some(rect) = stats.cmp_extent.to_rect() {
        println!(
            "  Binning point extent: ({:.1}, {:.1}) to ({:.1}, {:.1})",
            rect.min_x, rect.min_y, rect.max_x, rect.max_y
        );
    }
    if let Some(records) = result.store_records {
        println!("  Store records: {}", records);
    }

    let rasters = MapBuilder::from_aggregates(&result.aggregates, &project.transform).build_all();
    for path in export_all(&rasters, out)? {
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn points(path: &Path, out: &Path) -> Result<(), Box<dyn Error>> {
    let project = ProjectFile::load(path)?;
    project.geometry.validate()?;
    let list = PointList::from_geometry(&project.geometry, &project.config, &project.transform);
    list.write_json(out)?;
    println!(
        "Saved {} ({} sources, {} receivers)",
        out.display(),
        list.sources.len(),
        list.receivers.len()
    );
    Ok(())
}

#[derive(Serialize)]
struct BinReport {
    bin: BinAddress,
    fold: usize,
    offset_histogram: Histogram,
    offset_azimuth: OffsetAzimuthHistogram,
    spider_legs: Vec<SpiderLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_response: Option<KxKyResponse>,
}

#[derive(Serialize)]
struct LineReport {
    axis: LineAxis,
    index: u32,
    traces: usize,
    offset_histogram: Histogram,
    profile: Vec<ProfileSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    radial_response: Option<RadialResponse>,
}

fn response_settings(k_max: Option<f64>, unique_only: bool) -> Result<ResponseSettings, Box<dyn Error>> {
    let mut settings = ResponseSettings {
        unique_only,
        ..ResponseSettings::default()
    };
    if let Some(k_max) = k_max {
        settings.k_max = k_max;
    }
    settings.validate()?;
    Ok(settings)
}

/// Arrays of the first patterned source and receiver seeds
fn seed_arrays(geometry: &SurveyGeometry) -> ArrayWeights {
    let pattern_of = |role: Role| {
        geometry
            .blocks
            .iter()
            .flat_map(|b| &b.templates)
            .flat_map(|t| &t.seeds)
            .filter(|s| s.role == role)
            .find_map(|s| s.pattern)
            .and_then(|index| geometry.patterns.get(index))
    };
    ArrayWeights::new(pattern_of(Role::Source), pattern_of(Role::Receiver))
}

fn query(path: &Path, options: QueryOptions) -> Result<(), Box<dyn Error>> {
    let (project, engine) = load_engine(path)?;
    let store = AnalysisStore::open_matching(&store_dir(&project, path), engine.fingerprint())?;
    let unique = options.unique;
    let settings = response_settings(options.k_max, unique)?;
    let histogram = |records: &[TraceRecord]| -> Result<Histogram, Box<dyn Error>> {
        Ok(match options.bucket_width {
            Some(width) => analysis::offset_histogram_with(records, unique, width)?,
            None => analysis::offset_histogram(records, unique),
        })
    };

    let json = match (options.line, options.inline, options.crossline) {
        (Some(LineArg::Inline), _, Some(crossline)) => {
            let records = store.records_in_inline(crossline)?;
            serde_json::to_string_pretty(&LineReport {
                axis: LineAxis::Inline,
                index: crossline,
                traces: analysis::selected(&records, unique).count(),
                offset_histogram: histogram(&records)?,
                profile: analysis::inline_profile(&records, store.grid(), unique),
                radial_response: options.response.then(|| {
                    analysis::radial_stack_response(&records, store.grid(), LineAxis::Inline, &settings)
                }),
            })?
        }
        (Some(LineArg::Crossline), Some(inline), _) => {
            let records = store.records_in_crossline(inline)?;
            serde_json::to_string_pretty(&LineReport {
                axis: LineAxis::Crossline,
                index: inline,
                traces: analysis::selected(&records, unique).count(),
                offset_histogram: histogram(&records)?,
                profile: analysis::crossline_profile(&records, store.grid(), unique),
                radial_response: options.response.then(|| {
                    analysis::radial_stack_response(&records, store.grid(), LineAxis::Crossline, &settings)
                }),
            })?
        }
        (None, Some(inline), Some(crossline)) => {
            let address = BinAddress::new(inline, crossline);
            let records = store.records_in_bin(address)?;
            let weights = seed_arrays(engine.geometry());
            serde_json::to_string_pretty(&BinReport {
                bin: address,
                fold: analysis::selected(&records, unique).count(),
                offset_histogram: histogram(&records)?,
                offset_azimuth: analysis::offset_azimuth_histogram(&records, unique),
                spider_legs: analysis::spider_legs(&records, unique),
                stack_response: options
                    .response
                    .then(|| analysis::kxky_stack_response(&records, &weights, &settings)),
            })?
        }
        (Some(LineArg::Inline), _, None) => return Err("--line inline needs --crossline".into()),
        (Some(LineArg::Crossline), None, _) => return Err("--line crossline needs --inline".into()),
        (None, _, _) => return Err("a bin query needs --inline and --crossline".into()),
    };
    println!("{}", json);
    Ok(())
}

fn pattern(path: &Path, index: usize, k_max: Option<f64>) -> Result<(), Box<dyn Error>> {
    let project = ProjectFile::load(path)?;
    project.geometry.validate()?;
    let Some(pattern) = project.geometry.patterns.get(index) else {
        return Err(format!(
            "pattern {} not found; the geometry has {}",
            index,
            project.geometry.patterns.len()
        )
        .into());
    };
    let settings = response_settings(k_max, false)?;
    let response = analysis::pattern_response(pattern, &settings);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn invalidate(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    let project = ProjectFile::load(path)?;
    let dir = store_dir(&project, path);
    if force && AnalysisStore::break_lock(&dir)? {
        println!("Removed stale store locks");
    }
    AnalysisStore::invalidate(&dir)?;
    println!("Invalidated {}", dir.display());
    Ok(())
}
