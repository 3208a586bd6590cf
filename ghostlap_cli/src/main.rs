use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use ghostlap::{
    channel, compare_laps, extract_features, normalize, read_samples, Comparison, DistanceStats,
    LapRecord, Params, SectorMap, SelectionPolicy, Session, SessionStats, TelemetryFrame,
    FEATURE_NAMES,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lap segmentation and ghost-lap comparison CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment one or more sessions into laps and print session statistics
    Laps(LapsArgs),
    /// Write one selected lap as a lap-relative CSV
    Extract(ExtractArgs),
    /// Align a live lap against a ghost lap and write the comparison CSV
    Compare(CompareOutputArgs),
    /// Emit the regressor feature vector of one lap as JSON, or of every lap as CSV
    Features(FeaturesArgs),
    /// Describe the lap-distance channel of one lap and suggest quartile sectors
    DistanceStats(LapArgs),
    /// Look up playback frames and coaching cues at lap-relative times
    Coach(CoachArgs),
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Command::Laps(args) => &args.common,
            Command::Extract(args) => &args.lap.common,
            Command::Compare(args) => &args.compare.common,
            Command::Features(args) => &args.lap.common,
            Command::DistanceStats(args) => &args.common,
            Command::Coach(args) => &args.compare.common,
        }
    }
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Distance drop (meters, negative) that marks a start/finish crossing
    #[arg(long, default_value_t = -3000.0, allow_hyphen_values = true)]
    reset_threshold: f64,

    /// Laps must be strictly longer than this many seconds
    #[arg(long, default_value_t = 60.0)]
    min_lap_time: f64,

    /// Comparison grid step in seconds
    #[arg(long, default_value_t = 0.01)]
    step: f64,

    /// Skip the on-disk normalization cache
    #[arg(long, action = ArgAction::SetTrue)]
    no_cache: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

impl CommonArgs {
    fn params(&self) -> Params {
        let mut params = Params::default();
        params.lap_reset_threshold = self.reset_threshold;
        params.min_lap_time = self.min_lap_time;
        params.resample_step = self.step;
        params
    }

    fn timed(&self) -> bool {
        self.profile || self.verbose
    }
}

#[derive(Args, Debug)]
struct LapsArgs {
    /// Long-format telemetry CSV files
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Lap table output (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct LapArgs {
    /// Long-format telemetry CSV file
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Which lap to use
    #[arg(long, value_enum, default_value_t = PolicyOpt::Fastest)]
    policy: PolicyOpt,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[command(flatten)]
    lap: LapArgs,
}

#[derive(Args, Debug)]
struct FeaturesArgs {
    /// Write one CSV row per valid lap instead of the selected lap's JSON
    #[arg(long, action = ArgAction::SetTrue)]
    all: bool,

    #[command(flatten)]
    lap: LapArgs,
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Session containing the ghost lap
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Session containing the live lap (defaults to the ghost session)
    #[arg(long, value_hint = ValueHint::FilePath)]
    live_input: Option<PathBuf>,

    /// Ghost lap selection
    #[arg(long, value_enum, default_value_t = PolicyOpt::Fastest)]
    ghost: PolicyOpt,

    /// Live lap selection
    #[arg(long, value_enum, default_value_t = PolicyOpt::Representative)]
    live: PolicyOpt,

    /// Sector table JSON (list of sectors or bins/labels); quartiles of the
    /// ghost lap distance when omitted
    #[arg(long, value_hint = ValueHint::FilePath)]
    sectors: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CompareOutputArgs {
    #[command(flatten)]
    compare: CompareArgs,

    /// Aligned comparison CSV (`-` for stdout)
    #[arg(short, long, default_value = "comparison.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Optional CSV to write the sector summary
    #[arg(long, value_hint = ValueHint::FilePath)]
    sector_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CoachArgs {
    /// Lap-relative playback positions in seconds
    #[arg(long, required = true, num_args = 1..)]
    at: Vec<f64>,

    /// Playback frames JSON (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    compare: CompareArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PolicyOpt {
    Fastest,
    Representative,
}

impl From<PolicyOpt> for SelectionPolicy {
    fn from(value: PolicyOpt) -> Self {
        match value {
            PolicyOpt::Fastest => SelectionPolicy::Fastest,
            PolicyOpt::Representative => SelectionPolicy::Representative,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.command.common().verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Laps(args) => handle_laps(args),
        Command::Extract(args) => handle_extract(args),
        Command::Compare(args) => handle_compare(args),
        Command::Features(args) => handle_features(args),
        Command::DistanceStats(args) => handle_distance_stats(args),
        Command::Coach(args) => handle_coach(args),
    }
}

fn handle_laps(args: LapsArgs) -> Result<()> {
    let params = args.common.params();
    let cache_dir = prepare_cache_dir(&args.common);

    let t_parse = Instant::now();
    let sessions: Vec<(PathBuf, Session)> = args
        .inputs
        .par_iter()
        .map(|path| -> Result<(PathBuf, Session)> {
            let session = load_session(path, &params, cache_dir.as_deref())?;
            Ok((path.clone(), session))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.common.timed() {
        info!(
            "Parse stage: {:.1} ms ({} files)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            sessions.len()
        );
    }

    for (path, session) in &sessions {
        if let Some(stats) = session.stats() {
            log_session_stats(path, &stats);
        }
    }

    let mut writer = csv_writer(&args.output)?;
    writer.write_record(["file", "lap_number", "start_time", "end_time", "duration_s"])?;
    for (path, session) in &sessions {
        for (i, lap) in session.laps().iter().enumerate() {
            writer.write_record([
                path.display().to_string(),
                (i + 1).to_string(),
                format_instant(lap.start_time),
                format_instant(lap.end_time),
                format!("{:.3}", lap.duration),
            ])?;
        }
    }
    writer.flush()?;
    if args.output.as_os_str() != "-" {
        info!("Wrote lap table: {}", args.output.display());
    }
    Ok(())
}

fn handle_extract(args: ExtractArgs) -> Result<()> {
    let args = args.lap;
    let record = load_lap(&args)?;
    info!(
        "Selected {} lap: {:.3}s (lap {})",
        SelectionPolicy::from(args.policy),
        record.duration(),
        record.lap.index
    );
    write_lap_record(&record.frame, &args.output)?;
    if args.output.as_os_str() != "-" {
        info!("Wrote lap CSV: {}", args.output.display());
    }
    Ok(())
}

fn handle_compare(args: CompareOutputArgs) -> Result<()> {
    let comparison = build_comparison(&args.compare)?;
    let report = &comparison.report;
    match report.final_delta() {
        Ok(delta) => info!(
            "Ghost {:.3}s vs live {:.3}s: final delta {:+.3}s",
            comparison.ghost.duration(),
            comparison.live.duration(),
            delta
        ),
        Err(err) => warn!("{}", err),
    }

    let t_csv = Instant::now();
    write_comparison(&comparison, &args.output)?;
    if args.compare.common.timed() {
        info!(
            "CSV stage: {:.1} ms ({} rows)",
            t_csv.elapsed().as_secs_f64() * 1000.0,
            comparison.aligned.len()
        );
    }
    if args.output.as_os_str() != "-" {
        info!("Wrote comparison CSV: {}", args.output.display());
    }

    if let Some(path) = args.sector_output.as_ref() {
        match report.sector_splits() {
            Ok(_) => {
                write_sector_summary(&comparison, path)?;
                info!("Wrote sector summary: {}", path.display());
            }
            Err(err) => warn!("Skipping sector summary ({}): {}", path.display(), err),
        }
    }
    Ok(())
}

fn handle_features(args: FeaturesArgs) -> Result<()> {
    if args.all {
        return write_feature_table(&args.lap);
    }
    let args = args.lap;
    let record = load_lap(&args)?;
    let features = extract_features(&record);
    for (name, value) in features.named() {
        if value.is_nan() {
            warn!("Feature {} undefined: channel not recorded", name);
        }
    }
    let text = serde_json::to_string_pretty(&features)?;
    write_text(&args.output, &text)
}

fn handle_distance_stats(args: LapArgs) -> Result<()> {
    let record = load_lap(&args)?;
    let distance = record
        .frame
        .channel(channel::DISTANCE)
        .ok_or_else(|| anyhow!("lap has no '{}' channel", channel::DISTANCE))?;
    let stats = DistanceStats::from_values(distance)
        .ok_or_else(|| anyhow!("lap has no finite '{}' readings", channel::DISTANCE))?;
    let sectors = SectorMap::quartiles(&stats).context("failed to derive quartile sectors")?;
    let text = serde_json::to_string_pretty(&serde_json::json!({
        "distance": stats,
        "sectors": sectors.iter().collect::<Vec<_>>(),
    }))?;
    write_text(&args.output, &text)
}

fn handle_coach(args: CoachArgs) -> Result<()> {
    let comparison = build_comparison(&args.compare)?;
    let mut frames = Vec::with_capacity(args.at.len());
    for &t in &args.at {
        let frame = comparison
            .frame_at(t)
            .ok_or_else(|| anyhow!("no playback frame at {}s", t))?;
        debug!(time = frame.time_s, cue = ?frame.cue, "playback frame");
        frames.push(frame);
    }
    let text = serde_json::to_string_pretty(&frames)?;
    write_text(&args.output, &text)
}

/// `lap_number, duration_s` then every feature, one row per valid lap.
fn write_feature_table(args: &LapArgs) -> Result<()> {
    let params = args.common.params();
    let cache_dir = prepare_cache_dir(&args.common);
    let session = load_session(&args.input, &params, cache_dir.as_deref())?;

    let mut writer = csv_writer(&args.output)?;
    let mut header = vec!["lap_number", "duration_s"];
    header.extend(FEATURE_NAMES);
    writer.write_record(&header)?;
    for (i, (lap, features)) in session.lap_features().iter().enumerate() {
        let mut record = vec![(i + 1).to_string(), format!("{:.3}", lap.duration)];
        record.extend(features.to_vector().iter().map(|&v| cell(v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    if args.output.as_os_str() != "-" {
        info!("Wrote feature table: {}", args.output.display());
    }
    Ok(())
}

fn build_comparison(args: &CompareArgs) -> Result<Comparison> {
    let params = args.common.params();
    let cache_dir = prepare_cache_dir(&args.common);

    let t_parse = Instant::now();
    let ghost_session = load_session(&args.input, &params, cache_dir.as_deref())?;
    let live_session = match args.live_input.as_ref() {
        Some(path) => Some(load_session(path, &params, cache_dir.as_deref())?),
        None => None,
    };
    if args.common.timed() {
        info!(
            "Parse stage: {:.1} ms",
            t_parse.elapsed().as_secs_f64() * 1000.0
        );
    }

    let ghost = ghost_session
        .lap_record(args.ghost.into())
        .context("failed to select ghost lap")?;
    let live = live_session
        .as_ref()
        .unwrap_or(&ghost_session)
        .lap_record(args.live.into())
        .context("failed to select live lap")?;

    let sectors = match args.sectors.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            SectorMap::from_json_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => {
            let stats = ghost
                .frame
                .channel(channel::DISTANCE)
                .and_then(DistanceStats::from_values)
                .ok_or_else(|| anyhow!("ghost lap has no distance readings to derive sectors"))?;
            SectorMap::quartiles(&stats).context("failed to derive quartile sectors")?
        }
    };

    let t_compute = Instant::now();
    let comparison = compare_laps(ghost, live, &sectors, &params)?;
    if args.common.timed() {
        info!(
            "Compare stage: {:.1} ms ({} grid points)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            comparison.aligned.len()
        );
    }
    for gap in &comparison.report.gaps {
        warn!("Channel {} missing from {} lap", gap.channel, gap.side);
    }
    Ok(comparison)
}

fn load_lap(args: &LapArgs) -> Result<LapRecord> {
    let params = args.common.params();
    let cache_dir = prepare_cache_dir(&args.common);
    let session = load_session(&args.input, &params, cache_dir.as_deref())?;
    session
        .lap_record(args.policy.into())
        .with_context(|| format!("failed to select a lap from {}", args.input.display()))
}

fn prepare_cache_dir(common: &CommonArgs) -> Option<PathBuf> {
    if common.no_cache {
        return None;
    }
    let dir = PathBuf::from(".cache").join("normalized");
    match fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(err) => {
            warn!("Cache disabled ({}): {}", dir.display(), err);
            None
        }
    }
}

/// Normalized frames are cached on disk; segmentation always reruns.
fn load_session(path: &Path, params: &Params, cache_dir: Option<&Path>) -> Result<Session> {
    params.validate()?;
    let key = match cache_dir {
        Some(_) => Some(cache_key(path, params)?),
        None => None,
    };
    let cached = cache_dir
        .zip(key.as_deref())
        .and_then(|(dir, key)| read_cache(dir, key));

    let frame = match cached {
        Some(frame) => {
            debug!(path = %path.display(), rows = frame.len(), "normalization cache hit");
            frame
        }
        None => {
            let file =
                File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
            let samples = read_samples(BufReader::new(file))
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let frame = normalize(&samples, params)
                .with_context(|| format!("failed to normalize {}", path.display()))?;
            if let (Some(dir), Some(key)) = (cache_dir, key.as_deref()) {
                // Best-effort cache write
                if let Err(err) = write_cache(dir, key, &frame) {
                    warn!("{:#}", err);
                }
            }
            frame
        }
    };
    Session::from_frame(frame, params)
        .with_context(|| format!("failed to segment laps in {}", path.display()))
}

fn cache_key(path: &Path, params: &Params) -> Result<String> {
    use std::time::SystemTime;
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    let size = meta.len();
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let dur = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let mtime = (dur.as_secs(), dur.subsec_nanos());

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.to_string_lossy().hash(&mut hasher);
    size.hash(&mut hasher);
    mtime.hash(&mut hasher);
    params.numeric_channels.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

fn read_cache(dir: &Path, key: &str) -> Option<TelemetryFrame> {
    let path = dir.join(format!("{}.json", key));
    let text = fs::read_to_string(&path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_cache(dir: &Path, key: &str, frame: &TelemetryFrame) -> Result<()> {
    let path = dir.join(format!("{}.json", key));
    let text = serde_json::to_string(frame)?;
    fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn log_session_stats(path: &Path, stats: &SessionStats) {
    info!(
        "{}: {} laps, fastest lap {} ({:.3}s), slowest lap {} ({:.3}s), mean {:.3}s",
        path.display(),
        stats.lap_count,
        stats.fastest_lap,
        stats.fastest_time,
        stats.slowest_lap,
        stats.slowest_time,
        stats.mean_time
    );
    if let Some(std_dev) = stats.std_dev {
        info!("{}: lap time std dev {:.3}s", path.display(), std_dev);
    }
}

fn csv_writer(path: &Path) -> Result<csv::Writer<Box<dyn Write>>> {
    let sink: Box<dyn Write> = if path.as_os_str() == "-" {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )
    };
    Ok(csv::Writer::from_writer(sink))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", text)?;
    } else {
        fs::write(path, format!("{}\n", text))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn write_lap_record(frame: &TelemetryFrame, path: &Path) -> Result<()> {
    let mut writer = csv_writer(path)?;
    let names: Vec<&str> = frame.channel_names().collect();
    let mut header = vec!["lap_timestamp"];
    header.extend(names.iter().copied());
    writer.write_record(&header)?;

    for (row, t) in frame.times.iter().enumerate() {
        let mut record = vec![format!("{:.3}", t)];
        for name in &names {
            let value = frame
                .channel(name)
                .and_then(|c| c.get(row).copied())
                .unwrap_or(f64::NAN);
            record.push(cell(value));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_comparison(comparison: &Comparison, path: &Path) -> Result<()> {
    let aligned = &comparison.aligned;
    let report = &comparison.report;
    let names: Vec<&String> = aligned.ghost.channels.keys().collect();

    let mut writer = csv_writer(path)?;
    let mut header = vec!["time_s".to_string()];
    header.extend(names.iter().map(|n| format!("ghost_{}", n)));
    header.extend(names.iter().map(|n| format!("live_{}", n)));
    header.extend(
        ["speed_delta", "time_delta_cumulative", "sector"]
            .iter()
            .map(|s| s.to_string()),
    );
    writer.write_record(&header)?;

    for (i, t) in aligned.times.iter().enumerate() {
        let mut record = Vec::with_capacity(header.len());
        record.push(format!("{:.3}", t));
        record.extend(names.iter().map(|n| cell(aligned.ghost.value_at(n, i))));
        record.extend(names.iter().map(|n| cell(aligned.live.value_at(n, i))));
        record.push(optional_cell(report.speed_delta.as_ref().map(|d| d[i])));
        record.push(optional_cell(report.cumulative_delta.as_ref().map(|d| d[i])));
        record.push(report.sector_at(i).unwrap_or("").to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_sector_summary(comparison: &Comparison, path: &Path) -> Result<()> {
    let splits = comparison.report.sector_splits()?;
    let mut writer = csv_writer(path)?;
    writer.write_record([
        "sector",
        "ghost_time_s",
        "live_time_s",
        "delta_s",
        "contribution_s",
    ])?;
    for split in splits {
        writer.write_record([
            split.name.clone(),
            format!("{:.3}", split.ghost_time),
            format!("{:.3}", split.live_time),
            format!("{:.3}", split.delta),
            split
                .contribution
                .map(|v| format!("{:.6}", v))
                .unwrap_or_else(|| "".into()),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn cell(value: f64) -> String {
    if value.is_finite() {
        format!("{:.6}", value)
    } else {
        String::new()
    }
}

fn optional_cell(value: Option<f64>) -> String {
    value.map(cell).unwrap_or_default()
}

/// RFC 3339 rendering of epoch seconds.
fn format_instant(seconds: f64) -> String {
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| format!("{:.3}", seconds))
}
