//! skitrack - Command-line interface for the ski telemetry engine
//!
//! Commands:
//! - analyze: Import a GPX/FIT file and print the track report (batch mode)
//! - record: Drive a live recording from NDJSON samples on stdin
//! - recover: Inspect, finalize or clear an interrupted recording
//! - validate: Validate a live sample stream
//! - doctor: Diagnose engine and checkpoint health

use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ski_telemetry::adapters::parse_format_name;
use ski_telemetry::pipeline::import_track;
use ski_telemetry::schema::{LiveEvent, LiveEventAdapter, SCHEMA_VERSION};
use ski_telemetry::session::{GrantedAuthority, RecordingSession, SampleOutcome};
use ski_telemetry::{
    EngineConfig, EngineError, FileCheckpointStore, ReportEncoder, SourceFormat, Track,
    ENGINE_VERSION, PRODUCER_NAME,
};

/// skitrack - GPS telemetry for ski days
#[derive(Parser)]
#[command(name = "skitrack")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Analyze and record ski GPS tracks", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a track file and print its report (batch mode)
    Analyze {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Track format; detected from the file when omitted
        #[arg(long)]
        format: Option<String>,

        /// Track name (defaults to the name stored in the file)
        #[arg(long)]
        name: Option<String>,

        /// Engine configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum heart rate for zone thresholds (bpm)
        #[arg(long)]
        max_hr: Option<f64>,

        /// Speed histogram boundaries in m/s, comma separated
        #[arg(long, value_delimiter = ',')]
        speed_buckets: Option<Vec<f64>>,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Record from NDJSON live samples on stdin (streaming mode)
    Record {
        /// Directory holding the recording checkpoint
        #[arg(long)]
        checkpoint_dir: PathBuf,

        /// Recording name
        #[arg(long, default_value = "Live recording")]
        name: String,

        /// Engine configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Leave the checkpoint in place at end of input (simulates a crash)
        #[arg(long)]
        leave_open: bool,

        /// Flush output after each snapshot
        #[arg(long, default_value = "true")]
        flush: bool,
    },

    /// Inspect, finalize or clear an interrupted recording
    Recover {
        /// Directory holding the recording checkpoint
        #[arg(long)]
        checkpoint_dir: PathBuf,

        /// Replay the checkpoint and print the finished track report
        #[arg(long, conflicts_with = "clear")]
        finalize: bool,

        /// Delete the checkpoint without replaying it
        #[arg(long)]
        clear: bool,

        /// Engine configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a live sample stream
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose engine and checkpoint health
    Doctor {
        /// Check a checkpoint directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Single-line JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> Result<(), SkiCliError> {
    match cli.command {
        Commands::Analyze {
            input,
            format,
            name,
            config,
            max_hr,
            speed_buckets,
            output,
            output_format,
        } => {
            let mut config = load_config(config.as_deref())?;
            if max_hr.is_some() {
                config.analytics.max_heart_rate = max_hr;
            }
            if let Some(buckets) = speed_buckets {
                config.analytics.speed_bucket_boundaries_mps = buckets;
            }
            cmd_analyze(&input, format.as_deref(), name.as_deref(), &config, &output, output_format)
        }

        Commands::Record {
            checkpoint_dir,
            name,
            config,
            leave_open,
            flush,
        } => {
            let config = load_config(config.as_deref())?;
            cmd_record(&checkpoint_dir, &name, config, leave_open, flush)
        }

        Commands::Recover {
            checkpoint_dir,
            finalize,
            clear,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            cmd_recover(&checkpoint_dir, finalize, clear, config)
        }

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Doctor { checkpoint_dir, json } => cmd_doctor(checkpoint_dir.as_deref(), json),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, SkiCliError> {
    match path {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            Ok(EngineConfig::from_json(&json)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn read_input(input: &Path) -> Result<Vec<u8>, SkiCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read(input)?)
    }
}

fn cmd_analyze(
    input: &Path,
    format: Option<&str>,
    name: Option<&str>,
    config: &EngineConfig,
    output: &Path,
    output_format: OutputFormat,
) -> Result<(), SkiCliError> {
    let bytes = read_input(input)?;

    let format = match format {
        Some(f) => parse_format_name(f)?,
        None => SourceFormat::detect(&input.to_string_lossy(), &bytes).ok_or_else(|| {
            SkiCliError::InvalidArgument("cannot detect track format; pass --format".to_string())
        })?,
    };

    let track = import_track(&bytes, format, name, config)?;
    let output_data = encode_report(&track, config, &output_format)?;

    if output.to_string_lossy() == "-" {
        println!("{}", output_data);
    } else {
        fs::write(output, output_data)?;
    }

    Ok(())
}

fn encode_report(
    track: &Track,
    config: &EngineConfig,
    format: &OutputFormat,
) -> Result<String, SkiCliError> {
    let encoder = ReportEncoder::new();
    match format {
        OutputFormat::JsonPretty => Ok(encoder.encode_track_to_json(track, &config.analytics)?),
        OutputFormat::Json => Ok(serde_json::to_string(
            &encoder.encode_track(track, &config.analytics),
        )?),
    }
}

fn cmd_record(
    checkpoint_dir: &Path,
    name: &str,
    config: EngineConfig,
    leave_open: bool,
    flush: bool,
) -> Result<(), SkiCliError> {
    let store = FileCheckpointStore::new(checkpoint_dir)?;
    let mut session = RecordingSession::new(store, Box::new(GrantedAuthority), config.clone());

    if let Some(info) = session.check_for_recovery() {
        return Err(SkiCliError::RecoveryPending(info.name));
    }

    let encoder = ReportEncoder::new();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut last_seen: Option<DateTime<Utc>> = None;

    for (line_num, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        let event = match LiveEventAdapter::parse_line(trimmed) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("line {}: skipping unparseable sample: {}", line_num + 1, e);
                continue;
            }
        };

        if last_seen.is_none() {
            session.start_recording(name, event.timestamp())?;
        }
        last_seen = Some(event.timestamp());

        match event {
            LiveEvent::Location(fix) => match session.on_location(fix) {
                Ok(SampleOutcome::Recorded { .. }) => {
                    if let Some(processor) = session.processor() {
                        writeln!(stdout, "{}", encoder.encode_live_to_json(processor)?)?;
                        if flush {
                            stdout.flush()?;
                        }
                    }
                }
                Ok(SampleOutcome::Ignored) => {}
                Err(EngineError::InvalidSample(msg)) => {
                    log::warn!("line {}: {}", line_num + 1, msg);
                }
                Err(e) => return Err(e.into()),
            },
            LiveEvent::HeartRate(reading) => {
                if let Err(e) = session.on_heart_rate(reading) {
                    log::warn!("line {}: {}", line_num + 1, e);
                }
            }
        }
    }

    let end = match last_seen {
        Some(t) => t,
        None => return Err(SkiCliError::NoSamples),
    };

    if leave_open {
        session.tick(end)?;
        session.flush_checkpoint();
        log::info!("leaving checkpoint in {}", checkpoint_dir.display());
        return Ok(());
    }

    match session.stop_recording(end)? {
        Some(track) => {
            println!("{}", encode_report(&track, &config, &OutputFormat::JsonPretty)?);
            Ok(())
        }
        None => Err(SkiCliError::NoSamples),
    }
}

fn cmd_recover(
    checkpoint_dir: &Path,
    finalize: bool,
    clear: bool,
    config: EngineConfig,
) -> Result<(), SkiCliError> {
    let store = FileCheckpointStore::new(checkpoint_dir)?;
    let mut session = RecordingSession::new(store, Box::new(GrantedAuthority), config.clone());

    if clear {
        session.clear_recovery()?;
        println!("{}", serde_json::json!({ "cleared": true }));
        return Ok(());
    }

    let info = match session.check_for_recovery() {
        Some(info) => info,
        None => {
            println!("{}", serde_json::json!({ "recoverable": false }));
            return Ok(());
        }
    };

    if !finalize {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    session.recover_recording()?;
    let end = info.last_sample_at.unwrap_or(info.started_at);
    match session.stop_recording(end)? {
        Some(track) => {
            println!("{}", encode_report(&track, &config, &OutputFormat::JsonPretty)?);
            Ok(())
        }
        None => Err(SkiCliError::NoSamples),
    }
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), SkiCliError> {
    let input_data = String::from_utf8(read_input(input)?)
        .map_err(|e| SkiCliError::InvalidArgument(format!("input is not UTF-8: {}", e)))?;

    let mut total = 0;
    let mut errors = Vec::new();

    for (line_num, line) in input_data.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        total += 1;

        let error = match LiveEventAdapter::parse_line(trimmed) {
            Ok(event) => event.validate().err().map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(error) = error {
            errors.push(ValidationErrorDetail {
                line: line_num + 1,
                error,
            });
        }
    }

    let report = ValidationReport {
        schema: SCHEMA_VERSION.to_string(),
        total_samples: total,
        valid_samples: total - errors.len(),
        invalid_samples: errors.len(),
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report ({})", report.schema);
        println!("=================");
        println!("Total samples:   {}", report.total_samples);
        println!("Valid samples:   {}", report.valid_samples);
        println!("Invalid samples: {}", report.invalid_samples);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - line {}: {}", err.line, err.error);
            }
        }
    }

    if report.invalid_samples > 0 {
        Err(SkiCliError::ValidationFailed(report.invalid_samples))
    } else {
        Ok(())
    }
}

fn cmd_doctor(checkpoint_dir: Option<&Path>, json: bool) -> Result<(), SkiCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "engine_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Engine version {}", ENGINE_VERSION),
    });

    checks.push(DoctorCheck {
        name: "schema_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Live sample schema: {}", SCHEMA_VERSION),
    });

    let formats = [SourceFormat::Gpx, SourceFormat::Fit]
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    checks.push(DoctorCheck {
        name: "formats".to_string(),
        status: CheckStatus::Ok,
        message: format!("Track formats: {}", formats),
    });

    if let Some(dir) = checkpoint_dir {
        checks.push(check_checkpoint_dir(dir));
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (record mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: ENGINE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("skitrack Doctor Report");
        println!("======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(SkiCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn check_checkpoint_dir(dir: &Path) -> DoctorCheck {
    let name = "checkpoint".to_string();

    if !dir.exists() {
        return DoctorCheck {
            name,
            status: CheckStatus::Warning,
            message: format!("{} does not exist (created on first recording)", dir.display()),
        };
    }

    let store = match FileCheckpointStore::new(dir) {
        Ok(store) => store,
        Err(e) => {
            return DoctorCheck {
                name,
                status: CheckStatus::Error,
                message: e.to_string(),
            }
        }
    };

    let probe = dir.join(".skitrack-probe");
    if let Err(e) = fs::write(&probe, b"ok").and_then(|_| fs::remove_file(&probe)) {
        return DoctorCheck {
            name,
            status: CheckStatus::Error,
            message: format!("{} is not writable: {}", dir.display(), e),
        };
    }

    let session = RecordingSession::new(store, Box::new(GrantedAuthority), EngineConfig::default());
    match session.check_for_recovery() {
        Some(info) => DoctorCheck {
            name,
            status: CheckStatus::Warning,
            message: format!(
                "recoverable recording '{}' with {} points; run 'skitrack recover'",
                info.name, info.point_count
            ),
        },
        None => DoctorCheck {
            name,
            status: CheckStatus::Ok,
            message: format!("{} is writable, no pending recording", dir.display()),
        },
    }
}

// Error types

#[derive(Debug)]
enum SkiCliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
    InvalidArgument(String),
    RecoveryPending(String),
    NoSamples,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for SkiCliError {
    fn from(e: io::Error) -> Self {
        SkiCliError::Io(e)
    }
}

impl From<EngineError> for SkiCliError {
    fn from(e: EngineError) -> Self {
        SkiCliError::Engine(e)
    }
}

impl From<serde_json::Error> for SkiCliError {
    fn from(e: serde_json::Error) -> Self {
        SkiCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<SkiCliError> for CliError {
    fn from(e: SkiCliError) -> Self {
        match e {
            SkiCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            SkiCliError::Engine(e) => engine_error(e),
            SkiCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            SkiCliError::InvalidArgument(msg) => CliError {
                code: "INVALID_ARGUMENT".to_string(),
                message: msg,
                hint: Some("Run 'skitrack --help' for usage".to_string()),
            },
            SkiCliError::RecoveryPending(name) => CliError {
                code: "RECOVERY_PENDING".to_string(),
                message: format!("Recording '{}' was interrupted and can be recovered", name),
                hint: Some("Run 'skitrack recover --finalize' or 'skitrack recover --clear'".to_string()),
            },
            SkiCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No location samples were recorded".to_string(),
                hint: Some("Ensure stdin carries ski.live_sample.v1 location events".to_string()),
            },
            SkiCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} samples failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            SkiCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

fn engine_error(e: EngineError) -> CliError {
    let (code, hint) = match &e {
        EngineError::MalformedInput(_) => ("MALFORMED_INPUT", "Check that the file is a complete GPX or FIT track"),
        EngineError::UnsupportedFormat(_) => ("UNSUPPORTED_FORMAT", "Use --format gpx or --format fit"),
        EngineError::InvalidSample(_) => ("INVALID_SAMPLE", "Run 'skitrack validate' for details"),
        EngineError::AcquisitionTimeout { .. } => ("ACQUISITION_TIMEOUT", "No fix met the accuracy threshold; check acquisition_accuracy_m"),
        EngineError::RecoveryCorrupt(_) => ("RECOVERY_CORRUPT", "Run 'skitrack recover --clear' to discard the checkpoint"),
        EngineError::RecoveryPending => ("RECOVERY_PENDING", "Run 'skitrack recover' first"),
        EngineError::CheckpointWrite(_) => ("CHECKPOINT_WRITE", "Check the checkpoint directory is writable"),
        EngineError::Json(_) => ("JSON_ERROR", "Check JSON syntax"),
        _ => ("ENGINE_ERROR", "Run with -v for more detail"),
    };
    CliError {
        code: code.to_string(),
        message: e.to_string(),
        hint: Some(hint.to_string()),
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    schema: String,
    total_samples: usize,
    valid_samples: usize,
    invalid_samples: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    line: usize,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
