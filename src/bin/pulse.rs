//! Pulse CLI - Command-line interface for Synheart Pulse
//!
//! Commands:
//! - run: Process a reading stream and emit alerts and fused metrics (NDJSON)
//! - validate: Validate inbound messages
//! - patterns: Print the configured pattern definitions
//! - doctor: Diagnose configuration and environment

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use synheart_pulse::normalizer::{InboundMessage, Normalizer};
use synheart_pulse::{
    ComputeError, ProcessOutput, Publication, PulseConfig, PulseProcessor, Reading,
    PRODUCER_NAME, PULSE_VERSION,
};

/// Pulse - Streaming biometric anomaly detection and multi-source fusion
#[derive(Parser)]
#[command(name = "pulse")]
#[command(author = "Synheart AI Inc")]
#[command(version = PULSE_VERSION)]
#[command(about = "Detect sustained biometric anomalies and fuse wearable sources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a stream of readings (NDJSON in, NDJSON out)
    Run {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the grace window in milliseconds
        #[arg(long)]
        grace_ms: Option<i64>,

        /// Only emit alerts
        #[arg(long)]
        no_fused: bool,

        /// Abort on the first invalid or late message instead of skipping it
        #[arg(long)]
        strict: bool,

        /// Flush output after each record
        #[arg(long, default_value = "true")]
        flush: bool,
    },

    /// Validate inbound messages
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print configured pattern definitions as JSON
    Patterns {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Configuration file to check
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PulseCliError> {
    match cli.command {
        Commands::Run {
            input,
            config,
            grace_ms,
            no_fused,
            strict,
            flush,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(grace_ms) = grace_ms {
                config.grace_window_ms = grace_ms;
                config.validate()?;
            }
            cmd_run(&input, &config, !no_fused, strict, flush)
        }

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Patterns { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config.patterns)?);
            Ok(())
        }

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),
    }
}

fn load_config(path: Option<&Path>) -> Result<PulseConfig, PulseCliError> {
    match path {
        Some(path) => Ok(PulseConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(PulseConfig::default()),
    }
}

fn open_input(input: &Path) -> Result<Box<dyn BufRead>, PulseCliError> {
    if input.to_string_lossy() == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(fs::File::open(input)?)))
    }
}

/// Turn one message into readings, or apply it directly if it is a signal
enum Decoded {
    Readings(Vec<Reading>),
    Output(ProcessOutput),
    Nothing,
}

fn decode(
    processor: &mut PulseProcessor,
    message: InboundMessage,
) -> Result<Decoded, ComputeError> {
    let now = Utc::now();
    match message {
        InboundMessage::Reading(inbound) => {
            Ok(Decoded::Readings(vec![Normalizer::normalize(&inbound, now)?]))
        }
        InboundMessage::Flat(event) => Ok(Decoded::Readings(Normalizer::explode(&event, now)?)),
        InboundMessage::Control(control) => Ok(Decoded::Output(processor.apply_control(&control))),
        InboundMessage::EndSession(end) if end.end_session => {
            processor.end_session(&end.user_id);
            Ok(Decoded::Nothing)
        }
        InboundMessage::EndSession(_) => Ok(Decoded::Nothing),
    }
}

fn cmd_run(
    input: &Path,
    config: &PulseConfig,
    emit_fused: bool,
    strict: bool,
    flush: bool,
) -> Result<(), PulseCliError> {
    let mut stdout = io::stdout();
    run_stream(open_input(input)?, &mut stdout, config, emit_fused, strict, flush)
}

fn run_stream(
    reader: impl BufRead,
    out: &mut impl Write,
    config: &PulseConfig,
    emit_fused: bool,
    strict: bool,
    flush: bool,
) -> Result<(), PulseCliError> {
    let mut processor = PulseProcessor::new(config);

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        let mut output = ProcessOutput::default();
        let result = serde_json::from_str::<InboundMessage>(trimmed)
            .map_err(ComputeError::from)
            .and_then(|message| decode(&mut processor, message))
            .and_then(|decoded| match decoded {
                Decoded::Readings(readings) => {
                    for reading in readings {
                        output.extend(processor.ingest(reading)?);
                    }
                    Ok(())
                }
                Decoded::Output(applied) => {
                    output.extend(applied);
                    Ok(())
                }
                Decoded::Nothing => Ok(()),
            });

        if let Err(e) = result {
            if strict {
                return Err(e.into());
            }
            warn!(line = index + 1, error = %e, "skipping message");
        }

        write_output(out, output, emit_fused)?;
        if flush {
            out.flush()?;
        }
    }

    // Release readings still held by the grace window
    write_output(out, processor.flush(), emit_fused)?;
    out.flush()?;

    Ok(())
}

fn write_output(
    out: &mut impl Write,
    output: ProcessOutput,
    emit_fused: bool,
) -> Result<(), PulseCliError> {
    for alert in output.alerts {
        writeln!(out, "{}", serde_json::to_string(&Publication::Alert(alert))?)?;
    }
    if emit_fused {
        for fused in output.fused {
            writeln!(out, "{}", serde_json::to_string(&Publication::Fused(fused))?)?;
        }
    }
    Ok(())
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), PulseCliError> {
    let now = Utc::now();
    let mut total = 0;
    let mut errors = Vec::new();

    for (index, line) in open_input(input)?.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        total += 1;

        let checked = serde_json::from_str::<InboundMessage>(trimmed)
            .map_err(ComputeError::from)
            .and_then(|message| match message {
                InboundMessage::Reading(inbound) => Normalizer::normalize(&inbound, now).map(|_| ()),
                InboundMessage::Flat(event) => Normalizer::explode(&event, now).map(|_| ()),
                InboundMessage::Control(_) | InboundMessage::EndSession(_) => Ok(()),
            });

        if let Err(e) = checked {
            errors.push(ValidationErrorDetail {
                line: index + 1,
                error: e.to_string(),
            });
        }
    }

    let report = ValidationReport {
        total_messages: total,
        valid_messages: total - errors.len(),
        invalid_messages: errors.len(),
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total messages:   {}", report.total_messages);
        println!("Valid messages:   {}", report.valid_messages);
        println!("Invalid messages: {}", report.invalid_messages);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - Line {}: {}", err.line, err.error);
            }
        }
    }

    if report.invalid_messages > 0 {
        Err(PulseCliError::ValidationFailed(report.invalid_messages))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), PulseCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "pulse_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Pulse version {}", PULSE_VERSION),
    });

    let loaded = match config {
        Some(path) if !path.exists() => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "Config file does not exist, using defaults".to_string(),
            });
            Some(PulseConfig::default())
        }
        Some(path) => match load_config(Some(path)) {
            Ok(config) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: "Config file valid".to_string(),
                });
                Some(config)
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: CliError::from(e).message,
                });
                None
            }
        },
        None => Some(PulseConfig::default()),
    };

    if let Some(config) = loaded {
        let ids: Vec<&str> = config.patterns.iter().map(|p| p.id.as_str()).collect();
        checks.push(DoctorCheck {
            name: "patterns".to_string(),
            status: if ids.is_empty() { CheckStatus::Warning } else { CheckStatus::Ok },
            message: format!("{} patterns: {}", ids.len(), ids.join(", ")),
        });
        checks.push(DoctorCheck {
            name: "grace_window".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} ms", config.grace_window_ms),
        });
    }

    // Check stdin is available (for streaming mode)
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
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: PULSE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Pulse Doctor Report");
        println!("===================");
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
        Err(PulseCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum PulseCliError {
    Io(io::Error),
    Compute(ComputeError),
    Json(serde_json::Error),
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for PulseCliError {
    fn from(e: io::Error) -> Self {
        PulseCliError::Io(e)
    }
}

impl From<ComputeError> for PulseCliError {
    fn from(e: ComputeError) -> Self {
        PulseCliError::Compute(e)
    }
}

impl From<serde_json::Error> for PulseCliError {
    fn from(e: serde_json::Error) -> Self {
        PulseCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PulseCliError> for CliError {
    fn from(e: PulseCliError) -> Self {
        match e {
            PulseCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            PulseCliError::Compute(e @ ComputeError::InvalidConfig(_)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'pulse doctor --config <file>' for details".to_string()),
            },
            PulseCliError::Compute(e @ ComputeError::LateReading { .. }) => CliError {
                code: "LATE_READING".to_string(),
                message: e.to_string(),
                hint: Some("Increase --grace-ms or drop --strict".to_string()),
            },
            PulseCliError::Compute(e @ ComputeError::JsonError(_)) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Each line must be a reading, flat event, source control or end-of-session message".to_string()),
            },
            PulseCliError::Compute(e) => CliError {
                code: "INVALID_INPUT".to_string(),
                message: e.to_string(),
                hint: Some("Run 'pulse validate' for details".to_string()),
            },
            PulseCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            PulseCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} messages failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            PulseCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_messages: usize,
    valid_messages: usize,
    invalid_messages: usize,
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
