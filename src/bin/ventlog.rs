//! ventlog CLI - Command-line interface for the telemetry log processor
//!
//! Commands:
//! - process: Run the full two-pass pipeline over an exported archive
//! - validate: Check archive integrity (checksums, sequence, version)
//! - doctor: Diagnose metadata files and configuration

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use ventlog::error::LossThresholds;
use ventlog::pipeline::{LogProcessor, ProcessorConfig, PATIENT_CHANGE_FENCE_SECS};
use ventlog::reader::RecordReader;
use ventlog::{ErrorManager, MetadataSet, StaticMetadataStore, VERSION};

/// ventlog - Processing core for respiratory device telemetry logs
#[derive(Parser)]
#[command(name = "ventlog")]
#[command(version = VERSION)]
#[command(about = "Process device telemetry archives into structured data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full two-pass pipeline over an exported archive
    Process {
        /// Archive file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Metadata definition files (JSON), one per supported version
        #[arg(short, long, required = true)]
        metadata: Vec<PathBuf>,

        /// Report window start (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Report window end (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// Trend window in days (0 disables trends)
        #[arg(long, default_value = "7")]
        trend_days: i64,

        /// Archive export time as epoch seconds (defaults to now)
        #[arg(long)]
        export_time: Option<i64>,

        /// Write the run's error log as CSV to this path
        #[arg(long)]
        error_log: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        format: OutputFormat,
    },

    /// Check archive integrity without producing output
    Validate {
        /// Archive file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Metadata definition files (JSON)
        #[arg(short, long)]
        metadata: Vec<PathBuf>,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose metadata files and configuration
    Doctor {
        /// Metadata definition files to check
        #[arg(short, long)]
        metadata: Vec<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Compact JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), VentCliError> {
    match cli.command {
        Commands::Process {
            input,
            output,
            metadata,
            start,
            end,
            trend_days,
            export_time,
            error_log,
            format,
        } => cmd_process(
            &input,
            &output,
            &metadata,
            &start,
            &end,
            trend_days,
            export_time,
            error_log.as_deref(),
            format,
        ),

        Commands::Validate { input, metadata, json } => cmd_validate(&input, &metadata, json),

        Commands::Doctor { metadata, json } => cmd_doctor(&metadata, json),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_process(
    input: &Path,
    output: &Path,
    metadata: &[PathBuf],
    start: &str,
    end: &str,
    trend_days: i64,
    export_time: Option<i64>,
    error_log: Option<&Path>,
    format: OutputFormat,
) -> Result<(), VentCliError> {
    let lines = read_lines(input)?;
    let store = load_store(metadata)?;

    let config = ProcessorConfig {
        system_name: "ventlog-cli".to_string(),
        report_start: parse_time(start)?,
        report_end: parse_time(end)?,
        trend_days,
        export_time: export_time.unwrap_or_else(|| Utc::now().timestamp()),
        patient_change_fence_secs: PATIENT_CHANGE_FENCE_SECS,
    };

    let mut em = ErrorManager::new("ventlog-cli", LossThresholds::default());
    em.data_file = Some(input.to_string_lossy().into_owned());

    let processor = LogProcessor::new(&store, config);
    let result = processor.process(lines, &mut em);

    if let Some(log_path) = error_log {
        let mut file = fs::File::create(log_path)?;
        em.write_log(&mut file)?;
    }

    let data = result?;
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string(&data)?,
        OutputFormat::JsonPretty => serde_json::to_string_pretty(&data)?,
    };

    if output.to_string_lossy() == "-" {
        println!("{}", rendered);
    } else {
        fs::write(output, rendered)?;
    }

    Ok(())
}

fn cmd_validate(input: &Path, metadata: &[PathBuf], json: bool) -> Result<(), VentCliError> {
    let lines = read_lines(input)?;
    let store = load_store(metadata)?;
    let total_lines = lines.len();

    let mut em = ErrorManager::new("ventlog-cli", LossThresholds::default());
    let mut reader = RecordReader::new(lines);
    let mut records = 0_usize;
    loop {
        match reader.next_record(&store, &mut em, true) {
            Ok(Some(_)) => records += 1,
            Ok(None) => break,
            Err(e) => return Err(e.into()),
        }
    }

    let report = ValidationReport {
        total_lines,
        valid_records: records,
        bad_records: reader.bad_records(),
        software_version: reader.first_version().map(str::to_string),
        severity: em.severity().as_str().to_string(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total lines:      {}", report.total_lines);
        println!("Valid records:    {}", report.valid_records);
        println!("Bad records:      {}", report.bad_records);
        println!(
            "Software version: {}",
            report.software_version.as_deref().unwrap_or("not found")
        );
        println!("Severity:         {}", report.severity);
    }

    if report.software_version.is_none() {
        Err(VentCliError::NoVersion)
    } else {
        Ok(())
    }
}

fn cmd_doctor(metadata: &[PathBuf], json: bool) -> Result<(), VentCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("ventlog version {}", VERSION),
    });

    for path in metadata {
        let name = format!("metadata:{}", path.display());
        if !path.exists() {
            checks.push(DoctorCheck {
                name,
                status: CheckStatus::Error,
                message: "File does not exist".to_string(),
            });
            continue;
        }
        match fs::read_to_string(path) {
            Ok(content) => match MetadataSet::from_json(&content) {
                Ok(set) => checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Ok,
                    message: format!(
                        "Version {} ({} messages, {} parameters)",
                        set.version,
                        set.messages.len(),
                        set.params.len()
                    ),
                }),
                Err(e) => checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Error,
                    message: format!("Invalid metadata JSON: {}", e),
                }),
            },
            Err(e) => checks.push(DoctorCheck {
                name,
                status: CheckStatus::Error,
                message: format!("Cannot read file: {}", e),
            }),
        }
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
            message: "stdin is a pipe (archive streaming ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport { version: VERSION.to_string(), checks };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("ventlog Doctor Report");
        println!("=====================");
        println!("Version: {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(VentCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn read_lines(input: &Path) -> Result<Vec<String>, VentCliError> {
    let data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };
    Ok(data.lines().map(str::to_string).collect())
}

fn load_store(paths: &[PathBuf]) -> Result<StaticMetadataStore, VentCliError> {
    let mut store = StaticMetadataStore::new();
    for path in paths {
        let content = fs::read_to_string(path)?;
        store.insert(MetadataSet::from_json(&content)?);
    }
    Ok(store)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, VentCliError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(date) = text.parse::<NaiveDate>() {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    Err(VentCliError::BadTimestamp(text.to_string()))
}

// Error types

#[derive(Debug)]
enum VentCliError {
    Io(io::Error),
    Processing(ventlog::ProcessingError),
    Json(serde_json::Error),
    BadTimestamp(String),
    NoVersion,
    DoctorFailed,
}

impl From<io::Error> for VentCliError {
    fn from(e: io::Error) -> Self {
        VentCliError::Io(e)
    }
}

impl From<ventlog::ProcessingError> for VentCliError {
    fn from(e: ventlog::ProcessingError) -> Self {
        VentCliError::Processing(e)
    }
}

impl From<serde_json::Error> for VentCliError {
    fn from(e: serde_json::Error) -> Self {
        VentCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<VentCliError> for CliError {
    fn from(e: VentCliError) -> Self {
        match e {
            VentCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            VentCliError::Processing(e) => CliError {
                code: "PROCESSING_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'ventlog validate' for archive details".to_string()),
            },
            VentCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            VentCliError::BadTimestamp(text) => CliError {
                code: "BAD_TIMESTAMP".to_string(),
                message: format!("Cannot parse timestamp: {}", text),
                hint: Some("Use RFC 3339 or YYYY-MM-DD".to_string()),
            },
            VentCliError::NoVersion => CliError {
                code: "NO_VERSION".to_string(),
                message: "Archive contains no recognized software version".to_string(),
                hint: Some("Check that the matching metadata file is supplied".to_string()),
            },
            VentCliError::DoctorFailed => CliError {
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
    total_lines: usize,
    valid_records: usize,
    bad_records: u32,
    software_version: Option<String>,
    severity: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
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
    Error,
}
