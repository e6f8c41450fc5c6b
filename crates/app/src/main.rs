use std::fmt;

use reader_core::model::{BlockIndex, UserId};
use services::{ApiConfig, ReaderSession, SessionConfig};

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingUser,
    UnknownArg(String),
    InvalidUserId { raw: String },
    InvalidBlock { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingUser => write!(f, "a reader id is required (--user or READER_USER_ID)"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidUserId { raw } => write!(f, "invalid --user value: {raw}"),
            ArgsError::InvalidBlock { raw } => write!(f, "invalid --block value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- status  [options]");
    eprintln!("  cargo run -p app -- next    [options]");
    eprintln!("  cargo run -p app -- start   [options]");
    eprintln!("  cargo run -p app -- summary [options] [--block <index>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --api <url>        study service base URL");
    eprintln!("  --token <token>    bearer token");
    eprintln!("  --db <sqlite_url>  progress cache (default sqlite:reader.sqlite3)");
    eprintln!("  --user <id>        reader id");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  READER_API_BASE_URL, READER_API_TOKEN, READER_DB_URL, READER_USER_ID, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Next,
    Start,
    Summary,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "status" => Some(Self::Status),
            "next" => Some(Self::Next),
            "start" => Some(Self::Start),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

struct Args {
    api: ApiConfig,
    db_url: String,
    user: UserId,
    block: Option<BlockIndex>,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut api = ApiConfig::from_env();
        let mut db_url = std::env::var("READER_DB_URL")
            .ok()
            .map_or_else(|| "sqlite://reader.sqlite3".into(), normalize_sqlite_url);
        let mut user = match std::env::var("READER_USER_ID") {
            Ok(raw) => Some(parse_user(raw)?),
            Err(_) => None,
        };
        let mut block = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--api" => {
                    let token = api.token.clone();
                    api = ApiConfig::new(require_value(args, "--api")?);
                    api.token = token;
                }
                "--token" => {
                    api = api.with_token(require_value(args, "--token")?);
                }
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--user" => {
                    user = Some(parse_user(require_value(args, "--user")?)?);
                }
                "--block" => {
                    let value = require_value(args, "--block")?;
                    let parsed = value
                        .parse::<BlockIndex>()
                        .map_err(|_| ArgsError::InvalidBlock { raw: value.clone() })?;
                    block = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            api,
            db_url,
            user: user.ok_or(ArgsError::MissingUser)?,
            block,
        })
    }
}

fn parse_user(raw: String) -> Result<UserId, ArgsError> {
    raw.trim()
        .parse::<UserId>()
        .map_err(|_| ArgsError::InvalidUserId { raw })
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

fn print_status(session: &ReaderSession) {
    println!("reader {}", session.user());
    match session.next_case() {
        Some(case) => println!("next case: {}", case.id),
        None => println!("all cases complete"),
    }
    for block in session.scheduler().tracked_blocks() {
        let progress = session.block_progress(block);
        println!(
            "block {block}: pre {}/{} post {}/{} ({:.0}%)",
            progress.pre, progress.total, progress.post, progress.total, progress.percent_complete
        );
    }
    for summary in session.known_summaries() {
        print_summary(&summary);
    }
}

fn print_summary(summary: &reader_core::model::BlockSummary) {
    let pct = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| format!("{:.0}%", v * 100.0));
    println!(
        "summary {}: top1 {} -> {}, top3 {} -> {}",
        summary.block_index,
        pct(summary.top1_accuracy_pre),
        pct(summary.top1_accuracy_post),
        pct(summary.top3_accuracy_pre),
        pct(summary.top3_accuracy_post),
    );
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None => Command::Status,
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) if first.starts_with("--") => Command::Status,
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };
    if argv.first().is_some_and(|first| !first.starts_with("--")) {
        argv.remove(0);
    }

    let mut iter = argv.into_iter();
    let parsed = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    prepare_sqlite_file(&parsed.db_url)?;
    let session = ReaderSession::connect(
        parsed.user,
        parsed.api,
        &parsed.db_url,
        SessionConfig::default(),
    )
    .await?;
    session.bootstrap().await?;

    match cmd {
        Command::Status => {
            print_status(&session);
            match session.overall_progress().await {
                Ok(overall) => println!(
                    "study: {}/{} cases done, {} in progress, {} unassigned",
                    overall.completed, overall.total, overall.in_progress, overall.unassigned
                ),
                Err(error) => tracing::warn!(%error, "overall progress unavailable"),
            }
        }
        Command::Next => {
            let response = session.advance().await?;
            match response.assignment {
                Some(assignment) => println!(
                    "{:?}: case {} in block {} ({:?} arm, {} remaining)",
                    response.status,
                    assignment.case_id,
                    assignment.block_index,
                    assignment.arm,
                    response.remaining
                ),
                None => println!("no assignments remain"),
            }
        }
        Command::Start => {
            let assignments = session.start_next_block().await?;
            if assignments.is_empty() {
                println!("no new block was started");
            }
            for assignment in assignments {
                println!(
                    "block {} #{}: case {} ({:?} arm)",
                    assignment.block_index, assignment.display_order, assignment.case_id, assignment.arm
                );
            }
        }
        Command::Summary => {
            if parsed.block.is_none() {
                if let Some(latest) = session.latest_summary().await? {
                    print_summary(&latest);
                    session.shutdown().await;
                    return Ok(());
                }
            }
            let block = parsed
                .block
                .or_else(|| session.scheduler().latest_block_index())
                .ok_or(ArgsError::MissingValue { flag: "--block" })?;
            match session.poller().load_summary(block, true).await? {
                Some(summary) if summary.has_accuracy() => print_summary(&summary),
                _ => print_summary(&session.block_feedback(block).await?),
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "reader client failed");
        std::process::exit(2);
    }
}
