use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ormirror_convert::{
    convert_notes, write_yaml, AuthorSource, CharMap, ConvertOptions, DEFAULT_FILE_PREFIX,
};
use ormirror_core::{Channel, Volume};
use ormirror_storage::{read_array, read_snapshot};
use ormirror_sync::{run_mirror_from_env, MirrorConfig, MirrorRequest};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ormirror")]
#[command(about = "Mirror OpenReview submissions and convert them into a paper list")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Retrieve notes and download only updated files
    Mirror(MirrorArgs),
    /// Convert notes into a draft YAML file (to be manually revised)
    Convert(ConvertArgs),
    /// Print one array of a snapshot, one element per line
    Dump {
        file: PathBuf,
        array: String,
    },
}

#[derive(Debug, Args)]
struct MirrorArgs {
    /// Username for OpenReview
    #[arg(short, long)]
    username: String,
    /// Password for OpenReview
    #[arg(short, long)]
    password: String,
    /// Channel at OpenReview (Conference or ARR_Commitment)
    #[arg(short, long, default_value = "Conference")]
    channel: String,
    /// Snapshot of an earlier run; only new or updated notes are downloaded
    #[arg(short, long)]
    latest: Option<PathBuf>,
    /// Where to save the fetched notes [default: <channel>.json.gz]
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Attachment directory [default: <channel>]
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AuthorMode {
    /// Resolve each author id through its OpenReview profile
    Profile,
    /// Split the submitted author string on whitespace
    Heuristic,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Username for OpenReview (profile mode)
    #[arg(short, long)]
    username: Option<String>,
    /// Password for OpenReview (profile mode)
    #[arg(short, long)]
    password: Option<String>,
    /// Notes snapshot
    #[arg(short, long, default_value = "Conference.json.gz")]
    notes: PathBuf,
    /// Main or Findings
    #[arg(short, long, default_value = "Main")]
    volume: String,
    /// Character mapping file
    #[arg(short, long)]
    mapfile: PathBuf,
    /// Output YAML file
    #[arg(short, long, default_value = "papers.yml")]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = AuthorMode::Profile)]
    authors: AuthorMode,
    /// Directory prefix for paper and attachment paths
    #[arg(long, default_value = DEFAULT_FILE_PREFIX)]
    file_prefix: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,ormirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Mirror(args) => mirror(args).await,
        Commands::Convert(args) => convert(args).await,
        Commands::Dump { file, array } => dump(&file, &array),
    }
}

async fn mirror(args: MirrorArgs) -> Result<()> {
    let channel: Channel = args.channel.parse()?;
    let mut request = MirrorRequest::new(channel);
    request.latest = args.latest;
    if let Some(snapshot) = args.snapshot {
        request.snapshot_path = snapshot;
    }
    if let Some(output_dir) = args.output_dir {
        request.output_dir = output_dir;
    }

    let summary = run_mirror_from_env(&args.username, &args.password, &request).await?;
    println!(
        "mirror complete: run_id={} channel={} notes={} scheduled={} downloaded={} failed={} snapshot={}",
        summary.run_id,
        summary.channel,
        summary.fetched_notes,
        summary.scheduled_downloads,
        summary.downloaded,
        summary.failures.len(),
        summary.snapshot_path
    );
    for failure in &summary.failures {
        eprintln!("failed: {} ({})", failure.task.file_name(), failure.error);
    }
    if !summary.failures.is_empty() {
        bail!(
            "{} of {} downloads failed",
            summary.failures.len(),
            summary.scheduled_downloads
        );
    }
    Ok(())
}

async fn convert(args: ConvertArgs) -> Result<()> {
    let volume: Volume = args.volume.parse()?;
    let credentials = match (args.authors, args.username, args.password) {
        (AuthorMode::Heuristic, _, _) => None,
        (AuthorMode::Profile, Some(username), Some(password)) => Some((username, password)),
        (AuthorMode::Profile, _, _) => {
            bail!("profile author mode needs --username and --password (or use --authors heuristic)")
        }
    };

    info!(path = %args.notes.display(), "loading notes");
    let notes = read_snapshot(&args.notes)
        .with_context(|| format!("loading notes from {}", args.notes.display()))?;
    let charmap = CharMap::load(&args.mapfile)?;
    let options = ConvertOptions {
        file_prefix: args.file_prefix,
    };
    let venues = volume.accepted_venues();

    let conversion = match credentials {
        Some((username, password)) => {
            let client = MirrorConfig::from_env().connect(&username, &password).await?;
            convert_notes(&notes, &venues, AuthorSource::Profiles(&client), &charmap, &options)
                .await
        }
        None => convert_notes(&notes, &venues, AuthorSource::Heuristic, &charmap, &options).await,
    };

    write_yaml(&args.output, &conversion.records)?;
    println!(
        "convert complete: volume={} records={} skipped={} output={}",
        volume,
        conversion.records.len(),
        conversion.failures.len(),
        args.output.display()
    );
    Ok(())
}

fn dump(file: &Path, array: &str) -> Result<()> {
    let items = read_array(file, array)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for item in items {
        match item {
            JsonValue::String(text) => writeln!(out, "{text}")?,
            other => writeln!(out, "{other}")?,
        }
    }
    Ok(())
}
