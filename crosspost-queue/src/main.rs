//! crosspost-queue - Manage the crosspost queue
//!
//! Unix-style tool for adding, inspecting and rescheduling posts, and for
//! the offline spool.

use clap::{Parser, Subcommand, ValueEnum};
use libcrosspost::logging::{env_level, LogFormat, LoggingConfig};
use libcrosspost::quota::QuotaPolicy;
use libcrosspost::scheduling::{format_timestamp, parse_schedule};
use libcrosspost::spool::Spool;
use libcrosspost::{
    Config, CrosspostError, Database, NewPost, PlatformKind, PostFilter, PostStatus, Result,
    ScheduledPost, Source,
};
use serde_json::{Map, Value};
use std::io::{IsTerminal, Read};

#[derive(Parser, Debug)]
#[command(name = "crosspost-queue")]
#[command(version)]
#[command(about = "Manage scheduled posts")]
#[command(long_about = "\
crosspost-queue - Manage scheduled posts

DESCRIPTION:
    crosspost-queue adds posts to the crosspost queue and manages them
    until crosspost-dispatch publishes them. A post without a schedule is
    stored as a draft and is never published until it is scheduled.

COMMANDS:
    add       Add a post (one per platform)
    list      List posts
    show      Show one post with its bookkeeping
    schedule  Set the time a draft or pending post is due
    cancel    Unschedule a post, turning it back into a draft
    delete    Delete a post
    retry     Requeue a failed post
    stats     Show queue and quota statistics
    spool     Capture a post offline, without touching the database
    sync      Move spooled posts into the database

USAGE EXAMPLES:
    # Schedule a post for X and note in two hours
    crosspost-queue add \"Launch day!\" -p x -p note --at 2h

    # Read content from stdin and keep it as a draft
    cat article.txt | crosspost-queue add -p wordpress --title \"Release notes\"

    # Spread posts out at random intervals after the last scheduled one
    crosspost-queue add \"Tip of the day\" -p x --at random:2h-4h

    # List failed posts as JSON
    crosspost-queue list --status failed --format json

    # Reschedule a post
    crosspost-queue schedule <POST_ID> \"tomorrow 9am\"

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml
    Database location: ~/.local/share/crosspost/posts.db
    Spool location: ~/.local/share/crosspost/spool.jsonl

    Override with environment variables:
        CROSSPOST_CONFIG    - Path to config file
        CROSSPOST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad post ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
struct PostArgs {
    /// Post content (read from stdin when omitted)
    content: Option<String>,

    /// Target platform: x, note or wordpress (repeat for several)
    #[arg(short, long = "platform", required = true)]
    platforms: Vec<PlatformKind>,

    /// When to publish (e.g. "now", "30m", "tomorrow 9am", "random:1h-3h")
    #[arg(short, long, value_name = "WHEN")]
    at: Option<String>,

    /// Title for note and WordPress posts
    #[arg(long)]
    title: Option<String>,

    /// Extra platform option, e.g. --meta status=draft
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    meta: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a post
    Add {
        #[command(flatten)]
        post: PostArgs,

        /// Where the post came from
        #[arg(long, default_value = "manual")]
        source: Source,
    },

    /// List posts, newest first
    List {
        #[arg(short, long)]
        status: Option<PostStatus>,

        #[arg(short, long)]
        platform: Option<PlatformKind>,

        /// Only posts that are due now, oldest schedule first
        #[arg(long, conflicts_with = "status")]
        due: bool,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show one post
    Show {
        post_id: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Set when a draft or pending post is due
    Schedule {
        post_id: String,

        /// New schedule (e.g. "tomorrow 3pm", "2h", "@1767225600")
        time: String,
    },

    /// Unschedule a post, turning it back into a draft
    Cancel { post_id: String },

    /// Delete a post
    Delete { post_id: String },

    /// Requeue a failed post with a fresh retry budget
    Retry {
        post_id: String,

        /// When to try again (default: now)
        #[arg(short, long, value_name = "WHEN")]
        at: Option<String>,
    },

    /// Show queue statistics
    Stats {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Capture a post in the offline spool
    Spool {
        #[command(flatten)]
        post: PostArgs,
    },

    /// Move spooled posts into the database
    Sync {
        /// Only list what would be synced
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(LogFormat::Text, env_level("warn"), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        // The spool must keep working when the database is unavailable
        Commands::Spool { post } => cmd_spool(&config, post),
        Commands::Add { post, source } => cmd_add(&open_db(&config).await?, post, source).await,
        Commands::List {
            status,
            platform,
            due,
            limit,
            format,
        } => cmd_list(&open_db(&config).await?, status, platform, due, limit, format).await,
        Commands::Show { post_id, format } => {
            cmd_show(&open_db(&config).await?, &post_id, format).await
        }
        Commands::Schedule { post_id, time } => {
            cmd_schedule(&open_db(&config).await?, &post_id, &time).await
        }
        Commands::Cancel { post_id } => cmd_cancel(&open_db(&config).await?, &post_id).await,
        Commands::Delete { post_id } => cmd_delete(&open_db(&config).await?, &post_id).await,
        Commands::Retry { post_id, at } => {
            cmd_retry(&open_db(&config).await?, &post_id, at.as_deref()).await
        }
        Commands::Stats { format } => cmd_stats(&open_db(&config).await?, &config, format).await,
        Commands::Sync { dry_run } => cmd_sync(&open_db(&config).await?, &config, dry_run).await,
    }
}

async fn open_db(config: &Config) -> Result<Database> {
    Database::new(&config.database.path).await
}

/// Content from the argument, or from stdin when it is piped
fn read_content(content: Option<String>) -> Result<String> {
    if let Some(content) = content {
        return Ok(content);
    }

    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Err(CrosspostError::InvalidInput(
            "No content given. Pass it as an argument or pipe it on stdin".to_string(),
        ));
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(buffer.trim_end_matches('\n').to_string())
}

fn parse_metadata(title: Option<String>, meta: &[String]) -> Result<Map<String, Value>> {
    let mut metadata = Map::new();
    for entry in meta {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            CrosspostError::InvalidInput(format!("Invalid --meta '{}': expected KEY=VALUE", entry))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CrosspostError::InvalidInput(format!(
                "Invalid --meta '{}': key is empty",
                entry
            )));
        }
        metadata.insert(key.to_string(), Value::String(value.to_string()));
    }
    if let Some(title) = title {
        metadata.insert("title".to_string(), Value::String(title));
    }
    Ok(metadata)
}

/// One creation request per platform, sharing content and options
fn build_requests(args: PostArgs) -> Result<(Vec<NewPost>, Option<String>)> {
    let content = read_content(args.content)?;
    let metadata = parse_metadata(args.title, &args.meta)?;

    let mut platforms = args.platforms;
    platforms.sort();
    platforms.dedup();

    let requests = platforms
        .into_iter()
        .map(|platform| NewPost {
            metadata: metadata.clone(),
            ..NewPost::new(content.clone(), platform)
        })
        .collect::<Vec<_>>();

    // Validate everything before writing anything
    for request in &requests {
        request.validate()?;
    }
    Ok((requests, args.at))
}

async fn cmd_add(db: &Database, args: PostArgs, source: Source) -> Result<()> {
    let (requests, at) = build_requests(args)?;
    let now = chrono::Utc::now().timestamp();

    for request in requests {
        let mut request = request.source(source);
        if let Some(at) = &at {
            let last = db.latest_scheduled_for(request.platform).await?;
            request = request.scheduled_for(parse_schedule(at, last)?.timestamp());
        }

        let post = db.create(request, now).await?;
        println!("{}", post.id);
    }
    Ok(())
}

fn cmd_spool(config: &Config, args: PostArgs) -> Result<()> {
    let (requests, at) = build_requests(args)?;
    let spool = Spool::from_config(&config.spool);
    let now = chrono::Utc::now().timestamp();

    for mut request in requests {
        if let Some(at) = &at {
            request = request.scheduled_for(parse_schedule(at, None)?.timestamp());
        }
        let entry = spool.push(request, now)?;
        println!("{}", entry.id);
    }
    Ok(())
}

async fn cmd_sync(db: &Database, config: &Config, dry_run: bool) -> Result<()> {
    let spool = Spool::from_config(&config.spool);

    if dry_run {
        for entry in spool.entries()? {
            let when = entry
                .post
                .scheduled_for
                .map(format_timestamp)
                .unwrap_or_else(|| "draft".to_string());
            println!(
                "{} | {} | {} | {}",
                entry.id,
                entry.post.platform,
                when,
                truncate_content(&entry.post.content, 50)
            );
        }
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let summary = spool.sync(db, now).await?;
    for rejected in &summary.rejected {
        eprintln!("Set aside: {}", rejected);
    }
    if !summary.rejected.is_empty() {
        eprintln!("Kept in {}", spool.rejected_path().display());
    }
    println!(
        "Synced {} post(s), {} already present, {} set aside",
        summary.synced,
        summary.already_present,
        summary.rejected.len()
    );
    Ok(())
}

async fn cmd_list(
    db: &Database,
    status: Option<PostStatus>,
    platform: Option<PlatformKind>,
    due: bool,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let posts = if due {
        let now = chrono::Utc::now().timestamp();
        let mut posts = db.select_due(now, limit).await?;
        if let Some(platform) = platform {
            posts.retain(|p| p.platform == platform);
        }
        posts
    } else {
        db.list(&PostFilter {
            status,
            platform,
            limit: Some(limit),
        })
        .await?
    };

    match format {
        OutputFormat::Json => print_json(&posts)?,
        OutputFormat::Text => {
            let now = chrono::Utc::now().timestamp();
            for post in &posts {
                println!(
                    "{} | {} | {} | {} | {}",
                    post.id,
                    post.platform,
                    post.status,
                    describe_schedule(post, now),
                    truncate_content(&post.content, 50)
                );
            }
        }
    }
    Ok(())
}

async fn cmd_show(db: &Database, post_id: &str, format: OutputFormat) -> Result<()> {
    let post = find_post(db, post_id).await?;

    if format == OutputFormat::Json {
        return print_json(&post);
    }

    let now = chrono::Utc::now().timestamp();
    println!("ID:        {}", post.id);
    println!("Platform:  {}", post.platform);
    println!("Status:    {}", post.status);
    println!("Source:    {}", post.source.as_str());
    println!("Schedule:  {}", describe_schedule(&post, now));
    println!("Retries:   {}", post.retry_count);
    if let Some(error) = &post.last_error {
        let kind = post
            .last_error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("Error:     [{}] {}", kind, error);
    }
    if let Some(retry_after) = post.retry_after {
        println!("Retry at:  {}", format_timestamp(retry_after));
    }
    if let Some(id) = &post.platform_post_id {
        println!("Posted as: {}", id);
    }
    if let Some(url) = &post.post_url {
        println!("URL:       {}", url);
    }
    if let Some(posted_at) = post.posted_at {
        println!("Posted at: {}", format_timestamp(posted_at));
    }
    if !post.metadata.is_empty() {
        println!("Metadata:  {}", Value::Object(post.metadata.clone()));
    }
    println!();
    println!("{}", post.content);
    Ok(())
}

async fn cmd_schedule(db: &Database, post_id: &str, time: &str) -> Result<()> {
    let existing = find_post(db, post_id).await?;
    let last = db.latest_scheduled_for(existing.platform).await?;
    let scheduled_for = parse_schedule(time, last)?.timestamp();

    let now = chrono::Utc::now().timestamp();
    let post = db.reschedule(post_id, Some(scheduled_for), now).await?;
    println!("{} scheduled for {}", post.id, format_timestamp(scheduled_for));
    Ok(())
}

async fn cmd_cancel(db: &Database, post_id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let post = db.reschedule(post_id, None, now).await?;
    println!("{} is now a draft", post.id);
    Ok(())
}

async fn cmd_delete(db: &Database, post_id: &str) -> Result<()> {
    db.delete(post_id).await?;
    println!("Deleted {}", post_id);
    Ok(())
}

async fn cmd_retry(db: &Database, post_id: &str, at: Option<&str>) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let scheduled_for = match at {
        Some(at) => parse_schedule(at, None)?.timestamp(),
        None => now,
    };

    db.requeue_failed(post_id, scheduled_for, now).await?;
    println!("{} requeued for {}", post_id, format_timestamp(scheduled_for));
    Ok(())
}

async fn cmd_stats(db: &Database, config: &Config, format: OutputFormat) -> Result<()> {
    let stats = db.stats().await?;
    let now = chrono::Utc::now().timestamp();
    let usage = QuotaPolicy::from_config(config).usage(db, now).await?;

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "total": stats.total(),
            "statuses": stats,
            "quota": usage,
        }));
    }

    println!("Total: {}", stats.total());
    println!("  draft:      {}", stats.draft);
    println!("  pending:    {}", stats.pending);
    println!("  processing: {}", stats.processing);
    println!("  posted:     {}", stats.posted);
    println!("  failed:     {}", stats.failed);

    if !usage.is_empty() {
        println!();
        println!("Quota (current window):");
        for quota in usage {
            println!(
                "  {}: {}/{} since {}",
                quota.platform,
                quota.used,
                quota.limit,
                format_timestamp(quota.window_start)
            );
        }
    }
    Ok(())
}

async fn find_post(db: &Database, post_id: &str) -> Result<ScheduledPost> {
    db.get(post_id)
        .await?
        .ok_or_else(|| CrosspostError::NotFound(format!("post {}", post_id)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CrosspostError::InvalidInput(format!("cannot encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn describe_schedule(post: &ScheduledPost, now: i64) -> String {
    match (post.status, post.scheduled_for) {
        (PostStatus::Posted, _) => post
            .posted_at
            .map(|at| format!("posted {}", format_timestamp(at)))
            .unwrap_or_else(|| "posted".to_string()),
        (_, None) => "unscheduled".to_string(),
        (PostStatus::Pending, Some(at)) => format_time_until(now, post.retry_after.unwrap_or(at).max(at)),
        (_, Some(at)) => format_timestamp(at),
    }
}

/// Truncate content to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "due".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate_content("short", 50), "short");
        assert_eq!(truncate_content("line one\nline two", 50), "line one line two");
        assert_eq!(truncate_content(&"あ".repeat(60), 3), "あああ...");
    }

    #[test]
    fn test_format_time_until() {
        assert_eq!(format_time_until(1000, 900), "due");
        assert_eq!(format_time_until(0, 30), "in <1 minute");
        assert_eq!(format_time_until(0, 120), "in 2 minutes");
        assert_eq!(format_time_until(0, 3600), "in 1 hour");
        assert_eq!(format_time_until(0, 3 * 86_400), "in 3 days");
    }

    #[test]
    fn test_parse_metadata() {
        let metadata = parse_metadata(
            Some("Hello".to_string()),
            &["status=draft".to_string(), "slug=a=b".to_string()],
        )
        .unwrap();
        assert_eq!(metadata["title"], "Hello");
        assert_eq!(metadata["status"], "draft");
        assert_eq!(metadata["slug"], "a=b");

        assert!(parse_metadata(None, &["novalue".to_string()]).is_err());
        assert!(parse_metadata(None, &["=x".to_string()]).is_err());
    }
}
