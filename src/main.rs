//! CLI entry point for `mailcatch`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailcatch::config::{self, Config};
use mailcatch::model::message::MessageMeta;
use mailcatch::pop3::Pop3Handler;
use mailcatch::retention::RetentionSweeper;
use mailcatch::server::ConnectionServer;
use mailcatch::smtp::SmtpHandler;
use mailcatch::store::file::FileDataStore;
use mailcatch::store::DataStore;

/// Disposable-mail capture server: accepts mail over SMTP, serves it over POP3.
#[derive(Parser)]
#[command(name = "mailcatch", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (overrides $MAILCATCH_CONFIG)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Message store directory (overrides [datastore] path)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SMTP and POP3 listeners (default)
    Serve,
    /// List the messages in a mailbox
    List {
        address: String,
        #[arg(long)]
        json: bool,
    },
    /// Print one message
    Show {
        address: String,
        id: String,
        /// Print the raw message exactly as received
        #[arg(long)]
        raw: bool,
    },
    /// Delete one message
    Delete { address: String, id: String },
    /// Delete every message in a mailbox
    Purge { address: String },
    /// List every mailbox holding messages
    Mailboxes,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.datastore.path = dir;
    }

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(config),
        Commands::List { address, json } => cmd_list(&config, &address, json),
        Commands::Show { address, id, raw } => cmd_show(&config, &address, &id, raw),
        Commands::Delete { address, id } => cmd_delete(&config, &address, &id),
        Commands::Purge { address } => cmd_purge(&config, &address),
        Commands::Mailboxes => cmd_mailboxes(&config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = config::log_file_path(config).and_then(|path| {
        let dir = path.parent()?.to_path_buf();
        std::fs::create_dir_all(&dir).ok()?;
        let file_name = path.file_name()?.to_owned();
        let appender = tracing_appender::rolling::never(dir, file_name);
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailcatch", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<FileDataStore> {
    Ok(FileDataStore::open(
        &config.datastore.path,
        config.datastore.mailbox_msg_cap,
    )?)
}

// ── serve ───────────────────────────────────────────────────────

fn cmd_serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

/// Run both listeners until Ctrl-C or a fatal listener error, then drain.
async fn serve(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn DataStore> = Arc::new(open_store(&config)?);
    info!(path = %config.datastore.path.display(), "Using message store");

    let shutdown = CancellationToken::new();
    let smtp = ConnectionServer::bind_with_shutdown(
        &config.smtp.address,
        SmtpHandler::new(Arc::clone(&store), (&config.smtp).into()),
        shutdown.child_token(),
    )
    .await?;
    let pop3 = ConnectionServer::bind_with_shutdown(
        &config.pop3.address,
        Pop3Handler::new(Arc::clone(&store), (&config.pop3).into()),
        shutdown.child_token(),
    )
    .await?;
    let handles = [smtp.handle(), pop3.handle()];

    let mut listeners = tokio::task::JoinSet::new();
    listeners.spawn(smtp.serve());
    listeners.spawn(pop3.serve());

    let sweeper = match config.datastore.retention() {
        Some(max_age) => Some(tokio::spawn(
            RetentionSweeper::new(
                Arc::clone(&store),
                max_age,
                Duration::from_millis(config.datastore.retention_sleep_millis),
                shutdown.child_token(),
            )
            .run(),
        )),
        None => {
            info!("Retention scanner disabled");
            None
        }
    };

    let mut fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            None
        }
        Some(joined) = listeners.join_next() => joined?.err(),
    };

    shutdown.cancel();
    while let Some(joined) = listeners.join_next().await {
        if let Err(e) = joined? {
            fatal.get_or_insert(e);
        }
    }

    let active: usize = handles.iter().map(|h| h.active_sessions()).sum();
    if active > 0 {
        info!(sessions = active, "Waiting for sessions to finish");
    }
    for handle in &handles {
        handle.drain().await;
    }
    if let Some(task) = sweeper {
        task.await?;
    }

    match fatal {
        Some(e) => {
            warn!(error = %e, "Stopped after listener failure");
            Err(e.into())
        }
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

// ── inspection ──────────────────────────────────────────────────

fn cmd_list(config: &Config, address: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mailbox = store.mailbox_for(address)?;
    let messages = mailbox.list()?;
    if json {
        print_list_json(mailbox.name(), &messages)
    } else {
        print_list_table(mailbox.name(), &messages);
        Ok(())
    }
}

fn print_list_table(name: &str, messages: &[MessageMeta]) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {name}: {} message(s)", messages.len());
    println!();

    if messages.is_empty() {
        return;
    }

    println!(
        "  {:<20} {:<17} {:<25} {:<40} {:>8}",
        "Id", "Date", "From", "Subject", "Size"
    );
    println!("  {}", "-".repeat(114));

    for meta in messages {
        let date = meta.date.format("%Y-%m-%d %H:%M").to_string();
        let from_trunc: String = meta.from.chars().take(24).collect();
        let subj_trunc: String = meta.subject.chars().take(39).collect();
        println!(
            "  {:<20} {:<17} {:<25} {:<40} {:>8}",
            meta.id,
            date,
            from_trunc,
            subj_trunc,
            format_size(meta.size, BINARY)
        );
    }
    println!();
}

fn print_list_json(name: &str, messages: &[MessageMeta]) -> anyhow::Result<()> {
    let items: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "date": m.date.to_rfc3339(),
                "from": m.from,
                "to": m.to,
                "subject": m.subject,
                "size": m.size,
            })
        })
        .collect();

    let output = serde_json::json!({
        "mailbox": name,
        "message_count": messages.len(),
        "messages": items,
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_show(config: &Config, address: &str, id: &str, raw: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mailbox = store.mailbox_for(address)?;

    if raw {
        let bytes = mailbox.read_raw(id)?;
        std::io::Write::write_all(&mut std::io::stdout(), &bytes)?;
        return Ok(());
    }

    let meta = mailbox.get(id)?;
    let body = mailbox.read_body(id)?;
    println!("{:<9} {}", "Id:", meta.id);
    println!("{:<9} {}", "Date:", meta.date.to_rfc2822());
    println!("{:<9} {}", "From:", meta.from);
    println!("{:<9} {}", "To:", meta.to.join(", "));
    println!("{:<9} {}", "Subject:", meta.subject);
    if !body.attachments.is_empty() {
        println!("{:<9} {}", "Attached:", body.attachments.join(", "));
    }
    println!();
    match body.text {
        Some(text) => println!("{text}"),
        None => println!("(no text body)"),
    }
    Ok(())
}

fn cmd_delete(config: &Config, address: &str, id: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mailbox = store.mailbox_for(address)?;
    mailbox.delete(id)?;
    println!("Deleted {id} from {}", mailbox.name());
    Ok(())
}

fn cmd_purge(config: &Config, address: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mailbox = store.mailbox_for(address)?;
    let count = mailbox.list()?.len();
    mailbox.purge()?;
    println!("Purged {count} message(s) from {}", mailbox.name());
    Ok(())
}

fn cmd_mailboxes(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mailboxes = store.all_mailboxes()?;
    if mailboxes.is_empty() {
        println!("No mailboxes in {}", config.datastore.path.display());
        return Ok(());
    }
    for mailbox in mailboxes {
        let count = match mailbox.list() {
            Ok(messages) => messages.len().to_string(),
            Err(e) => {
                warn!(mailbox = mailbox.name(), error = %e, "Unreadable mailbox");
                "?".to_string()
            }
        };
        println!("  {:<40} {count:>6}", mailbox.name());
    }
    Ok(())
}
