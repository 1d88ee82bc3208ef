//! EdgeClass CLI - offline-first quiz client and sync server.
//!
//! Every write lands in the local database first and is delivered to the
//! sync server by `sync` or by the background scheduler in `watch`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use edgeclass_common::{Clock, DeviceId, SystemClock};
use edgeclass_server::ServerDb;
use edgeclass_storage::{
    LocalStore, OutboxStatus, QuestionDraft, QuizDraft, RecordWriter, SettingsStore, SqliteStore,
};
use edgeclass_sync::{
    HttpRemote, HttpThroughputProbe, NetworkOracle, SyncConfig, SyncEngine, SyncOutcome,
    SyncScheduler, SyncStatus, SyncStatusObserver,
};

const DEVICE_ID_SETTING: &str = "device_id";
const CURRENT_USER_SETTING: &str = "current_user";

#[derive(Parser)]
#[command(name = "edgeclass")]
#[command(about = "EdgeClass - offline-first quizzes with background sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the local database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON sync configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sync server base URL, overriding the configuration.
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:3001")]
        addr: String,

        /// Server database file (default: <data-dir>/server.db).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Register the local user.
    Register {
        #[arg(short, long)]
        username: String,
    },

    /// Create a quiz.
    QuizCreate {
        #[arg(short, long)]
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Question as "text|option,option,...|correct index". Repeatable.
        #[arg(short = 'q', long = "question")]
        questions: Vec<String>,
    },

    /// Edit a quiz.
    QuizUpdate {
        #[arg(long)]
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Delete a quiz.
    QuizDelete {
        #[arg(long)]
        id: String,
    },

    /// Submit answers to a quiz.
    Attempt {
        #[arg(long)]
        quiz_id: String,

        /// Chosen option indexes, in question order.
        #[arg(short, long, value_delimiter = ',')]
        answers: Vec<u32>,
    },

    /// Run one sync cycle now.
    Sync,

    /// Show outbox counts and failed entries.
    Stats,

    /// Give failed entries another attempt and sync.
    RetryFailed,

    /// Delete synced entries past the retention period.
    Purge,

    /// Show or change lite mode.
    LiteMode {
        #[arg(long, conflicts_with = "off")]
        on: bool,

        #[arg(long)]
        off: bool,
    },

    /// Keep syncing in the background and print status changes.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;

    if let Commands::Serve { addr, db } = &cli.command {
        let db_path = db.clone().unwrap_or_else(|| data_dir.join("server.db"));
        return cmd_serve(addr, &db_path).await;
    }

    let client = Client::open(&data_dir, cli.config.as_deref(), cli.server).await?;

    match cli.command {
        Commands::Serve { .. } => Ok(()),

        Commands::Register { username } => cmd_register(&client, &username).await,

        Commands::QuizCreate {
            title,
            description,
            questions,
        } => cmd_quiz_create(&client, title, description, &questions).await,

        Commands::QuizUpdate {
            id,
            title,
            description,
        } => cmd_quiz_update(&client, &id, title, description).await,

        Commands::QuizDelete { id } => cmd_quiz_delete(&client, &id).await,

        Commands::Attempt { quiz_id, answers } => cmd_attempt(&client, &quiz_id, answers).await,

        Commands::Sync => cmd_sync(&client).await,

        Commands::Stats => cmd_stats(&client).await,

        Commands::RetryFailed => cmd_retry_failed(&client).await,

        Commands::Purge => cmd_purge(&client).await,

        Commands::LiteMode { on, off } => {
            let enable = match (on, off) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_lite_mode(&client, enable).await
        }

        Commands::Watch => cmd_watch(&client).await,
    }
}

fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .context("Could not determine a data directory; pass --data-dir")?
            .join("edgeclass"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    Ok(dir)
}

/// Local store, device identity and sync settings for one invocation.
struct Client {
    store: Arc<SqliteStore>,
    device: DeviceId,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
}

type Engine = SyncEngine<SqliteStore, HttpRemote>;

impl Client {
    async fn open(data_dir: &Path, config: Option<&Path>, server: Option<String>) -> Result<Self> {
        let db_path = data_dir.join("edgeclass.db");
        let store = Arc::new(SqliteStore::open(&db_path).context("Failed to open local database")?);

        let device = match store.get_setting(DEVICE_ID_SETTING).await? {
            Some(id) => DeviceId::new(id).context("Stored device id is invalid")?,
            None => {
                let device = DeviceId::generate();
                store.put_setting(DEVICE_ID_SETTING, device.as_str()).await?;
                info!("Generated device id {}", device);
                device
            }
        };

        let mut config = match config {
            Some(path) => SyncConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };
        if let Some(server) = server {
            config = config.with_api_base_url(server);
        }

        Ok(Self {
            store,
            device,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    fn writer(&self) -> RecordWriter<SqliteStore> {
        RecordWriter::new(self.store.clone(), self.device.clone(), self.clock.clone())
    }

    async fn oracle(&self) -> Result<Arc<NetworkOracle>> {
        let settings: Arc<dyn SettingsStore> = self.store.clone();
        let oracle = NetworkOracle::new().with_settings(settings).await?;
        Ok(Arc::new(oracle))
    }

    async fn engine(&self) -> Result<Arc<Engine>> {
        let remote = HttpRemote::new(&self.config.api_base_url)
            .context("Invalid sync server URL")?;
        Ok(Arc::new(SyncEngine::new(
            self.store.clone(),
            Arc::new(remote),
            self.oracle().await?,
            self.clock.clone(),
            self.config.clone(),
        )))
    }

    fn probe(&self) -> Result<HttpThroughputProbe> {
        let url = format!("{}/probe", self.config.api_base_url.trim_end_matches('/'));
        Ok(HttpThroughputProbe::new(&url, self.config.request_timeout)?)
    }

    async fn current_user(&self) -> Result<String> {
        self.store
            .get_setting(CURRENT_USER_SETTING)
            .await?
            .context("No local user; run `edgeclass register` first")
    }
}

async fn cmd_serve(addr: &str, db_path: &Path) -> Result<()> {
    let db = Arc::new(ServerDb::open(db_path).context("Failed to open server database")?);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tokio::select! {
        result = edgeclass_server::serve(listener, db) => result.context("Server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn cmd_register(client: &Client, username: &str) -> Result<()> {
    let user = client
        .writer()
        .register_user(username)
        .await
        .context("Failed to register user")?;
    client
        .store
        .put_setting(CURRENT_USER_SETTING, &user.id)
        .await?;

    println!("Registered {} ({})", user.username, user.id);
    Ok(())
}

/// Parse "text|option,option,...|correct index".
fn parse_question(raw: &str) -> Result<QuestionDraft> {
    let mut parts = raw.split('|');
    let (Some(text), Some(options), Some(correct), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("Invalid question {:?}; expected \"text|a,b,c|index\"", raw);
    };

    let options: Vec<String> = options.split(',').map(|o| o.trim().to_string()).collect();
    let correct_answer: u32 = correct
        .trim()
        .parse()
        .with_context(|| format!("Invalid correct answer index {:?}", correct))?;
    if correct_answer as usize >= options.len() {
        anyhow::bail!(
            "Correct answer {} is out of range for {} options",
            correct_answer,
            options.len()
        );
    }

    Ok(QuestionDraft {
        question: text.trim().to_string(),
        options,
        correct_answer,
    })
}

async fn cmd_quiz_create(
    client: &Client,
    title: String,
    description: String,
    questions: &[String],
) -> Result<()> {
    let created_by = client.current_user().await?;
    let questions = questions
        .iter()
        .map(|q| parse_question(q))
        .collect::<Result<Vec<_>>>()?;

    let quiz = client
        .writer()
        .create_quiz(
            &created_by,
            QuizDraft {
                title,
                description,
                questions,
            },
        )
        .await
        .context("Failed to create quiz")?;

    println!("Created quiz {} ({})", quiz.title, quiz.id);
    Ok(())
}

async fn cmd_quiz_update(
    client: &Client,
    id: &str,
    title: Option<String>,
    description: Option<String>,
) -> Result<()> {
    if title.is_none() && description.is_none() {
        anyhow::bail!("Nothing to update; pass --title and/or --description");
    }
    let quiz = client
        .writer()
        .update_quiz(id, title, description)
        .await
        .context("Failed to update quiz")?;

    println!("Updated quiz {} ({})", quiz.title, quiz.id);
    Ok(())
}

async fn cmd_quiz_delete(client: &Client, id: &str) -> Result<()> {
    client
        .writer()
        .delete_quiz(id)
        .await
        .context("Failed to delete quiz")?;

    println!("Deleted quiz {}", id);
    Ok(())
}

async fn cmd_attempt(client: &Client, quiz_id: &str, answers: Vec<u32>) -> Result<()> {
    let user_id = client.current_user().await?;
    let attempt = client
        .writer()
        .submit_attempt(quiz_id, &user_id, answers)
        .await
        .context("Failed to submit attempt")?;

    println!(
        "Scored {}/{} (provisional until synced)",
        attempt.score, attempt.total_questions
    );
    Ok(())
}

async fn sync_once(client: &Client, engine: &Engine) -> Result<()> {
    let probe = client.probe()?;
    let network = engine.oracle().probe(&probe).await;
    info!(
        "Connection: {} (online: {}, lite mode: {})",
        network.effective_type, network.is_online, network.is_lite_mode
    );

    match engine.sync_all().await.context("Sync failed")? {
        SyncOutcome::Completed(result) => {
            println!(
                "Synced {} of {} ({} failed, {} retrying, {} conflicts) in {:.1}s",
                result.items_synced,
                result.items_count,
                result.items_failed,
                result.retries_scheduled,
                result.conflicts_found,
                result.duration.as_secs_f64()
            );
        }
        SyncOutcome::SkippedOffline => println!("Offline; changes stay queued"),
        SyncOutcome::AlreadyRunning => println!("A sync is already running"),
    }
    Ok(())
}

async fn cmd_sync(client: &Client) -> Result<()> {
    let engine = client.engine().await?;
    sync_once(client, &engine).await
}

async fn cmd_stats(client: &Client) -> Result<()> {
    let stats = client.store.stats().await?;

    println!("Outbox:");
    println!("  Pending: {}", stats.pending);
    println!("  Synced:  {}", stats.synced);
    println!("  Failed:  {}", stats.failed);
    println!("  Total:   {}", stats.total);

    let failed: Vec<_> = client
        .store
        .list_entries()
        .await?
        .into_iter()
        .filter(|e| e.status == OutboxStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!("\nFailed entries:");
        for entry in failed {
            println!(
                "  #{} {} {} (attempts: {}): {}",
                entry.id,
                entry.method.as_str(),
                entry.endpoint,
                entry.retry_count,
                entry.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

async fn cmd_retry_failed(client: &Client) -> Result<()> {
    let engine = client.engine().await?;
    let reset = engine.retry_failed().await?;
    println!("Reset {} failed entries", reset);
    if reset > 0 {
        sync_once(client, &engine).await?;
    }
    Ok(())
}

async fn cmd_purge(client: &Client) -> Result<()> {
    let engine = client.engine().await?;
    let purged = engine.purge_synced().await?;
    println!("Purged {} synced entries", purged);
    Ok(())
}

async fn cmd_lite_mode(client: &Client, enable: Option<bool>) -> Result<()> {
    let oracle = client.oracle().await?;
    let enabled = match enable {
        Some(enabled) => {
            oracle.set_lite_mode(enabled).await?;
            enabled
        }
        None => oracle.state().lite_mode,
    };

    let info = oracle.network_info();
    println!(
        "Lite mode: {} (batch size {}, {}s between batches)",
        if enabled { "on" } else { "off" },
        info.batch_size,
        info.sync_interval.as_secs()
    );
    Ok(())
}

fn print_status(status: &SyncStatus) {
    let event = status.last_event.as_ref().map(|e| e.name()).unwrap_or("-");
    println!(
        "[{}] online={} syncing={} pending={} synced={} failed={} last={}{}",
        status.updated_at.format("%H:%M:%S"),
        status.is_online,
        status.is_syncing,
        status.stats.pending,
        status.stats.synced,
        status.stats.failed,
        event,
        if status.auth_required {
            " (sign-in required)"
        } else {
            ""
        }
    );
}

async fn cmd_watch(client: &Client) -> Result<()> {
    let engine = client.engine().await?;
    let probe = client.probe()?;
    engine.oracle().probe(&probe).await;

    let observer = SyncStatusObserver::spawn(engine.clone(), client.config.status_poll_interval)
        .await
        .context("Failed to start status observer")?;
    let scheduler = SyncScheduler::spawn(engine.clone());

    let mut status = observer.subscribe();
    print_status(&status.borrow_and_update());

    if let Err(e) = scheduler.request_sync().await {
        warn!("Initial sync failed: {}", e);
    }

    let mut probe_timer = tokio::time::interval(Duration::from_secs(60));
    probe_timer.tick().await;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                print_status(&status.borrow_and_update());
            }
            _ = probe_timer.tick() => {
                engine.oracle().probe(&probe).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}
