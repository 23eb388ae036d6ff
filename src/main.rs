use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use hail_sync::config::{self, Config};
use hail_sync::db::{self, Pool};
use hail_sync::fetch::{FetchError, Fetcher};
use hail_sync::hail::token::OAuthEndpoints;
use hail_sync::hail::{self, HailClient, SqliteTokenStore, TokenManager, TokenStore};
use hail_sync::importer::ImporterRegistry;
use hail_sync::model::FetchTarget;
use hail_sync::notice::{DbNoticeSink, NoticeSink};

#[derive(Debug, Parser)]
#[command(author, version, about = "Synchronize Hail content into a local database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log every imported object
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the URL an operator visits to authorise access
    AuthorizeUrl,
    /// Exchange the code from the OAuth callback for tokens
    Authorize {
        #[arg(long)]
        code: String,
    },
    /// Refresh the access token now
    RefreshToken,
    /// List organisations available to the authorising user
    Organisations,
    /// Set the organisations that fetch jobs walk
    SetOrganisations { ids: Vec<String> },
    /// List public (or private) tags of the configured organisations
    Tags {
        #[arg(long)]
        private: bool,
    },
    /// Queue a fetch job; `*` fetches every type
    Enqueue {
        #[arg(default_value = FetchTarget::WILDCARD)]
        target: String,
    },
    /// Run pending fetch jobs and exit
    Run,
    /// Poll for fetch jobs until stopped or a job fails
    Worker,
    /// Show authorisation state, recent jobs and notices
    Status,
}

struct App {
    cfg: Config,
    pool: Pool,
    store: Arc<dyn TokenStore>,
    notices: Arc<dyn NoticeSink>,
    client: Arc<HailClient>,
}

impl App {
    async fn init(args: &Args) -> Result<Self> {
        let cfg = config::load(Some(args.config.as_path()))?;
        cfg.ensure_dirs()?;

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
        let pool = db::init_pool(&database_url).await?;
        db::run_migrations(&pool).await?;

        let http = hail::http_client(&cfg)?;
        let store: Arc<dyn TokenStore> = Arc::new(SqliteTokenStore::new(pool.clone()));
        let notices: Arc<dyn NoticeSink> = Arc::new(DbNoticeSink::new(pool.clone()));
        let tokens = TokenManager::load(
            http.clone(),
            cfg.credentials(),
            OAuthEndpoints::from_config(&cfg)?,
            store.clone(),
            notices.clone(),
        )
        .await?;
        let client = HailClient::from_config(&cfg, http, Arc::new(tokens), notices.clone())?;

        Ok(Self {
            cfg,
            pool,
            store,
            notices,
            client: Arc::new(client),
        })
    }

    fn fetcher(&self, verbose: bool) -> Fetcher {
        let registry = ImporterRegistry::standard(&self.pool, self.cfg.hail.page_size as usize);
        Fetcher::new(
            self.pool.clone(),
            self.client.clone(),
            self.store.clone(),
            registry,
            self.notices.clone(),
        )
        .verbose(verbose)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let app = App::init(&args).await?;
    let tokens = app.client.tokens();

    match &args.command {
        Command::AuthorizeUrl => {
            if !tokens.is_ready_to_authorise() {
                bail!(
                    "set {} and {} before authorising",
                    config::ENV_CLIENT_ID,
                    config::ENV_CLIENT_SECRET
                );
            }
            let state = uuid::Uuid::new_v4().to_string();
            println!("{}", tokens.authorization_url(&state));
        }
        Command::Authorize { code } => {
            let state = app.client.authorise(code).await?;
            info!(user_id = ?state.user_id, "authorised with Hail");
        }
        Command::RefreshToken => {
            let state = tokens.refresh_access_token().await?;
            info!(expiry = ?state.access_token_expiry, "access token refreshed");
        }
        Command::Organisations => {
            for org in app.client.organisations().await? {
                println!("{}\t{}", org.id, org.name);
            }
        }
        Command::SetOrganisations { ids } => {
            let state = tokens.set_organisations(ids.clone()).await?;
            info!(organisations = ?state.organisations, "organisations saved");
        }
        Command::Tags { private } => {
            let orgs = tokens.snapshot().await.organisations;
            for tag in app.client.tag_list(&orgs, *private).await? {
                println!("{}\t{}", tag.id, tag.name);
            }
        }
        Command::Enqueue { target } => {
            let target = FetchTarget::parse_target(target);
            if let FetchTarget::Unknown(name) = &target {
                warn!(%name, "not a fetchable type; the job will complete without fetching");
            }
            let id = db::enqueue_fetch_job(&app.pool, &target).await?;
            println!("{}", id);
        }
        Command::Run => {
            let processed = app.fetcher(args.verbose).run_pending().await?;
            info!(processed, "fetch run complete");
        }
        Command::Worker => run_worker(&app, args.verbose).await?,
        Command::Status => print_status(&app).await?,
    }

    Ok(())
}

async fn run_worker(app: &App, verbose: bool) -> Result<()> {
    let fetcher = app.fetcher(verbose);
    let poll_sleep = Duration::from_millis(app.cfg.app.poll_interval_ms);
    info!("starting fetch worker");
    loop {
        match fetcher.run_pending().await {
            Ok(0) => tokio::time::sleep(poll_sleep).await,
            Ok(processed) => info!(processed, "fetch jobs complete"),
            // A failed job ends the process; the next scheduled start retries
            // with a fresh job.
            Err(err @ FetchError::JobFailed { .. }) => return Err(err.into()),
            Err(err) => {
                error!(?err, "fetch worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn print_status(app: &App) -> Result<()> {
    let tokens = app.client.tokens();
    let state = tokens.snapshot().await;
    println!("ready to authorise: {}", tokens.is_ready_to_authorise());
    println!("authorised:         {}", state.is_authorised());
    if let Some(expiry) = state.access_token_expiry {
        println!("token expiry:       {}", expiry.to_rfc3339());
    }
    println!("user:               {}", state.user_id.as_deref().unwrap_or("-"));
    println!("organisations:      {}", state.organisations.join(", "));
    match state.api_health.message() {
        Some(msg) => println!("api health:         {} ({})", state.api_health.as_str(), msg),
        None => println!("api health:         {}", state.api_health.as_str()),
    }

    println!();
    for count in db::object_counts(&app.pool).await? {
        println!("{:<12} {}", count.object_type, count.count);
    }

    println!();
    for job in db::recent_fetch_jobs(&app.pool, 10).await? {
        println!(
            "#{} {} {} {}/{} {}{}",
            job.id,
            job.to_fetch,
            job.status.as_str(),
            job.global_done,
            job.global_total,
            job.created_at.to_rfc3339(),
            job.error.map(|e| format!(" error: {e}")).unwrap_or_default()
        );
    }

    let notices = db::recent_notices(&app.pool, 5).await?;
    if !notices.is_empty() {
        println!();
        for notice in notices {
            println!("[{}] {} {}", notice.level, notice.created_at, notice.message);
        }
    }
    Ok(())
}
