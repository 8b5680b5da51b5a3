mod cli;

use std::path::Path;
use std::sync::Arc;

use clap::Parser as _;
use cli::{Opts, OptsCmd};
use snafu::{ResultExt as _, Snafu, Whatever};
use tessera_api::{AppState, LogMailer, Server};
use tessera_catalog::{Catalogue, CatalogueOptions};
use tessera_core::config::Config;
use tessera_registry::{HttpRegister, LocalRegister, ServiceRegister};
use tessera_user_db::UserDbPool;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "tessera::cli";

/// Required configuration is missing; the conventional exit code for it.
const EXIT_BAD_CONFIG: i32 = 2;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Could not read config {path}: {source}"))]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Malformed config {path}: {source}"))]
    ConfigParse {
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("Invalid system streams: {source}"))]
    Catalogue { source: tessera_catalog::CatalogError },
    #[snafu(display("Storage error: {source}"))]
    Accounts {
        source: tessera_accounts::AccountsError,
    },
    #[snafu(display("Storage error: {source}"))]
    UserDb { source: tessera_user_db::DbError },
    #[snafu(transparent)]
    Server { source: tessera_api::ServerError },
    #[snafu(display("Miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main(flavor = "multi_thread")]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    match opts.cmd {
        OptsCmd::Serve => serve(&opts.config).await,
        OptsCmd::CheckConfig => {
            let config = load_config(&opts.config)?;
            build_catalogue(&config)?;
            println!("ok");
            Ok(())
        }
    }
}

async fn serve(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    let catalog = Arc::new(build_catalogue(&config)?);

    let accounts = Arc::new(
        tessera_accounts::AccountsDb::open(config.storage.data_dir.join("accounts.redb"))
            .await
            .context(AccountsSnafu)?,
    );
    let user_dbs = Arc::new(
        UserDbPool::new(
            config.storage.data_dir.join("users"),
            config.storage.user_db_pool_size,
        )
        .await
        .context(UserDbSnafu)?,
    );

    let register: Arc<dyn ServiceRegister> = if config.dns_less {
        Arc::new(LocalRegister::new(
            accounts.clone(),
            config.auth.invitation_tokens.clone(),
        ))
    } else {
        let Some(register_config) = &config.service_register else {
            // cluster mode without a register endpoint cannot serve
            eprintln!("Missing serviceRegister configuration in cluster mode");
            std::process::exit(EXIT_BAD_CONFIG);
        };
        let url = match url::Url::parse(&register_config.url) {
            Ok(url) => url,
            Err(err) => {
                eprintln!("Bad serviceRegister.url: {err}");
                std::process::exit(EXIT_BAD_CONFIG);
            }
        };
        Arc::new(HttpRegister::new(url, register_config.key.clone()))
    };

    let previews = tessera_previews::PreviewCache::open(
        config.previews.cache_dir.clone(),
        config.previews.max_age_secs,
    )
    .await
    .whatever_context::<_, Whatever>("opening preview cache")
    .context(WhateverSnafu)?;
    spawn_preview_sweep(previews);

    let state = Arc::new(AppState::new(
        config,
        catalog,
        accounts,
        user_dbs,
        register,
        Arc::new(LogMailer),
    ));

    info!(target: LOG_TARGET, "Starting API server");
    let server = Server::init(state).await?;
    server.run().await?;
    Ok(())
}

/// Hourly cron-style sweep of the preview cache; the cache's own lock
/// keeps overlapping runs exclusive.
fn spawn_preview_sweep(previews: tessera_previews::PreviewCache) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = previews.sweep().await {
                tracing::warn!(target: LOG_TARGET, %err, "Preview sweep failed");
            }
        }
    });
}

fn load_config(path: &Path) -> CliResult<Config> {
    if !path.exists() {
        // run with built-in defaults (standalone mode)
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).context(ConfigReadSnafu {
        path: path.display().to_string(),
    })?;
    serde_json::from_str(&raw).context(ConfigParseSnafu {
        path: path.display().to_string(),
    })
}

fn build_catalogue(config: &Config) -> CliResult<Catalogue> {
    Catalogue::build(CatalogueOptions {
        custom: config.custom_streams.clone(),
        backward_compatibility_prefix: config.backward_compatibility_prefix,
        legacy_dotted_reads: config.backward_compatibility_prefix,
    })
    .context(CatalogueSnafu)
}

fn init_logging() -> Result<(), Whatever> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .map_err(|err| snafu::FromString::without_source(format!("bad RUST_LOG: {err}")))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
