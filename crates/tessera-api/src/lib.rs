//! The HTTP API: method contexts, the registration pipeline, account-event
//! rules and the axum surface.

pub mod account_events;
pub mod context;
mod error;
mod maintenance;
pub mod registration;
pub mod routes;
pub mod users;

use std::io;
use std::net::SocketAddr;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use snafu::{ResultExt as _, Snafu};
use tessera_access::AccessLogicBuilder;
use tessera_accounts::AccountsDb;
use tessera_catalog::Catalogue;
use tessera_core::config::Config;
use tessera_core::fmt::BoxedError;
use tessera_registry::ServiceRegister;
use tessera_user_db::UserDbPool;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{info, warn};

pub use self::context::MethodContext;
pub use self::error::{RequestError, RequestResult};

#[cfg(test)]
mod tests;

const LOG_TARGET: &str = "tessera::api";

/// Loaded access policies, keyed `<user id>\n<token>`.
const ACCESS_CACHE_SIZE: usize = 10_000;

/// Operator hook run after token verification; rejection fails the call
/// with an invalid-access-token error.
pub type CustomAuthStep =
    Arc<dyn Fn(&context::AuthContext<'_>) -> Result<(), String> + Send + Sync>;

/// Welcome-mail port; failures are logged, never surfaced.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome(
        &self,
        username: &str,
        email: Option<&str>,
        language: &str,
    ) -> Result<(), BoxedError>;
}

/// Default mailer: logs instead of sending.
pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    async fn send_welcome(
        &self,
        username: &str,
        _email: Option<&str>,
        language: &str,
    ) -> Result<(), BoxedError> {
        info!(target: LOG_TARGET, %username, %language, "Welcome mail suppressed (no mailer)");
        Ok(())
    }
}

pub struct AppState {
    pub config: Config,
    pub catalog: Arc<Catalogue>,
    pub accounts: Arc<AccountsDb>,
    pub user_dbs: Arc<UserDbPool>,
    pub register: Arc<dyn ServiceRegister>,
    pub mailer: Arc<dyn Mailer>,
    pub access_builder: AccessLogicBuilder,
    access_cache: Mutex<LruCache<String, Arc<tessera_access::AccessLogic>>>,
    pub custom_auth: Option<CustomAuthStep>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: Config,
        catalog: Arc<Catalogue>,
        accounts: Arc<AccountsDb>,
        user_dbs: Arc<UserDbPool>,
        register: Arc<dyn ServiceRegister>,
        mailer: Arc<dyn Mailer>,
    ) -> AppState {
        let access_builder =
            AccessLogicBuilder::new(catalog.clone()).with_self_audit(config.auth.self_audit);
        AppState {
            config,
            catalog,
            accounts,
            user_dbs,
            register,
            mailer,
            access_builder,
            access_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(ACCESS_CACHE_SIZE).expect("non-zero"),
            )),
            custom_auth: None,
        }
    }

    pub fn with_custom_auth(mut self, step: CustomAuthStep) -> AppState {
        self.custom_auth = Some(step);
        self
    }

    /// This node's public endpoint for a user, returned by login and
    /// registration.
    pub fn api_endpoint_for(&self, username: &str) -> String {
        let base = self.config.http.public_url.trim_end_matches('/');
        format!("{base}/{username}/")
    }

    pub(crate) fn access_cache_get(
        &self,
        key: &str,
    ) -> Option<Arc<tessera_access::AccessLogic>> {
        self.access_cache
            .lock()
            .expect("Locking failed")
            .get(key)
            .cloned()
    }

    pub(crate) fn access_cache_put(&self, key: String, logic: Arc<tessera_access::AccessLogic>) {
        self.access_cache
            .lock()
            .expect("Locking failed")
            .put(key, logic);
    }

    pub(crate) fn access_cache_evict(&self, key: &str) {
        self.access_cache.lock().expect("Locking failed").pop(key);
    }

    /// Drop every cached policy of one user (access deleted or user gone).
    pub(crate) fn access_cache_evict_user(&self, user_id: &tessera_core::id::UserId) {
        let mut cache = self.access_cache.lock().expect("Locking failed");
        let prefix = format!("{user_id}\n");
        let stale: Vec<String> = cache
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(transparent)]
    Io { source: io::Error },

    #[snafu(display("Bad listen address `{listen}`"))]
    ListenAddr {
        listen: String,
        source: std::net::AddrParseError,
    },
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

pub struct Server {
    listener: TcpListener,
    state: SharedState,
}

impl Server {
    pub async fn init(state: SharedState) -> ServerResult<Server> {
        let addr = SocketAddr::from_str(&state.config.http.listen).context(ListenAddrSnafu {
            listen: state.config.http.listen.clone(),
        })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        info!(target: LOG_TARGET, "Listening on {}", listener.local_addr()?);
        Ok(Server { listener, state })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> ServerResult<()> {
        maintenance::spawn(self.state.clone());
        let router = routes::router(self.state.clone());
        axum::serve(self.listener, router.into_make_service())
            .await
            .map_err(|err| {
                warn!(target: LOG_TARGET, %err, "Server terminated");
                ServerError::Io { source: err }
            })
    }
}
