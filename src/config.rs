use std::{
    env::{self, VarError},
    str::FromStr,
    time::Duration,
};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use tracing::{info, instrument, warn};
use url::Url;

use crate::kv_store::ensure_schema;

/// # Errors
/// Will return [`Err`] if the connection to the database fails
/// or the store schema cannot be created.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!(?db_connection_options, "Connecting to database");
    let db = Database::connect(db_connection_options).await?;
    ensure_schema(&db).await?;
    set_db_conn(db);

    info!("Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    required_var("DB_URL").into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    optional_var("ADDR").unwrap_or_else(|| {
        const DEFAULT_ADDR: &str = "127.0.0.1:0";
        warn!(
            addr = DEFAULT_ADDR,
            "ADDR environment variable not set; defaulting to {DEFAULT_ADDR}"
        );
        DEFAULT_ADDR.to_owned()
    })
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub api_base: Url,
    pub domain: String,
    pub secret_key: String,
    pub timeout: Duration,
}

/// # Panics
/// Panics when `SHORTIO_SECRET_KEY` is not set or any provider variable is invalid.
pub fn provider_config_capsule(_: CapsuleHandle) -> ProviderConfig {
    const DEFAULT_API_BASE: &str = "https://api.short.io";
    const DEFAULT_DOMAIN: &str = "pwbtw.com";
    const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

    let api_base = optional_var("SHORTIO_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_owned());
    ProviderConfig {
        api_base: Url::parse(&api_base)
            .unwrap_or_else(|err| panic!("SHORTIO_API_BASE is not a valid URL: {err}")),
        domain: optional_var("SHORTIO_DOMAIN").unwrap_or_else(|| DEFAULT_DOMAIN.to_owned()),
        secret_key: required_var("SHORTIO_SECRET_KEY"),
        timeout: Duration::from_secs(
            parsed_var("PROVIDER_TIMEOUT_SECONDS").unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        ),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepConfig {
    /// Bearer token the on-demand sweep requires, if any.
    pub token: Option<String>,
    /// Period of the in-process sweep; disabled when unset.
    pub interval: Option<Duration>,
    /// How long a store entry outlives its link's expiry.
    pub store_ttl_grace: Duration,
}

/// # Panics
/// Panics when any sweep environment variable is invalid.
pub fn sweep_config_capsule(_: CapsuleHandle) -> SweepConfig {
    const DEFAULT_GRACE_SECONDS: u64 = 24 * 60 * 60;

    SweepConfig {
        token: optional_var("SWEEP_TOKEN").filter(|token| !token.is_empty()),
        interval: parsed_var("SWEEP_INTERVAL_SECONDS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        store_ttl_grace: Duration::from_secs(
            parsed_var("STORE_TTL_GRACE_SECONDS").unwrap_or(DEFAULT_GRACE_SECONDS),
        ),
    }
}

fn required_var(name: &str) -> String {
    env::var(name).unwrap_or_else(|err| match err {
        VarError::NotPresent => panic!("{name} is not set"),
        VarError::NotUnicode(actual) => {
            panic!("{name} is invalid unicode: {}", actual.display());
        }
    })
}

fn optional_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            info!(name, "Environment variable set");
            Some(value)
        }
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} environment variable is invalid: {}", actual.display());
        }
    }
}

fn parsed_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name).map(|raw| {
        raw.parse()
            .unwrap_or_else(|err| panic!("{name} environment variable is invalid ({raw}): {err}"))
    })
}
