//! Status query engine.
//!
//! Resolves a target's configured addresses, speaks the matching game
//! protocol, and records the observation. Queries for one status are
//! tried in priority order; the first success wins and refreshes the
//! status's cached display fields.

mod fivem;
mod minecraft;
mod resolve;
mod source;
mod teamspeak;

pub use resolve::resolve_host;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OnceCell};

use crate::alert::{self, DeliveryError, DisplayRefresher, Notifier};
use crate::config::Config;
use crate::db::{DbError, DowntimeState, GameMod, QueryKind, Status, StatusDisplay, StatusQuery, Store};

pub(crate) const DNS_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// An error from a single query attempt.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The server could not be reached; the attempt is retried on the
    /// next scheduled cycle.
    #[error("{0}")]
    Failed(String),
    /// The configuration can never succeed and should be disabled.
    #[error("{0}")]
    Invalid(String),
}

impl QueryError {
    pub fn failed(message: impl Into<String>) -> Self {
        QueryError::Failed(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        QueryError::Invalid(message.into())
    }
}

/// An error from one status's polling job.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl JobError {
    /// Whether this error signals a delivery-channel-wide outage that
    /// should fail the whole cycle rather than be retried per target.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Delivery(e) if e.is_outage())
    }
}

/// A normalized, protocol-agnostic snapshot of a server's live state.
///
/// Produced per attempt and consumed immediately by the recorder.
#[derive(Debug, Clone, Default)]
pub struct Info {
    pub title: Option<String>,
    pub address: String,
    pub thumbnail: Option<Vec<u8>>,
    pub game: Option<String>,
    pub map: Option<String>,
    pub mods: Option<Vec<GameMod>>,
    pub version: Option<String>,
    pub max_players: i64,
    pub num_players: i64,
    pub players: Vec<Player>,
}

/// A connected player reported by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub name: String,
}

impl Player {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Per-cycle query state: the caching DNS resolver, the HTTP client and
/// lazily opened UDP sockets shared per address family.
///
/// Created at cycle start and discarded at cycle end, so caches never
/// leak across cycles.
pub struct QueryContext {
    resolver: TokioAsyncResolver,
    http: reqwest::Client,
    udp_v4: OnceCell<Arc<Mutex<UdpSocket>>>,
    udp_v6: OnceCell<Arc<Mutex<UdpSocket>>>,
}

impl QueryContext {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Several FiveM servers use self-signed certificates.
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            resolver: resolve::new_resolver(),
            http,
            udp_v4: OnceCell::new(),
            udp_v6: OnceCell::new(),
        })
    }

    pub fn resolver(&self) -> &TokioAsyncResolver {
        &self.resolver
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Get the shared UDP socket for the given address family, opening
    /// it on first use. The mutex serializes request/response exchanges
    /// so concurrent jobs cannot read each other's datagrams.
    pub(crate) async fn udp_socket(
        &self,
        ip: IpAddr,
    ) -> Result<Arc<Mutex<UdpSocket>>, QueryError> {
        let (cell, bind_addr) = if ip.is_ipv4() {
            (&self.udp_v4, "0.0.0.0:0")
        } else {
            (&self.udp_v6, "[::]:0")
        };
        let socket = cell
            .get_or_try_init(|| async {
                let socket = UdpSocket::bind(bind_addr)
                    .await
                    .map_err(|e| QueryError::failed(format!("Failed to open socket: {}", e)))?;
                Ok::<_, QueryError>(Arc::new(Mutex::new(socket)))
            })
            .await?;
        Ok(socket.clone())
    }
}

/// Query one status: try each configuration in priority order, record
/// the outcome and refresh its displays.
pub async fn query_status<N, D>(
    ctx: &QueryContext,
    store: &Store,
    notifier: &N,
    displays: &D,
    status: &Status,
    cfg: &Config,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
    D: DisplayRefresher + ?Sized,
{
    let mut result = None;
    for query in &status.queries {
        if let Some(info) = maybe_query(ctx, store, notifier, status, query, cfg).await? {
            result = Some(info);
            break;
        }
    }

    record_result(store, notifier, status, result, cfg).await?;

    for display in &status.displays {
        maybe_update_display(store, notifier, displays, status, display).await?;
    }

    Ok(())
}

/// Attempt a single query configuration, applying the failure policy.
///
/// Transient failures only disable the configuration once it has been
/// failing for longer than the dead-after window; permanent ones disable
/// it immediately.
async fn maybe_query<N>(
    ctx: &QueryContext,
    store: &Store,
    notifier: &N,
    status: &Status,
    query: &StatusQuery,
    cfg: &Config,
) -> Result<Option<Info>, JobError>
where
    N: Notifier + ?Sized,
{
    match send_query(ctx, query).await {
        Ok(info) => {
            store.set_query_success(query.status_query_id)?;
            Ok(Some(info))
        }
        Err(QueryError::Failed(reason)) => {
            tracing::debug!("Query #{} failed: {}", query.status_query_id, reason);
            let now = Utc::now();
            let failed_at = store.set_query_failed(query.status_query_id, now)?;
            if now - failed_at > cfg.dead_after {
                let reason = "Offline for extended period of time";
                alert::disable_query(store, notifier, status, query, reason).await?;
            }
            Ok(None)
        }
        Err(QueryError::Invalid(reason)) => {
            store.set_query_failed(query.status_query_id, Utc::now())?;
            alert::disable_query(store, notifier, status, query, &reason).await?;
            Ok(None)
        }
    }
}

/// Dispatch to the protocol client matching the query's kind.
async fn send_query(ctx: &QueryContext, query: &StatusQuery) -> Result<Info, QueryError> {
    match query.kind {
        QueryKind::Arma3
        | QueryKind::ArmaReforger
        | QueryKind::Source
        | QueryKind::ProjectZomboid => source::query(ctx, query).await,
        QueryKind::Fivem => fivem::query(ctx, query).await,
        QueryKind::MinecraftBedrock => minecraft::query_bedrock(ctx, query).await,
        QueryKind::MinecraftJava => minecraft::query_java(ctx, query).await,
        QueryKind::Teamspeak3 => teamspeak::query(ctx, query).await,
    }
}

/// Record the cycle's outcome for a status and fire downtime transitions.
///
/// Pruning runs once per recording call rather than on its own timer;
/// the redundancy is cheaper than another scheduler.
async fn record_result<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
    result: Option<Info>,
    cfg: &Config,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    let now = Utc::now();
    store.prune_history(
        status.status_id,
        now,
        cfg.history_expires_after,
        cfg.history_players_expires_after,
    )?;

    match result {
        Some(info) => {
            tracing::debug!("Recording status #{} as online", status.status_id);
            let state = store.record_online(status.status_id, now, &info)?;
            if state == DowntimeState::Downtime {
                alert::send_downtime_ended(store, notifier, status).await?;
            }
        }
        None => {
            tracing::debug!("Recording status #{} as offline", status.status_id);
            let state = store.record_offline(status.status_id, now)?;
            if state == DowntimeState::PendingDowntime {
                alert::send_downtime_started(store, notifier, status).await?;
            }
        }
    }

    Ok(())
}

/// Refresh one display sink, disabling it when the external collaborator
/// reports it gone or forbidden.
async fn maybe_update_display<N, D>(
    store: &Store,
    notifier: &N,
    displays: &D,
    status: &Status,
    display: &StatusDisplay,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
    D: DisplayRefresher + ?Sized,
{
    match displays.refresh(display.message_id).await {
        Ok(()) => {
            store.set_display_success(display.message_id)?;
            Ok(())
        }
        Err(e) if e.disables_sink() => {
            store.set_display_failed(display.message_id, Utc::now())?;
            alert::disable_display(store, notifier, status, display, &e.to_string()).await
        }
        Err(e) => {
            store.set_display_failed(display.message_id, Utc::now())?;
            Err(e.into())
        }
    }
}
