//! Database model types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A monitored game server with its cached display fields and
/// eager-loaded query, alert and display configurations.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub status_id: i64,
    pub scope_id: i64,
    pub label: String,

    pub title: Option<String>,
    pub address: Option<String>,
    pub thumbnail: Option<Vec<u8>>,
    pub game: Option<String>,
    pub map: Option<String>,
    pub mods: Option<String>,
    pub version: Option<String>,

    pub enabled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub queries: Vec<StatusQuery>,
    pub alerts: Vec<StatusAlert>,
    pub displays: Vec<StatusDisplay>,
}

/// One configured way to reach a status, tried in priority order.
#[derive(Debug, Clone)]
pub struct StatusQuery {
    pub status_query_id: i64,
    pub status_id: i64,
    pub host: String,
    pub game_port: u16,
    pub query_port: u16,
    pub kind: QueryKind,
    pub priority: i64,
    pub enabled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub extra: String,
}

impl StatusQuery {
    /// Human-readable address shown in alerts and cached on the status.
    ///
    /// TeamSpeak repurposes the port fields, so the voice (query) port is
    /// the one users connect with.
    pub fn address(&self) -> String {
        let port = match self.kind {
            QueryKind::Teamspeak3 => self.query_port,
            _ => self.game_port,
        };
        if port > 0 {
            format!("{}:{}", self.host, port)
        } else {
            self.host.clone()
        }
    }
}

/// The closed set of supported query protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Arma3,
    ArmaReforger,
    Fivem,
    MinecraftBedrock,
    MinecraftJava,
    Source,
    Teamspeak3,
    ProjectZomboid,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Arma3 => "arma3",
            QueryKind::ArmaReforger => "arma-reforger",
            QueryKind::Fivem => "fivem",
            QueryKind::MinecraftBedrock => "minecraft-bedrock",
            QueryKind::MinecraftJava => "minecraft-java",
            QueryKind::Source => "source",
            QueryKind::Teamspeak3 => "teamspeak3",
            QueryKind::ProjectZomboid => "project-zomboid",
        }
    }

    /// Display label used in alert messages.
    pub fn label(self) -> &'static str {
        match self {
            QueryKind::Arma3 => "Arma 3",
            QueryKind::ArmaReforger => "Arma Reforger",
            QueryKind::Fivem => "FiveM",
            QueryKind::MinecraftBedrock => "Minecraft: Bedrock Edition",
            QueryKind::MinecraftJava => "Minecraft: Java Edition",
            QueryKind::Source => "Source",
            QueryKind::Teamspeak3 => "TeamSpeak 3",
            QueryKind::ProjectZomboid => "Project Zomboid",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored query kind tag is not recognised.
#[derive(Error, Debug)]
#[error("unknown query kind: {0}")]
pub struct UnknownQueryKind(pub String);

impl FromStr for QueryKind {
    type Err = UnknownQueryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "arma3" => QueryKind::Arma3,
            "arma-reforger" => QueryKind::ArmaReforger,
            "fivem" => QueryKind::Fivem,
            "minecraft-bedrock" => QueryKind::MinecraftBedrock,
            "minecraft-java" => QueryKind::MinecraftJava,
            "source" => QueryKind::Source,
            "teamspeak3" => QueryKind::Teamspeak3,
            "project-zomboid" => QueryKind::ProjectZomboid,
            other => return Err(UnknownQueryKind(other.to_string())),
        })
    }
}

/// A notification sink for a status.
#[derive(Debug, Clone)]
pub struct StatusAlert {
    pub status_alert_id: i64,
    pub status_id: i64,
    pub channel_id: i64,
    pub enabled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub send_audit: bool,
    pub send_downtime: bool,
}

/// A rendered display sink for a status.
#[derive(Debug, Clone)]
pub struct StatusDisplay {
    pub message_id: i64,
    pub status_id: i64,
    pub enabled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// An append-only observation row.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub status_history_id: i64,
    pub created_at: DateTime<Utc>,
    pub status_id: i64,
    pub online: bool,
    pub down: bool,
    pub max_players: i64,
    pub num_players: i64,
}

/// The online/down flags of a history row, as read by the downtime check.
#[derive(Debug, Clone, Copy)]
pub struct HistoryFlags {
    pub online: bool,
    pub down: bool,
}

/// A mod reported by a server, persisted as JSON in the status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMod {
    pub name: String,
    pub url: Option<String>,
}

/// Derived downtime classification for a status.
///
/// Computed on demand from the two most recent history rows; never
/// persisted itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowntimeState {
    /// The server was recently online.
    Online,
    /// The server is down, but has not yet been logged as downtime.
    PendingDowntime,
    /// The server is down and has been logged as downtime.
    Downtime,
}

impl DowntimeState {
    /// Classify from recent history rows, ordered newest first.
    ///
    /// At least one online row wins outright; otherwise any row already
    /// marked down means downtime. An empty history (a fresh status)
    /// classifies as pending.
    pub fn classify<'a, I>(recent: I) -> Self
    where
        I: IntoIterator<Item = &'a HistoryFlags>,
    {
        let mut any_online = false;
        let mut any_down = false;
        for row in recent {
            any_online |= row.online;
            any_down |= row.down;
        }

        if any_online {
            DowntimeState::Online
        } else if any_down {
            DowntimeState::Downtime
        } else {
            DowntimeState::PendingDowntime
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(rows: &[(bool, bool)]) -> Vec<HistoryFlags> {
        rows.iter()
            .map(|&(online, down)| HistoryFlags { online, down })
            .collect()
    }

    #[test]
    fn test_query_kind_round_trip() {
        for kind in [
            QueryKind::Arma3,
            QueryKind::ArmaReforger,
            QueryKind::Fivem,
            QueryKind::MinecraftBedrock,
            QueryKind::MinecraftJava,
            QueryKind::Source,
            QueryKind::Teamspeak3,
            QueryKind::ProjectZomboid,
        ] {
            assert_eq!(kind.as_str().parse::<QueryKind>().unwrap(), kind);
        }
        assert!("quake".parse::<QueryKind>().is_err());
    }

    #[test]
    fn test_downtime_classification() {
        // No history at all: fresh statuses are pending.
        assert_eq!(
            DowntimeState::classify(&flags(&[])),
            DowntimeState::PendingDowntime
        );
        // Any online row wins.
        assert_eq!(
            DowntimeState::classify(&flags(&[(false, true), (true, false)])),
            DowntimeState::Online
        );
        // No online, one already marked down.
        assert_eq!(
            DowntimeState::classify(&flags(&[(false, true), (false, false)])),
            DowntimeState::Downtime
        );
        // Two plain offline rows.
        assert_eq!(
            DowntimeState::classify(&flags(&[(false, false), (false, false)])),
            DowntimeState::PendingDowntime
        );
    }

    #[test]
    fn test_query_address() {
        let mut query = StatusQuery {
            status_query_id: 1,
            status_id: 1,
            host: "play.example.com".to_string(),
            game_port: 2302,
            query_port: 2303,
            kind: QueryKind::Arma3,
            priority: 0,
            enabled_at: None,
            failed_at: None,
            extra: String::new(),
        };
        assert_eq!(query.address(), "play.example.com:2302");

        query.kind = QueryKind::Teamspeak3;
        assert_eq!(query.address(), "play.example.com:2303");

        query.kind = QueryKind::Source;
        query.game_port = 0;
        assert_eq!(query.address(), "play.example.com");
    }
}
