//! FiveM (Cfx.re) HTTP query client.
//!
//! FiveM servers expose `dynamic.json`, `info.json` and `players.json`
//! over their game port. Field defaults are deliberately permissive;
//! servers omit keys freely.

use std::sync::OnceLock;

use base64::prelude::{Engine, BASE64_STANDARD};
use regex::Regex;
use serde::Deserialize;

use crate::db::StatusQuery;

use super::{resolve_host, Info, Player, QueryContext, QueryError};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct Dynamic {
    hostname: String,
    gametype: String,
    mapname: String,
    clients: i64,
    iv: i64,
    sv_maxclients: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ServerInfo {
    icon: Option<String>,
    vars: ServerVars,
    version: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
#[allow(non_snake_case)]
struct ServerVars {
    sv_maxClients: i64,
    sv_projectName: String,
}

#[derive(Debug, Deserialize)]
struct PlayerEntry {
    name: String,
}

/// Matches FiveM `^0`..`^9` colour codes embedded in hostnames.
fn colour_code() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\^\d").unwrap())
}

pub(super) async fn query(ctx: &QueryContext, query: &StatusQuery) -> Result<Info, QueryError> {
    let (ip, port) = resolve_host(ctx.resolver(), query).await?;
    let host = match ip {
        std::net::IpAddr::V4(v4) => v4.to_string(),
        std::net::IpAddr::V6(v6) => format!("[{}]", v6),
    };

    // Cache-busting parameter, same as the in-game server browser.
    let v = chrono::Utc::now().timestamp();
    let dynamic = get_json(ctx, &host, port, "dynamic.json", v).await?;
    let info = get_json(ctx, &host, port, "info.json", v).await?;
    let players = get_json(ctx, &host, port, "players.json", v).await?;

    let dynamic: Dynamic = from_document(dynamic)?;
    let info: ServerInfo = from_document(info)?;
    let players: Vec<PlayerEntry> = from_document(players)?;

    let thumbnail = match &info.icon {
        Some(icon) if !icon.is_empty() => Some(
            BASE64_STANDARD
                .decode(icon)
                .map_err(|_| QueryError::invalid("Server responded with malformed JSON"))?,
        ),
        _ => None,
    };

    let title = if dynamic.hostname.is_empty() {
        info.vars.sv_projectName.clone()
    } else {
        dynamic.hostname.clone()
    };
    let title = colour_code().replace_all(&title, "").trim().to_string();

    let version = match dynamic.iv {
        0 => info.version,
        iv => iv,
    };

    let max_players = match dynamic.sv_maxclients {
        0 => info.vars.sv_maxClients,
        n => n,
    };

    Ok(Info {
        title: (!title.is_empty()).then_some(title),
        address: query.address(),
        thumbnail,
        game: (!dynamic.gametype.is_empty()).then(|| dynamic.gametype.clone()),
        map: (!dynamic.mapname.is_empty()).then(|| dynamic.mapname.clone()),
        mods: None,
        version: (version != 0).then(|| version.to_string()),
        max_players,
        num_players: dynamic.clients,
        players: players
            .into_iter()
            .filter(|p| !p.name.is_empty())
            .map(|p| Player { name: p.name })
            .collect(),
    })
}

async fn get_json(
    ctx: &QueryContext,
    host: &str,
    port: u16,
    filename: &str,
    v: i64,
) -> Result<serde_json::Value, QueryError> {
    let url = format!("https://{}:{}/{}", host, port, filename);
    let response = ctx
        .http()
        .get(&url)
        .query(&[("v", v)])
        .send()
        .await
        .map_err(http_error)?;

    let status = response.status();
    if !status.is_success() {
        let message = format!("Server responded with {}", status.as_u16());
        if status.is_client_error() {
            return Err(QueryError::invalid(message));
        }
        return Err(QueryError::failed(message));
    }

    response
        .json()
        .await
        .map_err(|_| QueryError::invalid("Server responded with malformed JSON"))
}

fn http_error(e: reqwest::Error) -> QueryError {
    if e.is_timeout() {
        QueryError::failed("HTTP request timed out")
    } else if e.is_connect() {
        QueryError::failed("Failed to connect to server")
    } else {
        QueryError::failed(format!("HTTP request failed: {}", e))
    }
}

/// A schema mismatch here usually means the server process is mid-restart
/// and serving a placeholder document.
fn from_document<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, QueryError> {
    serde_json::from_value(value)
        .map_err(|_| QueryError::failed("Unexpected response format; did server shutdown?"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_tolerates_missing_keys() {
        let dynamic: Dynamic = from_document(serde_json::json!({})).unwrap();
        assert_eq!(dynamic.clients, 0);
        assert_eq!(dynamic.hostname, "");

        let dynamic: Dynamic = from_document(serde_json::json!({
            "hostname": "^2Cool^0 Server",
            "clients": 12,
            "sv_maxclients": 48,
        }))
        .unwrap();
        assert_eq!(dynamic.clients, 12);
        assert_eq!(dynamic.sv_maxclients, 48);
    }

    #[test]
    fn test_player_schema_mismatch_is_transient() {
        let result: Result<Vec<PlayerEntry>, _> =
            from_document(serde_json::json!({"error": "restarting"}));
        assert!(matches!(result, Err(QueryError::Failed(_))));
    }

    #[test]
    fn test_colour_codes_stripped() {
        let stripped = colour_code().replace_all("^2Cool^0 Server ", "");
        assert_eq!(stripped.trim(), "Cool Server");
    }
}
