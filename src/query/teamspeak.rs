//! TeamSpeak 3 ServerQuery client.
//!
//! TeamSpeak is queried through its text-based ServerQuery port, not
//! the voice port users connect to. For this kind the port fields are
//! repurposed: `game_port` holds the ServerQuery port (default 10011)
//! and `query_port` holds the voice port, which is what SRV records
//! advertise and what `use` selects the virtual server by.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::db::StatusQuery;

use super::{resolve_host, Info, Player, QueryContext, QueryError, QUERY_TIMEOUT};

const DEFAULT_QUERY_PORT: u16 = 10011;

pub(super) async fn query(ctx: &QueryContext, query: &StatusQuery) -> Result<Info, QueryError> {
    let query_port = match query.game_port {
        0 => DEFAULT_QUERY_PORT,
        port => port,
    };
    let (ip, voice_port) = resolve_host(ctx.resolver(), query).await?;
    let addr = SocketAddr::new(ip, query_port);

    let (info, clients) = timeout(QUERY_TIMEOUT, query_server(addr, voice_port))
        .await
        .map_err(|_| QueryError::failed("Query timed out"))??;

    let players = clients
        .iter()
        .filter(|entry| entry.get("client_type").map(String::as_str) == Some("0"))
        .filter_map(|entry| entry.get("client_nickname"))
        .filter(|name| !name.is_empty())
        .map(|name| Player { name: name.clone() })
        .collect();

    let field = |name: &str| {
        info.get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let number = |name: &str| {
        info.get(name)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0)
    };

    Ok(Info {
        title: field("virtualserver_name"),
        address: query.address(),
        thumbnail: None,
        game: None,
        map: None,
        mods: None,
        version: field("virtualserver_version"),
        max_players: number("virtualserver_maxclients"),
        num_players: number("virtualserver_clientsonline"),
        players,
    })
}

type Entry = std::collections::HashMap<String, String>;

async fn query_server(
    addr: SocketAddr,
    voice_port: u16,
) -> Result<(Entry, Vec<Entry>), QueryError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|_| QueryError::failed("Failed to connect to server"))?;
    let mut stream = BufReader::new(stream);

    let banner = read_line(&mut stream).await?;
    if !banner.starts_with("TS3") {
        return Err(QueryError::invalid("Server is not a TeamSpeak 3 server"));
    }
    // Welcome message following the banner.
    read_line(&mut stream).await?;

    send_command(&mut stream, &format!("use port={}", voice_port)).await?;
    let info = send_command(&mut stream, "serverinfo")
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| QueryError::failed("Query response was malformed"))?;
    let clients = send_command(&mut stream, "clientlist").await?;
    // Best-effort goodbye; the response no longer matters.
    let _ = stream.get_mut().write_all(b"quit\n").await;

    Ok((info, clients))
}

/// Send one command and read its response: zero or more data lines
/// followed by an `error` line reporting the outcome.
async fn send_command(
    stream: &mut BufReader<TcpStream>,
    command: &str,
) -> Result<Vec<Entry>, QueryError> {
    stream
        .get_mut()
        .write_all(format!("{}\n", command).as_bytes())
        .await
        .map_err(|e| QueryError::failed(format!("Failed to send query: {}", e)))?;

    let mut entries = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            continue;
        }
        if let Some(status) = line.strip_prefix("error ") {
            let error = parse_entry(status);
            if error.get("id").map(String::as_str) != Some("0") {
                return Err(QueryError::failed("Server query returned an error"));
            }
            return Ok(entries);
        }
        for item in line.split('|') {
            entries.push(parse_entry(item));
        }
    }
}

async fn read_line(stream: &mut BufReader<TcpStream>) -> Result<String, QueryError> {
    let mut line = String::new();
    let read = stream
        .read_line(&mut line)
        .await
        .map_err(|e| QueryError::failed(format!("Failed to receive response: {}", e)))?;
    if read == 0 {
        return Err(QueryError::failed("Server closed the connection"));
    }
    Ok(line.trim_matches(['\r', '\n', ' ']).to_string())
}

fn parse_entry(line: &str) -> Entry {
    line.split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), unescape(value)),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Undo ServerQuery escaping in a field value.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('s') => out.push(' '),
            Some('p') => out.push('|'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0C'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0B'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"My\sServer"), "My Server");
        assert_eq!(unescape(r"a\pb"), "a|b");
        assert_eq!(unescape(r"C:\\games\/ts3"), r"C:\games/ts3");
        assert_eq!(unescape(r"line\nbreak"), "line\nbreak");
        assert_eq!(unescape("plain"), "plain");
    }

    #[test]
    fn test_parse_entry() {
        let entry = parse_entry(
            "virtualserver_name=My\\sTeamSpeak virtualserver_maxclients=32 virtualserver_flag",
        );
        assert_eq!(
            entry.get("virtualserver_name").map(String::as_str),
            Some("My TeamSpeak")
        );
        assert_eq!(
            entry.get("virtualserver_maxclients").map(String::as_str),
            Some("32")
        );
        assert_eq!(entry.get("virtualserver_flag").map(String::as_str), Some(""));
    }

    #[test]
    fn test_clientlist_filtering() {
        let line = "clid=1 client_nickname=Alice client_type=0|clid=2 \
                    client_nickname=serveradmin client_type=1|clid=3 \
                    client_nickname=Bob client_type=0";
        let entries: Vec<Entry> = line.split('|').map(parse_entry).collect();
        let names: Vec<&str> = entries
            .iter()
            .filter(|e| e.get("client_type").map(String::as_str) == Some("0"))
            .filter_map(|e| e.get("client_nickname"))
            .map(String::as_str)
            .collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }
}
