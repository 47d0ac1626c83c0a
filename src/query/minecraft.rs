//! Minecraft query clients.
//!
//! Java edition speaks the Server List Ping protocol: varint-framed
//! packets over TCP carrying a JSON status document. Bedrock edition
//! answers a RakNet unconnected ping with a semicolon-separated string.

use std::net::SocketAddr;

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::db::StatusQuery;

use super::{resolve_host, Info, Player, QueryContext, QueryError, QUERY_TIMEOUT};

const FAVICON_PREFIX: &str = "data:image/png;base64,";

const RAKNET_PING: u8 = 0x01;
const RAKNET_PONG: u8 = 0x1C;
const RAKNET_MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56, 0x78,
];

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Deserialize)]
struct JavaStatus {
    version: JavaVersion,
    #[serde(default)]
    players: Option<JavaPlayers>,
    #[serde(default)]
    favicon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JavaVersion {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct JavaPlayers {
    max: i64,
    online: i64,
    sample: Vec<JavaPlayerSample>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct JavaPlayerSample {
    id: String,
    name: String,
}

pub(super) async fn query_java(ctx: &QueryContext, query: &StatusQuery) -> Result<Info, QueryError> {
    let (ip, port) = resolve_host(ctx.resolver(), query).await?;
    let addr = SocketAddr::new(ip, port);

    let status = timeout(QUERY_TIMEOUT, server_list_ping(addr, &query.host, port))
        .await
        .map_err(|_| QueryError::failed("Query timed out"))??;

    let thumbnail = match status.favicon.as_deref() {
        Some(favicon) if favicon.starts_with(FAVICON_PREFIX) => {
            let encoded: String = favicon[FAVICON_PREFIX.len()..]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            BASE64_STANDARD.decode(encoded).ok()
        }
        _ => None,
    };

    let (max_players, num_players, sample) = match status.players {
        Some(players) => {
            let sample = players
                .sample
                .into_iter()
                .filter(|p| !p.id.is_empty() && p.id != NIL_UUID && !p.name.is_empty())
                .map(|p| Player { name: p.name })
                .collect();
            (players.max, players.online, sample)
        }
        None => (0, 0, Vec::new()),
    };

    Ok(Info {
        title: None,
        address: query.address(),
        thumbnail,
        game: None,
        map: None,
        mods: None,
        // Can be a long string for proxy servers.
        version: Some(status.version.name),
        max_players,
        num_players,
        players: sample,
    })
}

async fn server_list_ping(
    addr: SocketAddr,
    host: &str,
    port: u16,
) -> Result<JavaStatus, QueryError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|_| QueryError::failed("Failed to connect to server"))?;

    // Handshake with next-state 1 (status), then an empty status request.
    let mut handshake = vec![0x00];
    write_varint(&mut handshake, -1); // protocol version: unspecified
    write_varint(&mut handshake, host.len() as i32);
    handshake.extend_from_slice(host.as_bytes());
    handshake.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut handshake, 1);

    write_frame(&mut stream, &handshake).await?;
    write_frame(&mut stream, &[0x00]).await?;

    let frame = read_frame(&mut stream).await?;
    let mut reader = &frame[..];
    let packet_id = read_varint(&mut reader)?;
    if packet_id != 0x00 {
        return Err(QueryError::failed("Query response was malformed"));
    }
    let len = read_varint(&mut reader)?;
    if len < 0 || reader.len() < len as usize {
        return Err(QueryError::failed("Query response was malformed"));
    }

    serde_json::from_slice(&reader[..len as usize])
        .map_err(|_| QueryError::failed("Query response was malformed"))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), QueryError> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut frame, payload.len() as i32);
    frame.extend_from_slice(payload);
    stream
        .write_all(&frame)
        .await
        .map_err(|e| QueryError::failed(format!("Failed to send query: {}", e)))
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, QueryError> {
    let mut len: i32 = 0;
    let mut shift = 0;
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| QueryError::failed(format!("Failed to receive response: {}", e)))?;
        len |= ((byte & 0x7F) as i32) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
        if shift >= 32 {
            return Err(QueryError::failed("Query response was malformed"));
        }
    }
    if !(0..=2_097_151).contains(&len) {
        return Err(QueryError::failed("Query response was malformed"));
    }

    let mut frame = vec![0u8; len as usize];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(|e| QueryError::failed(format!("Failed to receive response: {}", e)))?;
    Ok(frame)
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
}

fn read_varint(buf: &mut &[u8]) -> Result<i32, QueryError> {
    let mut value: i32 = 0;
    let mut shift = 0;
    loop {
        let (&byte, rest) = buf
            .split_first()
            .ok_or_else(|| QueryError::failed("Query response was malformed"))?;
        *buf = rest;
        value |= ((byte & 0x7F) as i32) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        if shift >= 32 {
            return Err(QueryError::failed("Query response was malformed"));
        }
    }
}

pub(super) async fn query_bedrock(
    ctx: &QueryContext,
    query: &StatusQuery,
) -> Result<Info, QueryError> {
    let (ip, port) = resolve_host(ctx.resolver(), query).await?;
    let addr = SocketAddr::new(ip, port);
    let socket = ctx.udp_socket(ip).await?;
    let socket = socket.lock().await;

    let pong = timeout(QUERY_TIMEOUT, async {
        let mut ping = vec![RAKNET_PING];
        ping.extend_from_slice(&chrono::Utc::now().timestamp_millis().to_be_bytes());
        ping.extend_from_slice(&RAKNET_MAGIC);
        ping.extend_from_slice(&rand::random::<u64>().to_be_bytes());
        socket
            .send_to(&ping, addr)
            .await
            .map_err(|e| QueryError::failed(format!("Failed to send query: {}", e)))?;

        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| QueryError::failed(format!("Failed to receive response: {}", e)))?;
            if from == addr {
                return Ok(buf[..len].to_vec());
            }
        }
    })
    .await
    .map_err(|_| QueryError::failed("Query timed out"))??;

    let status = parse_pong(&pong)?;

    Ok(Info {
        title: status.motd,
        address: query.address(),
        thumbnail: None,
        game: status.gamemode,
        map: None,
        mods: None,
        version: status.version,
        max_players: status.max_players,
        num_players: status.num_players,
        players: Vec::new(),
    })
}

#[derive(Debug, Default, PartialEq)]
struct BedrockStatus {
    motd: Option<String>,
    version: Option<String>,
    gamemode: Option<String>,
    max_players: i64,
    num_players: i64,
}

/// Parse an unconnected pong.
///
/// The payload is a semicolon-separated string:
/// `edition;motd;protocol;version;online;max;guid;submotd;gamemode;...`
fn parse_pong(pong: &[u8]) -> Result<BedrockStatus, QueryError> {
    let malformed = || QueryError::failed("Query response was malformed");

    // id + time + guid + magic + string length
    if pong.len() < 35 || pong[0] != RAKNET_PONG {
        return Err(malformed());
    }
    let len = u16::from_be_bytes([pong[33], pong[34]]) as usize;
    let data = pong.get(35..35 + len).ok_or_else(malformed)?;
    let data = String::from_utf8_lossy(data);
    let fields: Vec<&str> = data.split(';').collect();

    let field = |i: usize| {
        fields
            .get(i)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let number = |i: usize| {
        fields
            .get(i)
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0)
    };

    Ok(BedrockStatus {
        motd: field(1),
        version: field(3),
        gamemode: field(8),
        max_players: number(5),
        num_players: number(4),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        for value in [0, 1, 127, 128, 255, 25565, 2_097_151, i32::MAX, -1] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut slice = buf.as_slice();
            assert_eq!(read_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
        // -1 uses the full five bytes.
        let mut buf = Vec::new();
        write_varint(&mut buf, -1);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_read_varint_rejects_overlong() {
        let mut bytes = &[0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01][..];
        assert!(read_varint(&mut bytes).is_err());
    }

    #[test]
    fn test_java_status_sample_filtering() {
        let status: JavaStatus = serde_json::from_value(serde_json::json!({
            "version": {"name": "1.21.1"},
            "players": {
                "max": 20,
                "online": 3,
                "sample": [
                    {"id": "069a79f4-44e9-4726-a5be-fca90e38aaf5", "name": "Notch"},
                    {"id": NIL_UUID, "name": "Anonymous"},
                    {"id": "", "name": "Hidden"},
                ],
            },
        }))
        .unwrap();

        let sample: Vec<_> = status
            .players
            .unwrap()
            .sample
            .into_iter()
            .filter(|p| !p.id.is_empty() && p.id != NIL_UUID && !p.name.is_empty())
            .collect();
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].name, "Notch");
    }

    #[test]
    fn test_java_status_requires_version() {
        let result: Result<JavaStatus, _> =
            serde_json::from_value(serde_json::json!({"players": {"max": 20, "online": 0}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_pong() {
        let data = "MCPE;My Server;712;1.21.50;7;40;12345678901234;Sub MOTD;Survival;1;19132;19133;";
        let mut pong = vec![RAKNET_PONG];
        pong.extend_from_slice(&12345i64.to_be_bytes());
        pong.extend_from_slice(&987654321u64.to_be_bytes());
        pong.extend_from_slice(&RAKNET_MAGIC);
        pong.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pong.extend_from_slice(data.as_bytes());

        let status = parse_pong(&pong).unwrap();
        assert_eq!(status.motd.as_deref(), Some("My Server"));
        assert_eq!(status.version.as_deref(), Some("1.21.50"));
        assert_eq!(status.gamemode.as_deref(), Some("Survival"));
        assert_eq!(status.num_players, 7);
        assert_eq!(status.max_players, 40);
    }

    #[test]
    fn test_parse_pong_rejects_garbage() {
        assert!(parse_pong(&[]).is_err());
        assert!(parse_pong(&[RAKNET_PING, 0, 0]).is_err());
    }
}
