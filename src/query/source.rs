//! Source engine (A2S) query client.
//!
//! Speaks A2S_INFO, A2S_PLAYER and A2S_RULES over a shared UDP socket,
//! including challenge negotiation and split-packet reassembly. Rules
//! are only requested for games known to publish a mod list there.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::db::{GameMod, StatusQuery};

use super::{resolve_host, Info, Player, QueryContext, QueryError, QUERY_TIMEOUT};

const SINGLE_PACKET: i32 = -1;
const SPLIT_PACKET: i32 = -2;

const INFO_REQUEST: u8 = 0x54;
const INFO_RESPONSE: u8 = 0x49;
const CHALLENGE_RESPONSE: u8 = 0x41;
const PLAYER_REQUEST: u8 = 0x55;
const PLAYER_RESPONSE: u8 = 0x44;
const RULES_REQUEST: u8 = 0x56;
const RULES_RESPONSE: u8 = 0x45;

const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";

// A server that keeps handing out new challenges is either broken or
// deliberately stalling; give up well before the timeout would.
const MAX_CHALLENGES: usize = 5;

pub(super) async fn query(ctx: &QueryContext, query: &StatusQuery) -> Result<Info, QueryError> {
    let (ip, port) = resolve_host(ctx.resolver(), query).await?;
    let addr = SocketAddr::new(ip, port);
    let socket = ctx.udp_socket(ip).await?;
    // Held across the whole exchange so other jobs cannot interleave
    // their datagrams with ours.
    let socket = socket.lock().await;

    timeout(QUERY_TIMEOUT, query_server(&socket, addr, query))
        .await
        .map_err(|_| QueryError::failed("Query timed out"))?
}

async fn query_server(
    socket: &UdpSocket,
    addr: SocketAddr,
    query: &StatusQuery,
) -> Result<Info, QueryError> {
    let payload = request(socket, addr, INFO_REQUEST, INFO_PAYLOAD).await?;
    let server = parse_info(&payload).map_err(|_| malformed())?;

    let payload = request(socket, addr, PLAYER_REQUEST, &[]).await?;
    let players = parse_players(&payload).map_err(|_| malformed())?;

    let mods = maybe_query_rules(socket, addr, &server).await?;

    Ok(Info {
        title: Some(server.name),
        address: query.address(),
        thumbnail: None,
        game: Some(server.game),
        map: Some(server.map),
        mods,
        version: Some(server.version),
        max_players: server.max_players as i64,
        num_players: server.players as i64,
        players,
    })
}

fn malformed() -> QueryError {
    QueryError::failed("Query response was malformed")
}

/// Send an A2S request and return the response payload, negotiating
/// challenges as needed. The returned payload starts at the response
/// type byte.
async fn request(
    socket: &UdpSocket,
    addr: SocketAddr,
    kind: u8,
    body: &[u8],
) -> Result<Vec<u8>, QueryError> {
    // A2S_INFO appends the challenge; the others replace a placeholder.
    let mut challenge: Option<[u8; 4]> = match kind {
        INFO_REQUEST => None,
        _ => Some([0xFF; 4]),
    };

    for _ in 0..MAX_CHALLENGES {
        let mut packet = Vec::with_capacity(9 + body.len());
        packet.extend_from_slice(&SINGLE_PACKET.to_le_bytes());
        packet.push(kind);
        packet.extend_from_slice(body);
        if let Some(challenge) = challenge {
            packet.extend_from_slice(&challenge);
        }

        socket
            .send_to(&packet, addr)
            .await
            .map_err(|e| QueryError::failed(format!("Failed to send query: {}", e)))?;

        let payload = receive(socket, addr).await?;
        match payload.first() {
            Some(&CHALLENGE_RESPONSE) => {
                let bytes = payload.get(1..5).ok_or_else(malformed)?;
                let mut next = [0u8; 4];
                next.copy_from_slice(bytes);
                challenge = Some(next);
            }
            Some(_) => return Ok(payload),
            None => return Err(malformed()),
        }
    }

    Err(QueryError::invalid("Server responded with too many challenges"))
}

/// Receive one logical response, reassembling split packets. Datagrams
/// from other peers are discarded.
async fn receive(socket: &UdpSocket, addr: SocketAddr) -> Result<Vec<u8>, QueryError> {
    let mut buf = vec![0u8; 65536];
    let mut parts: Vec<Option<Vec<u8>>> = Vec::new();
    let mut received = 0usize;

    loop {
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| QueryError::failed(format!("Failed to receive response: {}", e)))?;
        if from != addr {
            continue;
        }

        let mut reader = Reader::new(&buf[..len]);
        match reader.i32_le().map_err(|_| malformed())? {
            SINGLE_PACKET => return Ok(reader.rest().to_vec()),
            SPLIT_PACKET => {
                let id = reader.i32_le().map_err(|_| malformed())?;
                if id as u32 & 0x8000_0000 != 0 {
                    return Err(QueryError::failed("Compressed response is not supported"));
                }
                let total = reader.u8().map_err(|_| malformed())? as usize;
                let number = reader.u8().map_err(|_| malformed())? as usize;
                // Split size; unused but part of the header.
                reader.u16_le().map_err(|_| malformed())?;

                if total == 0 || number >= total {
                    return Err(malformed());
                }
                parts.resize(total.max(parts.len()), None);
                if parts[number].is_none() {
                    parts[number] = Some(reader.rest().to_vec());
                    received += 1;
                }
                if received == total {
                    let mut assembled = Vec::new();
                    for part in parts.into_iter().flatten() {
                        assembled.extend_from_slice(&part);
                    }
                    // The reassembled payload repeats the single-packet
                    // header.
                    let mut reader = Reader::new(&assembled);
                    if reader.i32_le().map_err(|_| malformed())? != SINGLE_PACKET {
                        return Err(malformed());
                    }
                    return Ok(reader.rest().to_vec());
                }
            }
            _ => return Err(malformed()),
        }
    }
}

#[derive(Debug)]
struct ServerInfo {
    name: String,
    map: String,
    folder: String,
    game: String,
    players: u8,
    max_players: u8,
    version: String,
}

fn parse_info(payload: &[u8]) -> Result<ServerInfo, Truncated> {
    let mut reader = Reader::new(payload);
    if reader.u8()? != INFO_RESPONSE {
        return Err(Truncated);
    }
    let _protocol = reader.u8()?;
    let name = reader.cstring()?;
    let map = reader.cstring()?;
    let folder = reader.cstring()?;
    let game = reader.cstring()?;
    let _id = reader.u16_le()?;
    let players = reader.u8()?;
    let max_players = reader.u8()?;
    let _bots = reader.u8()?;
    let _server_type = reader.u8()?;
    let _environment = reader.u8()?;
    let _visibility = reader.u8()?;
    let _vac = reader.u8()?;
    let version = reader.cstring()?;

    Ok(ServerInfo {
        name,
        map,
        folder,
        game,
        players,
        max_players,
        version,
    })
}

fn parse_players(payload: &[u8]) -> Result<Vec<Player>, Truncated> {
    let mut reader = Reader::new(payload);
    if reader.u8()? != PLAYER_RESPONSE {
        return Err(Truncated);
    }
    let count = reader.u8()?;
    let mut players = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _index = reader.u8()?;
        let name = reader.cstring()?;
        let _score = reader.i32_le()?;
        let _duration = reader.f32_le()?;
        players.push(Player { name });
    }
    Ok(players)
}

/// Fetch and decode the mod list for games that publish one via rules.
async fn maybe_query_rules(
    socket: &UdpSocket,
    addr: SocketAddr,
    server: &ServerInfo,
) -> Result<Option<Vec<GameMod>>, QueryError> {
    let folder = server.folder.to_lowercase();
    if folder != "arma3" && folder != "dayz" {
        return Ok(None);
    }

    let payload = request(socket, addr, RULES_REQUEST, &[]).await?;
    let rules = parse_rules(&payload).map_err(|_| rules_malformed())?;
    let mods = parse_arma_mods(&rules).map_err(|_| rules_malformed())?;
    Ok(Some(mods))
}

fn rules_malformed() -> QueryError {
    QueryError::failed("Rules response was malformed")
}

fn parse_rules(payload: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Truncated> {
    let mut reader = Reader::new(payload);
    if reader.u8()? != RULES_RESPONSE {
        return Err(Truncated);
    }
    let count = reader.u16_le()?;
    let mut rules = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = reader.cbytes()?;
        let value = reader.cbytes()?;
        rules.push((key, value));
    }
    Ok(rules)
}

/// Decode Arma's binary mod list from the rules key/value pairs.
///
/// Arma chunks the binary blob across rules whose keys are two raw
/// bytes, ordered by key; NUL, 0xFF and 0x01 inside a chunk are escaped
/// behind 0x01.
fn parse_arma_mods(rules: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<GameMod>, Truncated> {
    let mut chunks: Vec<(&[u8], &[u8])> = rules
        .iter()
        .filter(|(key, _)| key.len() == 2)
        .map(|(key, value)| (key.as_slice(), value.as_slice()))
        .collect();
    chunks.sort_by_key(|(key, _)| *key);

    let mut blob = Vec::new();
    for (_, value) in chunks {
        let mut bytes = value.iter();
        while let Some(&b) = bytes.next() {
            if b != 0x01 {
                blob.push(b);
                continue;
            }
            match bytes.next() {
                Some(0x01) => blob.push(0x01),
                Some(0x02) => blob.push(0x00),
                Some(0x03) => blob.push(0xFF),
                _ => return Err(Truncated),
            }
        }
    }

    let mut reader = Reader::new(&blob);
    let _version = reader.u8()?;
    let _overflow = reader.u8()?;
    let dlc_bits = u16::from_le_bytes([reader.u8()?, reader.u8()?]);
    for _ in 0..dlc_bits.count_ones() {
        let _dlc_hash = reader.u32_le()?;
    }

    let count = reader.u8()?;
    let mut mods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _hash = reader.u32_le()?;
        let flag = reader.u8()?;
        let id_len = (flag & 0x0F) as usize;
        let dlc = flag & 0xF0 != 0;

        let mut steam_id: u64 = 0;
        for (i, b) in reader.take(id_len)?.iter().enumerate() {
            steam_id |= (*b as u64) << (8 * i);
        }

        let len = reader.u8()? as usize;
        let name = String::from_utf8_lossy(reader.take(len)?).into_owned();

        let (name, url) = if dlc {
            let name = if name.is_empty() {
                format!("Creator DLC ({})", steam_id)
            } else {
                name
            };
            let url = (steam_id != 0)
                .then(|| format!("https://store.steampowered.com/app/{}", steam_id));
            (name, url)
        } else {
            let url = (steam_id != 0).then(|| {
                format!(
                    "https://steamcommunity.com/sharedfiles/filedetails/?id={}",
                    steam_id
                )
            });
            (name, url)
        };
        mods.push(GameMod { name, url });
    }

    Ok(mods)
}

/// Error for a response shorter than its format requires.
#[derive(Debug)]
struct Truncated;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        let end = self.pos.checked_add(n).ok_or(Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }

    fn u8(&mut self) -> Result<u8, Truncated> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, Truncated> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i32_le(&mut self) -> Result<i32, Truncated> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u32_le(&mut self) -> Result<u32, Truncated> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f32_le(&mut self) -> Result<f32, Truncated> {
        Ok(f32::from_bits(self.u32_le()?))
    }

    fn cstring(&mut self) -> Result<String, Truncated> {
        Ok(String::from_utf8_lossy(&self.cbytes()?).into_owned())
    }

    fn cbytes(&mut self) -> Result<Vec<u8>, Truncated> {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|&b| b == 0).ok_or(Truncated)?;
        let bytes = rest[..end].to_vec();
        self.pos += end + 1;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_payload() -> Vec<u8> {
        let mut payload = vec![INFO_RESPONSE, 17];
        payload.extend_from_slice(b"Altis Life\0");
        payload.extend_from_slice(b"Altis\0");
        payload.extend_from_slice(b"Arma3\0");
        payload.extend_from_slice(b"Arma 3\0");
        payload.extend_from_slice(&((107410u32 & 0xFFFF) as u16).to_le_bytes());
        payload.push(12); // players
        payload.push(64); // max players
        payload.push(0); // bots
        payload.extend_from_slice(b"d"); // server type
        payload.extend_from_slice(b"l"); // environment
        payload.push(0); // visibility
        payload.push(1); // vac
        payload.extend_from_slice(b"2.18\0");
        payload
    }

    #[test]
    fn test_parse_info() {
        let info = parse_info(&info_payload()).unwrap();
        assert_eq!(info.name, "Altis Life");
        assert_eq!(info.map, "Altis");
        assert_eq!(info.folder, "Arma3");
        assert_eq!(info.game, "Arma 3");
        assert_eq!(info.players, 12);
        assert_eq!(info.max_players, 64);
        assert_eq!(info.version, "2.18");
    }

    #[test]
    fn test_parse_info_truncated() {
        let payload = info_payload();
        assert!(parse_info(&payload[..8]).is_err());
        assert!(parse_info(&[]).is_err());
    }

    #[test]
    fn test_parse_players() {
        let mut payload = vec![PLAYER_RESPONSE, 2];
        for name in ["Alice", "Bob"] {
            payload.push(0);
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&5i32.to_le_bytes());
            payload.extend_from_slice(&120.5f32.to_le_bytes());
        }
        let players = parse_players(&payload).unwrap();
        assert_eq!(players, vec![Player::named("Alice"), Player::named("Bob")]);
    }

    #[test]
    fn test_parse_arma_mods() {
        // One workshop mod plus one DLC, with an escaped NUL inside the
        // steam ID.
        let mut blob = vec![
            3, // protocol version
            0, // overflow flags
            0, 0, // no DLC bits
            2, // mod count
        ];
        // Workshop mod: id 0x0001_E240 (123456), 3-byte id.
        blob.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        blob.push(0x03);
        blob.extend_from_slice(&[0x40, 0xE2, 0x01]);
        blob.push(3);
        blob.extend_from_slice(b"ACE");
        // DLC with steam id 0: no URL, fallback name.
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.push(0x10);
        blob.push(0);

        // Each chunk is escaped independently; split the blob first.
        fn escape(bytes: &[u8]) -> Vec<u8> {
            let mut escaped = Vec::new();
            for b in bytes {
                match b {
                    0x00 => escaped.extend_from_slice(&[0x01, 0x02]),
                    0x01 => escaped.extend_from_slice(&[0x01, 0x01]),
                    0xFF => escaped.extend_from_slice(&[0x01, 0x03]),
                    b => escaped.push(*b),
                }
            }
            escaped
        }
        let mid = blob.len() / 2;
        let rules = vec![
            (vec![0x02, 0x01], escape(&blob[mid..])),
            (vec![0x01, 0x01], escape(&blob[..mid])),
            (b"allowedBuild".to_vec(), b"1".to_vec()),
        ];

        let mods = parse_arma_mods(&rules).unwrap();
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].name, "ACE");
        assert_eq!(
            mods[0].url.as_deref(),
            Some("https://steamcommunity.com/sharedfiles/filedetails/?id=123456")
        );
        assert_eq!(mods[1].name, "Creator DLC (0)");
        assert_eq!(mods[1].url, None);
    }

    #[test]
    fn test_parse_rules_pairs() {
        let mut payload = vec![RULES_RESPONSE];
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(b"key1\0value1\0");
        payload.extend_from_slice(b"key2\0value2\0");
        let rules = parse_rules(&payload).unwrap();
        assert_eq!(rules[0], (b"key1".to_vec(), b"value1".to_vec()));
        assert_eq!(rules[1], (b"key2".to_vec(), b"value2".to_vec()));
    }
}
