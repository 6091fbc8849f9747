//! UDP tracker protocol (BEP 15): fixed-width big-endian binary packets,
//! not bencode — each request/response is hand-packed with `byteorder`
//! since there's no length prefix or self-describing structure to lean a
//! serde format on.

use crate::ids::WirePeerId;
use crate::tracker::http::AnnounceEvent;
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// BEP 15: a connection id is valid for two minutes from when it was
/// received. Past that, `announce`/`scrape` must `connect()` again.
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(120);

/// Magic constant that opens every UDP tracker exchange, per BEP 15.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

fn event_code(event: AnnounceEvent) -> u32 {
    match event {
        AnnounceEvent::None => 0,
        AnnounceEvent::Completed => 1,
        AnnounceEvent::Started => 2,
        AnnounceEvent::Stopped => 3,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    pub transaction_id: u32,
    pub connection_id: u64,
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: WirePeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub key: u32,
    pub num_want: i32,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

fn encode_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
    buf.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    buf.write_u32::<BigEndian>(transaction_id).unwrap();
    buf
}

fn decode_connect_response(buf: &[u8]) -> Result<ConnectResponse> {
    if buf.len() < 16 {
        return Err(anyhow!("connect response too short"));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let transaction_id = cursor.read_u32::<BigEndian>()?;
    if action == ACTION_ERROR {
        return Err(anyhow!("tracker error: {}", error_message(&buf[8..])));
    }
    if action != ACTION_CONNECT {
        return Err(anyhow!("unexpected action {action} in connect response"));
    }
    let connection_id = cursor.read_u64::<BigEndian>()?;
    Ok(ConnectResponse { transaction_id, connection_id })
}

fn encode_announce_request(connection_id: u64, transaction_id: u32, params: &AnnounceParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.write_u64::<BigEndian>(connection_id).unwrap();
    buf.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    buf.write_u32::<BigEndian>(transaction_id).unwrap();
    buf.extend_from_slice(&params.info_hash);
    buf.extend_from_slice(&params.peer_id);
    buf.write_u64::<BigEndian>(params.downloaded).unwrap();
    buf.write_u64::<BigEndian>(params.left).unwrap();
    buf.write_u64::<BigEndian>(params.uploaded).unwrap();
    buf.write_u32::<BigEndian>(event_code(params.event)).unwrap();
    buf.write_u32::<BigEndian>(0).unwrap(); // ip_address: 0 = let the tracker decide
    buf.write_u32::<BigEndian>(params.key).unwrap();
    buf.write_i32::<BigEndian>(params.num_want).unwrap();
    buf.write_u16::<BigEndian>(params.port).unwrap();
    buf
}

fn decode_announce_response(buf: &[u8]) -> Result<AnnounceResponse> {
    if buf.len() < 20 {
        return Err(anyhow!("announce response too short"));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let transaction_id = cursor.read_u32::<BigEndian>()?;
    if action == ACTION_ERROR {
        return Err(anyhow!("tracker error: {}", error_message(&buf[8..])));
    }
    if action != ACTION_ANNOUNCE {
        return Err(anyhow!("unexpected action {action} in announce response"));
    }
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;

    let mut peers = Vec::new();
    let rest = &buf[20..];
    for chunk in rest.chunks(6) {
        if chunk.len() < 6 {
            break;
        }
        let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        peers.push(SocketAddr::new(ip.into(), port));
    }
    Ok(AnnounceResponse { transaction_id, interval, leechers, seeders, peers })
}

fn encode_scrape_request(connection_id: u64, transaction_id: u32, info_hashes: &[[u8; 20]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + info_hashes.len() * 20);
    buf.write_u64::<BigEndian>(connection_id).unwrap();
    buf.write_u32::<BigEndian>(ACTION_SCRAPE).unwrap();
    buf.write_u32::<BigEndian>(transaction_id).unwrap();
    for hash in info_hashes {
        buf.extend_from_slice(hash);
    }
    buf
}

fn decode_scrape_response(buf: &[u8], expected_count: usize) -> Result<(u32, Vec<ScrapeStats>)> {
    if buf.len() < 8 {
        return Err(anyhow!("scrape response too short"));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let transaction_id = cursor.read_u32::<BigEndian>()?;
    if action == ACTION_ERROR {
        return Err(anyhow!("tracker error: {}", error_message(&buf[8..])));
    }
    if action != ACTION_SCRAPE {
        return Err(anyhow!("unexpected action {action} in scrape response"));
    }
    let mut stats = Vec::with_capacity(expected_count);
    let rest = &buf[8..];
    for chunk in rest.chunks(12) {
        if chunk.len() < 12 {
            break;
        }
        let mut c = Cursor::new(chunk);
        let seeders = c.read_u32::<BigEndian>()?;
        let completed = c.read_u32::<BigEndian>()?;
        let leechers = c.read_u32::<BigEndian>()?;
        stats.push(ScrapeStats { seeders, completed, leechers });
    }
    Ok((transaction_id, stats))
}

fn error_message(rest: &[u8]) -> String {
    String::from_utf8_lossy(rest).into_owned()
}

/// One UDP tracker session: a bound socket plus the connection id
/// obtained from the handshake, retried with exponential-feeling backoff
/// per BEP 15's "n = 0 .. 8, 15 * 2^n seconds" guidance (simplified here
/// to a flat retry budget).
#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    connection_id: Option<u64>,
    connection_id_obtained_at: Option<Instant>,
    poll: Poll,
    events: Events,
}

impl UdpTracker {
    pub fn new() -> Result<Self> {
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut socket, Token(0), Interest::READABLE)?;
        Ok(UdpTracker {
            socket,
            connection_id: None,
            connection_id_obtained_at: None,
            poll,
            events: Events::with_capacity(4),
        })
    }

    fn connection_id_is_fresh(&self) -> bool {
        match self.connection_id_obtained_at {
            Some(obtained_at) => obtained_at.elapsed() < CONNECTION_ID_LIFETIME,
            None => false,
        }
    }

    /// Returns a valid connection id, transparently reconnecting if none
    /// is held yet or the held one is older than two minutes.
    fn ensure_connected(&mut self, addr: SocketAddr) -> Result<u64> {
        if self.connection_id.is_none() || !self.connection_id_is_fresh() {
            self.connect(addr)?;
        }
        self.connection_id.ok_or_else(|| anyhow!("connect() did not yield a connection id"))
    }

    fn round_trip(&mut self, addr: SocketAddr, request: &[u8], response_buf: &mut [u8]) -> Result<usize> {
        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt = 0;
        loop {
            self.socket.send_to(request, addr)?;
            self.poll.poll(&mut self.events, Some(Duration::from_secs(15)))?;
            if self.events.is_empty() {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(anyhow!("udp tracker timed out after {MAX_ATTEMPTS} attempts"));
                }
                continue;
            }
            let (len, from) = self.socket.recv_from(response_buf)?;
            if from != addr {
                continue;
            }
            return Ok(len);
        }
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnectResponse> {
        let transaction_id = rand::thread_rng().gen::<u32>();
        let request = encode_connect_request(transaction_id);
        let mut buf = [0u8; 16];
        let len = self.round_trip(addr, &request, &mut buf)?;
        let response = decode_connect_response(&buf[..len])?;
        if response.transaction_id != transaction_id {
            return Err(anyhow!("transaction id mismatch on connect"));
        }
        self.connection_id = Some(response.connection_id);
        self.connection_id_obtained_at = Some(Instant::now());
        Ok(response)
    }

    pub fn announce(&mut self, addr: SocketAddr, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let connection_id = self.ensure_connected(addr)?;
        let transaction_id = rand::thread_rng().gen::<u32>();
        let request = encode_announce_request(connection_id, transaction_id, params);
        let mut buf = [0u8; 2048];
        let len = self.round_trip(addr, &request, &mut buf)?;
        let response = decode_announce_response(&buf[..len])?;
        if response.transaction_id != transaction_id {
            return Err(anyhow!("transaction id mismatch on announce"));
        }
        debug!("udp tracker announce to {addr}: {} peers, interval {}", response.peers.len(), response.interval);
        Ok(response)
    }

    pub fn scrape(&mut self, addr: SocketAddr, info_hashes: &[[u8; 20]]) -> Result<Vec<ScrapeStats>> {
        let connection_id = self.ensure_connected(addr)?;
        let transaction_id = rand::thread_rng().gen::<u32>();
        let request = encode_scrape_request(connection_id, transaction_id, info_hashes);
        let mut buf = vec![0u8; 8 + info_hashes.len() * 12];
        let len = self.round_trip(addr, &request, &mut buf)?;
        let (got_transaction_id, stats) = decode_scrape_response(&buf[..len], info_hashes.len())?;
        if got_transaction_id != transaction_id {
            return Err(anyhow!("transaction id mismatch on scrape"));
        }
        Ok(stats)
    }
}
