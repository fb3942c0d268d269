//! Best-effort network reachability and latency metrics.
//!
//! The probe never fails and never takes long: every check is bounded by a
//! short timeout and every failure path produces an explicit unknown value.
//!
//! # Measurement
//!
//! 1. Resolve the collection endpoint's host.
//! 2. Send `probe_count` ICMP echo requests through an unprivileged datagram
//!    ICMP socket.
//! 3. If ICMP is unavailable or every echo goes unanswered, time TCP
//!    connects to the endpoint's port instead.
//! 4. Latency is the mean of the successful probes; packet loss is the
//!    share of failed probes.
//!
//! Results are cached for `cache_ttl` so consecutive batches reuse them.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpStream;
use tracing::debug;

/// Tri-state reachability of the collection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Online,
    Offline,
    Unknown,
}

/// Kind of the interface carrying the default route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Ethernet,
    WiFi,
    Cellular,
    Other,
    Unknown,
}

/// Network conditions at the time a batch was assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub online: Reachability,

    pub connection_type: ConnectionType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_percent: Option<f64>,

    pub measured_at: DateTime<Utc>,
}

impl NetworkMetrics {
    /// Metrics for when nothing could be determined.
    pub fn unknown() -> Self {
        Self {
            online: Reachability::Unknown,
            connection_type: ConnectionType::Unknown,
            latency_ms: None,
            packet_loss_percent: None,
            measured_at: Utc::now(),
        }
    }

    /// Builds metrics from per-probe round-trip times (`None` = lost).
    pub fn from_samples(samples: &[Option<Duration>], connection_type: ConnectionType) -> Self {
        if samples.is_empty() {
            return Self {
                connection_type,
                ..Self::unknown()
            };
        }

        let successes: Vec<Duration> = samples.iter().flatten().copied().collect();
        let lost = samples.len() - successes.len();
        let packet_loss = round2(lost as f64 * 100.0 / samples.len() as f64);

        let latency_ms = if successes.is_empty() {
            None
        } else {
            let total: f64 = successes.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            Some(round2(total / successes.len() as f64))
        };

        Self {
            online: if successes.is_empty() {
                Reachability::Offline
            } else {
                Reachability::Online
            },
            connection_type,
            latency_ms,
            packet_loss_percent: Some(packet_loss),
            measured_at: Utc::now(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Measures reachability of one host.
pub struct NetworkProbe {
    target: Option<(String, u16)>,
    probe_count: usize,
    probe_timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, NetworkMetrics)>>,
}

impl NetworkProbe {
    /// Creates a probe for the host of `endpoint`.
    ///
    /// An unparseable endpoint yields a probe that always reports unknown.
    pub fn for_endpoint(endpoint: &str) -> Self {
        let target = reqwest::Url::parse(endpoint).ok().and_then(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default()?;
            Some((host, port))
        });
        Self {
            target,
            probe_count: 3,
            probe_timeout: Duration::from_millis(200),
            cache_ttl: Duration::from_secs(60),
            cache: Mutex::new(None),
        }
    }

    /// Sets the number of probes per measurement.
    pub fn with_probe_count(mut self, count: usize) -> Self {
        self.probe_count = count.max(1);
        self
    }

    /// Sets the timeout of a single probe.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets how long a measurement is reused.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Returns current metrics, from cache when fresh.
    pub async fn measure(&self) -> NetworkMetrics {
        if let Some(cached) = self.cached() {
            return cached;
        }

        let metrics = self.measure_uncached().await;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some((Instant::now(), metrics.clone()));
        metrics
    }

    fn cached(&self) -> Option<NetworkMetrics> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, metrics)| metrics.clone())
    }

    async fn measure_uncached(&self) -> NetworkMetrics {
        let connection_type = detect_connection_type();

        let Some((host, port)) = &self.target else {
            return NetworkMetrics {
                connection_type,
                ..NetworkMetrics::unknown()
            };
        };

        let addr = match resolve(host, *port, self.probe_timeout).await {
            Some(addr) => addr,
            None => {
                debug!("Could not resolve {} for network probe", host);
                return NetworkMetrics {
                    connection_type,
                    ..NetworkMetrics::unknown()
                };
            }
        };

        let icmp = self.icmp_samples(addr.ip()).await;
        let samples = match icmp {
            Some(samples) if samples.iter().any(Option::is_some) => samples,
            _ => {
                debug!("ICMP unavailable or blocked for {}, using TCP connect", addr);
                self.tcp_samples(addr).await
            }
        };

        NetworkMetrics::from_samples(&samples, connection_type)
    }

    /// Returns `None` if ICMP sockets cannot be opened on this host.
    async fn icmp_samples(&self, ip: IpAddr) -> Option<Vec<Option<Duration>>> {
        let count = self.probe_count;
        let timeout = self.probe_timeout;
        tokio::task::spawn_blocking(move || {
            let socket = open_icmp_socket(ip, timeout).ok()?;
            Some(
                (0..count)
                    .map(|seq| icmp_echo(&socket, ip, seq as u16, timeout).ok())
                    .collect(),
            )
        })
        .await
        .ok()
        .flatten()
    }

    /// Probes run one after another so they do not compete with each other.
    async fn tcp_samples(&self, addr: SocketAddr) -> Vec<Option<Duration>> {
        let timeout = self.probe_timeout;
        stream::iter(0..self.probe_count)
            .then(|_| async move {
                let start = Instant::now();
                match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => Some(start.elapsed()),
                    _ => None,
                }
            })
            .collect()
            .await
    }
}

async fn resolve(host: &str, port: u16, timeout: Duration) -> Option<SocketAddr> {
    let lookup = tokio::net::lookup_host((host, port));
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(mut addrs)) => addrs.next(),
        _ => None,
    }
}

fn open_icmp_socket(ip: IpAddr, timeout: Duration) -> std::io::Result<Socket> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    socket.connect(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    Ok(socket)
}

/// Sends one echo request and waits for the matching reply.
fn icmp_echo(socket: &Socket, ip: IpAddr, seq: u16, timeout: Duration) -> std::io::Result<Duration> {
    let (request_type, reply_type) = match ip {
        IpAddr::V4(_) => (8u8, 0u8),
        IpAddr::V6(_) => (128u8, 129u8),
    };
    let packet = echo_request(request_type, seq);

    let start = Instant::now();
    socket.send(&packet)?;

    let mut buf = [0u8; 512];
    let mut reader = socket;
    loop {
        let n = reader.read(&mut buf)?;
        if let Some((kind, reply_seq)) = parse_echo_reply(&buf[..n])
            && kind == reply_type
            && reply_seq == seq
        {
            return Ok(start.elapsed());
        }
        if start.elapsed() >= timeout {
            return Err(std::io::ErrorKind::TimedOut.into());
        }
    }
}

/// Builds an 8-byte ICMP echo header plus a short payload.
///
/// The identifier is left zero; datagram ICMP sockets assign their own.
fn echo_request(kind: u8, seq: u16) -> Vec<u8> {
    let mut packet = vec![kind, 0, 0, 0, 0, 0];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(b"testpulse");
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Returns `(type, sequence)` of an ICMP message.
///
/// Some platforms deliver the IPv4 header along with the message; it is
/// skipped when present.
fn parse_echo_reply(data: &[u8]) -> Option<(u8, u16)> {
    let icmp = match data.first() {
        Some(first) if first >> 4 == 4 => {
            let header_len = ((first & 0x0f) as usize) * 4;
            data.get(header_len..)?
        }
        _ => data,
    };
    if icmp.len() < 8 {
        return None;
    }
    Some((icmp[0], u16::from_be_bytes([icmp[6], icmp[7]])))
}

/// Classifies the interface that carries the default route.
///
/// Only implemented for Linux; other platforms report `Unknown`.
pub fn detect_connection_type() -> ConnectionType {
    if !cfg!(target_os = "linux") {
        return ConnectionType::Unknown;
    }
    let Some(iface) = default_route_interface() else {
        return ConnectionType::Unknown;
    };
    let base = Path::new("/sys/class/net").join(&iface);
    let is_wireless = base.join("wireless").exists() || base.join("phy80211").exists();
    let arp_type = std::fs::read_to_string(base.join("type"))
        .ok()
        .and_then(|t| t.trim().parse::<u32>().ok());
    classify_interface(&iface, is_wireless, arp_type)
}

fn default_route_interface() -> Option<String> {
    let routes = std::fs::read_to_string("/proc/net/route").ok()?;
    parse_default_route(&routes)
}

/// Finds the interface whose destination is `00000000` in `/proc/net/route`.
fn parse_default_route(routes: &str) -> Option<String> {
    routes.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        (destination == "00000000").then(|| iface.to_string())
    })
}

fn classify_interface(name: &str, is_wireless: bool, arp_type: Option<u32>) -> ConnectionType {
    const ARPHRD_ETHER: u32 = 1;

    if is_wireless || name.starts_with("wl") {
        ConnectionType::WiFi
    } else if ["wwan", "ppp", "rmnet", "ccmni"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        ConnectionType::Cellular
    } else if arp_type == Some(ARPHRD_ETHER) {
        ConnectionType::Ethernet
    } else {
        ConnectionType::Other
    }
}
