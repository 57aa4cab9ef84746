//! Connectivity probe over SNTP.
//!
//! After a successful join the join worker repeatedly asks a time server
//! for the current time. A valid answer proves the device has a working
//! route to the internet, not only an association with the access point.
//!
//! The request is a plain SNTPv3 client packet over UDP (RFC 4330), which
//! works on both host and ESP32 through `std::net`.

use std::fmt;
use std::net::UdpSocket;
use std::time::Duration;

/// Size of an NTP packet without extensions.
pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x1b;

/// Mode value of a server reply.
const MODE_SERVER: u8 = 4;

/// Offset of the transmit timestamp seconds field.
const TRANSMIT_SECONDS_OFFSET: usize = 40;

/// How long to wait for a reply.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Diagnostics collaborator run after a successful join.
pub trait TimeProbe: Send {
    /// Fetch the current time as Unix seconds.
    fn fetch_time(&mut self) -> Result<u64, ProbeError>;
}

/// SNTP client probe.
pub struct NtpProbe {
    server: String,
    timeout: Duration,
}

impl NtpProbe {
    /// Create a probe for `host:port`.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timeout: RECEIVE_TIMEOUT,
        }
    }

    /// Override the receive timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Server address this probe queries.
    pub fn server(&self) -> &str {
        &self.server
    }
}

impl TimeProbe for NtpProbe {
    fn fetch_time(&mut self) -> Result<u64, ProbeError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.connect(self.server.as_str())?;
        socket.send(&client_request())?;

        let mut reply = [0u8; NTP_PACKET_LEN];
        let len = socket.recv(&mut reply)?;
        parse_server_reply(&reply[..len])
    }
}

/// Build an SNTP client request.
pub fn client_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet
}

/// Extract the server transmit time from an SNTP reply, as Unix seconds.
pub fn parse_server_reply(reply: &[u8]) -> Result<u64, ProbeError> {
    if reply.len() < NTP_PACKET_LEN {
        return Err(ProbeError::Truncated(reply.len()));
    }
    let mode = reply[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(ProbeError::UnexpectedMode(mode));
    }
    // Stratum 0 is a "kiss-o'-death" packet.
    if reply[1] == 0 {
        return Err(ProbeError::KissOfDeath);
    }

    let mut seconds = [0u8; 4];
    seconds.copy_from_slice(&reply[TRANSMIT_SECONDS_OFFSET..TRANSMIT_SECONDS_OFFSET + 4]);
    let ntp_seconds = u64::from(u32::from_be_bytes(seconds));
    ntp_seconds
        .checked_sub(NTP_UNIX_OFFSET)
        .ok_or(ProbeError::InvalidTimestamp(ntp_seconds))
}

/// Errors from the connectivity probe.
#[derive(Debug)]
pub enum ProbeError {
    /// Socket error or timeout.
    Io(std::io::Error),
    /// Reply shorter than an NTP packet.
    Truncated(usize),
    /// Reply was not a server packet.
    UnexpectedMode(u8),
    /// Server refused service.
    KissOfDeath,
    /// Transmit timestamp predates the Unix epoch.
    InvalidTimestamp(u64),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Truncated(len) => write!(f, "truncated reply: {} bytes", len),
            Self::UnexpectedMode(mode) => write!(f, "unexpected NTP mode {}", mode),
            Self::KissOfDeath => write!(f, "server sent kiss-o'-death"),
            Self::InvalidTimestamp(ts) => write!(f, "invalid NTP timestamp {}", ts),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
