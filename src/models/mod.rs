use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// OHLC candle for one time bucket
///
/// `time` is the bucket open time in unix seconds. The last candle of a
/// streamed series may still be live (`is_closed == false`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Candle aggregation period
///
/// Declaration order is ascending by duration, so `Ord` sorts short to long.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Horizon {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Horizon {
    pub const ALL: [Horizon; 8] = [
        Horizon::M1,
        Horizon::M5,
        Horizon::M15,
        Horizon::M30,
        Horizon::H1,
        Horizon::H4,
        Horizon::D1,
        Horizon::W1,
    ];

    /// Interval code understood by the upstream exchange (`1m`, `4h`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::M1 => "1m",
            Horizon::M5 => "5m",
            Horizon::M15 => "15m",
            Horizon::M30 => "30m",
            Horizon::H1 => "1h",
            Horizon::H4 => "4h",
            Horizon::D1 => "1d",
            Horizon::W1 => "1w",
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            Horizon::M1 => 60,
            Horizon::M5 => 300,
            Horizon::M15 => 900,
            Horizon::M30 => 1_800,
            Horizon::H1 => 3_600,
            Horizon::H4 => 14_400,
            Horizon::D1 => 86_400,
            Horizon::W1 => 604_800,
        }
    }

    /// Confluence weight; strictly increasing with duration
    pub fn default_weight(&self) -> f64 {
        match self {
            Horizon::M1 => 1.0,
            Horizon::M5 => 2.0,
            Horizon::M15 => 3.0,
            Horizon::M30 => 4.0,
            Horizon::H1 => 5.0,
            Horizon::H4 => 6.0,
            Horizon::D1 => 7.0,
            Horizon::W1 => 8.0,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Horizon::ALL
            .iter()
            .copied()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| format!("unknown horizon '{}'", s))
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntryZone {
    pub low: f64,
    pub high: f64,
}

impl EntryZone {
    pub fn midpoint(&self) -> f64 {
        (self.low + self.high) / 2.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub price: f64,
    pub probability: f64,
}

/// Candidate setup produced by the analyzer for one horizon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeframeSetup {
    pub horizon: Horizon,
    pub direction: Direction,
    pub entry_zone: EntryZone,
    pub stop_loss: f64,
    pub targets: Vec<Target>,
    /// In [0, 1]
    pub confidence: f64,
}

/// Cross-horizon agreement for one instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfluenceResult {
    pub instrument: String,
    /// `None` when no direction strictly dominates
    pub direction: Option<Direction>,
    /// In [0, 100]
    pub confluence_score: f64,
    pub agreeing_horizons: BTreeSet<Horizon>,
    pub is_valid: bool,
}

/// Signal lifecycle status
///
/// `TargetHit(k)` carries the index of the furthest target reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Active,
    TargetHit(usize),
    Stopped,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Active => "ACTIVE",
            SignalStatus::TargetHit(_) => "TARGET_HIT",
            SignalStatus::Stopped => "STOPPED",
            SignalStatus::Expired => "EXPIRED",
        }
    }

    /// Rebuild from the flattened (status, target index) columns used by row stores
    pub fn from_parts(status: &str, target_index: Option<usize>) -> Result<Self, String> {
        match (status, target_index) {
            ("ACTIVE", _) => Ok(SignalStatus::Active),
            ("TARGET_HIT", Some(k)) => Ok(SignalStatus::TargetHit(k)),
            ("TARGET_HIT", None) => Err("TARGET_HIT without target index".to_string()),
            ("STOPPED", _) => Ok(SignalStatus::Stopped),
            ("EXPIRED", _) => Ok(SignalStatus::Expired),
            (other, _) => Err(format!("invalid signal status '{}'", other)),
        }
    }

    pub fn target_index(&self) -> Option<usize> {
        match self {
            SignalStatus::TargetHit(k) => Some(*k),
            _ => None,
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::TargetHit(k) => write!(f, "TARGET_HIT({})", k),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Published, trackable trading signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub targets: Vec<Target>,
    pub confluence_score: f64,
    /// Distance from entry to stop as a percentage of entry
    pub risk_pct: f64,
    pub agreeing_horizons: Vec<Horizon>,
    pub basis_horizon: Horizon,
    pub status: SignalStatus,
    pub hit_targets: BTreeSet<usize>,
    pub published_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Signal {
    /// Deterministic id for an (instrument, direction, cycle) triple
    pub fn fingerprint(instrument: &str, direction: Direction, cycle_started_at: i64) -> Uuid {
        let name = format!("{}:{}:{}", instrument, direction, cycle_started_at);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// Still followed by reconciliation (active, or some but not all targets hit)
    pub fn is_tracked(&self) -> bool {
        match self.status {
            SignalStatus::Active => true,
            SignalStatus::TargetHit(k) => k + 1 < self.targets.len(),
            SignalStatus::Stopped | SignalStatus::Expired => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SignalStatus::Active
    }
}

/// Connection lifecycle for one live stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Reconnecting,
    Polling,
    Closed,
}

/// Snapshot of a live stream's connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionState {
    pub instrument: String,
    pub interval: Horizon,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn new(instrument: &str, interval: Horizon) -> Self {
        Self {
            instrument: instrument.to_string(),
            interval,
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
            last_message_at: None,
        }
    }

    /// Fallen back to polling
    pub fn is_degraded(&self) -> bool {
        self.status == ConnectionStatus::Polling
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Order-book depth snapshot, best levels first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepthSnapshot {
    pub instrument: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub received_at: DateTime<Utc>,
}

impl DepthSnapshot {
    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first()?.price;
        let ask = self.asks.first()?.price;
        Some((bid + ask) / 2.0)
    }
}
