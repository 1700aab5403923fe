//! Temperature / humidity / light / reliability readings
//!
//! The `Fetcher` polls the device at most once per scan interval and
//! retries a failed read a few times before giving up. When the first
//! attempt fails it asks the `IpResolver` whether the device moved to
//! another address (DHCP) and, if so, switches over and saves the new
//! host before retrying.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DeviceError, Result};
use crate::host::{HostUpdater, IpResolver};
use crate::protocol::{Telemetry, TELEMETRY_MIN_LEN, TELEMETRY_REQUEST};
use crate::transport::{exchange, ReadUntil, Timeouts};

pub const MAX_ATTEMPTS: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(8);
pub const JITTER: Duration = Duration::from_millis(500);

/// Retry behaviour of one fetch cycle
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter: Duration,
    pub timeouts: Timeouts,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
            jitter: JITTER,
            timeouts: Timeouts {
                connect: Duration::from_secs(4),
                read: Duration::from_secs(4),
            },
        }
    }
}

impl FetchPolicy {
    /// Wait after failed attempt number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }
}

/// One successful sensor reading, offsets applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// °C
    pub temperature: f64,
    /// %
    pub humidity: i32,
    /// lx
    pub light: u16,
    /// %
    pub reliability: u8,
    pub fetched_at: DateTime<Utc>,
}

impl SensorReading {
    pub fn from_telemetry(t: &Telemetry, temp_offset: f64, humi_offset: f64) -> Self {
        Self {
            temperature: t.temperature_raw as f64 / 10.0 + temp_offset,
            humidity: (t.humidity_raw as f64 / 10.0 + humi_offset).round() as i32,
            light: t.illuminance,
            reliability: (t.activity as f64 / 255.0 * 100.0).round() as u8,
            fetched_at: Utc::now(),
        }
    }

    pub fn value(&self, kind: SensorKind) -> f64 {
        match kind {
            SensorKind::Temperature => self.temperature,
            SensorKind::Humidity => self.humidity as f64,
            SensorKind::Light => self.light as f64,
            SensorKind::Reliability => self.reliability as f64,
        }
    }
}

/// The four values the device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Light,
    Reliability,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Light,
        SensorKind::Reliability,
    ];

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity | SensorKind::Reliability => "%",
            SensorKind::Light => "lx",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            SensorKind::Temperature => "Temperature",
            SensorKind::Humidity => "Humidity",
            SensorKind::Light => "Light",
            SensorKind::Reliability => "Reliability",
        })
    }
}

struct FetcherState {
    host: String,
    last_attempt: Option<Instant>,
    last_reading: Option<SensorReading>,
}

pub struct Fetcher {
    mac: String,
    port: u16,
    scan_interval: Duration,
    temp_offset: f64,
    humi_offset: f64,
    policy: FetchPolicy,
    resolver: Arc<dyn IpResolver>,
    host_updater: Arc<dyn HostUpdater>,
    state: Mutex<FetcherState>,
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        mac: String,
        port: u16,
        scan_interval: Duration,
        temp_offset: f64,
        humi_offset: f64,
        policy: FetchPolicy,
        resolver: Arc<dyn IpResolver>,
        host_updater: Arc<dyn HostUpdater>,
    ) -> Self {
        Self {
            mac,
            port,
            scan_interval,
            temp_offset,
            humi_offset,
            policy,
            resolver,
            host_updater,
            state: Mutex::new(FetcherState {
                host,
                last_attempt: None,
                last_reading: None,
            }),
        }
    }

    pub fn from_config(
        config: &Config,
        resolver: Arc<dyn IpResolver>,
        host_updater: Arc<dyn HostUpdater>,
    ) -> Self {
        let policy = FetchPolicy {
            max_attempts: config.sensor.max_attempts,
            timeouts: config.timeouts(),
            ..FetchPolicy::default()
        };
        Self::new(
            config.device.host.clone(),
            config.device.mac.clone(),
            config.device.port,
            Duration::from_secs(config.sensor.scan_interval),
            config.sensor.temp_offset,
            config.sensor.humi_offset,
            policy,
            resolver,
            host_updater,
        )
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub async fn host(&self) -> String {
        self.state.lock().await.host.clone()
    }

    pub async fn last_reading(&self) -> Option<SensorReading> {
        self.state.lock().await.last_reading.clone()
    }

    /// Run one fetch cycle
    ///
    /// Inside the scan interval of the previous attempt this returns the
    /// last reading (possibly `None`) without touching the network.
    /// Concurrent callers queue on the state lock and then hit the
    /// throttle.
    pub async fn fetch(&self) -> Result<Option<SensorReading>> {
        let mut state = self.state.lock().await;

        if let Some(last) = state.last_attempt {
            if last.elapsed() < self.scan_interval {
                debug!("Sensor fetch throttled, {:?} since last attempt", last.elapsed());
                return Ok(state.last_reading.clone());
            }
        }
        state.last_attempt = Some(Instant::now());

        let mut resolution_tried = false;
        let mut last_error = None;
        let mut attempt = 0;

        while attempt < self.policy.max_attempts {
            attempt += 1;
            match self.read_sensor(&state.host).await {
                Ok(reading) => {
                    info!(
                        "Sensor {}: {:.1}°C {}% {} lx reliability {}%",
                        state.host,
                        reading.temperature,
                        reading.humidity,
                        reading.light,
                        reading.reliability
                    );
                    state.last_reading = Some(reading.clone());
                    return Ok(Some(reading));
                }
                Err(e) => {
                    warn!(
                        "Sensor fetch attempt {}/{} from {}:{} failed: {}",
                        attempt, self.policy.max_attempts, state.host, self.port, e
                    );
                    last_error = Some(e);

                    if !resolution_tried {
                        resolution_tried = true;
                        if let Some(new_host) = self.resolve_moved_host(&state.host).await {
                            state.host = new_host;
                            continue;
                        }
                    }

                    if attempt < self.policy.max_attempts {
                        let wait = self.policy.backoff_with_jitter(attempt);
                        debug!("Retrying sensor fetch in {:?}", wait);
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        Err(DeviceError::FetchFailed {
            host: state.host.clone(),
            port: self.port,
            attempts: attempt,
            source: Box::new(
                last_error.unwrap_or_else(|| DeviceError::Format("no attempt made".to_string())),
            ),
        })
    }

    async fn read_sensor(&self, host: &str) -> Result<SensorReading> {
        let data = exchange(
            host,
            self.port,
            &TELEMETRY_REQUEST,
            ReadUntil::AtLeast(TELEMETRY_MIN_LEN),
            self.policy.timeouts,
        )
        .await?;
        let telemetry = Telemetry::parse(&data)?;
        Ok(SensorReading::from_telemetry(
            &telemetry,
            self.temp_offset,
            self.humi_offset,
        ))
    }

    /// Look the device up by MAC; returns the new address if it moved
    async fn resolve_moved_host(&self, current: &str) -> Option<String> {
        if self.mac.trim().is_empty() {
            return None;
        }
        let resolved = self.resolver.resolve_ip(&self.mac).await?;
        if resolved == current {
            return None;
        }

        info!("Device {} moved from {} to {}", self.mac, current, resolved);
        if let Err(e) = self.host_updater.update_host(&resolved).await {
            error!("Failed to persist new host {}: {}", resolved, e);
        }
        Some(resolved)
    }
}
