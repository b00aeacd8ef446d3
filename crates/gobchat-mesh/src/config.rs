use crate::link::ble;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeshConfig {
    pub connection: ConnectionConfig,
    pub delivery: DeliveryConfig,
    pub codec: CodecConfig,
    pub registry: RegistryConfig,
    pub scan: ScanConfig,
    pub link: LinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// A connect attempt that has not reached `Connected` by then fails (default: 10s)
    pub connect_timeout: Duration,
    /// First reconnect delay after an unexpected drop (default: 1s)
    pub reconnect_base: Duration,
    /// Multiplier applied per consecutive failure (default: 2)
    pub reconnect_factor: u32,
    /// Upper bound for the reconnect delay (default: 30s)
    pub reconnect_cap: Duration,
    /// Reconnect automatically after unexpected drops (default: true)
    pub auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_factor: 2,
            reconnect_cap: Duration::from_secs(30),
            auto_reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Delay before the reconnect that follows `failures` consecutive failures (1-based)
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        backoff(self.reconnect_base, self.reconnect_factor, failures.saturating_sub(1))
            .min(self.reconnect_cap)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Hop budget given to locally created messages (default: 5)
    pub default_ttl: u8,
    /// Retries after the first failed transmission of a queue entry (default: 3)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 1s)
    pub retry_base: Duration,
    /// Multiplier between retries, giving 1s, 3s, 9s by default
    pub retry_factor: u32,
    /// How long a message id stays in the seen set (default: 10 minutes)
    pub seen_retention: Duration,
    /// Hard cap on seen set entries; oldest go first (default: 10000)
    pub seen_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_factor: 3,
            seen_retention: Duration::from_secs(600),
            seen_capacity: 10_000,
        }
    }
}

impl DeliveryConfig {
    /// Delay before retry number `retry` (1-based)
    pub fn retry_delay(&self, retry: u32) -> Duration {
        backoff(self.retry_base, self.retry_factor, retry.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodecConfig {
    /// Incomplete reassemblies kept per connection (default: 16)
    pub max_pending_reassemblies: usize,
    /// Incomplete message eviction timeout (default: 60s)
    pub reassembly_timeout: Duration,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_pending_reassemblies: 16,
            reassembly_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Peers silent for longer than this are marked stale (default: 120s)
    pub silence_timeout: Duration,
    /// Interval of the background maintenance sweep (default: 5s)
    pub maintenance_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Scans stop on their own after this long (default: 30s)
    pub duration: Duration,
    /// Connect to peers as they are discovered (default: true)
    pub auto_connect: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            auto_connect: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Largest frame written to a BLE peer, ATT header excluded (default: 182)
    pub ble_max_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ble_max_payload: ble::DEFAULT_MAX_PAYLOAD,
        }
    }
}

fn backoff(base: Duration, factor: u32, exponent: u32) -> Duration {
    let multiplier = factor.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(multiplier).unwrap_or(Duration::MAX)
}

fn var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + ToString,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()?)
}

fn secs(name: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(var(name, default.as_secs())?))
}

fn millis(name: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(var(name, default.as_millis() as u64)?))
}

impl MeshConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = MeshConfig::default();

        Ok(MeshConfig {
            connection: ConnectionConfig {
                connect_timeout: secs(
                    "MESH_CONNECT_TIMEOUT_SECS",
                    defaults.connection.connect_timeout,
                )?,
                reconnect_base: millis(
                    "MESH_RECONNECT_BASE_MS",
                    defaults.connection.reconnect_base,
                )?,
                reconnect_factor: var(
                    "MESH_RECONNECT_FACTOR",
                    defaults.connection.reconnect_factor,
                )?,
                reconnect_cap: secs("MESH_RECONNECT_CAP_SECS", defaults.connection.reconnect_cap)?,
                auto_reconnect: var("MESH_AUTO_RECONNECT", defaults.connection.auto_reconnect)?,
            },
            delivery: DeliveryConfig {
                default_ttl: var("MESH_MESSAGE_TTL", defaults.delivery.default_ttl)?,
                max_attempts: var("MESH_SEND_MAX_ATTEMPTS", defaults.delivery.max_attempts)?,
                retry_base: millis("MESH_SEND_RETRY_BASE_MS", defaults.delivery.retry_base)?,
                retry_factor: var("MESH_SEND_RETRY_FACTOR", defaults.delivery.retry_factor)?,
                seen_retention: secs(
                    "MESH_SEEN_MESSAGES_EXPIRATION_SECS",
                    defaults.delivery.seen_retention,
                )?,
                seen_capacity: var(
                    "MESH_SEEN_MESSAGES_CACHE_SIZE",
                    defaults.delivery.seen_capacity,
                )?,
            },
            codec: CodecConfig {
                max_pending_reassemblies: var(
                    "MESH_MAX_PENDING_REASSEMBLIES",
                    defaults.codec.max_pending_reassemblies,
                )?,
                reassembly_timeout: secs(
                    "MESH_REASSEMBLY_TIMEOUT_SECS",
                    defaults.codec.reassembly_timeout,
                )?,
            },
            registry: RegistryConfig {
                silence_timeout: secs(
                    "MESH_PEER_SILENCE_TIMEOUT_SECS",
                    defaults.registry.silence_timeout,
                )?,
                maintenance_interval: secs(
                    "MESH_MAINTENANCE_INTERVAL_SECS",
                    defaults.registry.maintenance_interval,
                )?,
            },
            scan: ScanConfig {
                duration: secs("MESH_SCAN_DURATION_SECS", defaults.scan.duration)?,
                auto_connect: var("MESH_AUTO_CONNECT", defaults.scan.auto_connect)?,
            },
            link: LinkConfig {
                ble_max_payload: var("MESH_BLE_MAX_PAYLOAD", defaults.link.ble_max_payload)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let config = ConnectionConfig::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(16));
        assert_eq!(config.reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_schedule() {
        let config = DeliveryConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(3));
        assert_eq!(config.retry_delay(3), Duration::from_secs(9));
    }

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.connection.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.codec.max_pending_reassemblies, 16);
        assert_eq!(config.codec.reassembly_timeout, Duration::from_secs(60));
        assert_eq!(config.delivery.seen_retention, Duration::from_secs(600));
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.scan.duration, Duration::from_secs(30));
        assert_eq!(config.link.ble_max_payload, 182);
    }
}
