//! The session configuration surface (§6).

use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// `None` disables keep-alive pings entirely.
    pub ping_interval: Option<Duration>,
    pub connection_timeout: Duration,
    /// `0` disables reconnection: the session goes straight to `Disconnected`.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub reducer_call_timeout: Duration,
    pub auto_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ping_interval: Some(Duration::from_secs(30)),
            connection_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            reducer_call_timeout: Duration::from_secs(30),
            auto_connect: true,
        }
    }
}

impl Config {
    /// `delayForAttempt(k) = min(reconnect_delay * 2^k, max_reconnect_delay)` (§8 property 8).
    pub fn delay_for_attempt(&self, k: u32) -> Duration {
        let scaled = self.reconnect_delay.saturating_mul(1u32.checked_shl(k).unwrap_or(u32::MAX));
        scaled.min(self.max_reconnect_delay)
    }
}
