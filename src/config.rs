//! Static configuration shared by every command.
//!
//! Everything here is decided once at startup. In particular the capability
//! flags never change based on telemetry: a unit with a built-in CO2 sensor
//! overrules I2C-to-PWM speed writes with its own regulation, and non-CVE
//! units only understand virtual remote commands, so for both families the
//! speed surface is restricted to the three-level remote.

use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiProtocol {
    /// Poll the WiFi add-on's HTTP API.
    Http,
    /// Subscribe to the add-on's MQTT topics via a broker.
    Mqtt,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "config::Args")]
pub struct Args {
    /// The transport used to track device state.
    #[arg(long, value_enum, default_value_t = ApiProtocol::Http)]
    pub protocol: ApiProtocol,

    /// IPv4 address of the WiFi add-on (HTTP) or of the MQTT broker.
    #[arg(long)]
    pub ip: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    pub port: u16,

    /// Username for the HTTP API or the MQTT broker.
    #[arg(long)]
    pub username: Option<String>,

    /// Password for the HTTP API or the MQTT broker.
    #[arg(long)]
    pub password: Option<String>,

    /// The unit has a built-in CO2 sensor. Disables manual speed control.
    #[arg(long)]
    pub co2_sensor: bool,

    /// The unit is a non-CVE model. Disables manual speed control.
    #[arg(long)]
    pub non_cve: bool,

    /// Time between HTTP polling cycles. Applied regardless of outcome; there
    /// is deliberately no backoff.
    #[arg(long, default_value = "5s")]
    pub poll_interval: humantime::Duration,

    /// Pause before the MQTT client attempts to reconnect.
    #[arg(long, default_value = "10s")]
    pub reconnect_period: humantime::Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a valid IPv4 address")]
    InvalidIp(String),
}

/// Validated configuration. Construct through [`Args::into_config`].
#[derive(Clone, Debug)]
pub struct Config {
    pub protocol: ApiProtocol,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub co2_sensor: bool,
    pub non_cve: bool,
    pub poll_interval: Duration,
    pub reconnect_period: Duration,
}

impl Args {
    pub fn into_config(self) -> Result<Config, Error> {
        let ip = self.ip.parse::<Ipv4Addr>().map_err(|_| Error::InvalidIp(self.ip.clone()))?;
        Ok(Config {
            protocol: self.protocol,
            ip,
            port: self.port,
            username: self.username,
            password: self.password,
            co2_sensor: self.co2_sensor,
            non_cve: self.non_cve,
            poll_interval: *self.poll_interval,
            reconnect_period: *self.reconnect_period,
        })
    }
}

impl Config {
    /// Whether the fan accepts raw 0–254 speed writes. Computed from static
    /// configuration only, never reconsidered based on telemetry.
    pub fn allows_manual_speed_control(&self) -> bool {
        !self.co2_sensor && !self.non_cve
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(ip: &str) -> Args {
        use clap::Parser as _;
        Args::parse_from(["test", "--ip", ip])
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(args("not-an-ip").into_config(), Err(Error::InvalidIp(_))));
        assert!(matches!(args("999.0.0.1").into_config(), Err(Error::InvalidIp(_))));
        assert!(args("192.168.0.10").into_config().is_ok());
    }

    #[test]
    fn manual_speed_control_follows_the_capability_flags() {
        let mut config = args("192.168.0.10").into_config().unwrap();
        assert!(config.allows_manual_speed_control());
        config.co2_sensor = true;
        assert!(!config.allows_manual_speed_control());
        config.co2_sensor = false;
        config.non_cve = true;
        assert!(!config.allows_manual_speed_control());
    }
}
