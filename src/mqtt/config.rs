use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

pub const DEFAULT_SERVER: &str = "tcp://node.local:1883";
pub const DEFAULT_CLIENT_ID: &str = "akai";
pub const DEFAULT_TOPIC: &str = "akai";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttSettings {
    /// Broker url, e.g. `tcp://127.0.0.1:1883` or `ssl://broker:8883`
    pub server: String,
    pub client_id: String,
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    /// Capacity of the request channel between client and event loop
    pub request_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            qos: 2,
            retain: true,
            clean_session: true,
            keep_alive_secs: 30,
            request_capacity: 10,
        }
    }
}

impl MqttSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.qos
            )));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic must not be empty".into()));
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.request_capacity must be at least 1".into(),
            ));
        }
        BrokerAddress::parse(&self.server)?;
        Ok(())
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

/// Broker location resolved from the server url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parses `scheme://host[:port]`.
    ///
    /// `tcp` and `mqtt` select a plain connection, `ssl`, `tls` and `mqtts`
    /// a TLS one. Without a scheme the connection is plain. The port defaults
    /// to 1883 (plain) or 8883 (TLS).
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBroker(format!("{}: {}", url, reason));

        let (scheme, rest) = url.split_once("://").unwrap_or(("tcp", url));
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            _ => return Err(invalid("unsupported scheme")),
        };
        let default_port = if tls { 8883 } else { 1883 };

        let authority = rest.trim_end_matches('/');
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6 literal
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid("unexpected characters after host")),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid("invalid port"))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_is_plain_tcp() {
        let addr = BrokerAddress::parse(DEFAULT_SERVER).unwrap();
        assert_eq!(
            addr,
            BrokerAddress {
                host: "node.local".into(),
                port: 1883,
                tls: false
            }
        );
    }

    #[test]
    fn tls_schemes_use_tls_port_by_default() {
        for url in ["ssl://broker", "tls://broker/", "mqtts://broker"] {
            let addr = BrokerAddress::parse(url).unwrap();
            assert!(addr.tls, "{}", url);
            assert_eq!(addr.port, 8883);
            assert_eq!(addr.host, "broker");
        }
    }

    #[test]
    fn bare_host_and_ipv6() {
        let addr = BrokerAddress::parse("127.0.0.1:1884").unwrap();
        assert_eq!((addr.host.as_str(), addr.port, addr.tls), ("127.0.0.1", 1884, false));

        let addr = BrokerAddress::parse("tcp://[::1]:1885").unwrap();
        assert_eq!((addr.host.as_str(), addr.port), ("::1", 1885));

        let addr = BrokerAddress::parse("ssl://[fe80::1]").unwrap();
        assert_eq!((addr.host.as_str(), addr.port), ("fe80::1", 8883));
    }

    #[test]
    fn rejects_bad_urls() {
        for url in ["ws://broker:80", "tcp://:1883", "tcp://broker:notaport", "tcp://[::1"] {
            assert!(
                matches!(BrokerAddress::parse(url), Err(ConfigError::InvalidBroker(_))),
                "{}",
                url
            );
        }
    }

    #[test]
    fn qos_levels() {
        let mut settings = MqttSettings::default();
        assert_eq!(settings.qos(), QoS::ExactlyOnce);
        settings.qos = 1;
        assert_eq!(settings.qos(), QoS::AtLeastOnce);
        settings.qos = 3;
        assert!(settings.validate().is_err());
    }
}
