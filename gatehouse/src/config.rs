//! TOML configuration.
//!
//! The whole file deserializes into one immutable [`Config`] that is
//! passed by value into the reactor and the collaborators it starts.

use crate::error::ConfigError;
use crate::protocol::SourceKind;
use crate::reactor::poller::BackendKind;

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub reactor: ReactorConfig,

    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorConfig {
    pub backend: BackendKind,

    /// Largest header block accepted before the connection is rejected.
    pub max_header_size: usize,

    /// Bytes read per readiness notification.
    pub read_chunk: usize,

    /// Connections without I/O for this long are closed. `0` disables.
    pub idle_timeout_secs: u64,

    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            max_header_size: 64 * 1024,
            read_chunk: 16 * 1024,
            idle_timeout_secs: 300,
            max_events: 256,
        }
    }
}

impl ReactorConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    pub kind: SourceKind,

    /// Expect a PROXY v1 line before the protocol proper.
    #[serde(default)]
    pub proxy_protocol: bool,

    /// Upstream port used when a decision leaves it at `0`.
    #[serde(default)]
    pub default_port: u16,

    /// Fixed `host:port` a passthrough listener forwards to.
    #[serde(default)]
    pub upstream: Option<String>,
}

impl ListenerConfig {
    pub fn new(address: SocketAddr, kind: SourceKind) -> Self {
        Self {
            address,
            kind,
            proxy_protocol: false,
            default_port: 0,
            upstream: None,
        }
    }

    /// Port assumed for requests that name none.
    pub fn effective_default_port(&self) -> u16 {
        match (self.default_port, self.kind) {
            (0, SourceKind::Tls) => 443,
            (0, _) => 80,
            (port, _) => port,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    #[default]
    Permit,
    Close,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub workers: usize,

    /// Requests each worker may hold before the pool reports saturation.
    pub queue: usize,

    pub default: DefaultAction,

    #[serde(rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue: 64,
            default: DefaultAction::Permit,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Permit,
    Block,
    Redirect,
    Close,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Matches the host itself and every subdomain of it.
    pub suffix: String,
    pub action: RuleAction,

    /// Redirect URL.
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    pub workers: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.listeners.is_empty() {
            errors.push("at least one [[listener]] is required".to_string());
        }

        let mut seen = HashSet::new();
        for listener in &self.listeners {
            if listener.address.port() != 0 && !seen.insert(listener.address) {
                errors.push(format!("duplicate listener address {}", listener.address));
            }

            if let Some(upstream) = &listener.upstream
                && crate::protocol::http::split_authority(upstream, 0).is_err()
            {
                errors.push(format!("listener {}: invalid upstream {upstream}", listener.address));
            }
        }

        if self.reactor.read_chunk == 0 {
            errors.push("reactor.read_chunk must be positive".to_string());
        }
        if self.reactor.max_header_size < 1024 {
            errors.push("reactor.max_header_size must be at least 1024".to_string());
        }
        if self.reactor.max_events == 0 {
            errors.push("reactor.max_events must be positive".to_string());
        }
        if self.policy.workers == 0 || self.policy.queue == 0 {
            errors.push("policy.workers and policy.queue must be positive".to_string());
        }

        for rule in &self.policy.rules {
            if rule.action == RuleAction::Redirect && rule.target.is_empty() {
                errors.push(format!("redirect rule for {} has no target", rule.suffix));
            }
            if rule.suffix.is_empty() {
                errors.push("rule with an empty suffix".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [reactor]
        backend = "poll"
        idle_timeout_secs = 0

        [[listener]]
        address = "127.0.0.1:3128"
        kind = "proxy"

        [[listener]]
        address = "127.0.0.1:8443"
        kind = "tls"
        proxy_protocol = true

        [policy]
        workers = 1
        default = "close"

        [[policy.rule]]
        suffix = "ads.example"
        action = "redirect"
        target = "http://blocked.test/"
    "#;

    #[test]
    fn test_sample_parses() {
        let config: Config = SAMPLE.parse().unwrap();

        assert_eq!(config.reactor.backend, BackendKind::Poll);
        assert_eq!(config.reactor.idle_timeout(), None);
        assert_eq!(config.reactor.read_chunk, 16 * 1024);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[1].kind, SourceKind::Tls);
        assert!(config.listeners[1].proxy_protocol);
        assert_eq!(config.listeners[1].effective_default_port(), 443);
        assert_eq!(config.policy.default, DefaultAction::Close);
        assert_eq!(config.policy.rules[0].action, RuleAction::Redirect);
        assert_eq!(config.resolver.workers, 2);
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config: Config = include_str!("../gatehouse.toml").parse().unwrap();

        assert_eq!(config.listeners.len(), 4);
        assert_eq!(config.policy.rules.len(), 2);
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let text = r#"
            [reactor]
            read_chunk = 0
            max_header_size = 10

            [[policy.rule]]
            suffix = "x.test"
            action = "redirect"
        "#;

        let Err(ConfigError::Validation(errors)) = text.parse::<Config>() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_duplicate_listeners_rejected() {
        let text = r#"
            [[listener]]
            address = "127.0.0.1:3128"
            kind = "proxy"

            [[listener]]
            address = "127.0.0.1:3128"
            kind = "web"
        "#;
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_field_is_a_parse_error() {
        let text = r#"
            [reactor]
            bogus = 1
        "#;
        assert!(matches!(text.parse::<Config>(), Err(ConfigError::Parse(_))));
    }
}
