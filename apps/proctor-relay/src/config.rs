use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::cli::ServeArgs;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Connections that have not registered within this window are closed.
    pub registration_timeout: Duration,
    pub idle_timeout: Duration,
    pub recycle_interval: Duration,
    /// `None` accepts every test id.
    pub active_tests: Option<Vec<i64>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            registration_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            recycle_interval: Duration::from_secs(30),
            active_tests: None,
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.registration_timeout_secs == 0 {
            bail!("registration timeout must be at least one second");
        }
        if args.recycle_interval_secs == 0 {
            bail!("recycle interval must be at least one second");
        }
        let active_tests = if args.active_tests.is_empty() {
            None
        } else {
            Some(args.active_tests)
        };
        Ok(RelayConfig {
            listen_addr,
            registration_timeout: Duration::from_secs(args.registration_timeout_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            recycle_interval: Duration::from_secs(args.recycle_interval_secs),
            active_tests,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ServeArgs {
        ServeArgs {
            listen_addr: "0.0.0.0:9000".into(),
            registration_timeout_secs: 5,
            idle_timeout_secs: 60,
            recycle_interval_secs: 15,
            active_tests: vec![],
        }
    }

    #[test]
    fn converts_valid_arguments() {
        let config = RelayConfig::try_from(args()).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.registration_timeout, Duration::from_secs(5));
        assert!(config.active_tests.is_none());
    }

    #[test]
    fn rejects_bad_listen_address() {
        let mut bad = args();
        bad.listen_addr = "not-an-address".into();
        let err = RelayConfig::try_from(bad).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test]
    fn keeps_listed_tests() {
        let mut listed = args();
        listed.active_tests = vec![4, 9];
        let config = RelayConfig::try_from(listed).unwrap();
        assert_eq!(config.active_tests, Some(vec![4, 9]));
    }
}
