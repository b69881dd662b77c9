//! Name -> factory registries for the core's pluggable seams: Connector,
//! Selector strategy, Resolver, HostMapper, Bypass. A flat `match` rather
//! than a runtime-mutable map, since every name is known at compile time and
//! the set is populated once before listeners start and is read-only after.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::relayd::bypass::{Bypass, Mode, NoBypass, StaticBypass};
use crate::relayd::connector::{Connector, HttpConnector, HttpConnectorOptions};
use crate::relayd::resolver::{HostMapper, Resolver, StaticHostMapper, SystemResolver};
use crate::relayd::selector::Strategy;

/// Builds a Connector by its configured name. Only `http` (HTTP-CONNECT) is
/// implemented; the registry exists so a SOCKS5 or relay connector can be
/// added later without touching call sites (chain/config construction).
pub fn connector_by_name(name: &str, opts: HttpConnectorOptions) -> anyhow::Result<Arc<dyn Connector>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "http" => Ok(Arc::new(HttpConnector::new(opts))),
        other => anyhow::bail!("relayd: unknown connector {other:?} (expected http)"),
    }
}

/// Parses a Selector strategy name; unlike the other factories this never
/// fails, matching `selector::Strategy::parse`'s "unknown defaults to
/// round-robin" behaviour used throughout the config layer.
pub fn selector_strategy_by_name(name: &str) -> Strategy {
    Strategy::parse(name)
}

/// Builds a Resolver by name. Only `system` (the OS resolver) is
/// implemented today.
pub fn resolver_by_name(name: &str) -> anyhow::Result<Arc<dyn Resolver>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "system" => Ok(Arc::new(SystemResolver)),
        other => anyhow::bail!("relayd: unknown resolver {other:?} (expected system)"),
    }
}

/// Builds a HostMapper from a static name -> IPs table (the config-file
/// `[hosts]` section).
pub fn static_host_mapper(table: HashMap<String, Vec<IpAddr>>) -> Arc<dyn HostMapper> {
    Arc::new(StaticHostMapper::new(table))
}

/// Builds a Bypass by mode name (`blacklist`/`whitelist`) and pattern list;
/// an empty pattern list and unrecognised mode both fall back to `NoBypass`.
pub fn bypass_by_name(mode: &str, patterns: Vec<String>) -> Arc<dyn Bypass> {
    if patterns.is_empty() {
        return Arc::new(NoBypass);
    }
    let mode = match mode.trim().to_ascii_lowercase().as_str() {
        "whitelist" => Mode::Whitelist,
        _ => Mode::Blacklist,
    };
    Arc::new(StaticBypass::new(mode, patterns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_by_name_rejects_unknown() {
        assert!(connector_by_name("socks5", HttpConnectorOptions::default()).is_err());
        assert!(connector_by_name("http", HttpConnectorOptions::default()).is_ok());
    }

    #[test]
    fn bypass_by_name_empty_patterns_is_nobypass() {
        let bp = bypass_by_name("blacklist", vec![]);
        assert!(!bp.contains("anything"));
    }
}
