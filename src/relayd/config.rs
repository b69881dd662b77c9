//! Configuration: resolves a config file path, loads TOML or YAML into a
//! private `FileConfig` staging tree, and converts it into the public,
//! already-defaulted `Config` the wiring layer consumes.
//!
//! Path resolution follows flag > env > cwd-discovery > XDG default, with a
//! create-if-missing default template. Duration fields are `humantime`
//! strings (`"30s"`, `"500ms"`) with a bare-number-of-seconds fallback.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath { path: p, source: ConfigPathSource::Flag });
    }

    // clap already maps RELAYD_CONFIG into the flag value when unset; keep the
    // precedence visible by treating a bare env hit as its own source.
    if let Some(p) = std::env::var_os("RELAYD_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath { path: p, source: ConfigPathSource::Env });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath { path: p, source: ConfigPathSource::Cwd });
    }

    Ok(ResolvedConfigPath { path: default_config_path()?, source: ConfigPathSource::Default })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("relayd.toml"));
        }
        return Ok(p);
    }

    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["relayd.toml", "relayd.yaml", "relayd.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no relayd.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("dev", "relayd", "relayd").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("relayd.toml"))
}

/// Creates `path` with a commented default template if it doesn't exist
/// yet. Returns `true` if it created the file.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts.open(path).with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes()).with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", path.extension()),
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# relayd default configuration.
# A redirect:// listener receives TCP via netfilter REDIRECT or TPROXY;
# a redu:// listener does the UDP TPROXY equivalent. See the [[services]]
# table below.

admin_addr = "127.0.0.1:9090"

[logging]
level = "info"
format = "text"
output = "stderr"

[reload]
enabled = true
poll_interval = "1s"

# [[services]]
# name = "https-in"
# url = "redirect://0.0.0.0:12345?tproxy=false&sniffing=true"
# chain = "upstream"

# [[chains]]
# name = "upstream"
#
#   [[chains.hops]]
#   name = "hop0"
#
#     [[chains.hops.nodes]]
#     name = "proxy0"
#     addr = "127.0.0.1:3128"
#     connector = "http"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# relayd default configuration.
adminAddr: "127.0.0.1:9090"
logging:
  level: info
  format: text
  output: stderr
reload:
  enabled: true
  pollInterval: 1s
services: []
chains: []
"#;

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

/// Parses a humantime duration string (`"30s"`, `"500ms"`), falling back to
/// treating a bare number as a count of seconds.
pub fn parse_duration_str(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).with_context(|| format!("config: invalid duration {s:?}"))
}

fn parse_duration_opt(s: &Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match s {
        Some(s) if !s.trim().is_empty() => parse_duration_str(s),
        _ => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Public config tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub services: Vec<ServiceConfig>,
    pub chains: Vec<ChainConfig>,
    pub bypasses: HashMap<String, BypassDef>,
    pub hosts: HashMap<String, Vec<IpAddr>>,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub listen_addr: String,
    pub protocol: Protocol,
    pub tproxy: bool,
    pub so_mark: u32,
    pub sniffing: bool,
    pub sniffing_timeout: Duration,
    pub idle_timeout: Duration,
    pub ttl: Duration,
    pub read_buffer_size: usize,
    pub chain: Option<String>,
    pub bypass: Option<String>,
    pub resolver: Option<String>,
    pub host_mapper: Option<String>,
    pub rate_limit: u32,
    pub interface: String,
    pub retries: u32,
    pub dial_timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub hops: Vec<HopConfig>,
}

#[derive(Debug, Clone)]
pub struct HopConfig {
    pub name: String,
    pub selector: SelectorConfig,
    pub bypass: Option<String>,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub strategy: String,
    pub max_fails: u32,
    pub fail_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    pub host: Option<String>,
    pub connector: String,
    pub interface: String,
    pub so_mark: u32,
    pub auth: Option<AuthConfig>,
    pub is_backup: bool,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct BypassDef {
    pub mode: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

/// Splits a `redirect://addr[?k=v&...]` / `redu://addr[?k=v&...]` service
/// URL into its protocol and a flat query map. No `url` crate: the surface
/// is narrow enough for a plain split rather than pulling in a heavier
/// dependency.
pub fn parse_service_url(url: &str) -> anyhow::Result<(Protocol, String, BTreeMap<String, String>)> {
    let (scheme, rest) = url.split_once("://").with_context(|| format!("config: missing scheme in {url:?}"))?;
    let protocol = match scheme {
        "redirect" => Protocol::Tcp,
        "redu" => Protocol::Udp,
        other => anyhow::bail!("config: unknown service scheme {other:?} (expected redirect:// or redu://)"),
    };

    let (addr, query) = match rest.split_once('?') {
        Some((addr, query)) => (addr, query),
        None => (rest, ""),
    };

    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) => {
                params.insert(k.to_string(), v.to_string());
            }
            None => {
                params.insert(pair.to_string(), String::new());
            }
        }
    }

    Ok((protocol, addr.to_string(), params))
}

fn query_bool(params: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match params.get(key).map(|v| v.as_str()) {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

fn query_u32(params: &BTreeMap<String, String>, key: &str, default: u32) -> u32 {
    params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn query_usize(params: &BTreeMap<String, String>, key: &str, default: usize) -> usize {
    params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn query_duration(params: &BTreeMap<String, String>, key: &str, default: Duration) -> anyhow::Result<Duration> {
    match params.get(key) {
        Some(v) if !v.is_empty() => parse_duration_str(v),
        _ => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// FileConfig staging tree
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    services: Vec<FileServiceConfig>,
    chains: Vec<FileChainConfig>,
    bypasses: HashMap<String, FileBypassConfig>,
    hosts: HashMap<String, StringOrVec>,
    admin_addr: String,
    admin_enabled: Option<bool>,
    logging: Option<FileLoggingConfig>,
    reload: Option<FileReloadConfig>,
}

#[derive(Debug, Deserialize)]
struct FileServiceConfig {
    name: String,
    url: String,
    chain: Option<String>,
    bypass: Option<String>,
    resolver: Option<String>,
    host_mapper: Option<String>,
    #[serde(default)]
    rate_limit: u32,
    #[serde(default)]
    interface: String,
    #[serde(default)]
    retries: u32,
    dial_timeout: Option<String>,
    connect_timeout: Option<String>,
    idle_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileChainConfig {
    name: String,
    #[serde(default)]
    hops: Vec<FileHopConfig>,
}

#[derive(Debug, Deserialize)]
struct FileHopConfig {
    #[serde(default)]
    name: String,
    selector: Option<FileSelectorConfig>,
    bypass: Option<String>,
    #[serde(default)]
    nodes: Vec<FileNodeConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct FileSelectorConfig {
    strategy: Option<String>,
    max_fails: Option<u32>,
    fail_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileNodeConfig {
    name: String,
    addr: String,
    host: Option<String>,
    #[serde(default)]
    connector: String,
    #[serde(default)]
    interface: String,
    #[serde(default)]
    so_mark: u32,
    auth: Option<FileAuthConfig>,
    #[serde(default)]
    is_backup: bool,
    connect_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileAuthConfig {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct FileBypassConfig {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileLoggingConfig {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileReloadConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    poll_interval: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut services = Vec::with_capacity(fc.services.len());
        for s in fc.services {
            services.push(ServiceConfig::from_file(s)?);
        }

        let mut chains = Vec::with_capacity(fc.chains.len());
        for c in fc.chains {
            chains.push(ChainConfig::from_file(c)?);
        }

        let bypasses = fc
            .bypasses
            .into_iter()
            .map(|(name, b)| {
                (
                    name,
                    BypassDef {
                        mode: if b.mode.is_empty() { "blacklist".into() } else { b.mode },
                        patterns: b.patterns,
                    },
                )
            })
            .collect();

        let mut hosts = HashMap::new();
        for (name, ips) in fc.hosts {
            let parsed: Vec<IpAddr> = ips
                .into_vec()
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            hosts.insert(name, parsed);
        }

        let admin_addr = if fc.admin_addr.trim().is_empty() {
            "127.0.0.1:9090".to_string()
        } else {
            fc.admin_addr.trim().to_string()
        };

        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or_else(|| "info".into()),
                format: l.format.unwrap_or_else(|| "text".into()),
                output: l.output.unwrap_or_else(|| "stderr".into()),
            },
            None => LoggingConfig { level: "info".into(), format: "text".into(), output: "stderr".into() },
        };

        let reload = match fc.reload {
            Some(r) => ReloadConfig {
                enabled: r.enabled,
                poll_interval: parse_duration_opt(&r.poll_interval, Duration::from_secs(1))?,
            },
            None => ReloadConfig { enabled: true, poll_interval: Duration::from_secs(1) },
        };

        Ok(Config {
            services,
            chains,
            bypasses,
            hosts,
            admin: AdminConfig { enabled: fc.admin_enabled.unwrap_or(true), listen_addr: admin_addr },
            logging,
            reload,
        })
    }
}

impl ServiceConfig {
    fn from_file(s: FileServiceConfig) -> anyhow::Result<ServiceConfig> {
        let (protocol, listen_addr, params) =
            parse_service_url(&s.url).with_context(|| format!("config: service {:?}", s.name))?;

        let default_idle = Duration::from_secs(300);
        Ok(ServiceConfig {
            name: s.name,
            listen_addr,
            protocol,
            tproxy: query_bool(&params, "tproxy", false),
            so_mark: query_u32(&params, "so_mark", 0),
            sniffing: query_bool(&params, "sniffing", protocol == Protocol::Tcp),
            sniffing_timeout: query_duration(&params, "sniffingTimeout", Duration::from_secs(3))?,
            idle_timeout: parse_duration_opt(&s.idle_timeout, default_idle)?,
            ttl: query_duration(&params, "ttl", Duration::from_secs(30))?,
            read_buffer_size: query_usize(&params, "readBufferSize", 4096),
            chain: s.chain,
            bypass: s.bypass,
            resolver: s.resolver,
            host_mapper: s.host_mapper,
            rate_limit: s.rate_limit,
            interface: s.interface,
            retries: s.retries,
            dial_timeout: parse_duration_opt(&s.dial_timeout, Duration::from_secs(10))?,
            connect_timeout: parse_duration_opt(&s.connect_timeout, Duration::from_secs(10))?,
        })
    }
}

impl ChainConfig {
    fn from_file(c: FileChainConfig) -> anyhow::Result<ChainConfig> {
        let mut hops = Vec::with_capacity(c.hops.len());
        for h in c.hops {
            hops.push(HopConfig::from_file(h)?);
        }
        Ok(ChainConfig { name: c.name, hops })
    }
}

impl HopConfig {
    fn from_file(h: FileHopConfig) -> anyhow::Result<HopConfig> {
        let sel = h.selector.unwrap_or_default();
        let mut nodes = Vec::with_capacity(h.nodes.len());
        for n in h.nodes {
            nodes.push(NodeConfig::from_file(n)?);
        }
        Ok(HopConfig {
            name: h.name,
            selector: SelectorConfig {
                strategy: sel.strategy.unwrap_or_else(|| "roundrobin".into()),
                max_fails: sel.max_fails.unwrap_or(1),
                fail_timeout: parse_duration_opt(&sel.fail_timeout, Duration::from_secs(30))?,
            },
            bypass: h.bypass,
            nodes,
        })
    }
}

impl NodeConfig {
    fn from_file(n: FileNodeConfig) -> anyhow::Result<NodeConfig> {
        Ok(NodeConfig {
            name: n.name,
            addr: n.addr,
            host: n.host,
            connector: if n.connector.trim().is_empty() { "http".into() } else { n.connector },
            interface: n.interface,
            so_mark: n.so_mark,
            auth: n.auth.map(|a| AuthConfig { username: a.username, password: a.password }),
            is_backup: n.is_backup,
            connect_timeout: parse_duration_opt(&n.connect_timeout, Duration::from_secs(10))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_str_accepts_humantime_and_bare_seconds() {
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_str("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration_str("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_service_url_splits_scheme_addr_and_query() {
        let (proto, addr, params) = parse_service_url("redirect://0.0.0.0:12345?tproxy=true&so_mark=99").unwrap();
        assert_eq!(proto, Protocol::Tcp);
        assert_eq!(addr, "0.0.0.0:12345");
        assert_eq!(params.get("tproxy").map(String::as_str), Some("true"));
        assert_eq!(params.get("so_mark").map(String::as_str), Some("99"));
    }

    #[test]
    fn parse_service_url_udp_scheme() {
        let (proto, addr, params) = parse_service_url("redu://0.0.0.0:5300?ttl=45s").unwrap();
        assert_eq!(proto, Protocol::Udp);
        assert_eq!(addr, "0.0.0.0:5300");
        assert_eq!(params.get("ttl").map(String::as_str), Some("45s"));
    }

    #[test]
    fn parse_service_url_rejects_unknown_scheme() {
        assert!(parse_service_url("http://0.0.0.0:1").is_err());
    }

    #[test]
    fn from_file_config_fills_selector_defaults() {
        let toml = r#"
[[chains]]
name = "c1"

  [[chains.hops]]
  name = "h0"

    [[chains.hops.nodes]]
    name = "n0"
    addr = "127.0.0.1:3128"
"#;
        let fc: FileConfig = toml::from_str(toml).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        let hop = &cfg.chains[0].hops[0];
        assert_eq!(hop.selector.max_fails, 1);
        assert_eq!(hop.selector.fail_timeout, Duration::from_secs(30));
        assert_eq!(hop.nodes[0].connector, "http");
    }

    #[test]
    fn from_file_config_parses_service_defaults() {
        let toml = r#"
[[services]]
name = "svc"
url = "redirect://0.0.0.0:12345"
"#;
        let fc: FileConfig = toml::from_str(toml).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        let svc = &cfg.services[0];
        assert_eq!(svc.listen_addr, "0.0.0.0:12345");
        assert_eq!(svc.protocol, Protocol::Tcp);
        assert!(svc.sniffing);
        assert_eq!(svc.sniffing_timeout, Duration::from_secs(3));
    }
}
