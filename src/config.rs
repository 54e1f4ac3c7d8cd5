//! Configuration module with INI parsing and startup validation
//!
//! The configuration is loaded once at startup into an immutable snapshot
//! that is shared by reference with every connection worker. There is no
//! hot-reload: the data path never re-reads the file, never resolves DNS,
//! and never recompiles a pattern.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use configparser::ini::Ini;
use ipnet::IpNet;
use regex::Regex;
use tracing::{debug, warn};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "gns3_proxy_config.ini";

/// Main proxy configuration snapshot
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the proxy listens on (default: 0.0.0.0)
    pub bind_addr: IpAddr,
    /// TCP port the proxy listens on (default: 14080)
    pub bind_port: u16,
    /// Username used towards every backend server
    pub backend_user: String,
    /// Password used towards every backend server
    pub backend_password: String,
    /// TCP port of the backend servers (default: 3080)
    pub backend_port: u16,
    /// Fallback backend when no mapping matches. Either a name from
    /// `[servers]` or a bare IP literal.
    pub default_server_name: Option<String>,
    /// Listen backlog
    pub backlog: u32,
    /// Receive buffer size for backend sockets
    pub server_recvbuf: usize,
    /// Receive buffer size for client sockets
    pub client_recvbuf: usize,
    /// Soft RLIMIT_NOFILE target (best effort)
    pub open_file_limit: u64,
    /// Tunnel inactivity timeout in seconds
    pub inactivity_timeout_secs: u64,
    /// Ceiling for deny body-regex matching; larger bodies are matched
    /// against the buffered prefix only
    pub deny_body_limit: usize,
    /// Peers from which the trusted username header is honored
    pub auth_whitelist: Vec<IpNet>,
    /// Header carrying a pre-authenticated username from a trusted peer
    pub auth_header_name: String,
    /// Header carrying the original client address from a trusted peer
    pub real_ip_header_name: String,
    /// Accept usernames that are absent from `[users]` without a password
    /// check
    pub allow_any_user: bool,
    /// Backend servers by name, resolved at load time
    pub servers: HashMap<String, ServerEntry>,
    /// Username to plaintext password, as supplied
    pub users: HashMap<String, String>,
    /// Ordered user-to-server mapping rules, first match wins
    pub mappings: Vec<MappingRule>,
    /// Ordered per-user project filters, first match wins
    pub project_filters: Vec<ProjectFilterRule>,
    /// Ordered deny rules; all five patterns must match to fire
    pub deny_rules: Vec<DenyRule>,
}

/// A backend server from `[servers]`, with its address resolved once at
/// configuration load.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    /// Host as written in the configuration file
    pub host: String,
    /// Resolved address used by the data path
    pub addr: IpAddr,
}

/// A `[mapping]` rule: user pattern to server name.
#[derive(Debug, Clone)]
pub struct MappingRule {
    pub id: String,
    pub user: Regex,
    pub server: String,
}

/// A `[project-filter]` rule: user pattern to project-name pattern.
#[derive(Debug, Clone)]
pub struct ProjectFilterRule {
    pub id: String,
    pub user: Regex,
    pub project: Regex,
}

/// A `[deny]` rule. A request is denied when all five patterns match;
/// empty patterns in the file compile to match-anything.
#[derive(Debug, Clone)]
pub struct DenyRule {
    pub id: String,
    pub user: Regex,
    pub method: Regex,
    pub url: Regex,
    pub header: Regex,
    pub body: Regex,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 14080,
            backend_user: "admin".to_string(),
            backend_password: "password".to_string(),
            backend_port: 3080,
            default_server_name: None,
            backlog: 100,
            server_recvbuf: 81920,
            client_recvbuf: 81920,
            open_file_limit: 1024,
            inactivity_timeout_secs: 120,
            deny_body_limit: 1024 * 1024,
            auth_whitelist: Vec::new(),
            auth_header_name: "X-Auth-Username".to_string(),
            real_ip_header_name: "X-Forwarded-For".to_string(),
            allow_any_user: false,
            servers: HashMap::new(),
            users: HashMap::new(),
            mappings: Vec::new(),
            project_filters: Vec::new(),
            deny_rules: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load and validate configuration from an INI file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_ini_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    /// Parse and validate configuration from INI text.
    pub fn from_ini_str(content: &str) -> anyhow::Result<Self> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| anyhow!("Invalid INI syntax: {}", e))?;

        let mut config = ProxyConfig::default();

        if let Some(addr) = get_proxy_key(&ini, &["bind_addr", "hostname"]) {
            config.bind_addr = addr
                .parse()
                .with_context(|| format!("Invalid bind address {:?}", addr))?;
        }
        if let Some(port) = get_proxy_key(&ini, &["bind_port", "port"]) {
            config.bind_port = parse_num(&port, "bind_port")?;
        }
        if let Some(user) = get_proxy_key(&ini, &["backend_user"]) {
            config.backend_user = user;
        }
        if let Some(password) = get_proxy_key(&ini, &["backend_password"]) {
            config.backend_password = password;
        }
        if let Some(port) = get_proxy_key(&ini, &["backend_port"]) {
            config.backend_port = parse_num(&port, "backend_port")?;
        }
        if let Some(name) = get_proxy_key(&ini, &["default_server_name", "default_server"]) {
            config.default_server_name = Some(name);
        }
        if let Some(backlog) = get_proxy_key(&ini, &["backlog"]) {
            config.backlog = parse_num(&backlog, "backlog")?;
        }
        if let Some(size) = get_proxy_key(&ini, &["server_recvbuf", "server-recvbuf-size"]) {
            config.server_recvbuf = parse_num(&size, "server_recvbuf")?;
        }
        if let Some(size) = get_proxy_key(&ini, &["client_recvbuf", "client-recvbuf-size"]) {
            config.client_recvbuf = parse_num(&size, "client_recvbuf")?;
        }
        if let Some(limit) = get_proxy_key(&ini, &["open_file_limit", "open-file-limit"]) {
            config.open_file_limit = parse_num(&limit, "open_file_limit")?;
        }
        if let Some(secs) = get_proxy_key(&ini, &["inactivity_timeout_secs", "inactivity-timeout"])
        {
            config.inactivity_timeout_secs = parse_num(&secs, "inactivity_timeout_secs")?;
        }
        if let Some(limit) = get_proxy_key(&ini, &["deny_body_limit"]) {
            config.deny_body_limit = parse_num(&limit, "deny_body_limit")?;
        }
        if let Some(name) = get_proxy_key(&ini, &["auth_header_name"]) {
            config.auth_header_name = name;
        }
        if let Some(name) = get_proxy_key(&ini, &["real_ip_header_name"]) {
            config.real_ip_header_name = name;
        }
        if let Some(value) = get_proxy_key(&ini, &["allow_any_user"]) {
            config.allow_any_user = matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(list) = get_proxy_key(&ini, &["auth_whitelist"]) {
            config.auth_whitelist = parse_whitelist(&list)?;
        }

        config.servers = parse_servers(&ini, config.backend_port)?;
        config.users = parse_users(&ini);
        config.mappings = parse_mappings(&ini)?;
        config.project_filters = parse_project_filters(&ini)?;
        config.deny_rules = parse_deny_rules(&ini)?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation, called after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        for mapping in &self.mappings {
            if !self.servers.contains_key(&mapping.server) {
                bail!(
                    "Mapping {:?} references server {:?} which is not defined in [servers]",
                    mapping.id,
                    mapping.server
                );
            }
        }

        if let Some(ref name) = self.default_server_name {
            // The original accepts a bare IP literal here as well as a
            // server name.
            if !self.servers.contains_key(name) && name.parse::<IpAddr>().is_err() {
                bail!(
                    "default_server_name {:?} is neither an entry in [servers] nor an IP address",
                    name
                );
            }
        }

        if self.allow_any_user && self.users.is_empty() {
            warn!("allow_any_user is set but [users] is empty; every request will be rejected");
        }

        Ok(())
    }

    /// Full socket address of the listener.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.bind_port)
    }

    /// Resolve the effective default server to an address, if configured.
    pub fn default_server(&self) -> Option<(String, IpAddr)> {
        let name = self.default_server_name.as_ref()?;
        if let Some(entry) = self.servers.get(name) {
            return Some((name.clone(), entry.addr));
        }
        name.parse::<IpAddr>().ok().map(|addr| (name.clone(), addr))
    }
}

/// Look up a `[proxy]` key, accepting the spellings used by older
/// configuration files as aliases.
fn get_proxy_key(ini: &Ini, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| ini.get("proxy", name))
        .filter(|value| !value.is_empty())
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid value {:?} for proxy key {:?}", value, key))
}

/// Parse the comma-separated auth whitelist. Bare IPs become host-length
/// prefixes.
fn parse_whitelist(list: &str) -> anyhow::Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let net = match part.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => match part.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => IpNet::V4(
                    ipnet::Ipv4Net::new(v4, 32).expect("host prefix length is always valid"),
                ),
                Ok(IpAddr::V6(v6)) => IpNet::V6(
                    ipnet::Ipv6Net::new(v6, 128).expect("host prefix length is always valid"),
                ),
                Err(_) => bail!("auth_whitelist entry {:?} is not an IP or CIDR prefix", part),
            },
        };
        nets.push(net);
    }
    Ok(nets)
}

/// Read `[servers]`, resolving each value once. The data path never
/// performs synchronous resolution.
fn parse_servers(ini: &Ini, backend_port: u16) -> anyhow::Result<HashMap<String, ServerEntry>> {
    let mut servers = HashMap::new();
    for (name, value) in section_items(ini, "servers") {
        let addr = resolve_host(&value, backend_port).with_context(|| {
            format!("Server {:?} ({:?}) is not a resolvable host or IP", name, value)
        })?;
        debug!(server = %name, host = %value, %addr, "resolved backend server");
        servers.insert(name, ServerEntry { host: value, addr });
    }
    Ok(servers)
}

fn resolve_host(host: &str, port: u16) -> anyhow::Result<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let mut addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("DNS resolution failed for {:?}", host))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| anyhow!("DNS resolution returned no addresses for {:?}", host))
}

fn parse_users(ini: &Ini) -> HashMap<String, String> {
    section_items(ini, "users").collect()
}

fn parse_mappings(ini: &Ini) -> anyhow::Result<Vec<MappingRule>> {
    let line_format = Regex::new("^\"([^\"]*)\":\"([^\"]*)\"$").expect("static pattern");
    let mut mappings = Vec::new();
    for (id, value) in section_items(ini, "mapping") {
        let caps = line_format.captures(&value).ok_or_else(|| {
            anyhow!(
                "Mapping {:?} is not in format \"<user-regex>\":\"<server>\": {:?}",
                id,
                value
            )
        })?;
        let user = compile_fullmatch(&caps[1])
            .with_context(|| format!("Invalid user pattern in mapping {:?}", id))?;
        mappings.push(MappingRule {
            id,
            user,
            server: caps[2].to_string(),
        });
    }
    Ok(mappings)
}

fn parse_project_filters(ini: &Ini) -> anyhow::Result<Vec<ProjectFilterRule>> {
    let line_format = Regex::new("^\"([^\"]*)\":\"([^\"]*)\"$").expect("static pattern");
    let mut filters = Vec::new();
    for (id, value) in section_items(ini, "project-filter") {
        let caps = line_format.captures(&value).ok_or_else(|| {
            anyhow!(
                "Project filter {:?} is not in format \"<user-regex>\":\"<filter>\": {:?}",
                id,
                value
            )
        })?;
        let user = compile_fullmatch(&caps[1])
            .with_context(|| format!("Invalid user pattern in project filter {:?}", id))?;
        let project = compile_fullmatch(&caps[2])
            .with_context(|| format!("Invalid project pattern in project filter {:?}", id))?;
        filters.push(ProjectFilterRule { id, user, project });
    }
    Ok(filters)
}

fn parse_deny_rules(ini: &Ini) -> anyhow::Result<Vec<DenyRule>> {
    let line_format =
        Regex::new("^\"([^\"]*)\":\"([^\"]*)\":\"([^\"]*)\":\"([^\"]*)\":\"([^\"]*)\"$")
            .expect("static pattern");
    let mut rules = Vec::new();
    for (id, value) in section_items(ini, "deny") {
        let caps = line_format.captures(&value).ok_or_else(|| {
            anyhow!(
                "Deny rule {:?} is not in format \"<user>\":\"<method>\":\"<url>\":\"<header>\":\"<body>\": {:?}",
                id,
                value
            )
        })?;
        let compile = |index: usize, field: &str| {
            compile_fullmatch(&caps[index])
                .with_context(|| format!("Invalid {} pattern in deny rule {:?}", field, id))
        };
        rules.push(DenyRule {
            user: compile(1, "user")?,
            method: compile(2, "method")?,
            url: compile(3, "url")?,
            header: compile(4, "header")?,
            body: compile(5, "body")?,
            id,
        });
    }
    Ok(rules)
}

/// Compile a user-supplied pattern with whole-string semantics. An empty
/// pattern matches anything, including across line breaks.
fn compile_fullmatch(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.is_empty() {
        Regex::new("^(?s:.*)$")
    } else {
        Regex::new(&format!("^(?:{})$", pattern))
    }
}

/// Items of a section in file order, skipping valueless keys.
fn section_items<'a>(ini: &'a Ini, section: &str) -> impl Iterator<Item = (String, String)> + 'a {
    let section = section.to_string();
    ini.get_map_ref()
        .get(&section)
        .into_iter()
        .flat_map(|entries| entries.iter())
        .filter_map(|(key, value)| Some((key.clone(), value.clone()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[proxy]
bind_addr = 127.0.0.1
bind_port = 14080
backend_user = admin
backend_password = password
backend_port = 3080
default_server_name = gns3-1
auth_whitelist = 10.0.0.0/24, 192.0.2.7

[servers]
gns3-1 = 127.0.0.1
gns3-2 = 127.0.0.2

[users]
alice = wonder
bob = builder

[mapping]
m1 = "alice":"gns3-1"
m2 = "bob(.*)":"gns3-2"

[project-filter]
f1 = "alice":"(.*)Group1(.*)"

[deny]
r1 = "alice":"DELETE":"":"":""
"#;

    #[test]
    fn parses_sample_config() {
        let config = ProxyConfig::from_ini_str(SAMPLE).unwrap();
        assert_eq!(config.bind_port, 14080);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.users["alice"], "wonder");
        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.mappings[0].server, "gns3-1");
        assert_eq!(config.project_filters.len(), 1);
        assert_eq!(config.deny_rules.len(), 1);
        assert_eq!(config.auth_whitelist.len(), 2);
        assert_eq!(config.default_server().unwrap().0, "gns3-1");
    }

    #[test]
    fn mapping_order_is_file_order() {
        let content = r#"
[servers]
s1 = 127.0.0.1
s2 = 127.0.0.2

[mapping]
z9 = "(.*)":"s1"
a1 = "alice":"s2"
"#;
        let config = ProxyConfig::from_ini_str(content).unwrap();
        assert_eq!(config.mappings[0].id, "z9");
        assert_eq!(config.mappings[1].id, "a1");
    }

    #[test]
    fn rejects_mapping_to_unknown_server() {
        let content = r#"
[servers]
gns3-1 = 127.0.0.1

[mapping]
m1 = "alice":"missing"
"#;
        let err = ProxyConfig::from_ini_str(content).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn rejects_malformed_deny_line() {
        let content = r#"
[deny]
r1 = "alice":"DELETE"
"#;
        assert!(ProxyConfig::from_ini_str(content).is_err());
    }

    #[test]
    fn rejects_bad_regex() {
        let content = r#"
[servers]
gns3-1 = 127.0.0.1

[mapping]
m1 = "ali(ce":"gns3-1"
"#;
        assert!(ProxyConfig::from_ini_str(content).is_err());
    }

    #[test]
    fn rejects_unresolvable_server() {
        let content = r#"
[servers]
gns3-1 = no.such.host.invalid
"#;
        assert!(ProxyConfig::from_ini_str(content).is_err());
    }

    #[test]
    fn hyphenated_aliases_are_accepted() {
        let content = r#"
[proxy]
hostname = 0.0.0.0
port = 13080
server-recvbuf-size = 4096
open-file-limit = 2048
"#;
        let config = ProxyConfig::from_ini_str(content).unwrap();
        assert_eq!(config.bind_port, 13080);
        assert_eq!(config.server_recvbuf, 4096);
        assert_eq!(config.open_file_limit, 2048);
    }

    #[test]
    fn default_server_may_be_bare_ip() {
        let content = r#"
[proxy]
default_server_name = 192.0.2.10
"#;
        let config = ProxyConfig::from_ini_str(content).unwrap();
        let (name, addr) = config.default_server().unwrap();
        assert_eq!(name, "192.0.2.10");
        assert_eq!(addr, "192.0.2.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn empty_deny_fields_match_anything() {
        let content = r#"
[deny]
r1 = "":"":"":"":""
"#;
        let config = ProxyConfig::from_ini_str(content).unwrap();
        let rule = &config.deny_rules[0];
        assert!(rule.user.is_match("anyone"));
        assert!(rule.header.is_match("Host: x\r\nAccept: */*\r\n"));
    }
}
