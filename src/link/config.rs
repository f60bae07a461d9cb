//! Link configuration.
//!
//! A [`LinkBlock`] names one peer we are allowed to link with: where to
//! reach it, the password we send, the password we expect back, and the
//! connection policy flags. The linking core only reads these — parsing
//! a richer config format lives with the embedding daemon.
use tracing::warn;

use super::tree::fold_name;

/// Configuration for one permitted peer link.
#[derive(Debug, Clone)]
pub struct LinkBlock {
    /// Server name of the peer (case-insensitive).
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Password we present to this peer.
    pub send_pass: String,
    /// Password (or challenge base) we expect from this peer.
    pub recv_pass: String,
    /// Dial this peer at startup and after it drops.
    pub autoconnect: bool,
    /// Mask the peer's address in status notices.
    pub hidden: bool,
    /// Optional transport hook key (e.g. a TLS wrapper) to apply to the
    /// connection, resolved through the hook registry.
    pub hook: Option<String>,
}

impl LinkBlock {
    /// Address string shown in notices — hidden links mask their host.
    pub fn display_addr(&self) -> String {
        if self.hidden {
            "<hidden>".to_owned()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Case-insensitive lookup by peer server name.
pub fn find_link<'a>(blocks: &'a [LinkBlock], name: &str) -> Option<&'a LinkBlock> {
    let key = fold_name(name);
    blocks.iter().find(|b| fold_name(&b.name) == key)
}

/// Link blocks from the `SPANLINK_LINKS` env var.
///
/// Format: comma-separated entries of
/// `name/host:port/password[/auto][/hidden][/hook=KEY]`, e.g.
/// `hub.example/10.0.0.2:7000/s3cret/auto,edge.example/203.0.113.9:7000/pw/hook=tls`.
/// One password is used for both directions; split send/recv passwords
/// are for programmatic configuration.
pub fn blocks_from_env() -> Vec<LinkBlock> {
    let raw = std::env::var("SPANLINK_LINKS").unwrap_or_default();
    let mut blocks = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match parse_entry(entry) {
            Some(block) => blocks.push(block),
            None => warn!(entry, "ignoring malformed SPANLINK_LINKS entry"),
        }
    }
    blocks
}

fn parse_entry(entry: &str) -> Option<LinkBlock> {
    let mut fields = entry.split('/');
    let name = fields.next()?.to_owned();
    let addr = fields.next()?;
    let (host, port_str) = addr.rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;
    let pass = fields.next()?.to_owned();
    if name.is_empty() || host.is_empty() || pass.is_empty() {
        return None;
    }

    let mut block = LinkBlock {
        name,
        host: host.to_owned(),
        port,
        send_pass: pass.clone(),
        recv_pass: pass,
        autoconnect: false,
        hidden: false,
        hook: None,
    };
    for flag in fields {
        match flag {
            "auto" => block.autoconnect = true,
            "hidden" => block.hidden = true,
            _ => match flag.strip_prefix("hook=") {
                Some(key) if !key.is_empty() => block.hook = Some(key.to_owned()),
                _ => return None,
            },
        }
    }
    Some(block)
}
