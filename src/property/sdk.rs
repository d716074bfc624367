//! SDK wide properties
//!
//! The web proxy is configured on the build engine, which forwards it to
//! everything running inside it.

use super::{PropertiesAccessor, Prepare, Property, Table, always};
use crate::engine::{BuildEngine, PROXY_TYPES, ProxyType, WwwProxy};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const PROXY: &str = "proxy";
pub const PROXY_SERVERS: &str = "proxy.servers";
pub const PROXY_EXCLUDES: &str = "proxy.excludes";

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*://)?[^\s/:?#]+(:[0-9]{1,5})?([/?#]\S*)?$")
            .expect("valid regex")
    })
}

fn validate_urls(value: &str) -> Result<(), String> {
    match value.split_whitespace().find(|url| !url_pattern().is_match(url)) {
        Some(url) => Err(format!("Not a valid URL: \"{url}\"")),
        None => Ok(()),
    }
}

fn show_proxy(s: &WwwProxy) -> String {
    PROXY_TYPES.show(s.kind).to_string()
}

fn show_servers(s: &WwwProxy) -> String {
    s.servers.clone()
}

fn show_excludes(s: &WwwProxy) -> String {
    s.excludes.clone()
}

fn prepare_proxy(s: &mut WwwProxy, value: &str) -> Result<bool, String> {
    s.kind = PROXY_TYPES
        .parse(value)
        .map_err(|_| format!("Invalid proxy type: \"{value}\""))?;
    Ok(false)
}

fn prepare_servers(s: &mut WwwProxy, value: &str) -> Result<bool, String> {
    validate_urls(value)?;
    s.servers = value.trim().to_string();
    Ok(false)
}

fn prepare_excludes(s: &mut WwwProxy, value: &str) -> Result<bool, String> {
    validate_urls(value)?;
    s.excludes = value.trim().to_string();
    Ok(false)
}

static PROPERTIES: Table<WwwProxy> = Table::new(&[
    Property {
        name: PROXY,
        available: always,
        show: Some(show_proxy),
        prepare: prepare_proxy,
    },
    Property {
        name: PROXY_SERVERS,
        available: always,
        show: Some(show_servers),
        prepare: prepare_servers,
    },
    Property {
        name: PROXY_EXCLUDES,
        available: always,
        show: Some(show_excludes),
        prepare: prepare_excludes,
    },
]);

/// Accessor for the SDK wide properties, stored on `engine`
pub struct SdkProperties<'a> {
    engine: &'a mut BuildEngine,
    staged: WwwProxy,
}

impl<'a> SdkProperties<'a> {
    pub fn new(engine: &'a mut BuildEngine) -> Self {
        let staged = engine.www_proxy().clone();
        Self { engine, staged }
    }
}

impl PropertiesAccessor for SdkProperties<'_> {
    fn get(&self) -> BTreeMap<String, String> {
        PROPERTIES.get(&self.staged)
    }

    fn prepare_set(&mut self, name: &str, value: &str) -> Prepare {
        PROPERTIES.prepare(&mut self.staged, name, value)
    }

    fn can_set(&self) -> Result<(), String> {
        if self.staged.kind != ProxyType::Disabled && self.staged.servers.is_empty() {
            return Err(format!(
                "The value of \"{PROXY_SERVERS}\" must not be empty when \"{PROXY}\" is set to \"{}\"",
                PROXY_TYPES.show(self.staged.kind)
            ));
        }
        Ok(())
    }

    fn set(&mut self) -> bool {
        if &self.staged == self.engine.www_proxy() {
            return true;
        }

        if self.staged.kind == ProxyType::Automatic
            && self.staged.servers.split_whitespace().count() > 1
        {
            log::warn!(
                "Ignoring extra items in the \"{PROXY_SERVERS}\" list with \"{PROXY}\" set to \"{}\"",
                PROXY_TYPES.show(ProxyType::Automatic)
            );
        }

        match self.engine.set_www_proxy(self.staged.clone()) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to configure the proxy of {}: {e}", self.engine.name());
                false
            }
        }
    }
}
