use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer};

use crate::allowlist::SourceAllowlist;
use crate::error::{Error, Result};

/// Deserializes an absent field as None and an unset field as T::default.
///
/// This avoid having Option<Option<T>> as in serde_with::rust::double_option
pub fn deserialize_absent_or_null<'de, D, T: Default>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.or(Some(T::default())))
}


/// Raw Ethernet (EtherType 0x0842) listener.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Layer2Config {
    /// Falls back to the top-level interface; an empty name disables the listener.
    pub interface: Option<String>,
}

/// UDP listener set.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Layer4Config {
    pub listen_addr: Ipv4Addr,
    pub ports: Vec<u16>,
    /// Bind every socket to the top-level interface (SO_BINDTODEVICE).
    pub bind_interface: bool,
}

impl Default for Layer4Config {
    fn default() -> Self {
        Self {
            listen_addr: Ipv4Addr::UNSPECIFIED,
            ports: vec![7, 9],
            bind_interface: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnablementKind {
    /// JSON object mapping domain UUID to a boolean.
    #[default]
    Uuid,
    /// `aa:bb:cc:dd:ee:ff=yes` lines.
    Mac,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EnablementConfig {
    pub kind: EnablementKind,
    pub path: PathBuf,
}

impl Default for EnablementConfig {
    fn default() -> Self {
        Self {
            kind: EnablementKind::Uuid,
            path: PathBuf::from("/boot/config/plugins/libwake/vms.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub enabled: bool,
    pub interface: String,

    pub layer4: Layer4Config,

    #[serde(deserialize_with = "deserialize_absent_or_null")]
    pub layer2: Option<Layer2Config>,

    pub descriptor_dir: PathBuf,
    pub enablement: EnablementConfig,
    pub allow_subnets: Vec<IpNet>,
    pub debounce_secs: u64,
    pub refresh_secs: u64,
    /// Program used to query and start targets.
    pub controller: String,
    pub queue_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: "br0".into(),
            layer4: Layer4Config::default(),
            layer2: Some(Layer2Config::default()),
            descriptor_dir: PathBuf::from("/etc/libvirt/qemu"),
            enablement: EnablementConfig::default(),
            allow_subnets: Vec::new(),
            debounce_secs: 10,
            refresh_secs: 30,
            controller: "virsh".into(),
            queue_len: 64,
        }
    }
}

impl Config {
    /// Reads and validates the YAML file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("config {} not found, using defaults", path.display());
                return Ok(Self::default());
            },
            Err(source) => return Err(Error::ConfigRead { path: path.to_owned(), source }),
        };

        let cfg = Self::parse(&text).map_err(|e| match e {
            Error::ConfigParse { source, .. } => Error::ConfigParse { path: path.to_owned(), source },
            other => other,
        })?;
        Ok(cfg)
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() { return Ok(Self::default()); }

        let cfg: Self = serde_yml::from_str(text)
            .map_err(|source| Error::ConfigParse { path: PathBuf::new(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.layer4.ports.is_empty() {
            return Err(Error::InvalidConfig("no UDP ports specified".into()));
        }
        if self.layer4.ports.contains(&0) {
            return Err(Error::InvalidConfig("UDP port 0 is not a valid listen port".into()));
        }
        let mut seen = HashSet::new();
        if let Some(port) = self.layer4.ports.iter().find(|port| !seen.insert(**port)) {
            return Err(Error::InvalidConfig(format!("UDP port {port} listed more than once")));
        }
        if self.refresh_secs == 0 {
            return Err(Error::InvalidConfig("refresh_secs must be positive".into()));
        }
        if self.queue_len == 0 {
            return Err(Error::InvalidConfig("queue_len must be positive".into()));
        }
        Ok(())
    }

    pub fn allowlist(&self) -> SourceAllowlist {
        SourceAllowlist::new(self.allow_subnets.iter().copied())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    /// Interface for the raw listener. An empty name turns it off.
    pub fn layer2_interface(&self) -> Option<String> {
        self.layer2.as_ref().map(|l2| l2.interface.clone().unwrap_or_else(|| self.interface.clone()))
    }

    /// Interface the UDP sockets are bound to, if binding is requested.
    pub fn layer4_interface(&self) -> Option<&str> {
        (self.layer4.bind_interface && !self.interface.is_empty()).then_some(self.interface.as_str())
    }
}
