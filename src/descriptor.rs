//! Target descriptors and enablement state read from disk.
//!
//! Descriptors come from a directory of libvirt domain XML files; enablement
//! comes either from a JSON object keyed by domain UUID or from a list of
//! `mac=yes` lines. Both stores fail closed: whatever cannot be read is disabled.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use pnet::util::MacAddr;
use roxmltree::Document;

use crate::common::parse_mac;

/// One target as described on disk, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub uuid: String,
    pub macs: Vec<String>,
}

pub trait DescriptorSource: Send + Sync {
    /// Every descriptor that could be read. Unreadable entries are skipped.
    fn descriptors(&self) -> Vec<Descriptor>;
}

/// Directory of libvirt domain XML files (`/etc/libvirt/qemu`).
#[derive(Debug, Clone)]
pub struct LibvirtDir {
    dir: PathBuf,
}

impl LibvirtDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn xml_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "xml") {
                files.push(path);
            }
        }
        // processing order decides MAC collisions, keep it stable
        files.sort();
        Ok(files)
    }
}

impl DescriptorSource for LibvirtDir {
    fn descriptors(&self) -> Vec<Descriptor> {
        let files = match self.xml_files() {
            Ok(files) => files,
            Err(e) => {
                log::warn!("[index] cannot list {}: {}", self.dir.display(), e);
                return Vec::new();
            },
        };

        files.iter()
            .filter_map(|path| match read_domain_file(path) {
                Ok(desc) => Some(desc),
                Err(e) => {
                    log::debug!("[index] skipping {}: {}", path.display(), e);
                    None
                },
            })
            .collect()
    }
}

fn read_domain_file(path: &Path) -> Result<Descriptor, String> {
    let xml = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    parse_domain_xml(&xml)
}

/// Extracts name, UUID and interface MACs from a libvirt `<domain>` document.
pub fn parse_domain_xml(xml: &str) -> Result<Descriptor, String> {
    let doc = Document::parse(xml).map_err(|e| e.to_string())?;
    let root = doc.root_element();
    if root.tag_name().name() != "domain" {
        return Err(format!("unexpected root element <{}>", root.tag_name().name()));
    }

    let child_text = |tag: &str| {
        root.children()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .unwrap_or_default()
    };

    let macs = root.children()
        .filter(|n| n.has_tag_name("devices"))
        .flat_map(|devices| devices.children().filter(|n| n.has_tag_name("interface")))
        .flat_map(|iface| iface.children().filter(|n| n.has_tag_name("mac")))
        .filter_map(|mac| mac.attribute("address"))
        .map(|addr| addr.trim().to_lowercase())
        .filter(|addr| !addr.is_empty())
        .collect();

    Ok(Descriptor { name: child_text("name"), uuid: child_text("uuid"), macs })
}


/// Snapshot of which targets may be woken, taken once per index build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enablement {
    ById(HashMap<String, bool>),
    ByMac(HashSet<MacAddr>),
}

impl Enablement {
    /// Absent entries are disabled.
    pub fn is_enabled(&self, uuid: &str, mac: &MacAddr) -> bool {
        match self {
            Enablement::ById(ids) => ids.get(&uuid.to_lowercase()).copied().unwrap_or(false),
            Enablement::ByMac(macs) => macs.contains(mac),
        }
    }
}

pub trait EnablementStore: Send + Sync {
    fn load(&self) -> Enablement;
}

/// JSON object `{"<uuid>": true, ...}` as written by the settings page.
#[derive(Debug, Clone)]
pub struct UuidStateFile {
    path: PathBuf,
}

impl UuidStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EnablementStore for UuidStateFile {
    fn load(&self) -> Enablement {
        let state = std::fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|text| parse_uuid_state(&text));

        match state {
            Ok(ids) => Enablement::ById(ids),
            Err(e) => {
                log::debug!("[index] enablement {} unusable ({}), all targets disabled", self.path.display(), e);
                Enablement::ById(HashMap::new())
            },
        }
    }
}

pub fn parse_uuid_state(text: &str) -> Result<HashMap<String, bool>, String> {
    if text.trim().is_empty() { return Ok(HashMap::new()); }

    let ids: Option<HashMap<String, bool>> = serde_json::from_str(text).map_err(|e| e.to_string())?;
    Ok(ids.unwrap_or_default()
        .into_iter()
        .map(|(id, enabled)| (id.trim().to_lowercase(), enabled))
        .collect())
}

/// Lines of `aa:bb:cc:dd:ee:ff=yes`, `#` and `;` start comments.
#[derive(Debug, Clone)]
pub struct MacListFile {
    path: PathBuf,
}

impl MacListFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EnablementStore for MacListFile {
    fn load(&self) -> Enablement {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Enablement::ByMac(parse_mac_list(&text)),
            Err(e) => {
                log::debug!("[index] enablement {} unreadable ({}), all targets disabled", self.path.display(), e);
                Enablement::ByMac(HashSet::new())
            },
        }
    }
}

pub fn parse_mac_list(text: &str) -> HashSet<MacAddr> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .filter(|(_, value)| {
            let value = value.trim().trim_matches(|c: char| c == '"' || c == '\'').to_lowercase();
            matches!(value.as_str(), "yes" | "true" | "1" | "on")
        })
        .filter_map(|(mac, _)| parse_mac(mac))
        .collect()
}
