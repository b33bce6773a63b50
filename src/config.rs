use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use configparser::ini::Ini;

use crate::health::ProbeMode;

type Props = HashMap<String, Option<String>>;

const FLEET_PREFIX: &str = "fleet:";

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileDefaults {
    pub machine_type: Option<String>,
    pub image: Option<String>,
    pub image_project: Option<String>,
    pub network: Option<String>,
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub project: Option<String>,
    pub zone: Option<String>,
    pub access_token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub metadata_token: bool,
    pub api_base: Option<String>,
    pub defaults: ProfileDefaults,
}

/// A named instance group, read from a `[fleet:<name>]` section.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FleetConfig {
    pub name: String,
    pub prefix: String,
    pub tags: Vec<String>,
    pub image: Option<String>,
    pub machine_type: Option<String>,
    pub startup_script: Option<PathBuf>,
    pub metadata: Vec<(String, String)>,
    pub scopes: Vec<String>,
    pub tile_servers: Vec<String>,
    pub load_balancers: Vec<String>,
    pub firewall: Option<String>,
    pub firewall_ports: Vec<String>,
    pub probe: ProbeMode,
    pub name_padding: usize,
}

#[derive(Debug)]
pub struct FleetFile {
    pub path: PathBuf,
    pub profiles: HashMap<String, Profile>,
    pub fleets: Vec<FleetConfig>,
}

impl FleetFile {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let mut ini = Ini::new();
        ini.set_default_section("DEFAULT");
        let map = ini
            .load(path.to_string_lossy().as_ref())
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let global_props = map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("DEFAULT"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        let mut profiles = HashMap::new();
        let mut fleets = Vec::new();
        for (section, props) in map.iter() {
            if let Some(fleet_name) = strip_prefix_ignore_case(section, FLEET_PREFIX) {
                let fleet = FleetConfig::from_props(fleet_name.trim().to_string(), props, &config_dir)
                    .with_context(|| format!("Invalid fleet section [{}]", section))?;
                fleets.push(fleet);
                continue;
            }

            // Profile sections inherit anything they leave unset from [DEFAULT].
            let mut merged_props = props.clone();
            for (k, v) in &global_props {
                merged_props.entry(k.clone()).or_insert(v.clone());
            }
            let name = section.to_uppercase();
            let profile = Profile::from_props(name.clone(), &merged_props, &config_dir)
                .with_context(|| format!("Invalid profile section [{}]", section))?;
            profiles.insert(name, profile);
        }

        fleets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            path,
            profiles,
            fleets,
        })
    }

    pub fn profile(&self, name: Option<&str>) -> Result<Profile> {
        let key = name.unwrap_or("DEFAULT").to_uppercase();
        self.profiles
            .get(&key)
            .cloned()
            .with_context(|| format!("Profile '{}' not found in {}", key, self.path.display()))
    }

    pub fn fleet(&self, name: &str) -> Result<FleetConfig> {
        self.fleets
            .iter()
            .find(|fleet| fleet.name.eq_ignore_ascii_case(name))
            .cloned()
            .with_context(|| format!("Fleet '{}' not found in {}", name, self.path.display()))
    }
}

impl Profile {
    fn from_props(name: String, props: &Props, config_dir: &Path) -> Result<Self> {
        let defaults = ProfileDefaults {
            machine_type: optional(props, "machine_type"),
            image: optional(props, "image"),
            image_project: optional(props, "image_project"),
            network: optional(props, "network"),
            probe_timeout_ms: optional_u64(props, "probe_timeout_ms")?,
        };
        Ok(Self {
            name,
            project: optional(props, "project"),
            zone: optional(props, "zone"),
            access_token: optional(props, "access_token"),
            token_file: optional(props, "token_file").map(|raw| resolve_path(config_dir, &raw)),
            metadata_token: optional_bool(props, "metadata_token")?.unwrap_or(false),
            api_base: optional(props, "api_base"),
            defaults,
        })
    }
}

impl FleetConfig {
    fn from_props(name: String, props: &Props, config_dir: &Path) -> Result<Self> {
        let prefix = optional(props, "prefix").unwrap_or_else(|| name.clone());
        let tags = optional_list(props, "tags").unwrap_or_else(|| vec![name.clone()]);
        let probe = match optional(props, "probe") {
            Some(raw) => raw.parse::<ProbeMode>()?,
            None => ProbeMode::default(),
        };
        let metadata = match optional(props, "metadata") {
            Some(raw) => parse_metadata(&raw)?,
            None => Vec::new(),
        };
        Ok(Self {
            prefix,
            tags,
            image: optional(props, "image"),
            machine_type: optional(props, "machine_type"),
            startup_script: optional(props, "startup_script")
                .map(|raw| resolve_path(config_dir, &raw)),
            metadata,
            scopes: optional_list(props, "scopes").unwrap_or_default(),
            tile_servers: optional_list(props, "tile_servers").unwrap_or_default(),
            load_balancers: optional_list(props, "load_balancers").unwrap_or_default(),
            firewall: optional(props, "firewall"),
            firewall_ports: optional_list(props, "firewall_ports")
                .unwrap_or_else(|| vec!["80".to_string()]),
            probe,
            name_padding: optional_u64(props, "name_padding")?.unwrap_or(0) as usize,
            name,
        })
    }
}

fn default_config_path() -> PathBuf {
    let local = PathBuf::from("fleet.ini");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("fleet-manager").join("config.ini");
    }
    local
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// `key=value, key=value` in declaration order.
fn parse_metadata(raw: &str) -> Result<Vec<(String, String)>> {
    let mut items = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Invalid metadata entry (expected key=value): {}", entry))?;
        items.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(items)
}

fn optional(props: &Props, key: &str) -> Option<String> {
    find_value(props, key)
        .map(|value| normalize_value(&value))
        .filter(|value| !value.is_empty())
}

fn optional_list(props: &Props, key: &str) -> Option<Vec<String>> {
    optional(props, key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn optional_u64(props: &Props, key: &str) -> Result<Option<u64>> {
    let Some(raw) = optional(props, key) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u64>()
        .with_context(|| format!("Invalid integer for '{}': {}", key, raw))?;
    Ok(Some(parsed))
}

fn optional_bool(props: &Props, key: &str) -> Result<Option<bool>> {
    let Some(raw) = optional(props, key) else {
        return Ok(None);
    };
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow::anyhow!("Invalid boolean for '{}': {}", key, raw)),
    }
}

fn find_value(props: &Props, key: &str) -> Option<String> {
    if let Some(value) = props.get(key) {
        return value.clone();
    }
    props
        .iter()
        .find(|(prop_key, _)| prop_key.eq_ignore_ascii_case(key))
        .and_then(|(_, value)| value.clone())
}

/// Trims and drops trailing ` #` / ` ;` comments.
fn normalize_value(value: &str) -> String {
    let trimmed = value.trim();
    let cut = [" #", " ;", "\t#", "\t;"]
        .iter()
        .filter_map(|marker| trimmed.find(marker))
        .min()
        .unwrap_or(trimmed.len());
    trimmed[..cut].trim().to_string()
}

fn resolve_path(config_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(expand_tilde(value));
    if path.is_relative() {
        config_dir.join(path)
    } else {
        path
    }
}

fn expand_tilde(value: &str) -> String {
    if let Some(stripped) = value
        .strip_prefix("~/")
        .or_else(|| value.strip_prefix("~\\"))
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    value.to_string()
}
