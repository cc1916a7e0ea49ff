//! Region configuration: defaults → optional `veldt.toml` → environment,
//! merged through the `config` crate into typed sections.

use log::warn;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegionSection {
    pub name: String,
    /// Grid coordinates in region units.
    pub grid_x: u32,
    pub grid_y: u32,
    pub udp_port: u16,
    pub http_port: u16,
    pub ip_addr: String,
    pub region_id: Option<uuid::Uuid>,
    pub owner_id: Option<uuid::Uuid>,
    pub welcome_message: String,
    /// Directory holding `simstate-<short>.dat` files.
    pub state_dir: String,
    pub water_height: f32,
}

impl Default for RegionSection {
    fn default() -> Self {
        Self {
            name: "Veldt Test".to_string(),
            grid_x: 1000,
            grid_y: 1000,
            udp_port: 9000,
            http_port: 9001,
            ip_addr: "127.0.0.1".to_string(),
            region_id: None,
            owner_id: None,
            welcome_message: "Welcome to Veldt".to_string(),
            state_dir: ".".to_string(),
            water_height: 20.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GridSection {
    pub grid_server: Option<String>,
    pub asset_server: Option<String>,
    pub inventory_server: Option<String>,
    pub user_server: Option<String>,
    pub presence_server: Option<String>,
    pub grid_user_server: Option<String>,
    pub grid_server_is_xmlrpc: bool,
    pub new_userserver: bool,
    pub use_xinventory: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptSection {
    pub enable_unsafe_funcs: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub region: RegionSection,
    pub grid: GridSection,
    pub script: ScriptSection,
    pub release_notes: Option<String>,
}

impl RegionConfig {
    /// Layered load: built-in defaults, then `veldt.toml` if present, then
    /// `VELDT_*` environment overrides (`VELDT_REGION__NAME` etc).
    pub fn load(config_file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        builder = builder.add_source(
            config::File::with_name(config_file.unwrap_or("veldt")).required(config_file.is_some()),
        );
        builder = builder.add_source(
            config::Environment::with_prefix("VELDT")
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }

    /// True when no grid server is configured and the process should run
    /// its own standalone grid.
    pub fn is_standalone(&self) -> bool {
        self.grid.grid_server.is_none()
    }
}

/// Boolean parsing for values that may come from legacy key files, where
/// some writers emitted bare "0"/"1". Standard semantics apply ("1" is
/// true); the legacy spelling is logged so old configs can be audited.
pub fn parse_bool(value: &str) -> bool {
    match value {
        "true" | "True" | "TRUE" => true,
        "false" | "False" | "FALSE" => false,
        "1" => {
            warn!("legacy boolean spelling \"1\" in config, treating as true");
            true
        }
        "0" => {
            warn!("legacy boolean spelling \"0\" in config, treating as false");
            false
        }
        other => {
            warn!("unrecognized boolean {:?} in config, treating as false", other);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standalone() {
        let cfg = RegionConfig::default();
        assert!(cfg.is_standalone());
        assert_eq!(cfg.region.grid_x, 1000);
    }

    #[test]
    fn bool_spellings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("junk"));
    }
}
