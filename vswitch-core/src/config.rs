//! Start-up parameters of the switch.
//!
//! Parameters come from an optional JSON file and are then overridden by
//! command line flags. Everything the operator configures at runtime
//! (links, stages, pools) comes from the command script instead.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::stage::{CoreMask, MAX_LCORE};
use crate::Result;

pub const DEFAULT_SCRIPT: &str = "/etc/vswitch/vswitch.cli";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8086;
pub const DEFAULT_PCAP_DIR: &str = "/tmp";
/// Packets captured per graph when graph capture is enabled.
pub const GRAPH_PCAP_PKTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Command script executed at start-up.
    pub script: PathBuf,
    pub host: String,
    pub port: u16,
    pub ev_id: u8,
    /// Number of core slots; cores `0..nb_lcores` other than the main one
    /// may host stages.
    pub nb_lcores: u16,
    pub main_lcore: u16,
    pub stats_file: Option<PathBuf>,
    pub enable_graph_stats: bool,
    /// Capture packets walked by each graph to `<pcap_dir>/<graph>.pcap`.
    pub enable_graph_pcap: bool,
    pub pcap_dir: PathBuf,
    /// Names of the soft device ports.
    pub ports: Vec<String>,
}

impl Default for Params {
    fn default() -> Self {
        let nb_lcores = std::thread::available_parallelism()
            .map(|n| n.get().min(MAX_LCORE as usize) as u16)
            .unwrap_or(1);

        Self {
            script: PathBuf::from(DEFAULT_SCRIPT),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ev_id: 0,
            nb_lcores,
            main_lcore: 0,
            stats_file: None,
            enable_graph_stats: true,
            enable_graph_pcap: false,
            pcap_dir: PathBuf::from(DEFAULT_PCAP_DIR),
            ports: Vec::new(),
        }
    }
}

impl Params {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let params = serde_json::from_str(&text)?;
        log::debug!("loaded parameters from {}", path.display());
        Ok(params)
    }

    /// Cores stages may be placed on: every core slot but the main one.
    pub fn enabled_coremask(&self) -> CoreMask {
        (0..self.nb_lcores.min(MAX_LCORE))
            .filter(|&c| c != self.main_lcore)
            .collect()
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let params: Params = serde_json::from_str(r#"{"port": 9000, "ports": ["eth0"]}"#).unwrap();
        assert_eq!(params.port, 9000);
        assert_eq!(params.host, "127.0.0.1");
        assert_eq!(params.script, PathBuf::from(DEFAULT_SCRIPT));
        assert_eq!(params.ports, vec!["eth0".to_string()]);
        assert_eq!(params.control_addr(), "127.0.0.1:9000");
        assert!(!params.enable_graph_pcap);
        assert_eq!(params.pcap_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_enabled_coremask_skips_main() {
        let params = Params {
            nb_lcores: 4,
            main_lcore: 0,
            ..Default::default()
        };
        assert_eq!(params.enabled_coremask(), CoreMask(0xe));

        let params = Params {
            nb_lcores: 200,
            main_lcore: 2,
            ..Default::default()
        };
        assert!(!params.enabled_coremask().contains(2));
        assert!(params.enabled_coremask().contains(63));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Params::load(Path::new("/nonexistent/vswitch.json")).is_err());
    }
}
