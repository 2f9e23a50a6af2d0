//! Controller configuration.
//!
//! All tunables live in [ControllerConfiguration]. The defaults describe a
//! two-socket machine with one DRAM node and one NVRAM node; deployments
//! override them through a JSON file and `TIERPLACE_`-prefixed environment
//! variables (feature `figment_config`).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfiguration {
    /// NUMA nodes forming the DRAM tier.
    pub dram_nodes: Vec<u32>,
    /// NUMA nodes forming the NVRAM tier. Must be disjoint from
    /// `dram_nodes`.
    pub nvram_nodes: Vec<u32>,

    /// DRAM occupancy the controller steers towards.
    pub dram_target: f64,
    /// DRAM occupancy above which cold pages are pushed down.
    pub dram_limit: f64,
    /// NVRAM occupancy the controller steers towards.
    pub nvram_target: f64,
    /// NVRAM occupancy above which hot pages are pulled up.
    pub nvram_limit: f64,

    /// Write-intensity threshold (MB/s) above which the switch component
    /// engages.
    pub nvram_bw_thresh: f32,
    /// Sanity bound for the DRAM telemetry fields (MB/s).
    pub dram_bw_max: f32,
    /// Sanity bound for the PMM telemetry fields (MB/s).
    pub nvram_bw_max: f32,
    /// Mixed persistent-memory deployment; selects `pmm_app_bw` as the
    /// write-intensity signal instead of `pmm_writes`.
    pub pmm_mixed: bool,

    /// Size of the migration worker pool.
    pub workers_max: usize,

    /// Base sleep between placement ticks.
    pub memcheck_interval: Duration,
    /// Delay between an access-bit clear and the subsequent discovery.
    pub clear_interval: Duration,
    /// Readiness timeout of the admin socket; bounds how long shutdown can
    /// go unnoticed by the listener.
    pub select_timeout: Duration,

    /// Telemetry file written by the bandwidth sampler.
    pub memdata_path: PathBuf,
    /// Admin Unix-domain socket path.
    pub socket_path: PathBuf,

    /// Upper bound for pid arguments of admin commands.
    pub pid_max: i32,
}

impl Default for ControllerConfiguration {
    fn default() -> Self {
        ControllerConfiguration {
            dram_nodes: vec![0],
            nvram_nodes: vec![1],
            dram_target: 0.90,
            dram_limit: 0.95,
            nvram_target: 0.90,
            nvram_limit: 0.95,
            nvram_bw_thresh: 2048.0,
            dram_bw_max: 100_000.0,
            nvram_bw_max: 50_000.0,
            pmm_mixed: false,
            workers_max: 8,
            memcheck_interval: Duration::from_secs(2),
            clear_interval: Duration::from_secs(1),
            select_timeout: Duration::from_secs(1),
            memdata_path: PathBuf::from("./memdata"),
            socket_path: PathBuf::from("./socket"),
            pid_max: 32768,
        }
    }
}

impl ControllerConfiguration {
    /// Checks the structural invariants that the rest of the controller
    /// relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.dram_nodes.is_empty() || self.nvram_nodes.is_empty() {
            return Err(Error::Config("both tiers need at least one node".into()));
        }
        if self.dram_nodes.iter().any(|n| self.nvram_nodes.contains(n)) {
            return Err(Error::Config("tiers must be disjoint".into()));
        }
        if self.workers_max == 0 {
            return Err(Error::Config("workers_max must be nonzero".into()));
        }
        for (name, v) in [
            ("dram_target", self.dram_target),
            ("dram_limit", self.dram_limit),
            ("nvram_target", self.nvram_target),
            ("nvram_limit", self.nvram_limit),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("{} must lie in [0, 1]", name)));
            }
        }
        Ok(())
    }

    /// Loads the configuration from defaults, an optional JSON file and the
    /// process environment, in that precedence order.
    #[cfg(feature = "figment_config")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, Error> {
        use figment::{
            providers::{Env, Format, Json, Serialized},
            Figment,
        };

        let mut figment = Figment::from(Serialized::defaults(ControllerConfiguration::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        let config: ControllerConfiguration = figment
            .merge(Env::prefixed("TIERPLACE_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
