//! The periodic placement decision maker.
//!
//! One tick reads tier occupancy and the bandwidth telemetry, picks among
//! idle, threshold rebalance, bandwidth-driven switch and bandwidth-driven
//! pull, bounds the requested page count, and sleeps with a dynamic backoff.
//! The decision arithmetic lives in free functions so it can be exercised
//! without a kernel.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    channel::{PlacementMode, MAX_N_FIND, MAX_N_SWITCH},
    config::ControllerConfiguration,
    controller::Controller,
    telemetry::{TelemetryGate, TelemetryReader},
    topology::{page_size, Tier, TierTopology, TopologyError},
};

/// Runtime on/off switches of the two placement components, flipped from the
/// admin surface.
pub struct ComponentToggles {
    switch_enabled: AtomicBool,
    threshold_enabled: AtomicBool,
}

impl Default for ComponentToggles {
    fn default() -> Self {
        ComponentToggles {
            switch_enabled: AtomicBool::new(true),
            threshold_enabled: AtomicBool::new(true),
        }
    }
}

impl ComponentToggles {
    pub fn switch_enabled(&self) -> bool {
        self.switch_enabled.load(Ordering::Acquire)
    }

    pub fn threshold_enabled(&self) -> bool {
        self.threshold_enabled.load(Ordering::Acquire)
    }

    /// Flips the switch component; returns the new state.
    pub fn flip_switch(&self) -> bool {
        !self.switch_enabled.fetch_xor(true, Ordering::AcqRel)
    }

    /// Flips the threshold component; returns the new state.
    pub fn flip_threshold(&self) -> bool {
        !self.threshold_enabled.fetch_xor(true, Ordering::AcqRel)
    }
}

/// Sleeps for `total`, waking early once `exit` is raised.
pub fn sleep_observing(exit: &AtomicBool, total: Duration) {
    let chunk = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while !exit.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(chunk.min(deadline - now));
    }
}

fn pages_for(bytes: f64) -> usize {
    if bytes <= 0.0 {
        return 0;
    }
    ((bytes / page_size() as f64) as usize).min(MAX_N_FIND)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ThresholdDecision {
    pub n_pages: usize,
    pub mode: PlacementMode,
}

/// The threshold component's choice for this tick, if any.
pub(crate) fn threshold_decision(
    dram_usage: f64,
    nvram_usage: f64,
    dram_total: u64,
    nvram_total: u64,
    config: &ControllerConfiguration,
    switch_enabled: bool,
    nvram_pull_disabled: bool,
) -> Option<ThresholdDecision> {
    if dram_usage > config.dram_limit && nvram_usage < config.nvram_target {
        let bytes = ((dram_usage - config.dram_target) * dram_total as f64)
            .min((config.nvram_target - nvram_usage) * nvram_total as f64);
        let n_pages = pages_for(bytes);
        if n_pages == 0 {
            return None;
        }
        Some(ThresholdDecision {
            n_pages,
            mode: PlacementMode::DramPull,
        })
    } else if !switch_enabled && nvram_usage > config.nvram_limit && dram_usage < config.dram_target
    {
        if nvram_pull_disabled {
            debug!("NVRAM pull wanted but disabled by sticky flag");
            return None;
        }
        let bytes = ((nvram_usage - config.nvram_target) * nvram_total as f64)
            .min((config.dram_target - dram_usage) * dram_total as f64);
        let n_pages = pages_for(bytes);
        if n_pages == 0 {
            return None;
        }
        Some(ThresholdDecision {
            n_pages,
            mode: PlacementMode::NvramPull,
        })
    } else {
        None
    }
}

/// What the switch component does once the bandwidth threshold is crossed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SwitchPlan {
    /// DRAM is already at its target; exchange equal counts between tiers.
    Exchange,
    /// DRAM has headroom; pull up that many intensive pages instead.
    Intensive(usize),
}

pub(crate) fn switch_plan(
    dram_usage: f64,
    dram_total: u64,
    config: &ControllerConfiguration,
) -> SwitchPlan {
    if dram_usage >= config.dram_target {
        SwitchPlan::Exchange
    } else {
        SwitchPlan::Intensive(pages_for((config.dram_limit - dram_usage) * dram_total as f64))
    }
}

pub struct PlacementLoop {
    controller: Arc<Controller>,
    topology: Arc<TierTopology>,
    reader: TelemetryReader,
    gate: TelemetryGate,
    config: ControllerConfiguration,
    toggles: Arc<ComponentToggles>,
    exit: Arc<AtomicBool>,
}

impl PlacementLoop {
    pub fn new(
        controller: Arc<Controller>,
        topology: Arc<TierTopology>,
        toggles: Arc<ComponentToggles>,
        exit: Arc<AtomicBool>,
        config: ControllerConfiguration,
    ) -> PlacementLoop {
        PlacementLoop {
            controller,
            topology,
            reader: TelemetryReader::new(config.memdata_path.clone()),
            gate: TelemetryGate::new(),
            config,
            toggles,
            exit,
        }
    }

    pub fn run(mut self) {
        while !self.exit.load(Ordering::Acquire) {
            let interval = self.tick();
            sleep_observing(&self.exit, interval);
        }
    }

    fn read_usage(&self) -> Result<(f64, u64, f64, u64), TopologyError> {
        let (dram_free, dram_total) = self.topology.tier_space(Tier::Dram)?;
        let (nvram_free, nvram_total) = self.topology.tier_space(Tier::Nvram)?;
        Ok((
            (dram_total - dram_free) as f64 / dram_total as f64,
            dram_total,
            (nvram_total - nvram_free) as f64 / nvram_total as f64,
            nvram_total,
        ))
    }

    /// One placement tick; returns how long to sleep afterwards.
    fn tick(&mut self) -> Duration {
        let base = self.config.memcheck_interval;
        let switch_on = self.toggles.switch_enabled();
        let thresh_on = self.toggles.threshold_enabled();
        if !switch_on && !thresh_on {
            return base;
        }

        let (mut dram_usage, dram_total, mut nvram_usage, nvram_total) = match self.read_usage() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("could not read tier occupancy: {}", e);
                return base;
            }
        };
        info!("current DRAM usage: {:.2}%", dram_usage * 100.0);
        info!("current NVRAM usage: {:.2}%", nvram_usage * 100.0);

        let mut switch_migrated = 0;
        if switch_on {
            match self.gate.admit(&self.reader, &self.config) {
                Err(e) => debug!("skipping switch component: {}", e),
                Ok(sample) => {
                    let bw = sample.write_signal(self.config.pmm_mixed);
                    if bw > self.config.nvram_bw_thresh {
                        let guard = self.controller.placement_guard();
                        self.controller
                            .find_and_migrate_locked(0, PlacementMode::NvramClear);
                        sleep_observing(&self.exit, self.config.clear_interval);

                        match switch_plan(dram_usage, dram_total, &self.config) {
                            SwitchPlan::Exchange => {
                                switch_migrated = self
                                    .controller
                                    .find_and_migrate_locked(MAX_N_SWITCH, PlacementMode::Switch);
                                if switch_migrated > 0 {
                                    info!(
                                        "DRAM<->NVRAM: switched {} out of {} pages",
                                        switch_migrated,
                                        MAX_N_SWITCH * 2
                                    );
                                }
                            }
                            SwitchPlan::Intensive(n_pages) if n_pages > 0 => {
                                switch_migrated = self
                                    .controller
                                    .find_and_migrate_locked(n_pages, PlacementMode::NvramIntensive);
                                if switch_migrated > 0 {
                                    info!(
                                        "NVRAM->DRAM: sent {} out of {} intensive pages",
                                        switch_migrated, n_pages
                                    );
                                    if let Ok(usage) = self.read_usage() {
                                        dram_usage = usage.0;
                                        nvram_usage = usage.2;
                                    }
                                }
                            }
                            SwitchPlan::Intensive(_) => {}
                        }
                        drop(guard);
                    }
                }
            }
        }

        let mut migrated = switch_migrated;
        if thresh_on {
            if let Some(decision) = threshold_decision(
                dram_usage,
                nvram_usage,
                dram_total,
                nvram_total,
                &self.config,
                switch_on,
                self.controller.nvram_pull_disabled(),
            ) {
                let n = self
                    .controller
                    .find_and_migrate(decision.n_pages, decision.mode);
                if n > 0 {
                    match decision.mode {
                        PlacementMode::DramPull => {
                            info!("DRAM->NVRAM: migrated {} out of {} pages", n, decision.n_pages)
                        }
                        _ => info!("NVRAM->DRAM: migrated {} out of {} pages", n, decision.n_pages),
                    }
                }
                migrated += n;
            }
        }

        let mut interval = base;
        if migrated > 0 {
            // let the bandwidth settle before the next measurement
            interval *= 2;
            if switch_migrated > 0 {
                interval = interval.saturating_sub(self.config.clear_interval);
            }
        }
        interval
    }
}

/// Spawns the placement thread.
pub fn spawn(placement: PlacementLoop) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("placement".to_string())
        .spawn(move || placement.run())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfiguration {
        ControllerConfiguration::default()
    }

    fn pages(n: u64) -> u64 {
        n * page_size()
    }

    #[test]
    fn pull_down_when_dram_over_limit() {
        // DRAM usage 0.97 > limit, NVRAM 0.40 < target
        let decision = threshold_decision(
            0.97,
            0.40,
            pages(1000),
            pages(1000),
            &config(),
            false,
            false,
        )
        .unwrap();
        assert_eq!(decision.mode, PlacementMode::DramPull);
        // bounded by the DRAM overshoot, not the larger NVRAM headroom
        let overshoot =
            (((0.97 - config().dram_target) * pages(1000) as f64) / page_size() as f64) as usize;
        assert_eq!(decision.n_pages, overshoot);
        assert!((69..=70).contains(&decision.n_pages));
    }

    #[test]
    fn pull_down_is_bounded_by_nvram_headroom() {
        let decision = threshold_decision(
            0.97,
            0.88,
            pages(1000),
            pages(1000),
            &config(),
            false,
            false,
        )
        .unwrap();
        // (0.90 - 0.88) * 1000 < (0.97 - 0.90) * 1000
        assert!(decision.n_pages <= 20);
        assert_eq!(decision.mode, PlacementMode::DramPull);
    }

    #[test]
    fn pull_up_when_nvram_over_limit_and_switch_off() {
        let decision = threshold_decision(
            0.40,
            0.97,
            pages(1000),
            pages(1000),
            &config(),
            false,
            false,
        )
        .unwrap();
        assert_eq!(decision.mode, PlacementMode::NvramPull);
        let overshoot =
            (((0.97 - config().nvram_target) * pages(1000) as f64) / page_size() as f64) as usize;
        assert_eq!(decision.n_pages, overshoot);
    }

    #[test]
    fn no_pull_up_while_switch_component_enabled() {
        assert_eq!(
            threshold_decision(0.40, 0.97, pages(1000), pages(1000), &config(), true, false),
            None
        );
    }

    #[test]
    fn no_pull_up_while_sticky_disable_set() {
        assert_eq!(
            threshold_decision(0.40, 0.97, pages(1000), pages(1000), &config(), false, true),
            None
        );
    }

    #[test]
    fn idle_between_thresholds() {
        assert_eq!(
            threshold_decision(0.92, 0.50, pages(1000), pages(1000), &config(), false, false),
            None
        );
    }

    #[test]
    fn page_count_is_capped() {
        let huge = pages(1u64 << 40);
        let decision =
            threshold_decision(0.97, 0.10, huge, huge, &config(), false, false).unwrap();
        assert_eq!(decision.n_pages, MAX_N_FIND);
    }

    #[test]
    fn switch_exchanges_when_dram_at_target() {
        assert_eq!(switch_plan(0.96, pages(1000), &config()), SwitchPlan::Exchange);
    }

    #[test]
    fn switch_pulls_intensive_pages_when_dram_has_headroom() {
        let headroom =
            (((config().dram_limit - 0.50) * pages(1000) as f64) / page_size() as f64) as usize;
        match switch_plan(0.50, pages(1000), &config()) {
            SwitchPlan::Intensive(n) => assert_eq!(n, headroom),
            plan => panic!("unexpected plan {:?}", plan),
        }
    }

    #[test]
    fn toggles_flip_and_report() {
        let toggles = ComponentToggles::default();
        assert!(toggles.switch_enabled());
        assert!(!toggles.flip_switch());
        assert!(!toggles.switch_enabled());
        assert!(toggles.flip_switch());
        assert!(toggles.threshold_enabled());
        assert!(!toggles.flip_threshold());
    }

    #[test]
    fn exit_cuts_sleep_short() {
        let exit = AtomicBool::new(true);
        let begin = Instant::now();
        sleep_observing(&exit, Duration::from_secs(10));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
