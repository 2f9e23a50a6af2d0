//! Reader for the bandwidth telemetry file written by the sampling utility.
//!
//! The file holds exactly one record of six little-endian `f32` rates. Its
//! modification time is the freshness indicator: the placement loop consumes
//! each mtime at most once.

use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
    time::SystemTime,
};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::config::ControllerConfiguration;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("could not read telemetry file: {0}")]
    Io(#[from] io::Error),
    #[error("telemetry sample not newer than the last consumed one")]
    Stale,
    #[error("telemetry sample out of configured bandwidth bounds")]
    OutOfRange,
}

/// One decoded record of the telemetry file. All rates are in the sampler's
/// native unit (MB/s).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemdataSample {
    pub dram_reads: f32,
    pub dram_writes: f32,
    pub pmm_reads: f32,
    pub pmm_writes: f32,
    pub pmm_app_bw: f32,
    pub pmm_mem_bw: f32,
}

impl MemdataSample {
    /// The write-intensity signal the switch component compares against the
    /// bandwidth threshold. In mixed persistent-memory deployments the
    /// sampler cannot isolate write bandwidth, so the total app bandwidth is
    /// used instead.
    pub fn write_signal(&self, pmm_mixed: bool) -> f32 {
        if pmm_mixed {
            self.pmm_app_bw
        } else {
            self.pmm_writes
        }
    }

    fn in_bounds(&self, dram_bw_max: f32, nvram_bw_max: f32) -> bool {
        let dram_ok = |v: f32| (0.0..=dram_bw_max).contains(&v);
        let nvram_ok = |v: f32| (0.0..=nvram_bw_max).contains(&v);
        dram_ok(self.dram_reads)
            && dram_ok(self.dram_writes)
            && nvram_ok(self.pmm_reads)
            && nvram_ok(self.pmm_writes)
            && nvram_ok(self.pmm_app_bw)
            && nvram_ok(self.pmm_mem_bw)
    }
}

/// Reads the fixed-layout telemetry file.
pub struct TelemetryReader {
    path: PathBuf,
}

impl TelemetryReader {
    pub fn new(path: PathBuf) -> Self {
        TelemetryReader { path }
    }

    /// Modification time of the telemetry file.
    pub fn mtime(&self) -> Result<SystemTime, TelemetryError> {
        Ok(std::fs::metadata(&self.path)?.modified()?)
    }

    /// Reads the single record from the file.
    pub fn read(&self) -> Result<MemdataSample, TelemetryError> {
        let mut file = File::open(&self.path)?;
        let mut raw = [0u8; 24];
        file.read_exact(&mut raw)?;
        let mut cursor = &raw[..];
        Ok(MemdataSample {
            dram_reads: cursor.read_f32::<LittleEndian>()?,
            dram_writes: cursor.read_f32::<LittleEndian>()?,
            pmm_reads: cursor.read_f32::<LittleEndian>()?,
            pmm_writes: cursor.read_f32::<LittleEndian>()?,
            pmm_app_bw: cursor.read_f32::<LittleEndian>()?,
            pmm_mem_bw: cursor.read_f32::<LittleEndian>()?,
        })
    }
}

/// Freshness gate owning the last consumed mtime.
///
/// An mtime is consumed as soon as it is observed to advance, even when the
/// sample then fails its range checks, so a bad file is not re-examined
/// until it is rewritten.
#[derive(Debug, Default)]
pub struct TelemetryGate {
    last_consumed: Option<SystemTime>,
}

impl TelemetryGate {
    pub fn new() -> Self {
        TelemetryGate::default()
    }

    /// Reads and validates the next sample through the gate.
    pub fn admit(
        &mut self,
        reader: &TelemetryReader,
        config: &ControllerConfiguration,
    ) -> Result<MemdataSample, TelemetryError> {
        let mtime = reader.mtime()?;
        let sample = self.admit_at(mtime, || reader.read())?;
        self.check_bounds(sample, config)
    }

    /// Mtime gate only; `read` is invoked after the mtime is consumed.
    fn admit_at<F>(&mut self, mtime: SystemTime, read: F) -> Result<MemdataSample, TelemetryError>
    where
        F: FnOnce() -> Result<MemdataSample, TelemetryError>,
    {
        if let Some(last) = self.last_consumed {
            if mtime <= last {
                return Err(TelemetryError::Stale);
            }
        }
        self.last_consumed = Some(mtime);
        read()
    }

    fn check_bounds(
        &self,
        sample: MemdataSample,
        config: &ControllerConfiguration,
    ) -> Result<MemdataSample, TelemetryError> {
        if sample.in_bounds(config.dram_bw_max, config.nvram_bw_max) {
            Ok(sample)
        } else {
            Err(TelemetryError::OutOfRange)
        }
    }
}
