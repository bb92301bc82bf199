//! Synthetic load generation for the stress endpoint.
//!
//! Allocates memory, writes scratch files, and burns CPU on demand, always
//! releasing what it took before returning. Exposed for load testing the
//! surrounding deployment, not the pipeline itself.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::metrics;

const MIN_SIZE_MB: u64 = 1;
const MAX_SIZE_MB: u64 = 1000;
const MAX_CPU_PERCENT: u32 = 100;
const MIN_CPU_DURATION_SEC: u64 = 1;
const MAX_CPU_DURATION_SEC: u64 = 300;

fn default_size_mb() -> u64 {
    100
}

fn default_cpu_load() -> u32 {
    50
}

fn default_cpu_duration() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct StressParams {
    #[serde(default)]
    pub stress_memory: bool,
    #[serde(default)]
    pub stress_disk: bool,
    #[serde(default)]
    pub stress_cpu: bool,
    #[serde(default = "default_size_mb")]
    pub memory_size_mb: u64,
    #[serde(default = "default_size_mb")]
    pub disk_size_mb: u64,
    #[serde(default = "default_cpu_load")]
    pub cpu_load_percent: u32,
    #[serde(default = "default_cpu_duration")]
    pub cpu_duration_sec: u64,
}

impl StressParams {
    /// Range-check every knob, mirroring the documented bounds.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(MIN_SIZE_MB..=MAX_SIZE_MB).contains(&self.memory_size_mb) {
            return Err(format!(
                "memory_size_mb {} outside [{MIN_SIZE_MB}, {MAX_SIZE_MB}]",
                self.memory_size_mb
            ));
        }
        if !(MIN_SIZE_MB..=MAX_SIZE_MB).contains(&self.disk_size_mb) {
            return Err(format!(
                "disk_size_mb {} outside [{MIN_SIZE_MB}, {MAX_SIZE_MB}]",
                self.disk_size_mb
            ));
        }
        if self.cpu_load_percent > MAX_CPU_PERCENT {
            return Err(format!(
                "cpu_load_percent {} outside [0, {MAX_CPU_PERCENT}]",
                self.cpu_load_percent
            ));
        }
        if !(MIN_CPU_DURATION_SEC..=MAX_CPU_DURATION_SEC).contains(&self.cpu_duration_sec) {
            return Err(format!(
                "cpu_duration_sec {} outside [{MIN_CPU_DURATION_SEC}, {MAX_CPU_DURATION_SEC}]",
                self.cpu_duration_sec
            ));
        }
        Ok(())
    }
}

/// Apply the requested load, then release it.
pub async fn run(params: &StressParams) -> Result<()> {
    if params.stress_memory {
        let bytes = (params.memory_size_mb * 1024 * 1024) as usize;
        info!(mb = params.memory_size_mb, "memory stress: allocating");
        let block = vec![0xABu8; bytes];
        metrics::set_stress_memory(block.len() as f64);
        drop(block);
        metrics::set_stress_memory(0.0);
        info!(mb = params.memory_size_mb, "memory stress: released");
    }

    if params.stress_disk {
        let mb = params.disk_size_mb;
        info!(mb, "disk stress: writing scratch file");
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = tempfile::NamedTempFile::new().context("creating scratch file")?;
            let chunk = vec![0xCDu8; 1024 * 1024];
            for _ in 0..mb {
                file.write_all(&chunk).context("writing scratch file")?;
            }
            file.flush().context("flushing scratch file")?;
            metrics::set_stress_disk((mb * 1024 * 1024) as f64);
            // NamedTempFile removes itself on drop.
            drop(file);
            metrics::set_stress_disk(0.0);
            Ok(())
        })
        .await
        .context("disk stress task panicked")??;
        info!(mb, "disk stress: cleaned up");
    }

    if params.stress_cpu {
        let load = params.cpu_load_percent;
        let duration = Duration::from_secs(params.cpu_duration_sec);
        info!(load, secs = params.cpu_duration_sec, "cpu stress: starting");
        metrics::set_stress_cpu(load as f64);
        tokio::task::spawn_blocking(move || cpu_stress(load, duration))
            .await
            .context("cpu stress task panicked")?;
        metrics::set_stress_cpu(0.0);
        info!("cpu stress: completed");
    }

    Ok(())
}

/// Duty-cycle busy loop: work `load_percent` of each 10 ms slice, sleep the rest.
fn cpu_stress(load_percent: u32, duration: Duration) {
    const SLICE: Duration = Duration::from_millis(10);
    let busy = SLICE.mul_f64(load_percent as f64 / 100.0);
    let idle = SLICE.saturating_sub(busy);
    let deadline = Instant::now() + duration;

    while Instant::now() < deadline {
        let spin_until = Instant::now() + busy;
        let mut acc = 0u64;
        while Instant::now() < spin_until {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(1);
        }
        std::hint::black_box(acc);
        if !idle.is_zero() {
            std::thread::sleep(idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StressParams {
        StressParams {
            stress_memory: false,
            stress_disk: false,
            stress_cpu: false,
            memory_size_mb: 100,
            disk_size_mb: 100,
            cpu_load_percent: 50,
            cpu_duration_sec: 10,
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut p = params();
        p.memory_size_mb = 2000;
        assert!(p.validate().is_err());

        let mut p = params();
        p.disk_size_mb = 0;
        assert!(p.validate().is_err());

        let mut p = params();
        p.cpu_load_percent = 101;
        assert!(p.validate().is_err());

        let mut p = params();
        p.cpu_duration_sec = 301;
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn memory_and_disk_stress_complete_and_clean_up() -> anyhow::Result<()> {
        let mut p = params();
        p.stress_memory = true;
        p.memory_size_mb = 1;
        p.stress_disk = true;
        p.disk_size_mb = 1;
        run(&p).await?;
        Ok(())
    }

    #[tokio::test]
    async fn cpu_stress_respects_duration() -> anyhow::Result<()> {
        let mut p = params();
        p.stress_cpu = true;
        p.cpu_load_percent = 10;
        p.cpu_duration_sec = 1;

        let started = Instant::now();
        run(&p).await?;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }
}
