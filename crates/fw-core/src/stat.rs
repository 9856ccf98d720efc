use crate::registry::MemoryProbe;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{Pid, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};
use thiserror::Error;

/// Window over which the busy percentage is measured.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuCore {
    pub name: String,
    pub brand: String,
    pub frequency_mhz: u64,
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryTotals {
    pub free: u64,
    pub total: u64,
    pub percentage: u8,
}

impl MemoryTotals {
    pub fn new(free: u64, total: u64) -> Self {
        Self {
            free,
            total,
            percentage: used_percentage(free, total),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub release: String,
    pub cpus: Vec<CpuCore>,
    pub uptime: u64,
    pub memory: MemoryTotals,
    /// Whole-host busy percentage over [`CPU_SAMPLE_WINDOW`], two decimals.
    pub cpu: f64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StatError {
    #[error("Can not load system/cpu/memory information: {0}")]
    Unavailable(String),
}

pub fn used_percentage(free: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let used = 1.0 - (free.min(total) as f64 / total as f64);
    (used * 100.0).round() as u8
}

pub fn round_percent(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub trait SystemSource: Send + Sync {
    fn sample(&self) -> BoxFuture<'_, Result<SystemSnapshot, StatError>>;
}

/// Keeps one `System` alive between samples so every reading is a delta
/// against the previous refresh.
pub struct SysinfoSystemSource {
    system: Arc<Mutex<System>>,
    window: Duration,
}

impl Default for SysinfoSystemSource {
    fn default() -> Self {
        Self::new(CPU_SAMPLE_WINDOW)
    }
}

impl SysinfoSystemSource {
    pub fn new(window: Duration) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            window: window.max(MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }
}

impl SystemSource for SysinfoSystemSource {
    fn sample(&self) -> BoxFuture<'_, Result<SystemSnapshot, StatError>> {
        let system = self.system.clone();
        let window = self.window;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut system = system
                    .lock()
                    .map_err(|_| StatError::Unavailable("system probe poisoned".to_string()))?;
                system.refresh_cpu_all();
                std::thread::sleep(window);
                system.refresh_cpu_all();
                system.refresh_memory();
                snapshot_from(&system)
            })
            .await
            .map_err(|err| StatError::Unavailable(err.to_string()))?
        })
    }
}

fn snapshot_from(system: &System) -> Result<SystemSnapshot, StatError> {
    let cpus = system
        .cpus()
        .iter()
        .map(|cpu| CpuCore {
            name: cpu.name().to_string(),
            brand: cpu.brand().to_string(),
            frequency_mhz: cpu.frequency(),
            usage_percent: cpu.cpu_usage(),
        })
        .collect::<Vec<_>>();
    if cpus.is_empty() {
        return Err(StatError::Unavailable("no cpu data".to_string()));
    }

    Ok(SystemSnapshot {
        hostname: System::host_name().unwrap_or_default(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        release: System::kernel_version().unwrap_or_default(),
        cpus,
        uptime: System::uptime(),
        memory: MemoryTotals::new(system.available_memory(), system.total_memory()),
        cpu: round_percent(f64::from(system.global_cpu_usage())),
        sampled_at: Utc::now(),
    })
}

#[derive(Default)]
pub struct SysinfoMemoryProbe {
    system: Mutex<System>,
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn resident_bytes(&self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|process| process.memory())
    }
}
