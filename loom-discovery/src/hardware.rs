// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! Host CPU and memory utilization, sampled lazily.

use async_trait::async_trait;
use loom_model::ComputeUsage;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::warn;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn usage(&self) -> ComputeUsage;
}

/// Process-wide utilization with a shared last-sample cache. OS queries run
/// on the blocking pool and at most once per `min_interval`.
pub struct UtilizationCache {
    system: Arc<StdMutex<System>>,
    last: Mutex<Option<(Instant, ComputeUsage)>>,
    min_interval: Duration,
}

impl Default for UtilizationCache {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl UtilizationCache {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            system: Arc::new(StdMutex::new(System::new())),
            last: Mutex::new(None),
            min_interval,
        }
    }

    pub async fn sample(&self) -> ComputeUsage {
        let mut last = self.last.lock().await;
        if let Some((at, usage)) = *last {
            if at.elapsed() < self.min_interval {
                return usage;
            }
        }

        let system = self.system.clone();
        let sampled = tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
            sys.refresh_cpu();
            sys.refresh_memory();
            let total = sys.total_memory();
            let memory = if total == 0 {
                0.0
            } else {
                (sys.used_memory() as f64 / total as f64 * 100.0) as f32
            };
            ComputeUsage {
                cpu_usage_percent: sys.global_cpu_info().cpu_usage(),
                memory_usage_percent: memory,
            }
        })
        .await;

        let usage = match sampled {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Utilization sampling failed");
                (*last).map(|(_, u)| u).unwrap_or_default()
            }
        };
        *last = Some((Instant::now(), usage));
        usage
    }
}

#[async_trait]
impl UsageSource for UtilizationCache {
    async fn usage(&self) -> ComputeUsage {
        self.sample().await
    }
}

/// Always reports the same numbers.
pub struct FixedUsage(pub ComputeUsage);

#[async_trait]
impl UsageSource for FixedUsage {
    async fn usage(&self) -> ComputeUsage {
        self.0
    }
}

/// Short host description for the local compute, e.g. `"linux 6.8"`.
pub fn host_platform() -> String {
    match (System::name(), System::os_version()) {
        (Some(name), Some(version)) => format!("{} {}", name.to_lowercase(), version),
        (Some(name), None) => name.to_lowercase(),
        _ => std::env::consts::OS.to_string(),
    }
}
