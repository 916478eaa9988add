//! Host telemetry: mounted volumes and load figures for the dashboard.
//!
//! Collection never fails a request. Missing tools or unreadable `/proc`
//! files degrade to empty lists and `null` fields.

use async_trait::async_trait;
use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::VOLUME_MOUNT_PREFIXES;
use crate::root::{RootRegistry, StorageRoot};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub filesystem: String,
    pub mount: String,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLoad {
    pub load_average: Option<[f64; 3]>,
    pub cpu_count: usize,
    pub memory: Option<MemoryInfo>,
    pub uptime_secs: Option<u64>,
}

/// 主机信息来源。
#[async_trait]
pub trait SystemStats: Send + Sync {
    async fn volumes(&self) -> Vec<Volume>;
    async fn load(&self) -> SystemLoad;
}

/// Reads `df` output and the Linux `/proc` files.
#[derive(Debug, Clone)]
pub struct HostStats {
    proc_root: PathBuf,
}

impl Default for HostStats {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl HostStats {
    #[cfg(test)]
    fn with_proc_root(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }

    async fn read_proc(&self, name: &str) -> Option<String> {
        match fs::read_to_string(self.proc_root.join(name)).await {
            Ok(contents) => Some(contents),
            Err(err) => {
                debug!(file = name, error = %err, "proc file unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl SystemStats for HostStats {
    async fn volumes(&self) -> Vec<Volume> {
        let output = match Command::new("df").arg("-kP").output().await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "df unavailable");
                return Vec::new();
            }
        };
        if !output.status.success() {
            warn!(status = %output.status, "df exited with failure");
        }
        parse_df_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn load(&self) -> SystemLoad {
        let load_average = self
            .read_proc("loadavg")
            .await
            .and_then(|text| parse_loadavg(&text));
        let memory = self
            .read_proc("meminfo")
            .await
            .and_then(|text| parse_meminfo(&text));
        let uptime_secs = self
            .read_proc("uptime")
            .await
            .and_then(|text| parse_uptime(&text));
        let cpu_count = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);

        SystemLoad {
            load_average,
            cpu_count,
            memory,
            uptime_secs,
        }
    }
}

/// Whether a mount point is offered as a storage candidate.
pub fn is_candidate_mount(mount: &str) -> bool {
    mount == "/"
        || VOLUME_MOUNT_PREFIXES
            .iter()
            .any(|prefix| mount.starts_with(prefix))
        || mount.contains("storage")
}

/// 解析 `df -kP` 输出（1K 块），跳过表头与无法解析的行。
pub fn parse_df_output(text: &str) -> Vec<Volume> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                return None;
            }
            // Mount points may contain spaces; everything after the capacity column.
            let mount = parts[5..].join(" ");
            if !is_candidate_mount(&mount) {
                return None;
            }
            let kib = |value: &str| value.parse::<u64>().ok().map(|v| v.saturating_mul(1024));
            Some(Volume {
                filesystem: parts[0].to_string(),
                size_bytes: kib(parts[1])?,
                used_bytes: kib(parts[2])?,
                available_bytes: kib(parts[3])?,
                use_percent: parts[4].trim_end_matches('%').parse().ok(),
                mount,
            })
        })
        .collect()
}

pub fn parse_loadavg(text: &str) -> Option<[f64; 3]> {
    let mut fields = text.split_whitespace().map(|value| value.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

/// 解析 `/proc/meminfo`，优先使用 `MemAvailable`。
pub fn parse_meminfo(text: &str) -> Option<MemoryInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest
            .split_whitespace()
            .next()
            .and_then(|value| value.parse::<u64>().ok())
            .map(|kib| kib.saturating_mul(1024));
        match key.trim() {
            "MemTotal" => total = value,
            "MemAvailable" => available = value,
            "MemFree" => free = value,
            _ => {}
        }
    }
    let total_bytes = total?;
    let available_bytes = available.or(free)?;
    Some(MemoryInfo {
        total_bytes,
        available_bytes,
        used_bytes: total_bytes.saturating_sub(available_bytes),
    })
}

fn parse_uptime(text: &str) -> Option<u64> {
    text.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|secs| secs as u64)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOverview {
    storage_root: StorageRoot,
    load: SystemLoad,
    volumes: Vec<Volume>,
}

/// 列出可作为存储根目录的挂载卷。
pub async fn list_volumes(
    Extension(stats): Extension<Arc<dyn SystemStats>>,
) -> JsonResponse<Vec<Volume>> {
    JsonResponse(stats.volumes().await)
}

/// 仪表盘概览：当前根目录、负载与挂载卷。
pub async fn system_overview(
    Extension(stats): Extension<Arc<dyn SystemStats>>,
    Extension(registry): Extension<Arc<RootRegistry>>,
) -> JsonResponse<SystemOverview> {
    let (load, volumes) = tokio::join!(stats.load(), stats.volumes());
    JsonResponse(SystemOverview {
        storage_root: registry.active().as_ref().clone(),
        load,
        volumes,
    })
}
