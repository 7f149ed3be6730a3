use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// 后台加载线程池的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// worker 线程数，同时也是同时进行的生产任务的上限
    pub worker_threads: usize,
    /// 等待派发的请求队列长度
    pub queue_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2).clamp(1, 4);
        Self {
            worker_threads,
            queue_capacity: 64,
        }
    }
}

/// 资源池的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 不超过该大小的线性 buffer 从共享的 page 中子分配
    pub suballocation_threshold: u64,
    /// 子分配使用的 page 大小
    pub page_size: u64,
    /// 子分配区域的对齐
    pub region_alignment: u64,
    /// 线性 buffer 的最小尺寸档位，分配大小向上取整到 2 的幂
    pub min_size_class: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            suballocation_threshold: 64 * 1024,
            page_size: 1024 * 1024,
            region_alignment: 256,
            min_size_class: 256,
        }
    }
}

/// 上传子系统的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub loader: LoaderConfig,
    pub pool: PoolConfig,
    /// 每次 `update` 最多提交的字节数；单个超过预算的事务会单独提交
    pub max_upload_bytes_per_frame: u64,
    /// 每次 `update` 最多合并提交的事务数
    pub max_transactions_per_batch: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            pool: PoolConfig::default(),
            max_upload_bytes_per_frame: 64 * 1024 * 1024,
            max_transactions_per_batch: 256,
        }
    }
}

impl UploadConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse upload config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("invalid upload config {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.loader.worker_threads > 0, "loader.worker_threads must be positive");
        anyhow::ensure!(self.loader.queue_capacity > 0, "loader.queue_capacity must be positive");
        anyhow::ensure!(
            self.pool.region_alignment.is_power_of_two(),
            "pool.region_alignment must be a power of two"
        );
        anyhow::ensure!(
            self.pool.suballocation_threshold <= self.pool.page_size,
            "pool.suballocation_threshold must not exceed pool.page_size"
        );
        anyhow::ensure!(self.max_transactions_per_batch > 0, "max_transactions_per_batch must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = UploadConfig::from_toml_str(
            r#"
            max_transactions_per_batch = 8

            [loader]
            worker_threads = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.max_transactions_per_batch, 8);
        assert_eq!(config.loader.worker_threads, 3);
        assert_eq!(config.loader.queue_capacity, LoaderConfig::default().queue_capacity);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(UploadConfig::from_toml_str("").unwrap(), UploadConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(UploadConfig::from_toml_str("[loader]\nworker_threads = 0").is_err());
        assert!(UploadConfig::from_toml_str("[pool]\nregion_alignment = 100").is_err());
        assert!(UploadConfig::from_toml_str("max_transactions_per_batch = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join(format!("streamline-config-{}.toml", uuid::Uuid::new_v4()));
        assert!(UploadConfig::from_toml_file(path).is_err());
    }
}
