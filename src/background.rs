//! 会话清理与过期上传暂存目录清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::auth::Authenticator;
use crate::config::{SESSION_PRUNE_INTERVAL_SECS, STAGING_CLEAN_INTERVAL_SECS};
use crate::root::RootRegistry;
use crate::upload::{UploadConfig, cleanup_staging};

/// 启动后台任务。暂存清理每次针对当时的活动根目录。
pub fn spawn_background_tasks(
    registry: Arc<RootRegistry>,
    auth: Arc<Authenticator>,
    upload: Arc<UploadConfig>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            auth.prune().await;
        }
    });

    if upload.staging_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_staging(&registry.storage(), upload.staging_ttl).await {
                warn!(error = %err, "staging cleanup failed");
            }
        }
    });
}
