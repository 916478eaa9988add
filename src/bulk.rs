//! 批量操作：逐项独立执行，单项失败不会中断其余目标。

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::ErrorBody;
use crate::storage::Storage;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub path: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub requested: usize,
    pub deleted: usize,
    pub results: Vec<BulkItemResult>,
}

/// 依次删除每个目标，汇总成功数与逐项结果。
///
/// Duplicate targets are collapsed, keeping the first occurrence's order.
pub async fn delete_many(storage: &Storage, targets: &[String]) -> BulkReport {
    let mut seen = HashSet::new();
    let unique: Vec<&String> = targets
        .iter()
        .filter(|target| seen.insert(target.trim().to_string()))
        .collect();

    let mut results = Vec::with_capacity(unique.len());
    for target in unique {
        match storage.delete_path(target).await {
            Ok(()) => {
                debug!(path = target.as_str(), "bulk delete item");
                results.push(BulkItemResult {
                    path: target.clone(),
                    deleted: true,
                    error: None,
                });
            }
            Err(err) => {
                warn!(path = target.as_str(), error = %err, "bulk delete item failed");
                results.push(BulkItemResult {
                    path: target.clone(),
                    deleted: false,
                    error: Some(err.to_body()),
                });
            }
        }
    }

    let deleted = results.iter().filter(|result| result.deleted).count();
    BulkReport {
        requested: results.len(),
        deleted,
        results,
    }
}
