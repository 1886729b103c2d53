//! メニューのヘッダーに出す残高とUTXO数。
//!
//! 取得はバックグラウンドのスレッドで1回だけ行い、結果をJSONファイルに書き出す。
//! メニュー側はファイルを読むだけなので、取得が終わっていなくても待たされない。

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AppError;
use crate::rpc::NodeRpc;
use crate::types::btc_amount;
use crate::utxo::FetchOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub address: String,
    pub utxo_count: usize,
    #[serde(with = "btc_amount")]
    pub balance: Amount,
    /// UNIX時刻 (秒)
    pub updated_at: u64,
}

pub fn collect_status(node: &dyn NodeRpc, address: &str, options: &FetchOptions) -> Result<StatusSnapshot, AppError> {
    let utxos = node
        .list_unspent(options.min_conf, options.max_conf, address)
        .map_err(|e| e.rpc_into(AppError::Fetch))?;
    let balance = utxos
        .iter()
        .try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount))
        .ok_or_else(|| AppError::Fetch("残高の合計がオーバーフローしました".into()))?;
    let updated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Ok(StatusSnapshot {
        address: address.to_string(),
        utxo_count: utxos.len(),
        balance,
        updated_at,
    })
}

/// 一時ファイルに書いてからリネームし、読み手が書きかけを見ないようにする
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// ファイルが無い、または読めない場合は `None`
pub fn read_status(path: &Path) -> Option<StatusSnapshot> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

pub fn spawn_status_refresh(
    node: Arc<dyn NodeRpc>,
    address: String,
    options: FetchOptions,
    path: PathBuf,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let result = collect_status(node.as_ref(), &address, &options).and_then(|snapshot| {
            write_status(&path, &snapshot)?;
            Ok(snapshot)
        });
        match result {
            Ok(snapshot) => log::debug!(
                "残高を更新しました: {} ({} 件)",
                snapshot.balance,
                snapshot.utxo_count
            ),
            Err(e) => log::warn!("残高の取得に失敗しました: {}", e),
        }
    })
}

/// メニューのヘッダー行
pub fn status_line(path: Option<&Path>) -> String {
    match path.and_then(read_status) {
        Some(s) => format!("残高: {} / UTXO: {} 件 ({})", s.balance, s.utxo_count, s.address),
        None => "残高: 取得中…".to_string(),
    }
}
