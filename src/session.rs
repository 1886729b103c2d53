//! 署名途中のトランザクションをファイルに保存し、別の署名者へ引き継ぐ。

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AppError;
use crate::types::TransactionInput;

/// セッションファイルのスキーマバージョン
pub const SESSION_VERSION: u32 = 1;

fn legacy_version() -> u32 {
    SESSION_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSession {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub p2sh_address: String,
    pub redeem_script: String,
    pub inputs: Vec<TransactionInput>,
    pub signed_hex: String,
    pub complete: bool,
    pub signatures: usize,
    pub required_signatures: usize,
    #[serde(default)]
    pub batch: Option<usize>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_txid: Option<String>,
}

impl SigningSession {
    /// 未署名のトランザクションから新しいセッションを作る
    pub fn unsigned(
        p2sh_address: &str,
        redeem_script: &str,
        inputs: Vec<TransactionInput>,
        raw_hex: String,
        required_signatures: usize,
        batch: Option<usize>,
    ) -> Self {
        SigningSession {
            version: SESSION_VERSION,
            p2sh_address: p2sh_address.to_string(),
            redeem_script: redeem_script.to_string(),
            inputs,
            signed_hex: raw_hex,
            complete: false,
            signatures: 0,
            required_signatures,
            batch,
            created_at: unix_now().as_secs(),
            broadcast_txid: None,
        }
    }

    /// 呼び出し側が指定したアドレス・redeemScriptとファイルの内容を照合する。
    /// 未指定の項目は照合しない。
    pub fn verify_against(&self, p2sh_address: Option<&str>, redeem_script: Option<&str>) -> Result<(), AppError> {
        if let Some(expected) = p2sh_address {
            if expected != self.p2sh_address {
                return Err(AppError::SessionMismatch {
                    field: "p2sh_address".into(),
                    expected: expected.to_string(),
                    found: self.p2sh_address.clone(),
                });
            }
        }
        if let Some(expected) = redeem_script {
            if !expected.eq_ignore_ascii_case(&self.redeem_script) {
                return Err(AppError::SessionMismatch {
                    field: "redeem_script".into(),
                    expected: expected.to_string(),
                    found: self.redeem_script.clone(),
                });
            }
        }
        Ok(())
    }
}

fn unix_now() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SessionStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<アドレス先頭8文字>_b<バッチ>_s<署名数>_<ミリ秒>.json` という名前で保存する
    pub fn save(&self, session: &SigningSession) -> Result<PathBuf, AppError> {
        fs::create_dir_all(&self.dir)?;
        let stem = file_stem(session, unix_now().as_millis());
        let path = self.create_new(&stem, session)?;
        log::info!("セッションを保存しました: {:?}", path);
        Ok(path)
    }

    /// 同名のファイルがあれば `-1`, `-2` ... を付ける。作成は排他的に行い、既存ファイルは開かない。
    fn create_new(&self, stem: &str, session: &SigningSession) -> Result<PathBuf, AppError> {
        let json = serde_json::to_string_pretty(session)?;
        let mut n = 0;
        loop {
            let path = match n {
                0 => self.dir.join(format!("{}.json", stem)),
                n => self.dir.join(format!("{}-{}.json", stem, n)),
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(json.as_bytes()).map_err(|e| {
                        log::error!("セッションファイルの書き込みに失敗しました: {:?}", path);
                        AppError::Io(e)
                    })?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => {
                    log::error!("セッションファイルを作成できませんでした: {:?}", path);
                    return Err(AppError::Io(e));
                }
            }
        }
    }

    /// 既存ファイルを上書きする (ブロードキャスト結果の記録用)
    pub fn write(&self, path: &Path, session: &SigningSession) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(session)?;
        fs::write(path, json).map_err(|e| {
            log::error!("セッションファイルの書き込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })
    }

    pub fn load(&self, path: &Path) -> Result<SigningSession, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            log::error!("セッションファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        let session: SigningSession = serde_json::from_str(&content).map_err(|e| AppError::JsonParse {
            file_path: path.to_path_buf(),
            source: e,
        })?;
        if session.version > SESSION_VERSION {
            return Err(AppError::Validation(format!(
                "未対応のセッションバージョンです: {} (対応: {})",
                session.version, SESSION_VERSION
            )));
        }
        log::debug!("セッションを読み込みました: {:?} ({}/{})", path, session.signatures, session.required_signatures);
        Ok(session)
    }

    /// 保存済みセッションをファイル名順に返す
    pub fn list(&self) -> Result<Vec<PathBuf>, AppError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn file_stem(session: &SigningSession, millis: u128) -> String {
    let prefix: String = session
        .p2sh_address
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    let batch = session.batch.map(|b| format!("b{:03}", b)).unwrap_or_else(|| "send".to_string());
    format!("{}_{}_s{}_{}", prefix, batch, session.signatures, millis)
}
