use bitcoin::Amount;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::batch::{ConsolidateOptions, DEFAULT_BATCH_SIZE};
use crate::cli::CliArgs;
use crate::error::AppError;
use crate::prompt::Prompter;
use crate::types::{FeeRate, btc_amount};
use crate::utxo::FetchOptions;

pub const DEFAULT_CLI_PATH: &str = "bitcoin-cli";
pub const DEFAULT_SESSION_DIR: &str = "sessions";
pub const DEFAULT_FEE_TARGET_BLOCKS: u32 = 6;

/// 設定ファイル (すべて省略可能)
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub cli_path: Option<PathBuf>,
    #[serde(default)]
    pub cli_args: Vec<String>,
    pub p2sh_address: Option<String>,
    pub redeem_script: Option<String>,
    pub batch_size: Option<usize>,
    #[serde(default, with = "opt_btc_amount")]
    pub fee_default: Option<Amount>,
    pub min_conf: Option<u32>,
    pub max_conf: Option<u32>,
    pub page_size: Option<usize>,
    pub fee_target_blocks: Option<u32>,
    pub session_dir: Option<PathBuf>,
    pub refresh_between_batches: Option<bool>,
    pub max_batches: Option<usize>,
    pub auto_broadcast: Option<bool>,
    pub key_env: Option<String>,
    pub key_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
}

mod opt_btc_amount {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Amount>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "btc_amount")] Amount);
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(a)| a))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateKeySource {
    Prompt,
    Env(String),
    File(PathBuf),
}

impl PrivateKeySource {
    /// 署名の直前に秘密鍵を取得する。取得した鍵はどこにも保存しない。
    pub fn resolve(&self, prompter: &mut dyn Prompter) -> Result<String, AppError> {
        let wif = match self {
            PrivateKeySource::Prompt => prompter.secret("秘密鍵 (WIF):")?,
            PrivateKeySource::Env(var) => std::env::var(var)
                .map_err(|_| AppError::Validation(format!("環境変数 {} に秘密鍵が設定されていません", var)))?,
            PrivateKeySource::File(path) => fs::read_to_string(path).map_err(|e| {
                log::error!("秘密鍵ファイルの読み込みに失敗しました: {:?}", path);
                AppError::Io(e)
            })?,
        };
        let wif = wif.trim().to_string();
        if wif.is_empty() {
            return Err(AppError::Validation("秘密鍵が空です".into()));
        }
        Ok(wif)
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, PrivateKeySource::Prompt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub cli_path: PathBuf,
    pub cli_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MultisigConfig {
    pub node: NodeSettings,
    pub p2sh_address: Option<String>,
    pub redeem_script: Option<String>,
    pub private_key_source: PrivateKeySource,
    pub batch_size: usize,
    pub fee_default: FeeRate,
    pub min_conf: u32,
    pub max_conf: u32,
    pub page_size: usize,
    pub fee_target_blocks: u32,
    pub session_dir: PathBuf,
    pub refresh_between_batches: bool,
    pub max_batches: Option<usize>,
    pub auto_broadcast: bool,
    pub status_file: Option<PathBuf>,
}

impl Default for MultisigConfig {
    fn default() -> Self {
        MultisigConfig {
            node: NodeSettings {
                cli_path: PathBuf::from(DEFAULT_CLI_PATH),
                cli_args: Vec::new(),
            },
            p2sh_address: None,
            redeem_script: None,
            private_key_source: PrivateKeySource::Prompt,
            batch_size: DEFAULT_BATCH_SIZE,
            fee_default: FeeRate::DEFAULT,
            min_conf: 1,
            max_conf: 9_999_999,
            page_size: 500,
            fee_target_blocks: DEFAULT_FEE_TARGET_BLOCKS,
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            refresh_between_batches: true,
            max_batches: None,
            auto_broadcast: false,
            status_file: None,
        }
    }
}

impl MultisigConfig {
    /// 設定ファイルを読み、コマンドライン引数で上書きする
    pub fn load(args: &CliArgs) -> Result<Self, AppError> {
        let file = match &args.config {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::merge(file, Some(args))
    }

    /// 既定値 < 設定ファイル < コマンドライン の順に優先する
    pub fn merge(file: FileConfig, args: Option<&CliArgs>) -> Result<Self, AppError> {
        let defaults = MultisigConfig::default();
        let mut cli_args = file.cli_args;
        let mut key_env = file.key_env;
        let mut key_file = file.key_file;
        let mut cfg = MultisigConfig {
            node: NodeSettings {
                cli_path: file.cli_path.unwrap_or(defaults.node.cli_path),
                cli_args: Vec::new(),
            },
            p2sh_address: file.p2sh_address,
            redeem_script: file.redeem_script,
            private_key_source: PrivateKeySource::Prompt,
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            fee_default: file.fee_default.map(FeeRate::per_byte).unwrap_or(defaults.fee_default),
            min_conf: file.min_conf.unwrap_or(defaults.min_conf),
            max_conf: file.max_conf.unwrap_or(defaults.max_conf),
            page_size: file.page_size.unwrap_or(defaults.page_size),
            fee_target_blocks: file.fee_target_blocks.unwrap_or(defaults.fee_target_blocks),
            session_dir: file.session_dir.unwrap_or(defaults.session_dir),
            refresh_between_batches: file.refresh_between_batches.unwrap_or(defaults.refresh_between_batches),
            max_batches: file.max_batches,
            auto_broadcast: file.auto_broadcast.unwrap_or(defaults.auto_broadcast),
            status_file: file.status_file,
        };

        if let Some(args) = args {
            if let Some(path) = &args.cli_path {
                cfg.node.cli_path = path.clone();
            }
            if !args.cli_args.is_empty() {
                cli_args = args.cli_args.clone();
            }
            if args.p2sh_address.is_some() {
                cfg.p2sh_address = args.p2sh_address.clone();
            }
            if args.redeem_script.is_some() {
                cfg.redeem_script = args.redeem_script.clone();
            }
            if let Some(n) = args.batch_size {
                cfg.batch_size = n;
            }
            if let Some(fee) = args.fee_default {
                cfg.fee_default = FeeRate::per_byte(fee);
            }
            if let Some(n) = args.min_conf {
                cfg.min_conf = n;
            }
            if let Some(n) = args.max_conf {
                cfg.max_conf = n;
            }
            if let Some(n) = args.page_size {
                cfg.page_size = n;
            }
            if let Some(dir) = &args.session_dir {
                cfg.session_dir = dir.clone();
            }
            if let Some(path) = &args.status_file {
                cfg.status_file = Some(path.clone());
            }
            // コマンドラインで鍵の取得元を指定したらファイルの指定は両方とも無視する
            if args.key_env.is_some() || args.key_file.is_some() {
                key_env = args.key_env.clone();
                key_file = args.key_file.clone();
            }
        }

        cfg.node.cli_args = cli_args;
        cfg.private_key_source = match (key_env, key_file) {
            (Some(_), Some(_)) => {
                return Err(AppError::Validation("keyEnv と keyFile は同時に指定できません".into()));
            }
            (Some(var), None) => PrivateKeySource::Env(var),
            (None, Some(path)) => PrivateKeySource::File(path),
            (None, None) => PrivateKeySource::Prompt,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::Validation("batchSize は1以上を指定してください".into()));
        }
        if self.page_size == 0 {
            return Err(AppError::Validation("pageSize は1以上を指定してください".into()));
        }
        if self.min_conf > self.max_conf {
            return Err(AppError::Validation(format!(
                "minConf ({}) が maxConf ({}) を超えています",
                self.min_conf, self.max_conf
            )));
        }
        if self.fee_default.amount_per_byte() == Amount::ZERO {
            return Err(AppError::Validation("feeDefault は0より大きい値を指定してください".into()));
        }
        Ok(())
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            min_conf: self.min_conf,
            max_conf: self.max_conf,
            page_size: self.page_size,
            skip_address_validation: false,
        }
    }

    pub fn consolidate_options(&self, p2sh_address: &str, redeem_script: &str, fee_rate: FeeRate) -> ConsolidateOptions {
        ConsolidateOptions {
            p2sh_address: p2sh_address.to_string(),
            redeem_script: redeem_script.to_string(),
            batch_size: self.batch_size,
            max_batches: self.max_batches,
            fee_rate,
            refresh_between_batches: self.refresh_between_batches,
            auto_broadcast: self.auto_broadcast,
            fetch: self.fetch_options(),
        }
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, AppError> {
    let content = fs::read_to_string(path).map_err(|e| {
        log::error!("設定ファイルの読み込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    let config: FileConfig = serde_json::from_str(&content).map_err(|e| {
        log::error!("設定JSONのパースに失敗しました。");
        AppError::JsonParse {
            file_path: path.to_path_buf(),
            source: e,
        }
    })?;
    log::debug!("設定ファイルのパース成功: {:?}", config);
    Ok(config)
}
