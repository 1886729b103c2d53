use bitcoin::{Amount, Denomination};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::error::AppError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 設定を記述したJSONファイルへのパス
    #[clap(short, long, value_parser)]
    pub config: Option<PathBuf>,

    /// bitcoin-cli のパス
    #[clap(long, value_parser)]
    pub cli_path: Option<PathBuf>,

    /// bitcoin-cli に渡す追加引数 (例: -datadir=/data)。複数指定可
    #[clap(long = "cli-arg", value_parser, allow_hyphen_values = true)]
    pub cli_args: Vec<String>,

    /// マルチシグのP2SHアドレス
    #[clap(long, value_parser)]
    pub p2sh_address: Option<String>,

    /// redeemScript (hex)
    #[clap(long, value_parser)]
    pub redeem_script: Option<String>,

    /// 統合時の1バッチあたりの入力数
    #[clap(long, value_parser)]
    pub batch_size: Option<usize>,

    /// 手数料見積もりができない場合のレート (BTC/バイト)
    #[clap(long, value_parser = parse_btc_amount)]
    pub fee_default: Option<Amount>,

    /// 署名セッションを保存するディレクトリ
    #[clap(long, value_parser)]
    pub session_dir: Option<PathBuf>,

    /// 秘密鍵(WIF)を読む環境変数名
    #[clap(long, value_parser, conflicts_with = "key_file")]
    pub key_env: Option<String>,

    /// 秘密鍵(WIF)を読むファイル
    #[clap(long, value_parser)]
    pub key_file: Option<PathBuf>,

    #[clap(long, value_parser)]
    pub min_conf: Option<u32>,

    #[clap(long, value_parser)]
    pub max_conf: Option<u32>,

    /// listunspent のページサイズ
    #[clap(long, value_parser)]
    pub page_size: Option<usize>,

    /// 残高スナップショットを書き出すファイル
    #[clap(long, value_parser)]
    pub status_file: Option<PathBuf>,

    /// 確認をすべて「はい」で進める (検証スキップや未完了送信の確認は除く)
    #[clap(short = 'y', long)]
    pub yes: bool,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// 対話メニュー (既定)
    Menu,
    /// 送金トランザクションを作成して署名する
    Send {
        #[clap(long)]
        to: Option<String>,
        #[clap(long, value_parser = parse_btc_amount)]
        amount: Option<Amount>,
    },
    /// 保存済みセッションに部分署名する
    Sign {
        #[clap(long)]
        session: Option<PathBuf>,
    },
    /// 署名済みトランザクションを送信する
    Broadcast {
        #[clap(long)]
        session: Option<PathBuf>,
    },
    /// UTXOをバッチに分けて統合する
    Consolidate {
        #[clap(long)]
        max_batches: Option<usize>,
        #[clap(long)]
        auto_broadcast: bool,
    },
    /// 残高とUTXO数を表示する
    Status,
}

pub fn parse_btc_amount(s: &str) -> Result<Amount, AppError> {
    Amount::from_str_in(s.trim(), Denomination::Bitcoin)
        .map_err(|e| AppError::Validation(format!("無効な金額が指定されました: {} ({})", s, e)))
}
