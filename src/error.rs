use std::path::PathBuf;
use bitcoin::Amount;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON処理エラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ノード呼び出しエラー ({method}): {message}")]
    Rpc { method: String, message: String },

    #[error("入力検証エラー: {0}")]
    Validation(String),

    #[error("無効なアドレスです: {address}")]
    AddressInvalid { address: String },

    #[error("redeemScriptから導出したP2SHアドレス ({derived}) が設定値 ({configured}) と一致しません")]
    RedeemScriptMismatch { configured: String, derived: String },

    #[error("セッションファイルの{field}が一致しません: 期待値 {expected}, ファイル内 {found}")]
    SessionMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("UTXO取得エラー: {0}")]
    Fetch(String),

    #[error("資金不足: 利用可能な総額 {available}, 要求額 {required} (手数料 {fee} を含む)")]
    InsufficientFunds {
        available: Amount,
        required: Amount,
        fee: Amount,
    },

    #[error("トランザクション構築エラー: {0}")]
    Build(String),

    #[error("署名エラー: {0}")]
    Signing(String),

    #[error("この秘密鍵は既に署名済みです (入力インデックス {input_index})")]
    AlreadySigned { input_index: usize },

    #[error("トランザクションは既に署名完了しています ({signatures}/{required})")]
    SessionComplete { signatures: usize, required: usize },

    #[error("デコードエラー: {0}")]
    Decode(String),

    #[error("ブロードキャストエラー: {0}")]
    Broadcast(String),

    #[error("署名が完了していないトランザクションです ({signatures}/{required})")]
    IncompleteTransaction { signatures: usize, required: usize },

    #[error("内部エラー: {0}")]
    Internal(String),
}

impl AppError {
    /// ノード呼び出しの失敗を操作ごとのエラー種別に変換する。
    /// それ以外のエラーはそのまま返す。
    pub fn rpc_into(self, wrap: fn(String) -> AppError) -> AppError {
        match self {
            AppError::Rpc { method, message } => wrap(format!("{}: {}", method, message)),
            other => other,
        }
    }
}
