//! ノード (bitcoind系) のRPC機能を抽象化する。
//!
//! コアは `NodeRpc` トレイトだけに依存し、実際の転送手段 (CLIプロセス、
//! JSON-RPCソケット、テストダブル) は実装側が決める。

use bitcoin::Amount;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use crate::error::AppError;
use crate::types::{OutPointRef, ScriptKind, TransactionInput, Utxo, btc_amount, btc_number};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressValidation {
    pub isvalid: bool,
    #[serde(default)]
    pub script_pub_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedScript {
    #[serde(rename = "type")]
    pub kind: ScriptKind,
    #[serde(default)]
    pub req_sigs: Option<usize>,
    #[serde(default)]
    pub p2sh: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeeEstimate {
    Rate(Amount),
    /// ノードが `-1` を返した (見積り不能)
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignResult {
    pub hex: String,
    pub complete: bool,
    #[serde(default)]
    pub errors: Vec<SignInputError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInputError {
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodedTransaction {
    pub txid: String,
    pub vin: Vec<DecodedInput>,
    pub vout: Vec<DecodedOutput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedInput {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub script_sig: Option<ScriptSig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptSig {
    #[serde(default)]
    pub asm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedOutput {
    #[serde(with = "btc_amount")]
    pub value: Amount,
    pub script_pub_key: DecodedScriptPubKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecodedScriptPubKey {
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl DecodedScriptPubKey {
    /// 新旧両方のノード出力形式からアドレスを取り出す
    pub fn display_address(&self) -> String {
        self.address
            .clone()
            .or_else(|| self.addresses.first().cloned())
            .unwrap_or_else(|| format!("(script {})", self.hex))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletTransaction {
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub blockhash: Option<String>,
}

/// カーソル付き `listunspent` の1ページ要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentCursor {
    pub after: Option<OutPointRef>,
    pub limit: usize,
}

pub trait NodeRpc: Send + Sync {
    /// RPCメソッドを1回呼び出し、結果のJSONを返す。
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AppError>;

    fn validate_address(&self, address: &str) -> Result<AddressValidation, AppError> {
        call_typed(self, "validateaddress", vec![json!(address)])
    }

    fn decode_script(&self, script_hex: &str) -> Result<DecodedScript, AppError> {
        call_typed(self, "decodescript", vec![json!(script_hex)])
    }

    fn list_unspent(&self, min_conf: u32, max_conf: u32, address: &str) -> Result<Vec<Utxo>, AppError> {
        call_typed(self, "listunspent", vec![json!(min_conf), json!(max_conf), json!([address])])
    }

    /// カーソル指定のページ取得。未対応のノードでは `Ok(None)` を返す。
    fn list_unspent_page(
        &self,
        _min_conf: u32,
        _max_conf: u32,
        _address: &str,
        _cursor: &UnspentCursor,
    ) -> Result<Option<Vec<Utxo>>, AppError> {
        Ok(None)
    }

    fn estimate_fee(&self, target_blocks: u32) -> Result<FeeEstimate, AppError> {
        let value = self.call("estimatefee", vec![json!(target_blocks)])?;
        let number = match &value {
            Value::Number(n) => n.clone(),
            // estimatesmartfee 形式 {"feerate": ..} にも対応
            Value::Object(map) => match map.get("feerate") {
                Some(Value::Number(n)) => n.clone(),
                _ => return Ok(FeeEstimate::Unknown),
            },
            other => {
                return Err(AppError::Rpc {
                    method: "estimatefee".into(),
                    message: format!("想定外の応答: {}", other),
                });
            }
        };
        if number.as_f64().is_some_and(|f| f <= 0.0) {
            return Ok(FeeEstimate::Unknown);
        }
        crate::types::parse_btc_number(&number)
            .map(FeeEstimate::Rate)
            .map_err(|message| AppError::Rpc { method: "estimatefee".into(), message })
    }

    fn create_raw_transaction(
        &self,
        inputs: &[OutPointRef],
        outputs: &BTreeMap<String, Amount>,
    ) -> Result<String, AppError> {
        let mut out_map = serde_json::Map::new();
        for (address, amount) in outputs {
            let number = btc_number(*amount).map_err(AppError::Internal)?;
            out_map.insert(address.clone(), Value::Number(number));
        }
        let value = self.call(
            "createrawtransaction",
            vec![serde_json::to_value(inputs)?, Value::Object(out_map)],
        )?;
        expect_string("createrawtransaction", value)
    }

    fn sign_raw_transaction(
        &self,
        hex: &str,
        inputs: &[TransactionInput],
        private_keys: &[String],
    ) -> Result<SignResult, AppError> {
        call_typed(
            self,
            "signrawtransaction",
            vec![json!(hex), serde_json::to_value(inputs)?, json!(private_keys)],
        )
    }

    fn decode_raw_transaction(&self, hex: &str) -> Result<DecodedTransaction, AppError> {
        call_typed(self, "decoderawtransaction", vec![json!(hex)])
    }

    fn send_raw_transaction(&self, hex: &str) -> Result<String, AppError> {
        let value = self.call("sendrawtransaction", vec![json!(hex)])?;
        expect_string("sendrawtransaction", value)
    }

    fn get_transaction(&self, txid: &str) -> Result<WalletTransaction, AppError> {
        call_typed(self, "gettransaction", vec![json!(txid)])
    }
}

fn call_typed<T: DeserializeOwned, N: NodeRpc + ?Sized>(
    node: &N,
    method: &str,
    params: Vec<Value>,
) -> Result<T, AppError> {
    let value = node.call(method, params)?;
    serde_json::from_value(value).map_err(|e| AppError::Rpc {
        method: method.to_string(),
        message: format!("応答の解釈に失敗しました: {}", e),
    })
}

fn expect_string(method: &str, value: Value) -> Result<String, AppError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s),
        other => Err(AppError::Rpc {
            method: method.to_string(),
            message: format!("文字列の応答を期待しましたが {} を受け取りました", other),
        }),
    }
}

/// コインのCLIバイナリ (`bitcoin-cli` 等) を子プロセスとして呼び出すノード実装
#[derive(Debug, Clone)]
pub struct CliNode {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
}

impl CliNode {
    pub fn new(binary: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        CliNode {
            binary: binary.into(),
            extra_args,
        }
    }

    fn render_param(param: &Value) -> String {
        match param {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl NodeRpc for CliNode {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AppError> {
        let args: Vec<String> = params.iter().map(Self::render_param).collect();
        log::debug!("ノード呼び出し: {} {} (引数 {} 個)", self.binary.display(), method, args.len());

        let output = Command::new(&self.binary)
            .args(&self.extra_args)
            .arg(method)
            .args(&args)
            .output()
            .map_err(|e| AppError::Rpc {
                method: method.to_string(),
                message: format!("{} を実行できません: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log::warn!("ノード呼び出し失敗: {} -> {}", method, stderr);
            return Err(AppError::Rpc {
                method: method.to_string(),
                message: stderr,
            });
        }
        Ok(parse_cli_output(&output.stdout))
    }
}

/// CLIの標準出力はJSONか、JSONでない裸の文字列 (hexやtxid) のどちらか
pub fn parse_cli_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
