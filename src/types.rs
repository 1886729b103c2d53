use bitcoin::{Amount, Denomination};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// 手数料見積りに使うトランザクションサイズの基本値 (バイト)
pub const BASE_TX_SIZE_BYTES: u64 = 250;
/// 入力1つ増えるごとに加算するサイズ (バイト)
pub const PER_INPUT_SIZE_BYTES: u64 = 100;

/// ノードの `listunspent` が返すUTXO。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    #[serde(with = "btc_amount")]
    pub amount: Amount,
    pub script_pub_key: String,
}

impl Utxo {
    pub fn out_point(&self) -> OutPointRef {
        OutPointRef {
            txid: self.txid.clone(),
            vout: self.vout,
        }
    }

    pub fn to_signing_input(&self, redeem_script: &str) -> TransactionInput {
        TransactionInput {
            txid: self.txid.clone(),
            vout: self.vout,
            script_pub_key: self.script_pub_key.clone(),
            redeem_script: redeem_script.to_string(),
        }
    }

    pub fn key(&self) -> (&str, u32) {
        (&self.txid, self.vout)
    }
}

/// `createrawtransaction` に渡す入力 `{txid, vout}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPointRef {
    pub txid: String,
    pub vout: u32,
}

/// `signrawtransaction` に渡す署名時の入力表現
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInput {
    pub txid: String,
    pub vout: u32,
    pub script_pub_key: String,
    pub redeem_script: String,
}

/// `decodescript` が返すスクリプト種別
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Multisig,
    Scripthash,
    Pubkeyhash,
    Pubkey,
    Nonstandard,
    #[serde(other)]
    Other,
}

/// 1バイトあたりの手数料
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeeRate(Amount);

impl FeeRate {
    pub const DEFAULT: FeeRate = FeeRate(Amount::from_sat(10_000)); // 0.0001

    pub fn per_byte(amount: Amount) -> Self {
        FeeRate(amount)
    }

    pub fn amount_per_byte(&self) -> Amount {
        self.0
    }

    /// 入力数から見積った手数料。サイズは概算であり正確なバイト数ではない。
    pub fn fee_for_inputs(&self, input_count: usize) -> Result<Amount, AppError> {
        let size = estimated_tx_size(input_count);
        self.0.checked_mul(size).ok_or_else(|| {
            AppError::Build(format!("手数料計算がオーバーフローしました (入力数 {})", input_count))
        })
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/byte", self.0.display_in(Denomination::Bitcoin).show_denomination())
    }
}

pub fn estimated_tx_size(input_count: usize) -> u64 {
    BASE_TX_SIZE_BYTES + PER_INPUT_SIZE_BYTES * (input_count.saturating_sub(1) as u64)
}

pub fn parse_btc_number(number: &serde_json::Number) -> Result<Amount, String> {
    let text = number.to_string();
    match Amount::from_str_in(&text, Denomination::Bitcoin) {
        Ok(amount) => Ok(amount),
        // 指数表記などはf64経由で8桁に丸める
        Err(e) => number
            .as_f64()
            .ok_or_else(|| format!("金額として解釈できません ({}): {}", text, e))
            .and_then(|f| Amount::from_btc(f).map_err(|e| format!("金額として解釈できません ({}): {}", text, e))),
    }
}

pub fn btc_number(amount: Amount) -> Result<serde_json::Number, String> {
    amount
        .to_string_in(Denomination::Bitcoin)
        .parse::<serde_json::Number>()
        .map_err(|e| format!("金額をJSON数値に変換できません ({}): {}", amount, e))
}

/// 金額をBTC単位の10進JSON数値として読み書きする
pub mod btc_amount {
    use bitcoin::Amount;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        super::btc_number(*amount)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        super::parse_btc_number(&number).map_err(serde::de::Error::custom)
    }
}
