//! 同じ秘密鍵で二重に署名するのを防ぐためのチェック。
//!
//! 公開鍵が導出でき、トランザクションをローカルでデシリアライズできる場合は
//! 既存の各署名をその公開鍵で検証する。デシリアライズできない場合は
//! ノードのデコード結果 (asm) から公開鍵を探す。公開鍵が導出できない場合は
//! 判定不能として署名を許可する。

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{PublicKey, Transaction};

use crate::error::AppError;
use crate::rpc::NodeRpc;
use crate::script::{MultisigScript, signature_pushes};
use crate::signing::count_signatures;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    NotSigned,
    AlreadySigned { input_index: usize },
    /// 公開鍵が分からず判定できない。既存の署名数は参考情報。
    Undetermined { existing_signatures: usize },
}

/// WIF形式の秘密鍵から公開鍵を導出する。バージョンバイトは問わない。
pub fn derive_public_key(secp: &Secp256k1<All>, wif: &str) -> Result<PublicKey, AppError> {
    let data = bitcoin::base58::decode_check(wif.trim())
        .map_err(|e| AppError::Validation(format!("WIFのデコードに失敗しました: {}", e)))?;
    let compressed = match data.len() {
        33 => false,
        34 if data[33] == 0x01 => true,
        n => return Err(AppError::Validation(format!("WIFの長さが不正です: {} バイト", n))),
    };
    let secret = SecretKey::from_slice(&data[1..33])
        .map_err(|e| AppError::Validation(format!("秘密鍵が不正です: {}", e)))?;
    Ok(PublicKey {
        compressed,
        inner: secret.public_key(secp),
    })
}

pub fn already_signed(
    node: &dyn NodeRpc,
    secp: &Secp256k1<All>,
    raw_hex: &str,
    wif: &str,
    multisig: &MultisigScript,
) -> Result<GuardVerdict, AppError> {
    let key = match derive_public_key(secp, wif) {
        Ok(key) => key,
        Err(e) => {
            let existing_signatures = node
                .decode_raw_transaction(raw_hex)
                .map(|decoded| count_signatures(&decoded))
                .unwrap_or(0);
            log::warn!(
                "公開鍵を導出できないため二重署名チェックを省略します ({})。既存の署名数: {}",
                e,
                existing_signatures
            );
            return Ok(GuardVerdict::Undetermined { existing_signatures });
        }
    };

    if !multisig.contains(&key) {
        return Err(AppError::Signing(format!(
            "この秘密鍵の公開鍵 {} はredeemScriptの参加者ではありません",
            key
        )));
    }

    let decoded_locally = hex::decode(raw_hex.trim())
        .ok()
        .and_then(|bytes| encode::deserialize::<Transaction>(&bytes).ok());
    match decoded_locally {
        Some(tx) => verify_existing_signatures(secp, &tx, &key, multisig),
        None => {
            log::debug!("ローカルでデコードできないためasm検索で判定します。");
            scan_decoded_asm(node, raw_hex, &key)
        }
    }
}

fn verify_existing_signatures(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    key: &PublicKey,
    multisig: &MultisigScript,
) -> Result<GuardVerdict, AppError> {
    let cache = SighashCache::new(tx);
    for (input_index, input) in tx.input.iter().enumerate() {
        for sig_bytes in signature_pushes(&input.script_sig)? {
            let Ok(sig) = bitcoin::ecdsa::Signature::from_slice(&sig_bytes) else {
                continue;
            };
            let sighash = cache
                .legacy_signature_hash(input_index, &multisig.script, sig.sighash_type.to_u32())
                .map_err(|e| AppError::Internal(format!("sighash計算失敗 (入力 {}): {}", input_index, e)))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let mut signature = sig.signature;
            signature.normalize_s();
            if secp.verify_ecdsa(&message, &signature, &key.inner).is_ok() {
                return Ok(GuardVerdict::AlreadySigned { input_index });
            }
        }
    }
    Ok(GuardVerdict::NotSigned)
}

fn scan_decoded_asm(node: &dyn NodeRpc, raw_hex: &str, key: &PublicKey) -> Result<GuardVerdict, AppError> {
    let decoded = node
        .decode_raw_transaction(raw_hex)
        .map_err(|e| e.rpc_into(AppError::Decode))?;
    let key_hex = key.to_string();

    for (input_index, input) in decoded.vin.iter().enumerate() {
        let Some(script_sig) = &input.script_sig else { continue };
        let tokens: Vec<&str> = script_sig.asm.split_whitespace().collect();
        // 末尾のredeemScriptには全員の公開鍵が入っているので除く
        let body = tokens.split_last().map(|(_, rest)| rest).unwrap_or_default();
        if body.iter().any(|t| t.eq_ignore_ascii_case(&key_hex)) {
            return Ok(GuardVerdict::AlreadySigned { input_index });
        }
    }

    match count_signatures(&decoded) {
        0 => Ok(GuardVerdict::NotSigned),
        existing_signatures => Ok(GuardVerdict::Undetermined { existing_signatures }),
    }
}
