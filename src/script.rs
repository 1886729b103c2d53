use bitcoin::blockdata::script::Instruction;
use bitcoin::opcodes::Opcode;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::{PublicKey, Script, ScriptBuf};

use crate::error::AppError;
use crate::rpc::NodeRpc;
use crate::types::ScriptKind;

/// DER署名 (sighashバイト込み) とみなすバイト長の範囲
pub const DER_SIG_MIN_LEN: usize = 60;
pub const DER_SIG_MAX_LEN: usize = 73;

/// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG` 形式のredeemScript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigScript {
    pub required: usize,
    pub pubkeys: Vec<PublicKey>,
    pub script: ScriptBuf,
}

impl MultisigScript {
    pub fn from_hex(script_hex: &str) -> Result<Self, AppError> {
        let bytes = hex::decode(script_hex.trim())
            .map_err(|e| AppError::Decode(format!("redeemScriptのhexデコード失敗: {}", e)))?;
        Self::parse(ScriptBuf::from_bytes(bytes))
    }

    pub fn parse(script: ScriptBuf) -> Result<Self, AppError> {
        let not_multisig = |detail: &str| {
            AppError::Validation(format!("マルチシグのredeemScriptではありません ({}): {}", detail, script.to_hex_string()))
        };

        let mut instructions = Vec::new();
        for instruction in script.instructions() {
            instructions.push(instruction.map_err(|e| AppError::Decode(format!("スクリプト解析失敗: {}", e)))?);
        }
        if instructions.len() < 4 {
            return Err(not_multisig("命令数不足"));
        }

        let required = match instructions[0] {
            Instruction::Op(op) => small_int(op),
            _ => None,
        }
        .ok_or_else(|| not_multisig("必要署名数"))?;

        let last = instructions.len() - 1;
        if instructions[last] != Instruction::Op(OP_CHECKMULTISIG) {
            return Err(not_multisig("OP_CHECKMULTISIGがありません"));
        }
        let total = match instructions[last - 1] {
            Instruction::Op(op) => small_int(op),
            _ => None,
        }
        .ok_or_else(|| not_multisig("公開鍵数"))?;

        let mut pubkeys = Vec::with_capacity(total);
        for instruction in &instructions[1..last - 1] {
            match instruction {
                Instruction::PushBytes(bytes) => {
                    let key = PublicKey::from_slice(bytes.as_bytes())
                        .map_err(|e| AppError::Validation(format!("redeemScript内の公開鍵が不正です: {}", e)))?;
                    pubkeys.push(key);
                }
                Instruction::Op(_) => return Err(not_multisig("公開鍵以外の命令")),
            }
        }

        if pubkeys.len() != total || required > total {
            return Err(not_multisig("m/nの不整合"));
        }

        Ok(MultisigScript { required, pubkeys, script })
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.pubkeys.iter().any(|k| k.inner == key.inner)
    }
}

/// ノードの `decodescript` でredeemScriptを検証し、必要署名数を返す。
/// 導出されたP2SHアドレスが設定値と違えばそれ以上ノードを呼ばずに失敗する。
pub fn validate_redeem_script(node: &dyn NodeRpc, redeem_hex: &str, p2sh_address: &str) -> Result<usize, AppError> {
    let decoded = node
        .decode_script(redeem_hex)
        .map_err(|e| e.rpc_into(AppError::Validation))?;
    if decoded.kind != ScriptKind::Multisig {
        return Err(AppError::Validation(format!(
            "redeemScriptの種類がmultisigではありません: {:?}",
            decoded.kind
        )));
    }
    let required = decoded
        .req_sigs
        .filter(|n| *n > 0)
        .ok_or_else(|| AppError::Validation("redeemScriptの必要署名数を取得できません".into()))?;
    let derived = decoded
        .p2sh
        .ok_or_else(|| AppError::Validation("redeemScriptからP2SHアドレスを導出できません".into()))?;
    if derived != p2sh_address {
        return Err(AppError::RedeemScriptMismatch {
            configured: p2sh_address.to_string(),
            derived,
        });
    }
    log::info!("redeemScriptを確認しました: {}-of-n, {}", required, derived);
    Ok(required)
}

fn small_int(op: Opcode) -> Option<usize> {
    let byte = op.to_u8();
    if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&byte) {
        Some((byte - OP_PUSHNUM_1.to_u8() + 1) as usize)
    } else {
        None
    }
}

pub fn looks_like_der_signature(bytes: &[u8]) -> bool {
    (DER_SIG_MIN_LEN..=DER_SIG_MAX_LEN).contains(&bytes.len()) && bytes[0] == 0x30
}

/// asm表記のトークン (例: `3044...[ALL]`) が署名に見えるか
pub fn looks_like_der_signature_hex(token: &str) -> bool {
    let hex_part = token.split('[').next().unwrap_or_default();
    match hex::decode(hex_part) {
        // asmではsighashバイトが `[ALL]` に置き換わっているので1バイト補う
        Ok(bytes) if token.contains('[') => {
            (DER_SIG_MIN_LEN - 1..DER_SIG_MAX_LEN).contains(&bytes.len()) && bytes.first() == Some(&0x30)
        }
        Ok(bytes) => looks_like_der_signature(&bytes),
        Err(_) => false,
    }
}

/// P2SHマルチシグのscriptSigから署名のプッシュだけを取り出す。
/// 先頭の `OP_0` と末尾のredeemScriptは除外する。
pub fn signature_pushes(script_sig: &Script) -> Result<Vec<Vec<u8>>, AppError> {
    let mut pushes = Vec::new();
    for instruction in script_sig.instructions() {
        match instruction.map_err(|e| AppError::Decode(format!("scriptSig解析失敗: {}", e)))? {
            Instruction::PushBytes(bytes) if !bytes.is_empty() => pushes.push(bytes.as_bytes().to_vec()),
            _ => {}
        }
    }
    Ok(pushes.into_iter().filter(|p| looks_like_der_signature(p)).collect())
}
