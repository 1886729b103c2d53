use bitcoin::secp256k1::{All, Secp256k1};
use std::fmt;

use crate::error::AppError;
use crate::guard::{self, GuardVerdict};
use crate::rpc::{DecodedTransaction, NodeRpc};
use crate::script::{MultisigScript, looks_like_der_signature_hex};
use crate::session::SigningSession;
use crate::types::TransactionInput;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SigningState {
    Unsigned,
    PartiallySigned { signatures: usize, required: usize },
    Complete,
}

impl SigningState {
    /// 完了判定はノードの `complete` フラグだけを根拠にする
    pub fn from_counts(signatures: usize, required: usize, complete: bool) -> Self {
        if complete {
            SigningState::Complete
        } else if signatures == 0 {
            SigningState::Unsigned
        } else {
            SigningState::PartiallySigned { signatures, required }
        }
    }
}

impl fmt::Display for SigningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningState::Unsigned => write!(f, "未署名"),
            SigningState::PartiallySigned { signatures, required } => {
                write!(f, "部分署名 ({}/{})", signatures, required)
            }
            SigningState::Complete => write!(f, "署名完了"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub hex: String,
    pub complete: bool,
    /// scriptSig中の署名らしきデータの数 (全入力の合計、目安)
    pub signature_count: usize,
    /// 署名が最も少ない入力の署名数。署名者の人数にあたる。
    pub signers: usize,
    pub state: SigningState,
    pub guard: GuardVerdict,
    pub node_errors: Vec<String>,
}

fn signatures_per_input(decoded: &DecodedTransaction) -> impl Iterator<Item = usize> + '_ {
    decoded.vin.iter().map(|input| {
        input.script_sig.as_ref().map_or(0, |sig| {
            sig.asm
                .split_whitespace()
                .filter(|token| looks_like_der_signature_hex(token))
                .count()
        })
    })
}

/// デコード済みトランザクションのscriptSigに含まれるDER署名らしきトークンを数える
pub fn count_signatures(decoded: &DecodedTransaction) -> usize {
    signatures_per_input(decoded).sum()
}

/// 全入力に共通して入っている署名の数 (入力ごとの最小値)。入力が無ければ0。
pub fn count_signers(decoded: &DecodedTransaction) -> usize {
    signatures_per_input(decoded).min().unwrap_or(0)
}

/// 1つの秘密鍵で1ラウンド署名する
pub fn sign_round(
    node: &dyn NodeRpc,
    secp: &Secp256k1<All>,
    hex: &str,
    inputs: &[TransactionInput],
    wif: &str,
    multisig: &MultisigScript,
) -> Result<SignOutcome, AppError> {
    let verdict = guard::already_signed(node, secp, hex, wif, multisig)?;
    match verdict {
        GuardVerdict::AlreadySigned { input_index } => {
            log::warn!("この鍵は入力 {} に署名済みです。署名を中止します。", input_index);
            return Err(AppError::AlreadySigned { input_index });
        }
        GuardVerdict::Undetermined { existing_signatures } => {
            log::warn!("二重署名チェックができませんでした (既存の署名 {} 個)。署名を続行します。", existing_signatures);
        }
        GuardVerdict::NotSigned => {}
    }

    log::info!("署名を開始します (入力 {} 件)", inputs.len());
    let result = node
        .sign_raw_transaction(hex, inputs, &[wif.to_string()])
        .map_err(|e| e.rpc_into(AppError::Signing))?;
    let node_errors: Vec<String> = result
        .errors
        .iter()
        .map(|e| format!("{}:{} {}", e.txid, e.vout, e.error))
        .collect();

    if !result.complete && result.hex.eq_ignore_ascii_case(hex.trim()) {
        return Err(AppError::Signing(format!(
            "署名が追加されませんでした: {}",
            node_errors.join(", ")
        )));
    }

    let decoded = node
        .decode_raw_transaction(&result.hex)
        .map_err(|e| e.rpc_into(AppError::Decode))?;
    let signature_count = count_signatures(&decoded);
    let signers = count_signers(&decoded);
    let state = SigningState::from_counts(signers, multisig.required, result.complete);
    log::info!("署名ラウンド完了: {} (署名数 {})", state, signature_count);

    Ok(SignOutcome {
        hex: result.hex,
        complete: result.complete,
        signature_count,
        signers,
        state,
        guard: verdict,
        node_errors,
    })
}

/// セッションに1つ署名を加えた新しいセッションを返す。
/// 署名完了済みのセッションには署名しない。
pub fn sign_session(
    node: &dyn NodeRpc,
    secp: &Secp256k1<All>,
    session: &SigningSession,
    wif: &str,
) -> Result<(SigningSession, SignOutcome), AppError> {
    if session.complete {
        return Err(AppError::SessionComplete {
            signatures: session.signatures,
            required: session.required_signatures,
        });
    }
    let multisig = MultisigScript::from_hex(&session.redeem_script)?;
    let outcome = sign_round(node, secp, &session.signed_hex, &session.inputs, wif, &multisig)?;

    let mut next = session.clone();
    next.signed_hex = outcome.hex.clone();
    next.complete = outcome.complete;
    next.signatures = outcome.signers;
    next.required_signatures = multisig.required;
    next.broadcast_txid = None;
    Ok((next, outcome))
}
