//! 大量のUTXOを一定数ずつのバッチに分け、バッチごとに統合トランザクションを作る。
//!
//! バッチ全体はアトミックではない。N番目のバッチが失敗しても、それ以前の
//! バッチ (送信済みのものを含む) は取り消さず、以降のバッチを中止するだけ。

use bitcoin::Amount;
use bitcoin::secp256k1::{All, Secp256k1};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::broadcast::broadcast_session;
use crate::error::AppError;
use crate::rpc::NodeRpc;
use crate::script::MultisigScript;
use crate::session::{SessionStore, SigningSession};
use crate::signing::{SigningState, sign_session};
use crate::transaction::build_consolidation;
use crate::types::{FeeRate, Utxo};
use crate::utxo::{FetchOptions, fetch_utxos};

pub const DEFAULT_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBatch {
    /// 1始まりのバッチ番号
    pub number: usize,
    pub utxos: Vec<Utxo>,
}

impl TransactionBatch {
    pub fn total(&self) -> Amount {
        self.utxos.iter().map(|u| u.amount).sum()
    }
}

/// ソート済みのUTXOを先頭から `batch_size` 件ずつ区切る
pub fn plan_batches(utxos: &[Utxo], batch_size: usize) -> Vec<TransactionBatch> {
    utxos
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| TransactionBatch {
            number: i + 1,
            utxos: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ConsolidateOptions {
    pub p2sh_address: String,
    pub redeem_script: String,
    pub batch_size: usize,
    pub max_batches: Option<usize>,
    pub fee_rate: FeeRate,
    /// 送信済みバッチがある場合、次のバッチの前にUTXOを取り直す
    pub refresh_between_batches: bool,
    pub auto_broadcast: bool,
    pub fetch: FetchOptions,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub number: usize,
    pub input_count: usize,
    /// 取り直しの結果、使用済みとして外した入力の数
    pub dropped_inputs: usize,
    pub total_in: Amount,
    pub fee: Amount,
    pub output: Amount,
    pub session_path: PathBuf,
    pub state: SigningState,
    pub txid: Option<String>,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub number: usize,
    pub error: AppError,
}

#[derive(Debug)]
pub struct ConsolidationReport {
    pub planned_batches: usize,
    pub batches: Vec<BatchResult>,
    pub failure: Option<BatchFailure>,
    /// 今回処理しなかった (計画済みの) UTXOの数
    pub leftover: usize,
    /// 計画後に現れた、今回のバッチ以外が作ったUTXOの数
    pub new_since_plan: usize,
    pub further_rounds: usize,
}

/// 計画したバッチを順番に構築・署名・保存 (必要なら送信) する
pub fn consolidate(
    node: &dyn NodeRpc,
    secp: &Secp256k1<All>,
    store: &SessionStore,
    utxos: &[Utxo],
    signing_keys: &[String],
    options: &ConsolidateOptions,
) -> Result<ConsolidationReport, AppError> {
    let multisig = MultisigScript::from_hex(&options.redeem_script)?;
    let plan = plan_batches(utxos, options.batch_size);
    let to_run = options.max_batches.map_or(plan.len(), |max| max.min(plan.len()));
    log::info!(
        "UTXO {} 件を {} バッチに分割しました (今回 {} バッチを処理)",
        utxos.len(),
        plan.len(),
        to_run
    );

    let mut results: Vec<BatchResult> = Vec::new();
    let mut failure = None;
    let mut broadcast_txids: Vec<String> = Vec::new();
    let mut processed = 0;

    for batch in plan.iter().take(to_run) {
        let mut inputs = batch.utxos.clone();
        let mut dropped_inputs = 0;

        if options.refresh_between_batches && !broadcast_txids.is_empty() {
            match fetch_utxos(node, &options.p2sh_address, &options.fetch) {
                Ok(current) => dropped_inputs = retain_unspent(&mut inputs, &current),
                Err(e) => {
                    failure = Some(BatchFailure { number: batch.number, error: e });
                    break;
                }
            }
            if dropped_inputs > 0 {
                log::warn!("バッチ {}: 使用済みのUTXO {} 件を除外しました", batch.number, dropped_inputs);
            }
        }
        processed += batch.utxos.len();

        if inputs.is_empty() {
            log::warn!("バッチ {} は有効な入力が無いためスキップします", batch.number);
            continue;
        }

        match run_batch(node, secp, store, batch.number, &inputs, signing_keys, &multisig, options) {
            Ok(mut result) => {
                result.dropped_inputs = dropped_inputs;
                if let Some(txid) = &result.txid {
                    broadcast_txids.push(txid.clone());
                }
                log::info!("バッチ {} 完了: {} ({} 入力)", result.number, result.state, result.input_count);
                results.push(result);
            }
            Err(e) => {
                log::error!("バッチ {} で失敗しました。以降のバッチを中止します: {}", batch.number, e);
                processed -= batch.utxos.len();
                failure = Some(BatchFailure { number: batch.number, error: e });
                break;
            }
        }
    }

    let leftover = utxos.len() - processed;
    let new_since_plan = if options.refresh_between_batches && !broadcast_txids.is_empty() {
        count_new_utxos(node, utxos, &broadcast_txids, options)
    } else {
        0
    };
    let batch_size = options.batch_size.max(1);
    let further_rounds = (leftover + new_since_plan).div_ceil(batch_size);
    if leftover + new_since_plan > 0 {
        log::info!(
            "未統合のUTXOが {} 件残っています。あと約 {} 回の実行が必要です。",
            leftover + new_since_plan,
            further_rounds
        );
    }

    Ok(ConsolidationReport {
        planned_batches: plan.len(),
        batches: results,
        failure,
        leftover,
        new_since_plan,
        further_rounds,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_batch(
    node: &dyn NodeRpc,
    secp: &Secp256k1<All>,
    store: &SessionStore,
    number: usize,
    inputs: &[Utxo],
    signing_keys: &[String],
    multisig: &MultisigScript,
    options: &ConsolidateOptions,
) -> Result<BatchResult, AppError> {
    let built = build_consolidation(node, inputs, &options.p2sh_address, options.fee_rate)?;
    let output = built.total_in - built.fee;

    let mut session = SigningSession::unsigned(
        &options.p2sh_address,
        &options.redeem_script,
        built.signing_inputs(&options.redeem_script),
        built.hex,
        multisig.required,
        Some(number),
    );
    for key in signing_keys {
        if session.complete {
            break;
        }
        session = sign_session(node, secp, &session, key)?.0;
    }

    let session_path = store.save(&session)?;
    let txid = if options.auto_broadcast && session.complete {
        Some(broadcast_session(node, store, &session_path, &session, false)?)
    } else {
        None
    };

    Ok(BatchResult {
        number,
        input_count: inputs.len(),
        dropped_inputs: 0,
        total_in: built.total_in,
        fee: built.fee,
        output,
        session_path,
        state: SigningState::from_counts(session.signatures, session.required_signatures, session.complete),
        txid,
    })
}

/// `current` に存在しない入力を取り除き、除いた数を返す
pub fn retain_unspent(inputs: &mut Vec<Utxo>, current: &[Utxo]) -> usize {
    let unspent: HashSet<(&str, u32)> = current.iter().map(Utxo::key).collect();
    let before = inputs.len();
    inputs.retain(|u| unspent.contains(&u.key()));
    before - inputs.len()
}

fn count_new_utxos(node: &dyn NodeRpc, snapshot: &[Utxo], own_txids: &[String], options: &ConsolidateOptions) -> usize {
    let known: HashSet<(&str, u32)> = snapshot.iter().map(Utxo::key).collect();
    match fetch_utxos(node, &options.p2sh_address, &options.fetch) {
        Ok(current) => current
            .iter()
            .filter(|u| !known.contains(&u.key()) && !own_txids.contains(&u.txid))
            .count(),
        Err(e) => {
            log::debug!("残りUTXOの確認に失敗しました: {}", e);
            0
        }
    }
}
