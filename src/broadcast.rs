use bitcoin::Amount;
use std::fmt;
use std::path::Path;

use crate::error::AppError;
use crate::rpc::NodeRpc;
use crate::session::{SessionStore, SigningSession};
use crate::signing::{count_signatures, count_signers};

/// 送信前に表示するトランザクションの概要
#[derive(Debug, Clone)]
pub struct TxSummary {
    pub txid: String,
    pub input_count: usize,
    pub outputs: Vec<(String, Amount)>,
    pub total_out: Amount,
    pub signature_count: usize,
    /// 入力ごとの署名数の最小値
    pub signers: usize,
}

impl fmt::Display for TxSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "txid: {}", self.txid)?;
        writeln!(f, "入力数: {} / 署名数(目安): {}", self.input_count, self.signature_count)?;
        for (address, amount) in &self.outputs {
            writeln!(f, "  -> {} : {}", address, amount)?;
        }
        write!(f, "出力合計: {}", self.total_out)
    }
}

/// 署名の状態。セッションファイルならファイルの値、hexだけなら推定値。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub complete: bool,
    pub signatures: usize,
    pub required: usize,
}

impl Readiness {
    pub fn of_session(session: &SigningSession) -> Self {
        Readiness {
            complete: session.complete,
            signatures: session.signatures,
            required: session.required_signatures,
        }
    }

    /// hexしかない場合は、どの入力にも必要数の署名があるかで判断する
    pub fn estimate(summary: &TxSummary, required: usize) -> Self {
        Readiness {
            complete: summary.input_count > 0 && summary.signers >= required,
            signatures: summary.signers,
            required,
        }
    }
}

pub fn summarize(node: &dyn NodeRpc, hex: &str) -> Result<TxSummary, AppError> {
    let decoded = node
        .decode_raw_transaction(hex)
        .map_err(|e| e.rpc_into(AppError::Decode))?;
    let outputs: Vec<(String, Amount)> = decoded
        .vout
        .iter()
        .map(|o| (o.script_pub_key.display_address(), o.value))
        .collect();
    let total_out = outputs
        .iter()
        .try_fold(Amount::ZERO, |acc, (_, v)| acc.checked_add(*v))
        .ok_or_else(|| AppError::Decode("出力合計がオーバーフローしました".into()))?;
    Ok(TxSummary {
        txid: decoded.txid.clone(),
        input_count: decoded.vin.len(),
        signature_count: count_signatures(&decoded),
        signers: count_signers(&decoded),
        outputs,
        total_out,
    })
}

/// 署名済みトランザクションを送信し、txidを返す。
/// 署名が完了していなければ `allow_incomplete` が無い限り拒否する。
pub fn broadcast(
    node: &dyn NodeRpc,
    hex: &str,
    readiness: Readiness,
    allow_incomplete: bool,
) -> Result<String, AppError> {
    if !readiness.complete {
        if !allow_incomplete {
            return Err(AppError::IncompleteTransaction {
                signatures: readiness.signatures,
                required: readiness.required,
            });
        }
        log::warn!("署名未完了のトランザクションを強制送信します ({}/{})", readiness.signatures, readiness.required);
    }

    let txid = node
        .send_raw_transaction(hex)
        .map_err(|e| e.rpc_into(AppError::Broadcast))?;
    log::info!("トランザクションを送信しました: {}", txid);

    match node.get_transaction(&txid) {
        Ok(tx) => log::info!(
            "ウォレット上の承認数: {} (ブロック: {})",
            tx.confirmations,
            tx.blockhash.as_deref().unwrap_or("未取り込み")
        ),
        Err(e) => log::debug!("gettransactionで確認できませんでした: {}", e),
    }
    Ok(txid)
}

/// セッションを送信し、結果のtxidをセッションファイルに書き戻す
pub fn broadcast_session(
    node: &dyn NodeRpc,
    store: &SessionStore,
    path: &Path,
    session: &SigningSession,
    allow_incomplete: bool,
) -> Result<String, AppError> {
    if let Some(txid) = &session.broadcast_txid {
        return Err(AppError::Broadcast(format!("このセッションは送信済みです: {}", txid)));
    }
    let txid = broadcast(node, &session.signed_hex, Readiness::of_session(session), allow_incomplete)?;

    let mut recorded = session.clone();
    recorded.broadcast_txid = Some(txid.clone());
    if let Err(e) = store.write(path, &recorded) {
        log::error!("txidの記録に失敗しました ({}): {}", txid, e);
    }
    Ok(txid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use crate::signing::sign_session;
    use crate::testutil::{self, MockNode};
    use crate::transaction::build_send;
    use crate::types::FeeRate;

    fn session(node: &MockNode, signers: &[usize]) -> SigningSession {
        let utxos = testutil::utxos(&[80_000, 20_000]);
        let built = build_send(
            node,
            &utxos,
            &testutil::destination(),
            Amount::from_sat(50_000),
            &testutil::p2sh_address(),
            FeeRate::per_byte(Amount::from_sat(1)),
        )
        .unwrap();
        let mut session = SigningSession::unsigned(
            &testutil::p2sh_address(),
            &testutil::redeem_hex(),
            built.signing_inputs(&testutil::redeem_hex()),
            built.hex,
            2,
            None,
        );
        let secp = testutil::secp();
        for signer in signers {
            session = sign_session(node, &secp, &session, &testutil::wif(*signer)).unwrap().0;
        }
        session
    }

    #[test]
    fn summary_lists_outputs() {
        let node = MockNode::new(testutil::utxos(&[80_000, 20_000]));
        let s = session(&node, &[]);
        let summary = summarize(&node, &s.signed_hex).unwrap();
        assert_eq!(summary.input_count, 1);
        assert_eq!(summary.signature_count, 0);
        assert!(summary.outputs.iter().any(|(a, v)| a == &testutil::destination() && *v == Amount::from_sat(50_000)));
        assert_eq!(summary.total_out, Amount::from_sat(79_750));
        assert!(summary.to_string().contains(&testutil::destination()));
    }

    #[test]
    fn incomplete_session_is_refused_without_override() {
        let node = MockNode::new(testutil::utxos(&[80_000, 20_000]));
        let partial = session(&node, &[0]);
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let path = store.save(&partial).unwrap();

        let err = broadcast_session(&node, &store, &path, &partial, false).unwrap_err();
        assert!(matches!(err, AppError::IncompleteTransaction { signatures: 1, required: 2 }));
        assert_eq!(node.count("sendrawtransaction"), 0);

        // 強制送信してもノードが拒否する
        let err = broadcast_session(&node, &store, &path, &partial, true).unwrap_err();
        assert!(matches!(err, AppError::Broadcast(msg) if msg.contains("mandatory-script-verify-flag-failed")));
    }

    #[test]
    fn complete_session_is_sent_and_recorded() {
        let node = MockNode::new(testutil::utxos(&[80_000, 20_000]));
        let complete = session(&node, &[0, 2]);
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let path = store.save(&complete).unwrap();

        let txid = broadcast_session(&node, &store, &path, &complete, false).unwrap();
        assert_eq!(node.broadcast_txids(), vec![txid.clone()]);
        // 使われた1件が消え、おつりが新しいUTXOとして増える
        assert_eq!(node.remaining_utxos(), 2);
        assert_eq!(store.load(&path).unwrap().broadcast_txid, Some(txid));

        let reloaded = store.load(&path).unwrap();
        assert!(matches!(
            broadcast_session(&node, &store, &path, &reloaded, false),
            Err(AppError::Broadcast(_))
        ));
    }

    #[test]
    fn readiness_estimate_from_hex() {
        let node = MockNode::new(testutil::utxos(&[80_000, 20_000]));
        let complete = session(&node, &[1, 2]);
        let summary = summarize(&node, &complete.signed_hex).unwrap();
        assert!(Readiness::estimate(&summary, 2).complete);

        let partial = session(&node, &[1]);
        let summary = summarize(&node, &partial.signed_hex).unwrap();
        assert!(!Readiness::estimate(&summary, 2).complete);
    }

    #[test]
    fn multi_input_readiness_counts_signers_not_signatures() {
        let node = MockNode::new(Vec::new());
        let built = crate::transaction::build_consolidation(
            &node,
            &testutil::utxos(&[40_000, 30_000, 20_000]),
            &testutil::p2sh_address(),
            FeeRate::per_byte(Amount::from_sat(1)),
        )
        .unwrap();
        let unsigned = SigningSession::unsigned(
            &testutil::p2sh_address(),
            &testutil::redeem_hex(),
            built.signing_inputs(&testutil::redeem_hex()),
            built.hex,
            2,
            None,
        );
        let (once, _) = sign_session(&node, &testutil::secp(), &unsigned, &testutil::wif(0)).unwrap();

        let summary = summarize(&node, &once.signed_hex).unwrap();
        assert_eq!(summary.signature_count, 3);
        assert_eq!(summary.signers, 1);
        let readiness = Readiness::estimate(&summary, 2);
        assert_eq!(readiness, Readiness { complete: false, signatures: 1, required: 2 });
        assert_eq!(Readiness::of_session(&once), readiness);

        let err = broadcast(&node, &once.signed_hex, readiness, false).unwrap_err();
        assert!(matches!(err, AppError::IncompleteTransaction { signatures: 1, required: 2 }));
        assert!(err.to_string().contains("(1/2)"));
    }

    #[test]
    fn undecodable_hex_is_a_decode_error() {
        let node = MockNode::new(Vec::new());
        assert!(matches!(summarize(&node, "zz"), Err(AppError::Decode(_))));
    }
}
