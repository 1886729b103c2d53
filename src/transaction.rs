use bitcoin::Amount;
use std::collections::BTreeMap;

use crate::error::AppError;
use crate::rpc::NodeRpc;
use crate::types::{FeeRate, OutPointRef, TransactionInput, Utxo};
use crate::utxo::sort_by_amount_desc;

/// 入力選択の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSelection {
    pub selected: Vec<Utxo>,
    pub total: Amount,
    pub fee: Amount,
}

/// ノードに組み立てさせた未署名トランザクション
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub hex: String,
    pub inputs: Vec<Utxo>,
    pub total_in: Amount,
    pub fee: Amount,
    pub outputs: BTreeMap<String, Amount>,
    pub change: Amount,
}

impl BuiltTransaction {
    pub fn signing_inputs(&self, redeem_script: &str) -> Vec<TransactionInput> {
        self.inputs.iter().map(|u| u.to_signing_input(redeem_script)).collect()
    }
}

/// 金額の大きい順にUTXOを1つずつ加え、`選択額 >= 送金額 + 手数料` を
/// 満たした時点で止める。手数料は入力数に応じて毎回計算し直す。
pub fn select_inputs(candidates: &[Utxo], requested: Amount, fee_rate: FeeRate) -> Result<InputSelection, AppError> {
    let mut sorted = candidates.to_vec();
    sort_by_amount_desc(&mut sorted);

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    let mut fee = fee_rate.fee_for_inputs(1)?;

    for utxo in sorted {
        total = total
            .checked_add(utxo.amount)
            .ok_or_else(|| AppError::Build("入力合計がオーバーフローしました".into()))?;
        selected.push(utxo);
        fee = fee_rate.fee_for_inputs(selected.len())?;

        let required = requested
            .checked_add(fee)
            .ok_or_else(|| AppError::Build("要求額がオーバーフローしました".into()))?;
        if total >= required {
            log::debug!("入力選択完了: {} 件, 合計 {}, 手数料 {}", selected.len(), total, fee);
            return Ok(InputSelection { selected, total, fee });
        }
    }

    Err(AppError::InsufficientFunds {
        available: total,
        required: requested + fee,
        fee,
    })
}

/// 送金トランザクション (送金先 + おつり) を組み立てる
pub fn build_send(
    node: &dyn NodeRpc,
    candidates: &[Utxo],
    destination: &str,
    amount: Amount,
    change_address: &str,
    fee_rate: FeeRate,
) -> Result<BuiltTransaction, AppError> {
    if amount == Amount::ZERO {
        return Err(AppError::Validation("送金額は0より大きくなければなりません".into()));
    }
    log::info!("送金トランザクションの構築を開始します: {} -> {}", amount, destination);

    let selection = select_inputs(candidates, amount, fee_rate)?;
    let change = selection
        .total
        .checked_sub(amount)
        .and_then(|rest| rest.checked_sub(selection.fee))
        .ok_or_else(|| AppError::Build("おつりが負になりました".into()))?;

    let mut outputs = BTreeMap::new();
    outputs.insert(destination.to_string(), amount);
    if change > Amount::ZERO {
        log::debug!("おつり発生: {} -> {}", change, change_address);
        *outputs.entry(change_address.to_string()).or_insert(Amount::ZERO) += change;
    }

    create(node, selection, outputs, change)
}

/// 統合トランザクション (全入力 -> 自分のP2SHアドレス1出力) を組み立てる
pub fn build_consolidation(
    node: &dyn NodeRpc,
    utxos: &[Utxo],
    p2sh_address: &str,
    fee_rate: FeeRate,
) -> Result<BuiltTransaction, AppError> {
    if utxos.is_empty() {
        return Err(AppError::Build("統合するUTXOがありません".into()));
    }
    let total = utxos
        .iter()
        .try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount))
        .ok_or_else(|| AppError::Build("入力合計がオーバーフローしました".into()))?;
    let fee = fee_rate.fee_for_inputs(utxos.len())?;

    let send_amount = match total.checked_sub(fee) {
        Some(amount) if amount > Amount::ZERO => amount,
        _ => {
            return Err(AppError::InsufficientFunds {
                available: total,
                required: fee,
                fee,
            });
        }
    };

    let mut outputs = BTreeMap::new();
    outputs.insert(p2sh_address.to_string(), send_amount);
    let selection = InputSelection {
        selected: utxos.to_vec(),
        total,
        fee,
    };
    create(node, selection, outputs, Amount::ZERO)
}

fn create(
    node: &dyn NodeRpc,
    selection: InputSelection,
    outputs: BTreeMap<String, Amount>,
    change: Amount,
) -> Result<BuiltTransaction, AppError> {
    let inputs: Vec<OutPointRef> = selection.selected.iter().map(Utxo::out_point).collect();
    let hex = node
        .create_raw_transaction(&inputs, &outputs)
        .map_err(|e| e.rpc_into(AppError::Build))?;
    log::info!(
        "未署名トランザクションを構築しました: 入力 {} 件, 合計 {}, 手数料 {}",
        inputs.len(),
        selection.total,
        selection.fee
    );
    Ok(BuiltTransaction {
        hex,
        inputs: selection.selected,
        total_in: selection.total,
        fee: selection.fee,
        outputs,
        change,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, MockNode};

    fn one_sat_per_byte() -> FeeRate {
        FeeRate::per_byte(Amount::from_sat(1))
    }

    #[test]
    fn greedy_selection_stops_at_first_sufficient_prefix() {
        let utxos = testutil::utxos(&[20_000, 50_000, 30_000, 40_000]);
        let selection = select_inputs(&utxos, Amount::from_sat(85_000), one_sat_per_byte()).unwrap();

        let picked: Vec<u64> = selection.selected.iter().map(|u| u.amount.to_sat()).collect();
        assert_eq!(picked, vec![50_000, 40_000]);
        assert_eq!(selection.fee, Amount::from_sat(350));
        assert_eq!(selection.total, Amount::from_sat(90_000));
    }

    #[test]
    fn selected_prefix_is_minimal_for_every_request() {
        let utxos = testutil::utxos(&[70_000, 3_000, 45_000, 12_000, 9_000, 500]);
        let rate = one_sat_per_byte();
        let mut sorted = utxos.clone();
        sort_by_amount_desc(&mut sorted);

        for requested in (0..=140_000u64).step_by(3_917) {
            let requested = Amount::from_sat(requested);
            match select_inputs(&utxos, requested, rate) {
                Ok(sel) => {
                    let k = sel.selected.len();
                    assert_eq!(sel.selected, sorted[..k].to_vec());
                    assert!(sel.total >= requested + sel.fee);
                    let shorter: Amount = sorted[..k - 1].iter().map(|u| u.amount).sum();
                    assert!(shorter < requested + rate.fee_for_inputs(k - 1).unwrap() || k == 1);
                }
                Err(AppError::InsufficientFunds { .. }) => {
                    for k in 1..=sorted.len() {
                        let total: Amount = sorted[..k].iter().map(|u| u.amount).sum();
                        assert!(total < requested + rate.fee_for_inputs(k).unwrap());
                    }
                }
                Err(other) => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn insufficient_funds_makes_no_node_call() {
        let node = MockNode::new(Vec::new());
        let utxos = testutil::utxos(&[1_000, 2_000]);
        let err = build_send(
            &node,
            &utxos,
            &testutil::destination(),
            Amount::from_sat(10_000),
            &testutil::p2sh_address(),
            one_sat_per_byte(),
        )
        .unwrap_err();

        assert!(matches!(err, AppError::InsufficientFunds { .. }));
        assert!(node.calls().is_empty());
    }

    #[test]
    fn send_pays_destination_and_returns_change() {
        let utxos = testutil::utxos(&[100_000, 60_000, 5_000]);
        let node = MockNode::new(utxos.clone());
        let built = build_send(
            &node,
            &utxos,
            &testutil::destination(),
            Amount::from_sat(120_000),
            &testutil::p2sh_address(),
            one_sat_per_byte(),
        )
        .unwrap();

        assert_eq!(built.inputs.len(), 2);
        assert_eq!(built.fee, Amount::from_sat(350));
        assert_eq!(built.change, Amount::from_sat(39_650));
        assert_eq!(built.outputs[&testutil::p2sh_address()], Amount::from_sat(39_650));

        let decoded = node.decode_raw_transaction(&built.hex).unwrap();
        assert_eq!(decoded.vin.len(), 2);
        let paid: Amount = decoded.vout.iter().map(|o| o.value).sum();
        assert_eq!(paid + built.fee, built.total_in);
    }

    #[test]
    fn exact_amount_has_no_change_output() {
        let utxos = testutil::utxos(&[10_250]);
        let node = MockNode::new(utxos.clone());
        let built = build_send(
            &node,
            &utxos,
            &testutil::destination(),
            Amount::from_sat(10_000),
            &testutil::p2sh_address(),
            one_sat_per_byte(),
        )
        .unwrap();
        assert_eq!(built.change, Amount::ZERO);
        assert_eq!(built.outputs.len(), 1);
    }

    #[test]
    fn consolidation_sends_total_minus_fee_to_self() {
        let utxos = testutil::utxos(&[1_000, 2_000, 3_000]);
        let node = MockNode::new(utxos.clone());
        let built = build_consolidation(&node, &utxos, &testutil::p2sh_address(), one_sat_per_byte()).unwrap();

        assert_eq!(built.fee, Amount::from_sat(450));
        assert_eq!(built.outputs.len(), 1);
        assert_eq!(built.outputs[&testutil::p2sh_address()], Amount::from_sat(5_550));
        assert_eq!(built.signing_inputs(&testutil::redeem_hex()).len(), 3);
    }

    #[test]
    fn consolidation_of_dust_is_insufficient() {
        let utxos = testutil::utxos(&[100, 100]);
        let node = MockNode::new(utxos.clone());
        let err = build_consolidation(&node, &utxos, &testutil::p2sh_address(), one_sat_per_byte()).unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));
        assert_eq!(node.count("createrawtransaction"), 0);
    }

    #[test]
    fn node_rejection_is_a_build_error() {
        let utxos = testutil::utxos(&[50_000]);
        let node = MockNode::new(utxos.clone()).fail("createrawtransaction", "Invalid parameter");
        let err = build_consolidation(&node, &utxos, &testutil::p2sh_address(), one_sat_per_byte()).unwrap_err();
        assert!(matches!(err, AppError::Build(msg) if msg.contains("Invalid parameter")));
    }
}
