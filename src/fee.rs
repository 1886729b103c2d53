use crate::rpc::{FeeEstimate, NodeRpc};
use crate::types::FeeRate;

/// ノードから手数料率を取得する。取得できなければ `default` を使う。
/// この関数は失敗しない。
pub fn estimate_fee_rate(node: &dyn NodeRpc, target_blocks: u32, default: FeeRate) -> FeeRate {
    match node.estimate_fee(target_blocks) {
        Ok(FeeEstimate::Rate(amount)) if amount.to_sat() > 0 => {
            let rate = FeeRate::per_byte(amount);
            log::info!("ノードの見積り手数料率を使用します: {}", rate);
            rate
        }
        Ok(_) => {
            log::warn!("ノードが手数料率を見積れませんでした。既定値 {} を使用します。", default);
            default
        }
        Err(e) => {
            log::warn!("手数料率の取得に失敗しました ({})。既定値 {} を使用します。", e, default);
            default
        }
    }
}
