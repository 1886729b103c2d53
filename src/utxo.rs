use std::collections::HashSet;

use crate::error::AppError;
use crate::rpc::{NodeRpc, UnspentCursor};
use crate::types::Utxo;

/// ページ取得の上限。応答がおかしいノードで無限ループしないための歯止め。
pub const MAX_PAGES: usize = 100;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub min_conf: u32,
    pub max_conf: u32,
    pub page_size: usize,
    /// `validateaddress` が無効と判定しても続行する (利用者が確認済みの場合のみ)
    pub skip_address_validation: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            min_conf: 1,
            max_conf: 9_999_999,
            page_size: 500,
            skip_address_validation: false,
        }
    }
}

/// アドレスの全UTXOを金額の降順で返す。
///
/// ノードがカーソル付き取得に対応していればページ単位で取得し、
/// 対応していなければ一括取得した結果をクライアント側で分割する。
pub fn fetch_utxos(node: &dyn NodeRpc, address: &str, options: &FetchOptions) -> Result<Vec<Utxo>, AppError> {
    if options.skip_address_validation {
        log::warn!("アドレス検証をスキップします: {}", address);
    } else {
        let validation = node
            .validate_address(address)
            .map_err(|e| e.rpc_into(AppError::Fetch))?;
        if !validation.isvalid {
            return Err(AppError::AddressInvalid {
                address: address.to_string(),
            });
        }
    }

    let page_size = options.page_size.max(1);
    let mut utxos = match fetch_with_cursor(node, address, options, page_size)? {
        Some(utxos) => utxos,
        None => {
            log::debug!("ノードはカーソル付き取得に未対応のため一括取得します。");
            fetch_all_sliced(node, address, options, page_size)?
        }
    };

    if utxos.is_empty() {
        return Err(AppError::Fetch(format!("{} にUTXOがありません", address)));
    }
    sort_by_amount_desc(&mut utxos);
    log::info!("UTXOを {} 件取得しました ({})", utxos.len(), address);
    Ok(utxos)
}

pub fn sort_by_amount_desc(utxos: &mut [Utxo]) {
    utxos.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });
}

fn fetch_with_cursor(
    node: &dyn NodeRpc,
    address: &str,
    options: &FetchOptions,
    page_size: usize,
) -> Result<Option<Vec<Utxo>>, AppError> {
    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    let mut cursor = UnspentCursor {
        after: None,
        limit: page_size,
    };

    for page_no in 0..MAX_PAGES {
        let page = node
            .list_unspent_page(options.min_conf, options.max_conf, address, &cursor)
            .map_err(|e| e.rpc_into(AppError::Fetch))?;
        let Some(page) = page else {
            if page_no == 0 {
                return Ok(None);
            }
            log::warn!("ページ {} でカーソル取得が使えなくなりました。取得済み分で打ち切ります。", page_no);
            return Ok(Some(collected));
        };

        let received = page.len();
        let mut fresh = 0;
        for utxo in page {
            if seen.insert((utxo.txid.clone(), utxo.vout)) {
                cursor.after = Some(utxo.out_point());
                collected.push(utxo);
                fresh += 1;
            }
        }
        log::debug!("ページ {}: {} 件受信 (新規 {} 件)", page_no, received, fresh);

        if received < page_size {
            return Ok(Some(collected));
        }
        if fresh == 0 {
            log::warn!("ノードが同じページを返しました。取得を終了します。");
            return Ok(Some(collected));
        }
    }

    log::warn!("ページ数の上限 ({}) に達しました。{} 件で打ち切ります。", MAX_PAGES, collected.len());
    Ok(Some(collected))
}

fn fetch_all_sliced(
    node: &dyn NodeRpc,
    address: &str,
    options: &FetchOptions,
    page_size: usize,
) -> Result<Vec<Utxo>, AppError> {
    let mut all = node
        .list_unspent(options.min_conf, options.max_conf, address)
        .map_err(|e| e.rpc_into(AppError::Fetch))?;
    sort_by_amount_desc(&mut all);

    let mut seen = HashSet::new();
    let mut collected = Vec::with_capacity(all.len());
    for (page_no, page) in all.chunks(page_size).enumerate() {
        for utxo in page {
            if seen.insert(utxo.key()) {
                collected.push(utxo.clone());
            }
        }
        log::debug!("ページ {}: {} 件", page_no, page.len());
    }
    Ok(collected)
}
