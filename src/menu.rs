//! 対話メニューと各操作。サブコマンドからも同じ操作を呼び出す。
//!
//! 操作中のエラーは表示してメニューに戻る。途中で作られたセッションファイルは消さない。

use bitcoin::Amount;
use bitcoin::secp256k1::{All, Secp256k1};
use std::path::PathBuf;
use std::sync::Arc;

use crate::batch::{ConsolidationReport, consolidate, plan_batches};
use crate::broadcast::{Readiness, broadcast, broadcast_session, summarize};
use crate::cli::parse_btc_amount;
use crate::config::MultisigConfig;
use crate::error::AppError;
use crate::fee::estimate_fee_rate;
use crate::guard::GuardVerdict;
use crate::prompt::{Prompter, is_end_of_input};
use crate::rpc::NodeRpc;
use crate::script::validate_redeem_script;
use crate::session::{SessionStore, SigningSession};
use crate::signing::{SigningState, count_signers, sign_session};
use crate::status::{collect_status, status_line, write_status};
use crate::transaction::build_send;
use crate::types::{FeeRate, TransactionInput, Utxo};
use crate::utxo::{FetchOptions, fetch_utxos};

/// 計画表示で列挙するバッチ数
const PLAN_PREVIEW: usize = 10;

enum SessionSource {
    File(PathBuf),
    Hex(String),
}

struct Multisig {
    p2sh_address: String,
    redeem_script: String,
    required: usize,
}

pub struct App<'a> {
    node: Arc<dyn NodeRpc>,
    secp: Secp256k1<All>,
    config: &'a MultisigConfig,
    store: SessionStore,
    prompter: &'a mut dyn Prompter,
}

impl<'a> App<'a> {
    pub fn new(node: Arc<dyn NodeRpc>, config: &'a MultisigConfig, prompter: &'a mut dyn Prompter) -> Self {
        App {
            node,
            secp: Secp256k1::new(),
            store: SessionStore::new(&config.session_dir),
            config,
            prompter,
        }
    }

    pub fn run_menu(&mut self) -> Result<(), AppError> {
        loop {
            println!();
            println!("==== P2SHマルチシグ ====");
            println!("{}", status_line(self.config.status_file.as_deref()));
            println!("1) 送金トランザクションを作成");
            println!("2) 部分署名");
            println!("3) 送信");
            println!("4) UTXOの統合");
            println!("5) 残高を表示");
            println!("0) 終了");

            let choice = match self.prompter.ask("番号を選択:") {
                Ok(choice) => choice,
                Err(e) if is_end_of_input(&e) => return Ok(()),
                Err(e) => return Err(e),
            };
            let result = match choice.trim() {
                "1" => self.create_send(None, None),
                "2" => self.sign_partial(None),
                "3" => self.broadcast(None),
                "4" => self.consolidate(None, false),
                "5" => self.show_status(),
                "0" | "q" => return Ok(()),
                other => {
                    println!("無効な選択です: {}", other);
                    continue;
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if is_end_of_input(&e) => return Ok(()),
                Err(e) => {
                    log::error!("操作に失敗しました: {}", e);
                    println!("エラー: {}", e);
                }
            }
        }
    }

    /// 送金トランザクションを作って保存し、希望すればそのまま署名する
    pub fn create_send(&mut self, to: Option<String>, amount: Option<Amount>) -> Result<(), AppError> {
        let multisig = self.multisig()?;

        let destination = match to {
            Some(to) => to,
            None => self.ask_nonempty("送金先アドレス:")?,
        };
        let validation = self
            .node
            .validate_address(&destination)
            .map_err(|e| e.rpc_into(AppError::Validation))?;
        if !validation.isvalid {
            return Err(AppError::AddressInvalid { address: destination });
        }
        let amount = match amount {
            Some(amount) => amount,
            None => parse_btc_amount(&self.ask_nonempty("送金額 (BTC):")?)?,
        };

        let (utxos, _) = self.fetch(&multisig.p2sh_address)?;
        let fee_rate = self.fee_rate();
        let built = build_send(
            self.node.as_ref(),
            &utxos,
            &destination,
            amount,
            &multisig.p2sh_address,
            fee_rate,
        )?;

        println!("入力: {} 件 (合計 {})", built.inputs.len(), built.total_in);
        for (address, value) in &built.outputs {
            println!("  -> {} : {}", address, value);
        }
        println!("{}", send_fee_line(built.fee, fee_rate, built.change));
        if !self.prompter.confirm("この内容で署名セッションを作成しますか?")? {
            println!("中止しました。");
            return Ok(());
        }

        let session = SigningSession::unsigned(
            &multisig.p2sh_address,
            &multisig.redeem_script,
            built.signing_inputs(&multisig.redeem_script),
            built.hex,
            multisig.required,
            None,
        );
        let path = self.store.save(&session)?;
        println!("未署名のセッションを保存しました: {}", path.display());

        if self.prompter.confirm("続けてこの端末で署名しますか?")? {
            self.sign_and_save(&session)?;
        }
        Ok(())
    }

    /// 保存済みセッション、または貼り付けたhexに1つ署名を加える
    pub fn sign_partial(&mut self, session: Option<PathBuf>) -> Result<(), AppError> {
        let source = match session {
            Some(path) => SessionSource::File(path),
            None => self.choose_source()?,
        };
        let session = match source {
            SessionSource::File(path) => {
                let session = self.store.load(&path)?;
                self.check_session(&session)?;
                session
            }
            SessionSource::Hex(hex) => self.session_from_hex(hex)?,
        };
        println!(
            "現在の状態: {}",
            SigningState::from_counts(session.signatures, session.required_signatures, session.complete)
        );
        self.sign_and_save(&session)?;
        Ok(())
    }

    pub fn broadcast(&mut self, session: Option<PathBuf>) -> Result<(), AppError> {
        let source = match session {
            Some(path) => SessionSource::File(path),
            None => self.choose_source()?,
        };
        let (hex, file) = match source {
            SessionSource::File(path) => {
                let session = self.store.load(&path)?;
                self.check_session(&session)?;
                (session.signed_hex.clone(), Some((path, session)))
            }
            SessionSource::Hex(hex) => (hex, None),
        };

        let summary = summarize(self.node.as_ref(), &hex)?;
        let readiness = match &file {
            Some((_, session)) => Readiness::of_session(session),
            None => Readiness::estimate(&summary, self.multisig()?.required),
        };
        println!("{}", summary);
        println!("署名: {}/{} (完了: {})", readiness.signatures, readiness.required, readiness.complete);

        let mut allow_incomplete = false;
        if !readiness.complete {
            println!("署名が完了していません。ノードに拒否される可能性が高い状態です。");
            if !self.prompter.confirm_override("それでも送信しますか?")? {
                println!("中止しました。");
                return Ok(());
            }
            allow_incomplete = true;
        }
        if !self.prompter.confirm("このトランザクションを送信しますか?")? {
            println!("中止しました。");
            return Ok(());
        }

        let txid = match &file {
            Some((path, session)) => broadcast_session(self.node.as_ref(), &self.store, path, session, allow_incomplete)?,
            None => broadcast(self.node.as_ref(), &hex, readiness, allow_incomplete)?,
        };
        println!("送信しました: {}", txid);
        Ok(())
    }

    pub fn consolidate(&mut self, max_batches: Option<usize>, auto_broadcast: bool) -> Result<(), AppError> {
        let multisig = self.multisig()?;
        let (utxos, fetch_options) = self.fetch(&multisig.p2sh_address)?;
        let fee_rate = self.fee_rate();
        let mut options = self
            .config
            .consolidate_options(&multisig.p2sh_address, &multisig.redeem_script, fee_rate);
        // バッチ間の再取得でも検証スキップの判断を引き継ぐ
        options.fetch = fetch_options;
        if max_batches.is_some() {
            options.max_batches = max_batches;
        }
        options.auto_broadcast |= auto_broadcast;

        let plan = plan_batches(&utxos, options.batch_size);
        println!("{}", plan_line(utxos.len(), plan.len(), options.batch_size, fee_rate));
        for batch in plan.iter().take(PLAN_PREVIEW) {
            println!("  バッチ {}: {} 件, 合計 {}", batch.number, batch.utxos.len(), batch.total());
        }
        if plan.len() > PLAN_PREVIEW {
            println!("  ... 他 {} バッチ", plan.len() - PLAN_PREVIEW);
        }
        if let Some(max) = options.max_batches {
            println!("今回は最大 {} バッチを処理します。", max);
        }
        if !self.prompter.confirm("統合を開始しますか?")? {
            println!("中止しました。");
            return Ok(());
        }

        let keys = self.collect_signing_keys(multisig.required)?;
        let report = consolidate(self.node.as_ref(), &self.secp, &self.store, &utxos, &keys, &options)?;
        print_report(&report);
        match report.failure {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    pub fn show_status(&mut self) -> Result<(), AppError> {
        let address = match &self.config.p2sh_address {
            Some(address) => address.clone(),
            None => self.ask_nonempty("P2SHアドレス:")?,
        };
        let snapshot = collect_status(self.node.as_ref(), &address, &self.config.fetch_options())?;
        if let Some(path) = &self.config.status_file {
            write_status(path, &snapshot)?;
        }
        println!("{}: 残高 {} / UTXO {} 件", snapshot.address, snapshot.balance, snapshot.utxo_count);
        Ok(())
    }

    fn ask_nonempty(&mut self, question: &str) -> Result<String, AppError> {
        let answer = self.prompter.ask(question)?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(AppError::Validation(format!("入力が空です: {}", question)));
        }
        Ok(answer.to_string())
    }

    /// 設定済みの値が無ければ尋ね、redeemScriptをノードで検証する
    fn multisig(&mut self) -> Result<Multisig, AppError> {
        let p2sh_address = match &self.config.p2sh_address {
            Some(address) => address.clone(),
            None => self.ask_nonempty("P2SHアドレス:")?,
        };
        let redeem_script = match &self.config.redeem_script {
            Some(script) => script.clone(),
            None => self.ask_nonempty("redeemScript (hex):")?,
        };
        let required = validate_redeem_script(self.node.as_ref(), &redeem_script, &p2sh_address)?;
        Ok(Multisig {
            p2sh_address,
            redeem_script,
            required,
        })
    }

    /// ノードがアドレスを無効と判定した場合は、確認の上で検証を飛ばして取得する。
    /// 実際に使った取得条件も返す。
    fn fetch(&mut self, address: &str) -> Result<(Vec<Utxo>, FetchOptions), AppError> {
        let mut options = self.config.fetch_options();
        match fetch_utxos(self.node.as_ref(), address, &options) {
            Err(AppError::AddressInvalid { address }) => {
                println!("ノードがアドレス {} を無効と判定しました。", address);
                if !self.prompter.confirm_override("検証をスキップして続行しますか?")? {
                    return Err(AppError::AddressInvalid { address });
                }
                options.skip_address_validation = true;
                let utxos = fetch_utxos(self.node.as_ref(), &address, &options)?;
                Ok((utxos, options))
            }
            Ok(utxos) => Ok((utxos, options)),
            Err(e) => Err(e),
        }
    }

    fn fee_rate(&self) -> FeeRate {
        estimate_fee_rate(self.node.as_ref(), self.config.fee_target_blocks, self.config.fee_default)
    }

    fn choose_source(&mut self) -> Result<SessionSource, AppError> {
        let files = self.store.list()?;
        if files.is_empty() {
            println!("{} に保存済みのセッションはありません。", self.store.dir().display());
        }
        for (i, path) in files.iter().enumerate() {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            println!("{}) {}", i + 1, name);
        }
        println!("h) トランザクションhexを貼り付ける");

        let answer = self.ask_nonempty("選択:")?;
        if answer.eq_ignore_ascii_case("h") {
            return Ok(SessionSource::Hex(self.ask_nonempty("トランザクションhex:")?));
        }
        answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| files.get(i))
            .map(|path| SessionSource::File(path.clone()))
            .ok_or_else(|| AppError::Validation(format!("無効な選択です: {}", answer)))
    }

    /// 設定のアドレス・redeemScriptとセッションが食い違う場合は確認を取る
    fn check_session(&mut self, session: &SigningSession) -> Result<(), AppError> {
        let verified = session.verify_against(self.config.p2sh_address.as_deref(), self.config.redeem_script.as_deref());
        if let Err(e) = verified {
            println!("{}", e);
            if !self.prompter.confirm_override("設定と異なるセッションです。続行しますか?")? {
                return Err(e);
            }
            log::warn!("設定と異なるセッションを使用します: {}", e);
        }
        Ok(())
    }

    /// 貼り付けたhexから署名に必要な入力情報を組み立て直す
    fn session_from_hex(&mut self, hex: String) -> Result<SigningSession, AppError> {
        let multisig = self.multisig()?;
        let script_pub_key = self
            .node
            .validate_address(&multisig.p2sh_address)
            .map_err(|e| e.rpc_into(AppError::Validation))?
            .script_pub_key
            .ok_or_else(|| AppError::Validation("P2SHアドレスのscriptPubKeyを取得できません".into()))?;
        let decoded = self
            .node
            .decode_raw_transaction(&hex)
            .map_err(|e| e.rpc_into(AppError::Decode))?;

        let mut inputs = Vec::with_capacity(decoded.vin.len());
        for (i, vin) in decoded.vin.iter().enumerate() {
            let (Some(txid), Some(vout)) = (&vin.txid, vin.vout) else {
                return Err(AppError::Decode(format!("入力 {} の参照先が読み取れません", i)));
            };
            inputs.push(TransactionInput {
                txid: txid.clone(),
                vout,
                script_pub_key: script_pub_key.clone(),
                redeem_script: multisig.redeem_script.clone(),
            });
        }

        let mut session = SigningSession::unsigned(
            &multisig.p2sh_address,
            &multisig.redeem_script,
            inputs,
            hex,
            multisig.required,
            None,
        );
        session.signatures = count_signers(&decoded);
        Ok(session)
    }

    /// 1つ署名して新しいファイルに保存する。完了したら送信を提案する。
    fn sign_and_save(&mut self, session: &SigningSession) -> Result<PathBuf, AppError> {
        let wif = self.config.private_key_source.resolve(&mut *self.prompter)?;
        let (signed, outcome) = sign_session(self.node.as_ref(), &self.secp, session, &wif)?;
        if let GuardVerdict::Undetermined { existing_signatures } = outcome.guard {
            println!(
                "注意: この鍵が署名済みか確認できませんでした (既存の署名データ {} 個)",
                existing_signatures
            );
        }
        for error in &outcome.node_errors {
            println!("  ノードの報告: {}", error);
        }

        let path = self.store.save(&signed)?;
        println!("{} (署名データ {} 個)", outcome.state, outcome.signature_count);
        println!("セッション: {}", path.display());
        println!("{}", signed.signed_hex);

        if signed.complete && self.prompter.confirm("署名が完了しました。送信しますか?")? {
            let txid = broadcast_session(self.node.as_ref(), &self.store, &path, &signed, false)?;
            println!("送信しました: {}", txid);
        }
        Ok(path)
    }

    /// 統合の各バッチに使う秘密鍵。空なら署名せずに保存だけ行う。
    fn collect_signing_keys(&mut self, required: usize) -> Result<Vec<String>, AppError> {
        let mut keys = Vec::new();
        if !self.prompter.confirm("各バッチにこの端末で署名しますか?")? {
            return Ok(keys);
        }
        keys.push(self.config.private_key_source.resolve(&mut *self.prompter)?);
        while self.config.private_key_source.is_interactive()
            && keys.len() < required
            && self.prompter.confirm("別の秘密鍵でも署名しますか?")?
        {
            keys.push(self.config.private_key_source.resolve(&mut *self.prompter)?);
        }
        Ok(keys)
    }
}

fn send_fee_line(fee: Amount, fee_rate: FeeRate, change: Amount) -> String {
    format!("手数料: {} (レート {}) / おつり: {}", fee, fee_rate, change)
}

fn plan_line(utxo_count: usize, batch_count: usize, batch_size: usize, fee_rate: FeeRate) -> String {
    format!(
        "UTXO {} 件を {} バッチに分けます (1バッチ最大 {} 件、手数料レート {})",
        utxo_count, batch_count, batch_size, fee_rate
    )
}

fn print_report(report: &ConsolidationReport) {
    for batch in &report.batches {
        println!(
            "バッチ {}: 入力 {} 件 (除外 {}), 手数料 {}, 出力 {}, {}",
            batch.number, batch.input_count, batch.dropped_inputs, batch.fee, batch.output, batch.state
        );
        println!("  セッション: {}", batch.session_path.display());
        if let Some(txid) = &batch.txid {
            println!("  送信済み: {}", txid);
        }
    }
    if let Some(failure) = &report.failure {
        println!("バッチ {} で失敗したため以降を中止しました: {}", failure.number, failure.error);
    }
    println!(
        "処理 {}/{} バッチ。残り {} 件 (計画後の新規 {} 件)、あと約 {} 回の実行が必要です。",
        report.batches.len(),
        report.planned_batches,
        report.leftover,
        report.new_since_plan,
        report.further_rounds
    );
}
