//! テスト用のノード実装とフィクスチャ。

use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, Network, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    absolute::LockTime, transaction::Version,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::AppError;
use crate::rpc::{NodeRpc, UnspentCursor};
use crate::script::{MultisigScript, signature_pushes};
use crate::types::{Utxo, parse_btc_number};

pub fn secp() -> Secp256k1<All> {
    Secp256k1::new()
}

fn key(byte: u8) -> PrivateKey {
    let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
    PrivateKey::new(secret, Network::Testnet)
}

/// マルチシグの参加者3人の鍵
pub fn private_keys() -> [PrivateKey; 3] {
    [key(1), key(2), key(3)]
}

pub fn wif(index: usize) -> String {
    private_keys()[index].to_wif()
}

/// どのredeemScriptにも含まれない鍵
pub fn outsider_wif() -> String {
    key(9).to_wif()
}

pub fn redeem_script() -> ScriptBuf {
    let secp = secp();
    let mut builder = Builder::new().push_int(2);
    for k in private_keys() {
        builder = builder.push_key(&k.public_key(&secp));
    }
    builder.push_int(3).push_opcode(OP_CHECKMULTISIG).into_script()
}

pub fn redeem_hex() -> String {
    redeem_script().to_hex_string()
}

pub fn p2sh_address() -> String {
    Address::p2sh(&redeem_script(), Network::Testnet).unwrap().to_string()
}

pub fn destination() -> String {
    Address::p2pkh(key(7).public_key(&secp()).pubkey_hash(), Network::Testnet).to_string()
}

pub fn txid_hex(seed: usize) -> String {
    format!("{:064x}", seed + 1)
}

pub fn utxos(amounts_sat: &[u64]) -> Vec<Utxo> {
    let spk = ScriptBuf::new_p2sh(&redeem_script().script_hash()).to_hex_string();
    amounts_sat
        .iter()
        .enumerate()
        .map(|(i, sat)| Utxo {
            txid: txid_hex(i),
            vout: (i % 3) as u32,
            amount: Amount::from_sat(*sat),
            script_pub_key: spk.clone(),
        })
        .collect()
}

struct FailRule {
    successes_left: usize,
    message: String,
}

pub struct MockState {
    pub utxos: Vec<Utxo>,
    pub invalid_addresses: Vec<String>,
    pub cursor_paging: bool,
    pub fee_response: Value,
    pub calls: Vec<String>,
    pub broadcast: Vec<String>,
    failures: HashMap<String, FailRule>,
}

/// 実際のトランザクションを組み立て・署名するノードのテストダブル
pub struct MockNode {
    pub state: Mutex<MockState>,
}

impl MockNode {
    pub fn new(utxos: Vec<Utxo>) -> Self {
        MockNode {
            state: Mutex::new(MockState {
                utxos,
                invalid_addresses: Vec::new(),
                cursor_paging: false,
                fee_response: json!(0.0001),
                calls: Vec::new(),
                broadcast: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }

    pub fn with_cursor_paging(self) -> Self {
        self.state.lock().unwrap().cursor_paging = true;
        self
    }

    pub fn with_invalid_address(self, address: &str) -> Self {
        self.state.lock().unwrap().invalid_addresses.push(address.to_string());
        self
    }

    pub fn with_fee_response(self, value: Value) -> Self {
        self.state.lock().unwrap().fee_response = value;
        self
    }

    /// `method` を `successes` 回成功させた後は失敗させる
    pub fn fail_after(self, method: &str, successes: usize, message: &str) -> Self {
        self.state.lock().unwrap().failures.insert(
            method.to_string(),
            FailRule {
                successes_left: successes,
                message: message.to_string(),
            },
        );
        self
    }

    pub fn fail(self, method: &str, message: &str) -> Self {
        self.fail_after(method, 0, message)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == method).count()
    }

    pub fn broadcast_txids(&self) -> Vec<String> {
        self.state.lock().unwrap().broadcast.clone()
    }

    pub fn remaining_utxos(&self) -> usize {
        self.state.lock().unwrap().utxos.len()
    }

    fn record(&self, method: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(method.to_string());
        if let Some(rule) = state.failures.get_mut(method) {
            if rule.successes_left == 0 {
                return Err(AppError::Rpc {
                    method: method.to_string(),
                    message: rule.message.clone(),
                });
            }
            rule.successes_left -= 1;
        }
        Ok(())
    }
}

fn rpc_err(method: &str, message: impl Into<String>) -> AppError {
    AppError::Rpc {
        method: method.to_string(),
        message: message.into(),
    }
}

fn decode_tx(method: &str, value: &Value) -> Result<Transaction, AppError> {
    let hex_str = value.as_str().ok_or_else(|| rpc_err(method, "hexがありません"))?;
    let bytes = hex::decode(hex_str).map_err(|_| rpc_err(method, "TX decode failed"))?;
    encode::deserialize(&bytes).map_err(|_| rpc_err(method, "TX decode failed"))
}

fn address_string(script: &ScriptBuf) -> Option<String> {
    Address::from_script(script, Network::Testnet).ok().map(|a| a.to_string())
}

/// Bitcoin Core風のscriptSig asm (`0 3044..[ALL] 5221..`)
fn core_asm(script: &ScriptBuf) -> String {
    use bitcoin::blockdata::script::Instruction;
    script
        .instructions()
        .filter_map(Result::ok)
        .map(|ins| match ins {
            Instruction::PushBytes(b) if b.is_empty() => "0".to_string(),
            Instruction::PushBytes(b) if b.as_bytes()[0] == 0x30 && b.len() <= 73 && b.as_bytes()[b.len() - 1] == 0x01 => {
                format!("{}[ALL]", hex::encode(&b.as_bytes()[..b.len() - 1]))
            }
            Instruction::PushBytes(b) => hex::encode(b.as_bytes()),
            Instruction::Op(op) => format!("{:?}", op),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn input_complete(tx: &Transaction, index: usize, required: usize) -> bool {
    signature_pushes(&tx.input[index].script_sig)
        .map(|s| s.len() >= required)
        .unwrap_or(false)
}

impl MockNode {
    fn sign(&self, params: &[Value]) -> Result<Value, AppError> {
        let method = "signrawtransaction";
        let mut tx = decode_tx(method, &params[0])?;
        let inputs = params[1].as_array().cloned().unwrap_or_default();
        let mut keys = Vec::new();
        for v in params[2].as_array().cloned().unwrap_or_default() {
            let key = v
                .as_str()
                .and_then(|w| PrivateKey::from_wif(w).ok())
                .ok_or_else(|| rpc_err(method, "Invalid private key"))?;
            keys.push(key);
        }
        let secp = secp();

        let mut complete = true;
        let mut errors = Vec::new();
        for index in 0..tx.input.len() {
            let prev_txid = tx.input[index].previous_output.txid.to_string();
            let prev_vout = tx.input[index].previous_output.vout as u64;
            let redeem_hex = inputs
                .iter()
                .find(|i| i["txid"].as_str() == Some(prev_txid.as_str()) && i["vout"].as_u64() == Some(prev_vout))
                .and_then(|i| i["redeemScript"].as_str().map(str::to_string))
                .ok_or_else(|| rpc_err(method, "redeemScriptがありません"))?;
            let multisig = MultisigScript::from_hex(&redeem_hex)?;

            let sighash = SighashCache::new(&tx)
                .legacy_signature_hash(index, &multisig.script, EcdsaSighashType::All.to_u32())
                .map_err(|e| rpc_err(method, e.to_string()))?;
            let msg = Message::from_digest(sighash.to_byte_array());

            // 既存の署名を公開鍵順に振り分ける
            let existing = signature_pushes(&tx.input[index].script_sig)?;
            let mut by_key: Vec<Option<Vec<u8>>> = vec![None; multisig.pubkeys.len()];
            for sig_bytes in existing {
                if let Ok(sig) = bitcoin::ecdsa::Signature::from_slice(&sig_bytes) {
                    for (slot, pk) in multisig.pubkeys.iter().enumerate() {
                        if secp.verify_ecdsa(&msg, &sig.signature, &pk.inner).is_ok() {
                            by_key[slot] = Some(sig_bytes.clone());
                        }
                    }
                }
            }
            for k in &keys {
                let pk = k.public_key(&secp);
                if let Some(slot) = multisig.pubkeys.iter().position(|p| p.inner == pk.inner) {
                    if by_key[slot].is_none() && by_key.iter().flatten().count() < multisig.required {
                        let signature = bitcoin::ecdsa::Signature {
                            signature: secp.sign_ecdsa(&msg, &k.inner),
                            sighash_type: EcdsaSighashType::All,
                        };
                        by_key[slot] = Some(signature.to_vec());
                    }
                }
            }

            let mut builder = Builder::new().push_int(0);
            for sig in by_key.iter().flatten() {
                builder = builder.push_slice(PushBytesBuf::try_from(sig.clone()).unwrap());
            }
            builder = builder.push_slice(PushBytesBuf::try_from(multisig.script.to_bytes()).unwrap());
            tx.input[index].script_sig = builder.into_script();

            if by_key.iter().flatten().count() < multisig.required {
                complete = false;
                errors.push(json!({
                    "txid": tx.input[index].previous_output.txid.to_string(),
                    "vout": tx.input[index].previous_output.vout,
                    "error": "Operation not valid with the current stack size"
                }));
            }
        }
        Ok(json!({ "hex": encode::serialize_hex(&tx), "complete": complete, "errors": errors }))
    }

    fn create(&self, params: &[Value]) -> Result<Value, AppError> {
        let method = "createrawtransaction";
        let mut input = Vec::new();
        for i in params[0].as_array().cloned().unwrap_or_default() {
            let txid = Txid::from_str(i["txid"].as_str().unwrap_or_default())
                .map_err(|e| rpc_err(method, e.to_string()))?;
            input.push(TxIn {
                previous_output: OutPoint::new(txid, i["vout"].as_u64().unwrap_or_default() as u32),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
        }
        let mut output = Vec::new();
        for (address, amount) in params[1].as_object().cloned().unwrap_or_default() {
            let address = Address::from_str(&address)
                .map_err(|e| rpc_err(method, format!("Invalid address: {}", e)))?
                .assume_checked();
            let value = match amount {
                Value::Number(n) => parse_btc_number(&n).map_err(|e| rpc_err(method, e))?,
                _ => return Err(rpc_err(method, "Invalid amount")),
            };
            output.push(TxOut {
                value,
                script_pubkey: address.script_pubkey(),
            });
        }
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        Ok(Value::String(encode::serialize_hex(&tx)))
    }

    fn decode(&self, params: &[Value]) -> Result<Value, AppError> {
        let tx = decode_tx("decoderawtransaction", &params[0])?;
        let vin: Vec<Value> = tx
            .input
            .iter()
            .map(|i| {
                json!({
                    "txid": i.previous_output.txid.to_string(),
                    "vout": i.previous_output.vout,
                    "scriptSig": {"asm": core_asm(&i.script_sig), "hex": i.script_sig.to_hex_string()}
                })
            })
            .collect();
        let vout: Vec<Value> = tx
            .output
            .iter()
            .enumerate()
            .map(|(n, o)| {
                let number = crate::types::btc_number(o.value).unwrap();
                json!({
                    "value": Value::Number(number),
                    "n": n,
                    "scriptPubKey": {"hex": o.script_pubkey.to_hex_string(), "address": address_string(&o.script_pubkey)}
                })
            })
            .collect();
        Ok(json!({ "txid": tx.compute_txid().to_string(), "vin": vin, "vout": vout }))
    }

    fn send(&self, params: &[Value]) -> Result<Value, AppError> {
        let method = "sendrawtransaction";
        let tx = decode_tx(method, &params[0])?;
        let required = MultisigScript::parse(redeem_script())?.required;
        if (0..tx.input.len()).any(|i| !input_complete(&tx, i, required)) {
            return Err(rpc_err(method, "mandatory-script-verify-flag-failed"));
        }
        let mut state = self.state.lock().unwrap();
        for input in &tx.input {
            let spent_txid = input.previous_output.txid.to_string();
            let before = state.utxos.len();
            state
                .utxos
                .retain(|u| !(u.txid == spent_txid && u.vout == input.previous_output.vout));
            if state.utxos.len() == before {
                return Err(rpc_err(method, "bad-txns-inputs-missingorspent"));
            }
        }
        let txid = tx.compute_txid().to_string();
        let own_script = ScriptBuf::new_p2sh(&redeem_script().script_hash());
        for (n, output) in tx.output.iter().enumerate() {
            if output.script_pubkey == own_script {
                state.utxos.push(Utxo {
                    txid: txid.clone(),
                    vout: n as u32,
                    amount: output.value,
                    script_pub_key: own_script.to_hex_string(),
                });
            }
        }
        state.broadcast.push(txid.clone());
        Ok(Value::String(txid))
    }
}

impl NodeRpc for MockNode {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AppError> {
        self.record(method)?;
        match method {
            "validateaddress" => {
                let address = params[0].as_str().unwrap_or_default().to_string();
                let state = self.state.lock().unwrap();
                let isvalid = !state.invalid_addresses.contains(&address);
                let spk = Address::from_str(&address)
                    .ok()
                    .map(|a| a.assume_checked().script_pubkey().to_hex_string());
                Ok(json!({ "isvalid": isvalid, "address": address, "scriptPubKey": spk }))
            }
            "decodescript" => {
                let script_hex = params[0].as_str().unwrap_or_default();
                match MultisigScript::from_hex(script_hex) {
                    Ok(m) => Ok(json!({
                        "type": "multisig",
                        "reqSigs": m.required,
                        "p2sh": Address::p2sh(&m.script, Network::Testnet)
                            .map_err(|e| rpc_err(method, e.to_string()))?
                            .to_string()
                    })),
                    Err(_) => Ok(json!({ "type": "nonstandard" })),
                }
            }
            "listunspent" => Ok(serde_json::to_value(&self.state.lock().unwrap().utxos)?),
            "estimatefee" => Ok(self.state.lock().unwrap().fee_response.clone()),
            "createrawtransaction" => self.create(&params),
            "signrawtransaction" => self.sign(&params),
            "decoderawtransaction" => self.decode(&params),
            "sendrawtransaction" => self.send(&params),
            "gettransaction" => {
                let txid = params[0].as_str().unwrap_or_default().to_string();
                if self.state.lock().unwrap().broadcast.contains(&txid) {
                    Ok(json!({ "confirmations": 0 }))
                } else {
                    Err(rpc_err(method, "Invalid or non-wallet transaction id"))
                }
            }
            other => Err(rpc_err(other, "Method not found")),
        }
    }

    fn list_unspent_page(
        &self,
        _min_conf: u32,
        _max_conf: u32,
        _address: &str,
        cursor: &UnspentCursor,
    ) -> Result<Option<Vec<Utxo>>, AppError> {
        if !self.state.lock().unwrap().cursor_paging {
            return Ok(None);
        }
        self.record("listunspent_page")?;
        let state = self.state.lock().unwrap();
        let start = match &cursor.after {
            None => 0,
            Some(after) => state
                .utxos
                .iter()
                .position(|u| u.txid == after.txid && u.vout == after.vout)
                .map(|p| p + 1)
                .unwrap_or(state.utxos.len()),
        };
        Ok(Some(state.utxos.iter().skip(start).take(cursor.limit).cloned().collect()))
    }
}
