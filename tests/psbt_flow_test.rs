//! PSBT workflows end to end: create, sign, finalize, broadcast.

mod common;

use common::{test_backend, MockIndexer};

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use btc_wallet::backend::Backend;
use btc_wallet::bitcoin::address::{generate_address_info, script_pubkey};
use btc_wallet::bitcoin::psbt::{decode_psbt, encode_psbt};
use btc_wallet::config::Network;
use btc_wallet::storage::{AddressType, MemoryStorage};
use btc_wallet::wallet::psbt::{PsbtCreateRequest, PsbtOutput};

const DEST: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

fn scripthash_at(backend: &Backend<MemoryStorage>, name: &str, index: u32) -> String {
    let wallet = backend.get_wallet(name).unwrap().unwrap();
    generate_address_info(&wallet.seed, Network::Mainnet, index, wallet.address_type)
        .unwrap()
        .scripthash
}

#[tokio::test]
async fn test_psbt_create_sign_finalize_broadcast() {
    let mock = MockIndexer::new(150);
    let backend = test_backend(mock.clone());
    backend
        .create_wallet("treasury", None, AddressType::P2wpkh)
        .unwrap();
    mock.fund(&scripthash_at(&backend, "treasury", 0), 100_000, 100, 0x01);

    let created = backend
        .create_psbt(
            "treasury",
            PsbtCreateRequest {
                outputs: vec![PsbtOutput {
                    address: DEST.to_string(),
                    amount: 30_000,
                }],
                fee_rate: 10,
                min_confirmations: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(created.inputs_count, 1);
    assert_eq!(created.total_input, 100_000);
    assert_eq!(created.total_output, 30_000);
    // Change went to a fresh internal address.
    let change_address = created.change_address.clone().unwrap();
    let wallet = backend.get_wallet("treasury").unwrap().unwrap();
    assert_eq!(wallet.next_address_index, 6);
    let records = backend.stored_addresses("treasury").unwrap();
    let change_record = records.iter().find(|a| a.index == 5).unwrap();
    assert_eq!(change_record.address, change_address);
    assert_eq!(change_record.derivation_path, "m/84'/0'/0'/1/5");

    // The unsigned packet carries witness UTXOs and our pubkey hints.
    let packet = decode_psbt(&created.psbt).unwrap();
    assert_eq!(packet.inputs.len(), 1);
    assert!(packet.inputs[0].witness_utxo.is_some());
    assert_eq!(packet.inputs[0].bip32_derivation.len(), 1);
    assert_eq!(packet.unsigned_tx.output.len(), 2);

    let signed = backend
        .sign_wallet_psbt("treasury", &created.psbt)
        .await
        .unwrap();
    assert_eq!(signed.inputs_total, 1);
    assert_eq!(signed.inputs_signed, 1);

    let packet = decode_psbt(&signed.psbt).unwrap();
    assert_eq!(packet.inputs[0].partial_sigs.len(), 1);

    // Finalize without broadcasting first.
    let finalized = backend
        .finalize_wallet_psbt("treasury", &signed.psbt, false)
        .await
        .unwrap();
    assert!(!finalized.broadcast);
    assert!(mock.broadcasts.lock().unwrap().is_empty());

    // Then for real.
    let finalized = backend
        .finalize_wallet_psbt("treasury", &signed.psbt, true)
        .await
        .unwrap();
    assert!(finalized.broadcast);
    assert_eq!(finalized.broadcast_txid.as_deref(), Some(finalized.txid.as_str()));
    assert_eq!(mock.broadcasts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_psbt_sign_skips_foreign_inputs() {
    let mock = MockIndexer::new(150);
    let backend = test_backend(mock);
    backend
        .create_wallet("treasury", None, AddressType::P2wpkh)
        .unwrap();

    let ours = backend.stored_addresses("treasury").unwrap()[0].clone();
    let our_script = script_pubkey(&ours.address, Network::Mainnet).unwrap();
    let foreign_script = script_pubkey(DEST, Network::Mainnet).unwrap();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![
            TxIn {
                previous_output: OutPoint {
                    txid: "11".repeat(32).parse().unwrap(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            },
            TxIn {
                previous_output: OutPoint {
                    txid: "22".repeat(32).parse().unwrap(),
                    vout: 1,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            },
        ],
        output: vec![TxOut {
            value: Amount::from_sat(60_000),
            script_pubkey: foreign_script.clone(),
        }],
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: Amount::from_sat(50_000),
        script_pubkey: our_script,
    });
    psbt.inputs[1].witness_utxo = Some(TxOut {
        value: Amount::from_sat(20_000),
        script_pubkey: foreign_script,
    });

    let signed = backend
        .sign_wallet_psbt("treasury", &encode_psbt(&psbt))
        .await
        .unwrap();

    // Only the input paying our stored address gets a signature; the other
    // stays untouched for its rightful signer.
    assert_eq!(signed.inputs_total, 2);
    assert_eq!(signed.inputs_signed, 1);

    let packet = decode_psbt(&signed.psbt).unwrap();
    assert_eq!(packet.inputs[0].partial_sigs.len(), 1);
    assert!(packet.inputs[1].partial_sigs.is_empty());
}

#[tokio::test]
async fn test_psbt_sign_is_idempotent() {
    let mock = MockIndexer::new(150);
    let backend = test_backend(mock.clone());
    backend
        .create_wallet("treasury", None, AddressType::P2wpkh)
        .unwrap();
    mock.fund(&scripthash_at(&backend, "treasury", 0), 100_000, 100, 0x01);

    let created = backend
        .create_psbt(
            "treasury",
            PsbtCreateRequest {
                outputs: vec![PsbtOutput {
                    address: DEST.to_string(),
                    amount: 40_000,
                }],
                fee_rate: 10,
                min_confirmations: None,
            },
        )
        .await
        .unwrap();

    let once = backend
        .sign_wallet_psbt("treasury", &created.psbt)
        .await
        .unwrap();
    let twice = backend
        .sign_wallet_psbt("treasury", &once.psbt)
        .await
        .unwrap();

    assert_eq!(twice.inputs_signed, 1);
    assert_eq!(
        decode_psbt(&once.psbt).unwrap(),
        decode_psbt(&twice.psbt).unwrap()
    );
}

#[tokio::test]
async fn test_psbt_create_validates_outputs() {
    let mock = MockIndexer::new(150);
    let backend = test_backend(mock.clone());
    backend
        .create_wallet("treasury", None, AddressType::P2wpkh)
        .unwrap();
    mock.fund(&scripthash_at(&backend, "treasury", 0), 100_000, 100, 0x01);

    let err = backend
        .create_psbt(
            "treasury",
            PsbtCreateRequest {
                outputs: vec![],
                fee_rate: 10,
                min_confirmations: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least one output"));

    let err = backend
        .create_psbt(
            "treasury",
            PsbtCreateRequest {
                outputs: vec![PsbtOutput {
                    address: DEST.to_string(),
                    amount: 100,
                }],
                fee_rate: 10,
                min_confirmations: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("below dust limit"));

    let err = backend
        .create_psbt(
            "treasury",
            PsbtCreateRequest {
                outputs: vec![PsbtOutput {
                    address: DEST.to_string(),
                    amount: 30_000,
                }],
                fee_rate: 2_000,
                min_confirmations: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("safety limit"));
}

#[tokio::test]
async fn test_psbt_finalize_rejects_unsigned() {
    let mock = MockIndexer::new(150);
    let backend = test_backend(mock.clone());
    backend
        .create_wallet("treasury", None, AddressType::P2wpkh)
        .unwrap();
    mock.fund(&scripthash_at(&backend, "treasury", 0), 100_000, 100, 0x01);

    let created = backend
        .create_psbt(
            "treasury",
            PsbtCreateRequest {
                outputs: vec![PsbtOutput {
                    address: DEST.to_string(),
                    amount: 30_000,
                }],
                fee_rate: 10,
                min_confirmations: None,
            },
        )
        .await
        .unwrap();

    let err = backend
        .finalize_wallet_psbt("treasury", &created.psbt, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no partial signature"));

    assert!(backend
        .finalize_wallet_psbt("treasury", "not!base64", false)
        .await
        .is_err());
}
