//! End-to-end wallet flows:
//!
//! 1. Deterministic legacy derivation across instances and reloads
//! 2. BIP32 spend with a fee built from the pre-sign size estimate
//! 3. 2-of-3 native P2WSH partial signing across two parties
//! 4. Passphrase rotation (add, then replace)
//! 5. Address-hash stability across chain extension
//! 6. Erasure reconciliation in the encrypted store

use std::collections::BTreeSet;
use std::sync::Arc;

use hdvault::accounts::{AccountType, AccountTypeArmoryLegacy, AccountTypeBip32};
use hdvault::crypto::{hash160, hmac_sha512};
use hdvault::derivation::Bip32Node;
use hdvault::signer::{Recipient, RecipientKind, ScriptSpender, Signer, SpenderStatus};
use hdvault::transaction::Utxo;
use hdvault::wallet::{AccountResolverFeed, Wallet};
use hdvault::{
    AddressAccount, AddressType, KdfRomix, PassphrasePrompt, SecureBytes,
};
use tempfile::TempDir;

const BTC: u64 = 100_000_000;

fn small_kdf() -> KdfRomix {
    KdfRomix::new(4096, 1, hdvault::prng().random(32).to_vec()).unwrap()
}

fn prompt_of(pass: &'static [u8]) -> PassphrasePrompt {
    Arc::new(move |_ids| SecureBytes::from(pass))
}

fn default_types() -> BTreeSet<AddressType> {
    [AddressType::P2pkh, AddressType::P2wpkh, AddressType::NestedP2wpkh]
        .into_iter()
        .collect()
}

fn legacy_account_type(root: [u8; 32], lookup: u32) -> AccountType {
    AccountType::ArmoryLegacy(AccountTypeArmoryLegacy {
        root_priv: Some(SecureBytes::from(root)),
        root_pub: None,
        chaincode: None,
        address_types: default_types(),
        default_address_type: AddressType::P2pkh,
        lookup,
    })
}

/// Master node from a raw seed, BIP32 style.
fn master_node_from_seed(seed: &[u8]) -> Bip32Node {
    let i = hmac_sha512(b"Bitcoin seed", seed);
    Bip32Node::from_private(
        SecureBytes::from(&i[..32]),
        SecureBytes::from(&i[32..]),
        0,
        0,
        0,
    )
    .unwrap()
}

fn bip32_account_type(seed: &[u8], lookup: u32, default: AddressType) -> AccountType {
    AccountType::Bip32(AccountTypeBip32 {
        node: master_node_from_seed(seed),
        seed_fingerprint: u32::from_be_bytes(hash160(seed)[..4].try_into().unwrap()),
        derivation_path: vec![],
        nodes: vec![0, 1],
        outer_account_override: Vec::new(),
        inner_account_override: Vec::new(),
        address_types: default_types(),
        default_address_type: default,
        main: true,
        lookup,
    })
}

fn create_wallet(dir: &TempDir, name: &str, pass: &'static [u8]) -> Wallet {
    Wallet::create(&dir.path().join(name), prompt_of(pass), small_kdf()).unwrap()
}

// ----------------------------- Scenario 1 -----------------------------

#[test]
fn legacy_derivation_is_deterministic() {
    let root: [u8; 32] = hex::decode(
        "6ca4a27ac660c72b97b0374a7be43b6f26b4b42ba2e2abb0230c8bb02b7a7326",
    )
    .unwrap()
    .try_into()
    .unwrap();

    let collect_addresses = |wallet: &mut Wallet, account_id: &[u8]| -> Vec<Vec<u8>> {
        let account = wallet.account_mut(account_id).unwrap();
        (0..10)
            .map(|i| {
                account
                    .get_outer_account()
                    .unwrap()
                    .get_asset_for_index(i)
                    .unwrap()
                    .pubkey()
                    .unwrap()
                    .to_vec()
            })
            .collect()
    };

    let dir = TempDir::new().unwrap();
    let (account_id, first_run, hash_9) = {
        let mut wallet = create_wallet(&dir, "w1", b"pass");
        let account_id = wallet
            .create_address_account(&legacy_account_type(root, 20), prompt_of(b"pass"))
            .unwrap();
        for _ in 0..10 {
            wallet.get_new_address(&account_id, None).unwrap();
        }
        let pubkeys = collect_addresses(&mut wallet, &account_id);
        // P2PKH script hash of asset 9
        let entry_9 = {
            let account = wallet.account_mut(&account_id).unwrap();
            let asset_id = {
                let outer = account.get_outer_account().unwrap();
                outer.get_asset_for_index(9).unwrap().id()
            };
            account.get_address_entry_for_id(&asset_id).unwrap()
        };
        assert_eq!(entry_9.prefixed_hash[1..], hash160(&pubkeys[9]));
        (account_id, pubkeys, entry_9.prefixed_hash.clone())
    };

    // reload the same wallet: byte-identical assets
    {
        let mut wallet = Wallet::open(&dir.path().join("w1"), prompt_of(b"pass")).unwrap();
        let reloaded = collect_addresses(&mut wallet, &account_id);
        assert_eq!(first_run, reloaded);
    }

    // an independent wallet built from the same root derives the same chain
    {
        let dir2 = TempDir::new().unwrap();
        let mut wallet = create_wallet(&dir2, "w2", b"other");
        let account_id2 = wallet
            .create_address_account(&legacy_account_type(root, 20), prompt_of(b"other"))
            .unwrap();
        for _ in 0..10 {
            wallet.get_new_address(&account_id2, None).unwrap();
        }
        let second_run = collect_addresses(&mut wallet, &account_id2);
        assert_eq!(first_run, second_run);
        assert_eq!(hash160(&second_run[9]).to_vec(), hash_9[1..].to_vec());
    }
}

// ----------------------------- Scenario 2 -----------------------------

#[test]
fn bip32_spend_with_size_estimate() {
    let dir = TempDir::new().unwrap();
    let mut wallet = create_wallet(&dir, "spender", b"pw");
    let account_id = wallet
        .create_address_account(
            &bip32_account_type(b"scenario-2-seed", 5, AddressType::P2wpkh),
            prompt_of(b"pw"),
        )
        .unwrap();

    // fund index 0 with 1 BTC
    let funding = wallet.get_new_address(&account_id, None).unwrap();
    let utxo = Utxo::new([0xF0; 32], 0, BTC, funding.script.clone());

    let change = wallet.get_new_change_address(&account_id, None).unwrap();

    let fee_per_byte = 200u64;
    let send_value = 90_000_000u64;

    // draft pass to size the transaction, then set the change
    let build = |change_value: u64| {
        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(utxo.clone(), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x99; 20],
            value: send_value,
        }));
        signer.add_recipient(
            Recipient::from_script(&change.script, change_value).unwrap(),
        );
        signer
    };

    let ddc = Arc::clone(wallet.ddc());
    let lock = ddc.lock(prompt_of(b"pw"));
    let account = wallet.account_mut(&account_id).unwrap();
    let feed = AccountResolverFeed::new(account, &ddc, &lock);

    let mut draft = build(0);
    draft.resolve_spenders(&feed).unwrap();
    let estimate = draft.estimate_size();
    let fee = estimate as u64 * fee_per_byte;
    assert!(fee < BTC - send_value);

    let mut signer = build(BTC - send_value - fee);
    signer.sign(&feed).unwrap();
    assert!(signer.is_signed());
    signer.verify().unwrap();

    let raw = signer.serialize_signed_tx().unwrap();
    let tolerance = 2 * signer.spenders().len();
    assert!(
        raw.len().abs_diff(signer.estimate_size()) <= tolerance,
        "estimate {} vs actual {}",
        signer.estimate_size(),
        raw.len()
    );

    // the fee rate the estimate implied holds on the wire
    let actual_fee_rate = fee / raw.len() as u64;
    assert!(actual_fee_rate.abs_diff(fee_per_byte) <= 5);
}

// ----------------------------- Scenario 3 -----------------------------

struct Cosigner {
    _dir: TempDir,
    wallet: Wallet,
    account_id: Vec<u8>,
    asset_id: Vec<u8>,
}

fn make_cosigner(seed: &[u8], pass: &'static [u8]) -> Cosigner {
    let dir = TempDir::new().unwrap();
    let mut wallet = Wallet::create(
        &dir.path().join("cosigner"),
        prompt_of(pass),
        small_kdf(),
    )
    .unwrap();
    let account_id = wallet
        .create_address_account(
            &bip32_account_type(seed, 10, AddressType::P2wpkh),
            prompt_of(pass),
        )
        .unwrap();
    let entry = wallet.get_new_address(&account_id, None).unwrap();
    Cosigner {
        _dir: dir,
        wallet,
        account_id,
        asset_id: entry.asset_id,
    }
}

#[test]
fn two_of_three_p2wsh_partial_signing() {
    let mut a = make_cosigner(b"cosigner-a", b"pa");
    let mut b = make_cosigner(b"cosigner-b", b"pb");
    let c = make_cosigner(b"cosigner-c", b"pc");

    // assemble the 2-of-3 address from the three cosigner assets
    let ms_asset = AddressAccount::build_multisig_asset(
        &[
            (a.wallet.account(&a.account_id).unwrap(), &a.asset_id),
            (b.wallet.account(&b.account_id).unwrap(), &b.asset_id),
            (c.wallet.account(&c.account_id).unwrap(), &c.asset_id),
        ],
        2,
    )
    .unwrap();
    let ms_address = hdvault::AddressEntry::instantiate(&ms_asset, AddressType::P2wsh).unwrap();
    let witness_script = ms_address.inner_script.clone().unwrap();
    let utxo = Utxo::new([0xAB; 32], 0, BTC, ms_address.script.clone());

    let build_base = |utxo: &Utxo| {
        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(utxo.clone(), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x77; 20],
            value: BTC - 50_000,
        }));
        signer
    };

    // party A signs first
    let state_a = {
        let ddc = Arc::clone(a.wallet.ddc());
        let lock = ddc.lock(prompt_of(b"pa"));
        let account = a.wallet.account_mut(&a.account_id).unwrap();
        let feed = AccountResolverFeed::new(account, &ddc, &lock);
        feed.register_script(&witness_script);

        let mut signer = build_base(&utxo);
        signer.sign(&feed).unwrap();
        assert_eq!(signer.spenders()[0].status(), SpenderStatus::PartiallySigned);

        let eval = signer.evaluate_signed_state().unwrap();
        assert_eq!(eval.input(0).unwrap().sig_count, 1);
        assert!(!eval.is_valid());

        signer.serialize_state().unwrap()
    };

    // party B completes and finalizes
    let (final_tx, state_b) = {
        let ddc = Arc::clone(b.wallet.ddc());
        let lock = ddc.lock(prompt_of(b"pb"));
        let account = b.wallet.account_mut(&b.account_id).unwrap();
        let feed = AccountResolverFeed::new(account, &ddc, &lock);
        feed.register_script(&witness_script);

        let mut signer = Signer::from_state(&state_a).unwrap();
        signer.populate_utxo(utxo.clone()).unwrap();
        signer.sign(&feed).unwrap();
        signer.verify().unwrap();

        let eval = signer.evaluate_signed_state().unwrap();
        assert_eq!(eval.input(0).unwrap().sig_count, 2);
        assert!(eval.is_valid());

        (
            signer.serialize_signed_tx().unwrap(),
            signer.serialize_state().unwrap(),
        )
    };

    // merging in reverse order yields the same bytes
    {
        let mut forward = Signer::from_state(&state_a).unwrap();
        forward.merge_state(&state_b).unwrap();
        let mut reverse = Signer::from_state(&state_b).unwrap();
        reverse.merge_state(&state_a).unwrap();
        assert_eq!(
            forward.serialize_state().unwrap(),
            reverse.serialize_state().unwrap()
        );

        forward.verify().unwrap();
        assert_eq!(forward.serialize_signed_tx().unwrap(), final_tx);
    }
}

// ----------------------------- Scenario 4 -----------------------------

#[test]
fn passphrase_rotation_add_then_replace() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rotating");
    Wallet::create(&path, prompt_of(b"alpha"), small_kdf()).unwrap();

    let can_open = |pass: &'static [u8]| -> bool {
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let prompt: PassphrasePrompt = Arc::new(move |_ids| {
            if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                SecureBytes::from(pass)
            } else {
                SecureBytes::empty()
            }
        });
        Wallet::open(&path, prompt).is_ok()
    };

    // add "beta" alongside "alpha"
    {
        let wallet = Wallet::open(&path, prompt_of(b"alpha")).unwrap();
        wallet
            .change_passphrase(prompt_of(b"alpha"), SecureBytes::from(&b"beta"[..]), false)
            .unwrap();
    }
    assert!(can_open(b"alpha"));
    assert!(can_open(b"beta"));

    // replace "alpha" with "gamma"
    {
        let wallet = Wallet::open(&path, prompt_of(b"alpha")).unwrap();
        wallet
            .change_passphrase(prompt_of(b"alpha"), SecureBytes::from(&b"gamma"[..]), true)
            .unwrap();
    }
    assert!(!can_open(b"alpha"));
    assert!(can_open(b"beta"));
    assert!(can_open(b"gamma"));
}

// ----------------------------- Scenario 5 -----------------------------

#[test]
fn address_hash_index_survives_chain_extension() {
    let dir = TempDir::new().unwrap();
    let mut wallet = create_wallet(&dir, "extending", b"pw");
    let account_id = wallet
        .create_address_account(
            &bip32_account_type(b"scenario-5-seed", 5, AddressType::P2wpkh),
            prompt_of(b"pw"),
        )
        .unwrap();

    // register five addresses; address 2 is the one receiving funds
    let mut entries = Vec::new();
    for _ in 0..5 {
        entries.push(wallet.get_new_address(&account_id, None).unwrap());
    }
    let target = entries[2].clone();

    // the index resolves the scripthash before the extension
    let account = wallet.account_mut(&account_id).unwrap();
    let (asset_id, ae_type) = account
        .get_asset_id_pair_for_addr(&target.prefixed_hash)
        .unwrap();
    assert_eq!(asset_id, target.asset_id);
    assert_eq!(ae_type, AddressType::P2wpkh);

    // extend to ten addresses and re-register
    for _ in 0..5 {
        wallet.get_new_address(&account_id, None).unwrap();
    }

    let account = wallet.account_mut(&account_id).unwrap();
    let (asset_id, ae_type) = account
        .get_asset_id_pair_for_addr(&target.prefixed_hash)
        .unwrap();
    assert_eq!(asset_id, target.asset_id);
    assert_eq!(ae_type, AddressType::P2wpkh);

    // the same holds after a close/reload cycle
    drop(wallet);
    let mut wallet = Wallet::open(&dir.path().join("extending"), prompt_of(b"pw")).unwrap();
    let account = wallet.account_mut(&account_id).unwrap();
    let (asset_id, _) = account
        .get_asset_id_pair_for_addr(&target.prefixed_hash)
        .unwrap();
    assert_eq!(asset_id, target.asset_id);

    // and the address entry built from the id matches the original script
    let entry = account.get_address_entry_for_id(&asset_id).unwrap();
    assert_eq!(entry.script, target.script);
}

// ----------------------------- Scenario 6 -----------------------------

#[test]
fn erasure_reconciliation_across_overwrites() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("erasing");
    let salt = SecureBytes::from([0x61u8; 32]);
    let root = vec![0x62u8; 32];

    {
        let iface = hdvault::WalletDbInterface::open(&path).unwrap();
        iface.set_db_count(1).unwrap();
        iface.open_db("records", &salt, &root).unwrap();

        for value in [b"A".as_slice(), b"B", b"C"] {
            let tx = iface.begin_write_transaction("records").unwrap();
            tx.insert(b"K", value).unwrap();
            tx.commit().unwrap();
        }

        // key-cycle flag, two erasure markers, the live payload; the two
        // wiped slots leave holes the markers account for
        let raw = iface.raw_records("records").unwrap();
        let db_keys: Vec<u32> = raw.iter().map(|(k, _)| *k).collect();
        assert_eq!(db_keys, vec![0, 2, 4, 5]);
    }

    // reload reconciles every gap; exactly one live record remains
    let iface = hdvault::WalletDbInterface::open(&path).unwrap();
    iface.open_db("records", &salt, &root).unwrap();
    let tx = iface.begin_read_transaction("records").unwrap();
    assert_eq!(tx.get(b"K").unwrap(), b"C");
    assert_eq!(tx.iter().len(), 1);
}

// ----------------------------- Watching-only copy -----------------------------

#[test]
fn watching_only_copy_tracks_addresses_without_keys() {
    let dir = TempDir::new().unwrap();
    let mut wallet = create_wallet(&dir, "full", b"pw");
    let account_id = wallet
        .create_address_account(
            &bip32_account_type(b"wo-seed", 5, AddressType::P2wpkh),
            prompt_of(b"pw"),
        )
        .unwrap();
    let first = wallet.get_new_address(&account_id, None).unwrap();

    let wo_dir = TempDir::new().unwrap();
    let mut wo = wallet
        .watching_only_copy(&wo_dir.path().join("watch"))
        .unwrap();

    // the copy observes the same address space
    let wo_account = wo.account_mut(&account_id).unwrap();
    let entry = wo_account.get_address_entry_for_id(&first.asset_id).unwrap();
    assert_eq!(entry.script, first.script);

    // but holds no private material
    for account in wo_account.account_map().values() {
        if let Some(root) = account.root() {
            assert!(!root.has_private_key());
        }
    }

    // and keeps deriving the same future addresses
    let next_full = wallet.get_new_address(&account_id, None).unwrap();
    let next_wo = wo.get_new_address(&account_id, None).unwrap();
    assert_eq!(next_full.script, next_wo.script);
}
