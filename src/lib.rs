//! hdvault: a hierarchical-deterministic Bitcoin wallet engine.
//!
//! Three subsystems make up the core:
//!
//! - **Key tree** — asset accounts and address accounts over four
//!   derivation schemes (legacy chain-code, BIP32, BIP32-with-salt, ECDH),
//!   with extend-on-demand address lookup.
//! - **Encrypted vault** — a record store where every entry travels in an
//!   authenticated IES envelope under rotating session keys, plus the
//!   decrypted-data container that serves key material behind a scoped
//!   lock.
//! - **Signer** — spender/recipient assembly, script resolution through a
//!   resolver feed, legacy and BIP143 sighash, multi-party state exchange,
//!   and verification.
//!
//! # Locking discipline
//!
//! Private material only exists while a [`ddc::DdcLock`] guard is alive;
//! dropping the last guard zeroizes the cache. Database writes buffer in
//! per-thread transactions that nest; the outermost `commit` flushes,
//! dropping it uncommitted rolls back.

#![forbid(unsafe_code)]

pub mod accounts;
pub mod address;
pub mod assets;
pub mod crypto;
pub mod db;
pub mod ddc;
pub mod derivation;
pub mod encryption;
pub mod kdf;
pub mod prng;
pub mod script;
pub mod signer;
pub mod transaction;
pub mod util;
pub mod verify;
pub mod wallet;

pub use accounts::{
    AccountType, AccountTypeArmoryLegacy, AccountTypeBip32, AccountTypeEcdh, AddressAccount,
    AssetAccount, MetaDataAccount, DEFAULT_LOOKUP,
};
pub use address::{AddressEntry, AddressType};
pub use assets::{AssetEntry, PrivateKeyAsset};
pub use db::{DbTransaction, WalletDbInterface};
pub use ddc::{DdcLock, DdcStore, DecryptedDataContainer, PassphrasePrompt};
pub use derivation::{Bip32Node, DerivationScheme, EcdhSalts};
pub use encryption::{CipherSpec, EncryptedData, EncryptedSeed, EncryptionKeyAsset};
pub use kdf::KdfRomix;
pub use prng::{prng, Prng};
pub use signer::{
    Recipient, RecipientKind, ResolverFeed, ScriptSpender, Signer, SignerError, SpenderStatus,
    StackItem,
};
pub use transaction::{Outpoint, Utxo};
pub use util::SecureBytes;
pub use verify::{verify_transaction, TxEvalState};
pub use wallet::{AccountResolverFeed, Wallet, WalletHeader};
