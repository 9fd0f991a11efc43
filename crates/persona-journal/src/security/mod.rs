//! Key custody for the encrypted journal database
pub mod key_custodian;
pub mod secret_store;
pub use key_custodian::{DatabaseKey, KeyCustodian, DATABASE_KEY_NAME};
pub use secret_store::{FileSecretStore, MemorySecretStore, SecretStore, SecretStoreError};
