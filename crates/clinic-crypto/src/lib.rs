pub mod aes_cbc;
pub mod aes_gcm;
pub mod digest;
pub mod error;
pub mod framing;
pub mod kdf;
pub mod keygen;
pub mod types;

pub use aes_gcm::{generate_nonce, open, seal, GcmCipher};
pub use digest::sha256_hex;
pub use error::CryptoError;
pub use framing::{append_key_id, split_key_id};
pub use kdf::{derive_key_from_password, derive_key_with_iterations};
pub use keygen::{generate_key, random_bytes};
pub use types::{
    AES_BLOCK_SIZE, AES_GCM_NONCE_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH, CBC_IV_LENGTH,
    MAX_KEY_ID_LENGTH, PBKDF2_ITERATIONS, PBKDF2_SALT_LENGTH,
};
