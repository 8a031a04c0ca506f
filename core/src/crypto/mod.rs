// Session payload encryption

pub mod cipher;

pub use cipher::{Cipher, CryptoError, SessionCipher};
