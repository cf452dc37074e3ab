pub mod bytes;
pub mod channel;
pub mod codec;
pub mod commands;
pub mod config;
pub mod controller;
pub mod cryptography;
pub mod error;
pub mod events;
pub mod handshake;
pub mod networking;
pub mod session;
pub mod storage;
pub mod utils;

pub use error::{Result, TransferError};

/// Well-known port the hosting side listens on.
pub const DEFAULT_PORT: u16 = 3290;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const ENCRYPTION_OVERHEAD: usize = 16;

/// Plaintext bytes carried by one full chunk.
pub const CHUNK_SIZE: usize = 5_000_000;
/// Largest chunk either side will emit or accept, whatever its own config says.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Major protocol version spoken by this build.
pub const PROTOCOL_VERSION: u64 = 9;
/// Oldest peer version this build can interoperate with.
pub const MIN_SUPPORTED_VERSION: u64 = 8;
