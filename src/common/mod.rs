pub mod crypto;
pub mod exchange;
pub mod keygen;
pub mod redis_client;
pub mod time_util;
