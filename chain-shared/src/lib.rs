pub mod address;
pub mod crypto;
pub mod error;
pub mod hash;

pub use error::Error;
pub use hash::Hash256;

pub type Result<T> = std::result::Result<T, Error>;
