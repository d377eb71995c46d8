pub mod credentials;
pub mod signature;
