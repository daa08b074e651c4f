//! Authentication: the collaboration server's login bootstrap and token
//! verifier.

pub mod login;

pub use login::{Identity, TokenVerifier, UserDirectory};
