//! Bearer credential claims, signing, and revocation.

pub mod claims;
pub mod revocation;
pub mod signer;

pub use claims::{Claims, TokenKind};
pub use revocation::RevocationList;
pub use signer::{CredentialSigner, IssuedCredential};
