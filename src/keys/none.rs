//! Identity key provider: disables the crypto path entirely. Used when the
//! operator hasn't configured any key material — objects pass through
//! unmodified and no envelope metadata is ever written.

use super::{Dek, KeyProvider, KeyProviderError};
use async_trait::async_trait;

pub struct NoneKeyProvider;

#[async_trait]
impl KeyProvider for NoneKeyProvider {
    async fn wrap(&self, _dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        unreachable!("NoneKeyProvider disables the crypto path; wrap should never be called")
    }

    async fn unwrap(&self, _wrapped: &[u8], _fingerprint: &str) -> Result<Dek, KeyProviderError> {
        unreachable!("NoneKeyProvider disables the crypto path; unwrap should never be called")
    }

    fn fingerprint(&self) -> &str {
        "none"
    }

    fn is_identity(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_identity() {
        assert!(NoneKeyProvider.is_identity());
        assert_eq!(NoneKeyProvider.fingerprint(), "none");
    }
}
