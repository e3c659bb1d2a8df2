//! KMS-backed key provider: delegates wrap/unwrap to an external key
//! management service. The actual network call is an external collaborator
//! (per SPEC_FULL.md's scope boundary — the KMS SDK itself is not part of
//! the crypto core), so it's expressed here as a trait object the operator
//! supplies a concrete implementation for at startup.

use super::{Dek, KeyProvider, KeyProviderError};
use async_trait::async_trait;

/// The RPC surface a concrete KMS client must implement. Kept deliberately
/// minimal — wrap/unwrap by key id, plus the current key id for fingerprint
/// reporting.
#[async_trait]
pub trait KmsClient: Send + Sync {
    async fn wrap(&self, key_id: &str, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError>;
    async fn unwrap(&self, key_id: &str, wrapped: &[u8]) -> Result<Vec<u8>, KeyProviderError>;
}

pub struct KmsKeyProvider {
    client: Box<dyn KmsClient>,
    key_id: String,
}

impl KmsKeyProvider {
    pub fn new(client: Box<dyn KmsClient>, key_id: String) -> Self {
        Self { client, key_id }
    }
}

#[async_trait]
impl KeyProvider for KmsKeyProvider {
    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        self.client.wrap(&self.key_id, dek).await
    }

    async fn unwrap(&self, wrapped: &[u8], fingerprint: &str) -> Result<Dek, KeyProviderError> {
        if fingerprint != self.key_id {
            return Err(KeyProviderError::KeyUnavailable(fingerprint.to_string()));
        }
        self.client.unwrap(&self.key_id, wrapped).await
    }

    fn fingerprint(&self) -> &str {
        &self.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeKms {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KmsClient for FakeKms {
        async fn wrap(&self, _key_id: &str, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = dek.to_vec();
            out.push(0xAA);
            Ok(out)
        }

        async fn unwrap(&self, _key_id: &str, wrapped: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
            let mut out = wrapped.to_vec();
            out.pop();
            Ok(out)
        }
    }

    #[tokio::test]
    async fn delegates_to_client_and_checks_key_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = KmsKeyProvider::new(
            Box::new(FakeKms {
                calls: calls.clone(),
            }),
            "key-1".to_string(),
        );
        let dek = vec![1, 2, 3];
        let wrapped = provider.wrap(&dek).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let unwrapped = provider.unwrap(&wrapped, "key-1").await.unwrap();
        assert_eq!(unwrapped, dek);

        let err = provider.unwrap(&wrapped, "key-2").await.unwrap_err();
        assert!(matches!(err, KeyProviderError::KeyUnavailable(_)));
    }
}
