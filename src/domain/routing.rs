//! Destination resolution for routed requests

use super::registry::Registry;
use crate::infrastructure::protocols::sip::message::SipRequest;
use std::sync::Arc;

/// Picks the next hop for a request addressed to a user identity.
///
/// A registered identity wins; otherwise the configured fallback (if any).
#[derive(Clone)]
pub struct DestinationResolver {
    registry: Arc<dyn Registry>,
    fallback: Option<String>,
}

impl DestinationResolver {
    /// An empty `fallback` means "no fallback".
    pub fn new(registry: Arc<dyn Registry>, fallback: impl Into<String>) -> Self {
        let fallback = fallback.into();
        Self {
            registry,
            fallback: (!fallback.trim().is_empty()).then(|| fallback.trim().to_string()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub async fn resolve(&self, user: Option<&str>) -> Option<String> {
        if let Some(user) = user {
            if let Some(address) = self.registry.get(user).await {
                return Some(address);
            }
        }
        self.fallback.clone()
    }

    /// Resolve the user named in the To header of `request`
    pub async fn resolve_request(&self, request: &SipRequest) -> Option<String> {
        self.resolve(request.to_user().as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::InMemoryRegistry;

    #[tokio::test]
    async fn test_registered_user_resolves_to_address() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add("alice", "10.0.0.5:5060").await;

        let resolver = DestinationResolver::new(registry, "192.0.2.1:5060");
        assert_eq!(
            resolver.resolve(Some("alice")).await.as_deref(),
            Some("10.0.0.5:5060")
        );
    }

    #[tokio::test]
    async fn test_unknown_user_uses_fallback() {
        let resolver = DestinationResolver::new(Arc::new(InMemoryRegistry::new()), "192.0.2.1:5060");
        assert_eq!(
            resolver.resolve(Some("carol")).await.as_deref(),
            Some("192.0.2.1:5060")
        );
        assert_eq!(resolver.resolve(None).await.as_deref(), Some("192.0.2.1:5060"));
    }

    #[tokio::test]
    async fn test_request_resolved_by_to_user() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add("alice", "10.0.0.5:5060").await;
        let resolver = DestinationResolver::new(registry, "");

        let request = |to: &str| {
            SipRequest::parse(
                format!(
                    "BYE sip:{to}@10.0.0.1 SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKbye\r\n\
                     From: <sip:bob@10.0.0.1>;tag=b0b\r\n\
                     To: <sip:{to}@10.0.0.1>\r\n\
                     Call-ID: bye-1@10.0.0.9\r\n\
                     CSeq: 2 BYE\r\n\
                     Content-Length: 0\r\n\r\n"
                )
                .as_bytes(),
            )
            .unwrap()
        };

        assert_eq!(
            resolver.resolve_request(&request("alice")).await.as_deref(),
            Some("10.0.0.5:5060")
        );
        assert_eq!(resolver.resolve_request(&request("carol")).await, None);
    }

    #[tokio::test]
    async fn test_no_fallback_is_unresolvable() {
        let resolver = DestinationResolver::new(Arc::new(InMemoryRegistry::new()), "");
        assert_eq!(resolver.resolve(Some("carol")).await, None);
    }
}
