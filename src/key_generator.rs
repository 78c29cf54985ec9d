//! Identifier strategies for the rate limiter.

use crate::ammo::Ammo;
use crate::error::HttpError;

/// Strategy for deriving a limiter identifier from a request
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStrategy {
    /// Use the client IP address
    IpAddress,
    /// Use the API key header
    ApiKey,
    /// Use the user id header
    UserId,
    /// Composite key from multiple sources
    Composite(Vec<KeyStrategy>),
}

/// Derives limiter identifiers from request context
pub struct KeyGenerator {
    default_strategy: KeyStrategy,
}

impl KeyGenerator {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            default_strategy: strategy,
        }
    }

    /// Derive an identifier using the configured strategy
    pub fn generate(&self, ammo: &Ammo) -> Result<String, HttpError> {
        self.generate_with_strategy(&self.default_strategy, ammo)
    }

    pub fn generate_with_strategy(
        &self,
        strategy: &KeyStrategy,
        ammo: &Ammo,
    ) -> Result<String, HttpError> {
        match strategy {
            KeyStrategy::IpAddress => Ok(ammo.ip().to_string()),
            KeyStrategy::ApiKey => ammo
                .header("x-api-key")
                .or_else(|| ammo.header("authorization"))
                .ok_or_else(|| HttpError::with_message(401, "missing API key")),
            KeyStrategy::UserId => ammo
                .header("x-user-id")
                .ok_or_else(|| HttpError::with_message(401, "missing user id")),
            KeyStrategy::Composite(strategies) => {
                let mut parts = Vec::with_capacity(strategies.len());
                for sub in strategies {
                    if matches!(sub, KeyStrategy::Composite(_)) {
                        return Err(HttpError::internal());
                    }
                    parts.push(self.generate_with_strategy(sub, ammo)?);
                }
                Ok(parts.join(":"))
            }
        }
    }

    /// Sanitize an identifier so the storage key stays well-formed
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_alphanumeric() || c == ':' || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyStrategy::IpAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ammo::RequestInfo;
    use http::Method;
    use serde_json::Map;

    fn ammo() -> Ammo {
        Ammo::new(
            RequestInfo {
                method: Method::GET,
                path: "/api/test".to_string(),
                endpoint: "/api/test".to_string(),
                ip: "192.168.1.1".to_string(),
                protocol: "http".to_string(),
                hostname: "localhost".to_string(),
                full_url: "http://localhost/api/test".to_string(),
                headers: vec![
                    ("x-api-key".to_string(), "test-api-key".to_string()),
                    ("x-user-id".to_string(), "user123".to_string()),
                ],
            },
            Map::new(),
        )
    }

    #[test]
    fn test_ip_address_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::IpAddress);
        assert_eq!(generator.generate(&ammo()).unwrap(), "192.168.1.1");
    }

    #[test]
    fn test_api_key_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::ApiKey);
        assert_eq!(generator.generate(&ammo()).unwrap(), "test-api-key");
    }

    #[test]
    fn test_user_id_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::UserId);
        assert_eq!(generator.generate(&ammo()).unwrap(), "user123");
    }

    #[test]
    fn test_missing_header_is_unauthorized() {
        let generator = KeyGenerator::new(KeyStrategy::UserId);
        let mut info = RequestInfo {
            method: Method::GET,
            path: "/".to_string(),
            endpoint: "/".to_string(),
            ip: "1.1.1.1".to_string(),
            protocol: "http".to_string(),
            hostname: "localhost".to_string(),
            full_url: "http://localhost/".to_string(),
            headers: vec![],
        };
        info.headers.clear();
        let bare = Ammo::new(info, Map::new());
        assert_eq!(generator.generate(&bare).unwrap_err().resolve().0, 401);
    }

    #[test]
    fn test_composite_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::Composite(vec![
            KeyStrategy::UserId,
            KeyStrategy::IpAddress,
        ]));
        assert_eq!(generator.generate(&ammo()).unwrap(), "user123:192.168.1.1");
    }

    #[test]
    fn test_nested_composite_rejected() {
        let generator = KeyGenerator::new(KeyStrategy::Composite(vec![KeyStrategy::Composite(
            vec![KeyStrategy::IpAddress],
        )]));
        assert!(generator.generate(&ammo()).is_err());
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(
            KeyGenerator::sanitize_key("rl:1.2.3.4/path?q=1"),
            "rl:1.2.3.4_path_q_1"
        );
    }
}
