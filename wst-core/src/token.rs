//! Address tokens: the destination descriptor carried in the `tkn` query
//! parameter of every transport request.
//!
//! Wire format is `base64("<host>:<port>")`, or with a shared secret
//! `base64("<host>:<port>:<hex hmac-sha256>")`.

use crate::address::Endpoint;
use crate::auth::{self, AuthError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Reason given to clients whose token cannot be resolved.
pub const REJECT_REASON: &str = "Unable to determine tunnel target";

/// Token errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(&'static str),
    #[error("{}", REJECT_REASON)]
    Rejected,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// A decoded (and, when required, verified) address token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressToken {
    pub target: Endpoint,
    pub signature: Option<Vec<u8>>,
}

impl AddressToken {
    /// Build the token string for a destination, signing it when a key is set.
    pub fn encode(
        target: &Endpoint,
        auth_key: Option<&str>,
        identity: Option<&str>,
    ) -> Result<String, TokenError> {
        let mut raw = target.to_string();
        if let Some(key) = auth_key {
            let signature =
                auth::sign_target(key, identity.unwrap_or_default(), &target.host, target.port)?;
            raw.push(':');
            raw.push_str(&hex::encode(signature));
        }
        Ok(STANDARD.encode(raw.as_bytes()))
    }

    /// Parse a token string without checking any signature.
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|_| TokenError::Malformed("not base64"))?;
        let raw = String::from_utf8(bytes).map_err(|_| TokenError::Malformed("not text"))?;

        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 2 {
            return Err(TokenError::Malformed("missing port"));
        }
        let port = parts[1]
            .parse::<u16>()
            .map_err(|_| TokenError::Malformed("port is not numeric"))?;
        if parts[0].is_empty() || port == 0 {
            return Err(TokenError::Malformed("empty host or port"));
        }
        // An undecodable signature is treated as absent.
        let signature = parts.get(2).and_then(|sig| hex::decode(sig).ok());

        Ok(Self {
            target: Endpoint::new(parts[0], port),
            signature,
        })
    }

    /// Decode a token and resolve its destination.
    ///
    /// Without a shared secret any well-formed token is accepted. With one,
    /// the signature must match the HMAC of `identity:host:port`.
    pub fn decode(
        token: &str,
        shared_secret: Option<&str>,
        identity: Option<&str>,
    ) -> Result<Endpoint, TokenError> {
        let parsed = Self::parse(token)?;
        let Some(secret) = shared_secret else {
            return Ok(parsed.target);
        };

        let signature = parsed.signature.ok_or(TokenError::Rejected)?;
        let target = parsed.target;
        if auth::verify_target(
            secret,
            identity.unwrap_or_default(),
            &target.host,
            target.port,
            &signature,
        ) {
            Ok(target)
        } else {
            Err(TokenError::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_roundtrip() {
        let cases = [
            ("localhost", 1u16),
            ("db.internal", 5432),
            ("10.0.0.5", 22),
            ("a-very-long-host-name.with.many.labels.example.com", 65535),
        ];
        for (host, port) in cases {
            let target = Endpoint::new(host, port);
            let token = AddressToken::encode(&target, None, None).unwrap();
            assert_eq!(AddressToken::decode(&token, None, None).unwrap(), target);
        }
    }

    #[test]
    fn test_wire_format() {
        let token = AddressToken::encode(&Endpoint::new("db.internal", 5432), None, None).unwrap();
        assert_eq!(token, "ZGIuaW50ZXJuYWw6NTQzMg==");

        let signed = AddressToken::encode(
            &Endpoint::new("10.0.0.5", 22),
            Some("s3cret"),
            Some("abc123"),
        )
        .unwrap();
        assert_eq!(
            signed,
            "MTAuMC4wLjU6MjI6MjA3MjFhMTM5NDdkMDAyZDY0NzA4NGM0OTU2NDdmYTYzOTg3Y2Y2NjQzNTY3NTVjOGQyOTU5ZGIzYzg3OWM0Mw=="
        );
    }

    #[test]
    fn test_signed_accept_and_reject() {
        let target = Endpoint::new("10.0.0.5", 22);
        let token = AddressToken::encode(&target, Some("s3cret"), Some("abc123")).unwrap();

        let parsed = AddressToken::parse(&token).unwrap();
        assert_eq!(
            hex::encode(parsed.signature.unwrap()),
            "20721a13947d002d647084c495647fa63987cf664356755c8d2959db3c879c43"
        );

        assert_eq!(
            AddressToken::decode(&token, Some("s3cret"), Some("abc123")).unwrap(),
            target
        );

        let err = AddressToken::decode(&token, Some("other"), Some("abc123")).unwrap_err();
        assert_eq!(err.to_string(), REJECT_REASON);

        // A token replayed under another identity does not verify.
        assert!(AddressToken::decode(&token, Some("s3cret"), Some("zzz")).is_err());
    }

    #[test]
    fn test_unsigned_token_rejected_when_secret_configured() {
        let token = AddressToken::encode(&Endpoint::new("10.0.0.5", 22), None, None).unwrap();
        assert!(matches!(
            AddressToken::decode(&token, Some("s3cret"), Some("abc123")),
            Err(TokenError::Rejected)
        ));
    }

    #[test]
    fn test_signed_token_accepted_in_open_mode() {
        let target = Endpoint::new("10.0.0.5", 22);
        let token = AddressToken::encode(&target, Some("s3cret"), Some("abc123")).unwrap();
        assert_eq!(AddressToken::decode(&token, None, None).unwrap(), target);
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(matches!(
            AddressToken::decode("!!!", None, None),
            Err(TokenError::Malformed(_))
        ));
        let no_port = STANDARD.encode("hostonly");
        assert!(matches!(
            AddressToken::decode(&no_port, None, None),
            Err(TokenError::Malformed(_))
        ));
        let bad_port = STANDARD.encode("host:ssh");
        assert!(matches!(
            AddressToken::decode(&bad_port, None, None),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let token = STANDARD.encode("10.0.0.5:22:not-hex");
        assert!(matches!(
            AddressToken::decode(&token, Some("s3cret"), Some("abc123")),
            Err(TokenError::Rejected)
        ));
    }
}
