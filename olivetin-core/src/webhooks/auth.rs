//! Webhook authentication

use super::WebhookRequest;
use crate::config::WebhookConfig;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, warn};

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Checks the request against the webhook's `authType`. `none` (or unset)
/// accepts everything, unknown types reject everything.
pub fn verify(webhook: &WebhookConfig, request: &WebhookRequest) -> bool {
    match webhook.auth_type.as_str() {
        "hmac-sha256" => verify_hmac::<Hmac<Sha256>>(webhook, request, "sha256="),
        "hmac-sha1" => verify_hmac::<Hmac<Sha1>>(webhook, request, "sha1="),
        "bearer" => verify_bearer(webhook, request),
        "basic" => verify_basic(webhook, request),
        "none" | "" => true,
        other => {
            warn!(auth_type = other, "Unknown webhook auth type, rejecting");
            false
        }
    }
}

fn require_secret(webhook: &WebhookConfig) -> bool {
    if webhook.secret.is_empty() {
        warn!(auth_type = %webhook.auth_type, "Webhook auth type requires a secret");
        return false;
    }
    true
}

fn verify_hmac<M: Mac + hmac::digest::KeyInit>(webhook: &WebhookConfig, request: &WebhookRequest, prefix: &str) -> bool {
    if !require_secret(webhook) {
        return false;
    }

    let header = if webhook.auth_header.is_empty() {
        DEFAULT_SIGNATURE_HEADER
    } else {
        webhook.auth_header.as_str()
    };

    let Some(signature) = request.header(header) else {
        debug!(header, "Missing webhook signature header");
        return false;
    };

    let signature = signature.strip_prefix(prefix).unwrap_or(signature);
    let Ok(expected) = hex::decode(signature.trim()) else {
        debug!(header, "Webhook signature is not hex");
        return false;
    };

    let Ok(mut mac) = <M as Mac>::new_from_slice(webhook.secret.as_bytes()) else {
        return false;
    };
    mac.update(&request.body);
    mac.verify_slice(&expected).is_ok()
}

fn verify_bearer(webhook: &WebhookConfig, request: &WebhookRequest) -> bool {
    if !require_secret(webhook) {
        return false;
    }

    match request.header("Authorization").and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token == webhook.secret,
        None => {
            debug!("Missing or invalid Bearer token");
            false
        }
    }
}

/// The secret is `user:pass`, or just a password that any user name may use.
fn verify_basic(webhook: &WebhookConfig, request: &WebhookRequest) -> bool {
    if !require_secret(webhook) {
        return false;
    }

    let Some((username, password)) = basic_credentials(request) else {
        debug!("Missing Basic auth header");
        return false;
    };

    match webhook.secret.split_once(':') {
        Some((expected_user, expected_pass)) => username == expected_user && password == expected_pass,
        None => password == webhook.secret,
    }
}

fn basic_credentials(request: &WebhookRequest) -> Option<(String, String)> {
    let encoded = request.header("Authorization")?.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(header: &str, value: &str, body: &[u8]) -> WebhookRequest {
        let mut request = WebhookRequest {
            method: "POST".into(),
            body: body.to_vec(),
            ..Default::default()
        };
        request.headers.insert(header.to_ascii_lowercase(), value.to_string());
        request
    }

    fn webhook(auth_type: &str, secret: &str) -> WebhookConfig {
        WebhookConfig {
            auth_type: auth_type.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    fn sign_sha256(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_hmac_sha256_with_and_without_prefix() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign_sha256("topsecret", body);
        let hook = webhook("hmac-sha256", "topsecret");

        assert!(verify(&hook, &request_with("X-Webhook-Signature", &sig, body)));
        assert!(verify(&hook, &request_with("X-Webhook-Signature", &format!("sha256={}", sig), body)));
        assert!(!verify(&hook, &request_with("X-Webhook-Signature", &sig, b"tampered")));
        assert!(!verify(&hook, &request_with("X-Other", &sig, body)));
        assert!(!verify(&webhook("hmac-sha256", ""), &request_with("X-Webhook-Signature", &sig, body)));
    }

    #[test]
    fn test_hmac_sha1_custom_header() {
        let body = b"payload";
        let mut mac = Hmac::<Sha1>::new_from_slice(b"k").unwrap();
        mac.update(body);
        let sig = format!("sha1={}", hex::encode(mac.finalize().into_bytes()));

        let mut hook = webhook("hmac-sha1", "k");
        hook.auth_header = "X-Hub-Signature".into();

        assert!(verify(&hook, &request_with("x-hub-signature", &sig, body)));
    }

    #[test]
    fn test_bearer_and_basic() {
        let bearer = webhook("bearer", "tok");
        assert!(verify(&bearer, &request_with("Authorization", "Bearer tok", b"")));
        assert!(!verify(&bearer, &request_with("Authorization", "Bearer nope", b"")));
        assert!(!verify(&bearer, &request_with("Authorization", "tok", b"")));

        let creds = base64::engine::general_purpose::STANDARD.encode("ci:pw");
        let basic = webhook("basic", "ci:pw");
        assert!(verify(&basic, &request_with("Authorization", &format!("Basic {}", creds), b"")));

        let password_only = webhook("basic", "pw");
        assert!(verify(&password_only, &request_with("Authorization", &format!("Basic {}", creds), b"")));
        assert!(!verify(&webhook("basic", "other"), &request_with("Authorization", &format!("Basic {}", creds), b"")));
    }

    #[test]
    fn test_none_and_unknown() {
        let request = WebhookRequest::default();
        assert!(verify(&webhook("", ""), &request));
        assert!(verify(&webhook("none", ""), &request));
        assert!(!verify(&webhook("jwt", "x"), &request));
    }
}
