use std::sync::Arc;

use sigvault::{
    compute_signature, KeyStore, ManualClock, MissingHeaderPolicy, RequestParts, RequestSigner,
    SignatureConfig, SignatureEnvelope, SignatureVerifier, SignedRequest,
};

const KEY_ID: &str = "client-001";
const SECRET: &str = "secret-key-001-change-in-production";
const NOW: i64 = 1_700_000_000;

struct Harness {
    signer: RequestSigner,
    verifier: SignatureVerifier,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(KeyStore::with_clock(clock.clone()));
    store.register(KEY_ID, SECRET).unwrap();
    let config = SignatureConfig::new(MissingHeaderPolicy::Reject);
    let replay = Arc::new(sigvault::ReplayGuard::new(
        config.validity_window_secs,
        &config.replay,
    ));
    Harness {
        signer: RequestSigner::with_clock(store.clone(), &config, clock.clone()),
        verifier: SignatureVerifier::with_parts(store, replay, clock, &config).unwrap(),
    }
}

fn signed<'a>(
    env: &'a SignatureEnvelope,
    method: &'a str,
    path: &'a str,
    headers: &'a [(&'a str, &'a str)],
    body: &'a [u8],
) -> SignedRequest<'a> {
    SignedRequest {
        key_id: env.key_id(),
        signature: env.signature(),
        timestamp: env.timestamp(),
        nonce: env.nonce(),
        method,
        path,
        headers,
        body,
    }
}

#[test]
fn test_golden_vector() {
    // Pinned once. A change here means every deployed caller breaks.
    let config = SignatureConfig::new(MissingHeaderPolicy::Reject);
    let body = br#"{"msg":"hi"}"#;
    let canonical = config
        .canonicalizer()
        .canonical_string(&RequestParts {
            method: "POST",
            path: "/api/notifications",
            timestamp: 1_700_000_000,
            nonce: "abc-123",
            key_id: KEY_ID,
            headers: &[],
            body,
        })
        .unwrap();

    assert_eq!(
        canonical,
        "POST\n/api/notifications\n1700000000\nabc-123\nclient-001\n\
         2VgIUn9udKekzC09/AVkJL6l3OOUDzHxWNBq1QmPvdg="
    );
    assert_eq!(
        compute_signature(&canonical, SECRET.as_bytes()),
        "hBibddn2Ed2ViJIpEhhxsyxwIifl9AoGuD8D8pybHXM="
    );

    let h = harness();
    let env = h
        .signer
        .sign_at(KEY_ID, "post", "/api/notifications?page=2", &[], body, NOW, "abc-123")
        .unwrap();
    assert_eq!(env.signature(), "hBibddn2Ed2ViJIpEhhxsyxwIifl9AoGuD8D8pybHXM=");
}

#[test]
fn test_golden_vector_with_signed_header() {
    let h = harness();
    // Only x-api-version is signed: content-type lacks the prefix and the
    // protocol headers are excluded.
    let headers = [
        ("Content-Type", "application/json"),
        ("X-API-Version", " 2 "),
        ("X-API-Key", KEY_ID),
        ("X-API-Nonce", "abc-123"),
    ];
    let env = h
        .signer
        .sign_at(
            KEY_ID,
            "POST",
            "/api/notifications",
            &headers,
            br#"{"msg":"hi"}"#,
            NOW,
            "abc-123",
        )
        .unwrap();
    assert_eq!(env.signature(), "dDR2XyEfo7VBLguVfeQEJjA9IZsrd6g0E9i1+2EiAbg=");
}

#[test]
fn test_sign_then_verify() {
    let h = harness();
    let headers = [("x-api-version", "2"), ("x-api-tenant", "acme")];
    let cases: [(&str, &str, &[u8]); 4] = [
        ("GET", "/api/notifications", b""),
        ("POST", "/api/notifications", br#"{"msg":"hi"}"#),
        ("PUT", "/api/playlists/42", "caf\u{e9} \u{1f3b5}".as_bytes()),
        ("DELETE", "/api/playlists/42?hard=true", b""),
    ];
    for (method, path, body) in cases {
        let env = h.signer.sign(KEY_ID, method, path, &headers, body).unwrap();
        // Header order on arrival differs from signing order.
        let reversed = [headers[1], headers[0]];
        assert!(
            h.verifier.verify(&signed(&env, method, path, &reversed, body)),
            "{method} {path}"
        );
    }
}

#[test]
fn test_any_single_change_breaks_signature() {
    let h = harness();
    let headers = [("x-api-version", "2")];
    let body = br#"{"msg":"hi"}"#;
    let method = "POST";
    let path = "/api/notifications";

    let fresh = || {
        h.signer
            .sign(KEY_ID, method, path, &headers, body)
            .unwrap()
    };

    let env = fresh();
    let mut req = signed(&env, method, path, &headers, body);
    req.method = "PUT";
    assert!(!h.verifier.verify(&req));

    let env = fresh();
    let mut req = signed(&env, method, path, &headers, body);
    req.path = "/api/notificationz";
    assert!(!h.verifier.verify(&req));

    let env = fresh();
    let mut req = signed(&env, method, path, &headers, body);
    req.timestamp += 1;
    assert!(!h.verifier.verify(&req));

    let env = fresh();
    let other_nonce = format!("{}x", env.nonce());
    let mut req = signed(&env, method, path, &headers, body);
    req.nonce = &other_nonce;
    assert!(!h.verifier.verify(&req));

    let env = fresh();
    let changed_header = [("x-api-version", "3")];
    let req = signed(&env, method, path, &changed_header, body);
    assert!(!h.verifier.verify(&req));

    let env = fresh();
    let added_header = [("x-api-version", "2"), ("x-api-extra", "1")];
    let req = signed(&env, method, path, &added_header, body);
    assert!(!h.verifier.verify(&req));

    let env = fresh();
    let req = signed(&env, method, path, &headers, br#"{"msg":"hI"}"#);
    assert!(!h.verifier.verify(&req));

    // All the rejections above left their nonces unused.
    let env = fresh();
    assert!(h.verifier.verify(&signed(&env, method, path, &headers, body)));
}

#[test]
fn test_header_value_with_line_break_cannot_be_signed() {
    let h = harness();
    let headers = [("x-api-version", "2\nx-api-admin:true")];
    assert!(h
        .signer
        .sign(KEY_ID, "GET", "/api/notifications", &headers, b"")
        .is_err());
}
