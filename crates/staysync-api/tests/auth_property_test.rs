//! Property tests for webhook signature verification.

use std::{sync::Arc, time::Duration};

use axum::http::{HeaderMap, HeaderValue};
use proptest::prelude::*;
use staysync_api::{
    auth::{sign, SIGNATURE_HEADER, TIMESTAMP_HEADER, TOKEN_HEADER},
    AuthConfig, AuthError, WebhookAuthenticator,
};
use staysync_core::{Clock, TestClock};
use staysync_delivery::storage::memory::MemoryStorage;

const SECRET: &str = "property-secret";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn authenticator(clock: &TestClock) -> WebhookAuthenticator {
    WebhookAuthenticator::new(
        AuthConfig {
            token: "t".into(),
            signing_secret: Some(SECRET.into()),
            replay_window: Duration::from_secs(300),
        },
        Arc::new(MemoryStorage::new()),
        Arc::new(clock.clone()),
    )
}

fn headers(timestamp: i64, signature: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TOKEN_HEADER, HeaderValue::from_static("t"));
    headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp.to_string()).unwrap());
    headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
    headers
}

proptest! {
    #[test]
    fn any_signed_body_verifies_within_the_window(
        body in prop::collection::vec(any::<u8>(), 0..256),
        skew in -300i64..=300,
    ) {
        let clock = TestClock::new();
        let auth = authenticator(&clock);
        let ts = clock.now().timestamp() + skew;

        let result = runtime().block_on(auth.authenticate(&headers(ts, &sign(SECRET, ts, &body)), None, &body));

        prop_assert_eq!(result, Ok(()));
    }

    #[test]
    fn any_single_byte_change_breaks_the_signature(
        body in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let clock = TestClock::new();
        let auth = authenticator(&clock);
        let ts = clock.now().timestamp();
        let signature = sign(SECRET, ts, &body);

        let mut tampered = body.clone();
        let at = index.index(tampered.len());
        tampered[at] ^= flip;

        let result = runtime().block_on(auth.authenticate(&headers(ts, &signature), None, &tampered));

        prop_assert_eq!(result, Err(AuthError::InvalidSignature));
    }
}
