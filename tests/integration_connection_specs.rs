mod common;

use std::io;
use std::sync::Arc;

use callx::prelude::*;
use callx::{Certificate, TlsVersion};
use common::{MockNetwork, Reply, client_builder, get};

fn secure_network() -> Arc<MockNetwork> {
    let network = MockNetwork::new(|_| Reply::text(200, "secure"));
    network.set_certificates(vec![
        Certificate::from_public_key_info("CN=secure.test", b"secure-key".to_vec())
            .with_dns_names(["secure.test"]),
    ]);
    network
}

fn client_with_specs(
    network: &Arc<MockNetwork>,
    specs: impl IntoIterator<Item = ConnectionSpec>,
) -> Client {
    client_builder(network)
        .connection_specs(specs)
        .build()
        .expect("client should build")
}

#[test]
fn default_handshake_offers_modern_tls() {
    let network = secure_network();
    let client = client_builder(&network).build().expect("client should build");

    let response = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect("call should succeed");
    assert_eq!(response.text_lossy(), "secure");

    let attempts = network.tls_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].host, "secure.test");
    assert_eq!(attempts[0].spec, ConnectionSpec::modern_tls());
    assert!(!attempts[0].is_fallback);
}

#[test]
fn failed_handshake_falls_back_to_the_next_spec() {
    let network = secure_network();
    network.fail_handshakes([io::ErrorKind::ConnectionReset]);
    let client = client_with_specs(
        &network,
        [ConnectionSpec::modern_tls(), ConnectionSpec::compatible_tls()],
    );

    let response = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect("fallback handshake should succeed");
    assert_eq!(response.text_lossy(), "secure");

    let attempts = network.tls_attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].spec, ConnectionSpec::modern_tls());
    assert!(!attempts[0].is_fallback);
    assert_eq!(attempts[1].spec, ConnectionSpec::compatible_tls());
    assert_eq!(attempts[1].spec.tls_versions(), Some(&[TlsVersion::Tls10][..]));
    assert!(attempts[1].is_fallback);
    assert_eq!(network.connects().len(), 2);
    assert_eq!(client.connection_pool().idle_connection_count(), 1);
}

#[test]
fn fallback_is_skipped_when_connection_retries_are_off() {
    let network = secure_network();
    network.fail_handshakes([io::ErrorKind::ConnectionReset]);
    let client = client_builder(&network)
        .connection_specs([ConnectionSpec::modern_tls(), ConnectionSpec::compatible_tls()])
        .retry_on_connection_failure(false)
        .build()
        .expect("client should build");

    let error = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect_err("handshake failure must surface");
    assert_eq!(error.code(), ErrorCode::Connect);
    assert_eq!(network.tls_attempts().len(), 1);
    assert_eq!(network.connects().len(), 1);
}

#[test]
fn rejected_certificate_does_not_fall_back() {
    let network = secure_network();
    network.fail_handshakes([io::ErrorKind::InvalidData]);
    let client = client_with_specs(
        &network,
        [ConnectionSpec::modern_tls(), ConnectionSpec::compatible_tls()],
    );

    let error = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect_err("certificate failure must surface");
    assert_eq!(error.code(), ErrorCode::Connect);
    assert_eq!(network.tls_attempts().len(), 1);
}

#[test]
fn cleartext_requires_a_cleartext_spec() {
    let network = secure_network();
    let client = client_with_specs(&network, [ConnectionSpec::modern_tls()]);

    let error = client
        .new_call(get("http://plain.test/"))
        .execute()
        .expect_err("cleartext must be refused");
    assert_eq!(error.code(), ErrorCode::UnknownService);
    match &error {
        Error::UnknownService { host, message } => {
            assert_eq!(host, "plain.test");
            assert!(message.contains("cleartext"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(network.connects().is_empty());
}

#[test]
fn https_requires_a_tls_spec() {
    let network = secure_network();
    let client = client_with_specs(&network, [ConnectionSpec::cleartext()]);

    let error = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect_err("tls must be refused");
    assert_eq!(error.code(), ErrorCode::UnknownService);
    assert!(network.connects().is_empty());
    assert!(network.tls_attempts().is_empty());

    client
        .new_call(get("http://secure.test/"))
        .execute()
        .expect("cleartext call should succeed");
}

#[test]
fn pooled_connections_are_shared_only_with_equal_specs() {
    let network = secure_network();
    let client = client_builder(&network).build().expect("client should build");
    client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect("first call should succeed");

    let same_specs = client.to_builder().build().expect("derived client should build");
    same_specs
        .new_call(get("https://secure.test/"))
        .execute()
        .expect("second call should succeed");
    assert_eq!(network.connects().len(), 1);

    let restricted = client
        .to_builder()
        .connection_specs([ConnectionSpec::restricted_tls()])
        .build()
        .expect("derived client should build");
    restricted
        .new_call(get("https://secure.test/"))
        .execute()
        .expect("third call should succeed");
    assert_eq!(network.connects().len(), 2);
    assert_eq!(
        network.tls_attempts().last().map(|attempt| attempt.spec.clone()),
        Some(ConnectionSpec::restricted_tls())
    );
}

#[test]
fn builder_rejects_an_empty_spec_list() {
    let network = secure_network();
    let error = client_builder(&network)
        .connection_specs(Vec::new())
        .build()
        .expect_err("empty spec list must be rejected");
    assert_eq!(error.code(), ErrorCode::InvalidConfig);
}
