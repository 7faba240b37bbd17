mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use callx::prelude::*;
use callx::{Certificate, PREEMPTIVE_CHALLENGE_SCHEME, basic_credentials};
use common::{MockNetwork, Reply, client_builder, get, lock};
use http::{Method, StatusCode};

fn site_certificate() -> Certificate {
    Certificate::from_public_key_info("CN=secure.test", b"secure-key".to_vec())
        .with_dns_names(["secure.test"])
}

fn authenticator<F>(authenticate: F) -> Arc<dyn Authenticator>
where
    F: Fn(Option<&Route>, &Response) -> callx::Result<Option<Request>> + Send + Sync + 'static,
{
    Arc::new(authenticate)
}

#[test]
fn basic_authenticator_answers_origin_challenge() {
    let expected = basic_credentials("jesse", "password1");
    let network = MockNetwork::new(move |request| {
        if request.header("authorization") == Some(expected.as_str()) {
            Reply::text(200, "welcome")
        } else {
            Reply::status(401).with_header("www-authenticate", "Basic realm=\"api\"")
        }
    });
    let client = client_builder(&network)
        .authenticator(Arc::new(BasicAuthenticator::new("jesse", "password1")))
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("http://api.test/private"))
        .execute()
        .expect("call should succeed");
    assert_eq!(response.text_lossy(), "welcome");
    assert_eq!(
        response.prior_response().map(Response::status),
        Some(StatusCode::UNAUTHORIZED)
    );
    assert_eq!(network.requests().len(), 2);
}

#[test]
fn challenge_on_a_closing_connection_is_answered_on_a_new_one() {
    let expected = basic_credentials("jesse", "password1");
    let network = MockNetwork::new(move |request| {
        if request.header("authorization") == Some(expected.as_str()) {
            return Reply::text(200, "welcome");
        }
        Reply::status(401)
            .with_header("www-authenticate", "Basic realm=\"api\"")
            .with_header("connection", "close")
    });
    let client = client_builder(&network)
        .authenticator(Arc::new(BasicAuthenticator::new("jesse", "password1")))
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("http://api.test/private"))
        .execute()
        .expect("authenticated retry should connect again");
    assert_eq!(response.text_lossy(), "welcome");
    assert_eq!(network.requests().len(), 2);
    assert_eq!(network.connects().len(), 2);
}

#[test]
fn rejected_credentials_surface_the_challenge() {
    let network = MockNetwork::new(|_| {
        Reply::status(401).with_header("www-authenticate", "Basic realm=\"api\"")
    });
    let client = client_builder(&network)
        .authenticator(Arc::new(BasicAuthenticator::new("jesse", "wrong")))
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("http://api.test/private"))
        .execute()
        .expect("challenge response should be returned");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(network.requests().len(), 2);
}

#[test]
fn authenticator_repeating_a_request_stops_the_retry_loop() {
    let network = MockNetwork::new(|_| Reply::status(401));
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let stubborn = authenticator(move |_route, response| {
        counter.fetch_add(1, Ordering::AcqRel);
        let request = response
            .request()
            .to_builder()
            .try_set_header("authorization", "Bearer same-token")?
            .build()?;
        Ok(Some(request))
    });
    let client = client_builder(&network)
        .authenticator(stubborn)
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("http://api.test/private"))
        .execute()
        .expect("challenge response should be returned");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let requests = network.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].header("authorization").is_none());
    assert_eq!(requests[1].header("authorization"), Some("Bearer same-token"));
    assert_eq!(invocations.load(Ordering::Acquire), 2);
}

#[test]
fn declining_authenticator_returns_the_challenge_unmodified() {
    let network = MockNetwork::new(|_| {
        Reply::status(401).with_header("www-authenticate", "Bearer realm=\"api\"")
    });
    let client = client_builder(&network)
        .authenticator(Arc::new(BasicAuthenticator::new("user", "pass")))
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("http://api.test/private"))
        .execute()
        .expect("challenge response should be returned");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.header("www-authenticate"), Some("Bearer realm=\"api\""));
    assert_eq!(network.requests().len(), 1);
}

#[test]
fn proxy_challenge_without_a_proxy_is_a_protocol_violation() {
    let network = MockNetwork::new(|_| Reply::status(407));
    let client = client_builder(&network).build().expect("client should build");
    let error = client
        .new_call(get("http://api.test/"))
        .execute()
        .expect_err("407 without proxy must fail");
    assert_eq!(error.code(), ErrorCode::ProtocolViolation);
}

fn tunnel_network(expected: String) -> Arc<MockNetwork> {
    let network = MockNetwork::new(move |request| {
        if *request.method() == Method::CONNECT {
            if request.header("proxy-authorization") == Some(expected.as_str()) {
                return Reply::status(200);
            }
            return Reply::status(407).with_header("proxy-authenticate", "Basic realm=\"proxy\"");
        }
        Reply::text(200, "through the tunnel")
    });
    network.set_certificates(vec![site_certificate()]);
    network
}

fn connect_requests(network: &MockNetwork) -> Vec<Request> {
    network
        .requests()
        .into_iter()
        .filter(|request| *request.method() == Method::CONNECT)
        .collect()
}

#[test]
fn basic_proxy_credentials_are_sent_preemptively() {
    let credentials = basic_credentials("proxy-user", "proxy-pass");
    let network = tunnel_network(credentials.clone());
    let client = client_builder(&network)
        .try_proxy("http://proxy.test:3128")
        .expect("proxy should parse")
        .proxy_authenticator(Arc::new(BasicAuthenticator::new("proxy-user", "proxy-pass")))
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("https://secure.test/data"))
        .execute()
        .expect("call should succeed");
    assert_eq!(response.text_lossy(), "through the tunnel");
    assert!(response.handshake().is_some());

    let connects = connect_requests(&network);
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].header("host"), Some("secure.test:443"));
    assert_eq!(connects[0].header("proxy-connection"), Some("Keep-Alive"));
    assert_eq!(
        connects[0].header("proxy-authorization"),
        Some(credentials.as_str())
    );
    assert_eq!(network.tls_hosts(), vec!["secure.test".to_owned()]);
    assert_eq!(network.connects().len(), 1);
}

#[test]
fn tunnel_answers_a_proxy_challenge() {
    let credentials = basic_credentials("proxy-user", "proxy-pass");
    let network = tunnel_network(credentials.clone());
    let header_value = credentials.clone();
    let reactive = authenticator(move |_route, response| {
        let preemptive = response
            .challenges()
            .iter()
            .any(|challenge| challenge.scheme() == PREEMPTIVE_CHALLENGE_SCHEME);
        if preemptive {
            return Ok(None);
        }
        let request = response
            .request()
            .to_builder()
            .try_set_header("proxy-authorization", &header_value)?
            .build()?;
        Ok(Some(request))
    });
    let client = client_builder(&network)
        .try_proxy("proxy.test:3128")
        .expect("proxy should parse")
        .proxy_authenticator(reactive)
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("https://secure.test/data"))
        .execute()
        .expect("call should succeed");
    assert_eq!(response.text_lossy(), "through the tunnel");

    let connects = connect_requests(&network);
    assert_eq!(connects.len(), 2);
    assert!(connects[0].header("proxy-authorization").is_none());
    assert_eq!(
        connects[1].header("proxy-authorization"),
        Some(credentials.as_str())
    );
    assert_eq!(network.connects().len(), 1);
}

#[test]
fn preemptive_proxy_credentials_skip_the_challenge() {
    let seen_schemes = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen_schemes);
    let credentials = basic_credentials("proxy-user", "proxy-pass");
    let header_value = credentials.clone();
    let preemptive = authenticator(move |_route, response| {
        let schemes: Vec<String> = response
            .challenges()
            .iter()
            .map(|challenge| challenge.scheme().to_owned())
            .collect();
        lock(&record).extend(schemes);
        let request = response
            .request()
            .to_builder()
            .try_set_header("proxy-authorization", &header_value)?
            .build()?;
        Ok(Some(request))
    });
    let network = MockNetwork::new(move |request| {
        if *request.method() == Method::CONNECT {
            if request.header("proxy-authorization") == Some(credentials.as_str()) {
                return Reply::status(200);
            }
            return Reply::status(407);
        }
        Reply::status(204)
    });
    network.set_certificates(vec![site_certificate()]);
    let client = client_builder(&network)
        .try_proxy("proxy.test:3128")
        .expect("proxy should parse")
        .proxy_authenticator(preemptive)
        .build()
        .expect("client should build");

    let response = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect("call should succeed");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        *lock(&seen_schemes),
        vec![PREEMPTIVE_CHALLENGE_SCHEME.to_owned()]
    );
    let connects = network
        .requests()
        .iter()
        .filter(|request| *request.method() == Method::CONNECT)
        .count();
    assert_eq!(connects, 1);
}

#[test]
fn proxy_refusing_credentials_fails_the_tunnel() {
    let network = MockNetwork::new(|request| {
        if *request.method() == Method::CONNECT {
            return Reply::status(407).with_header("proxy-authenticate", "Basic realm=\"proxy\"");
        }
        Reply::status(200)
    });
    let client = client_builder(&network)
        .try_proxy("proxy.test:3128")
        .expect("proxy should parse")
        .build()
        .expect("client should build");

    let error = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect_err("tunnel must fail without credentials");
    assert_eq!(error.code(), ErrorCode::ProxyTunnel);
}

#[test]
fn unexpected_connect_status_fails_the_tunnel() {
    let network = MockNetwork::new(|_| Reply::status(502));
    let client = client_builder(&network)
        .try_proxy("proxy.test:3128")
        .expect("proxy should parse")
        .build()
        .expect("client should build");
    let error = client
        .new_call(get("https://secure.test/"))
        .execute()
        .expect_err("tunnel must fail");
    match &error {
        Error::ProxyTunnel { target, message } => {
            assert_eq!(target, "secure.test:443");
            assert!(message.contains("502"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}
