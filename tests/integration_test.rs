//! Integration tests for Veryxorp
//!
//! Runs the full server on loopback ports and exercises:
//! - HTTP to HTTPS redirects
//! - ACME challenge answers on the plaintext port
//! - HTTPS proxying to a backend
//! - Host policy on the TLS handshake
//! - Protocol upgrades through the proxy
//! - Connection deadlines and startup failures

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use veryxorp::certificate::{PendingChallenges, SelfSignedIssuer};
use veryxorp::{
    CertificateError, CertificateManager, CertificateRecord, CertificateStore, Issuer, ProxyConfig,
    ProxyServer, Timeouts, UpstreamTarget,
};

const DOMAIN: &str = "proxy.test";

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Issues self-signed certificates and counts how often it was asked
#[derive(Default)]
struct CountingIssuer {
    calls: AtomicUsize,
}

impl CountingIssuer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Issuer for CountingIssuer {
    async fn issue(&self, domain: &str) -> Result<CertificateRecord, CertificateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Give concurrent handshakes a chance to pile up
        sleep(Duration::from_millis(50)).await;
        SelfSignedIssuer::generate(domain, Utc::now() + chrono::Duration::days(30))
    }
}

/// Backend that echoes what it received
async fn run_backend_server(port: u16) -> tokio::task::JoinHandle<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none")
                            .to_string()
                    };
                    let response_text = format!(
                        "{} {}|host={}|xff={}|proto={}|fwd-host={}|custom={}|proxy-auth={}",
                        req.method(),
                        req.uri(),
                        header("host"),
                        header("x-forwarded-for"),
                        header("x-forwarded-proto"),
                        header("x-forwarded-host"),
                        header("x-custom"),
                        header("proxy-authorization"),
                    );
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let response_text =
                        format!("{}|body={}", response_text, String::from_utf8_lossy(&body));

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("x-backend", "echo")
                            .body(Full::new(Bytes::from(response_text)))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    })
}

/// Backend that accepts any upgrade and echoes the upgraded stream
async fn run_upgrade_backend(port: u16) -> tokio::task::JoinHandle<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<Incoming>| async move {
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        if let Ok(upgraded) = on_upgrade.await {
                            let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
                            let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        }
                    });

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(101)
                            .header("connection", "upgrade")
                            .header("upgrade", "echo")
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await;
            });
        }
    })
}

struct TestProxy {
    dir: TempDir,
    issuer: Arc<CountingIssuer>,
    server: Arc<ProxyServer>,
    http_port: u16,
    https_port: u16,
}

fn test_config(dir: &TempDir, backend_port: u16, timeouts: Timeouts) -> (ProxyConfig, u16, u16) {
    let http_port = get_unique_port();
    let https_port = get_unique_port();

    let mut config = ProxyConfig::new(DOMAIN, UpstreamTarget::new("127.0.0.1", backend_port));
    config.certs_dir = dir.path().join("certs");
    config.http_addr = SocketAddr::from(([127, 0, 0, 1], http_port));
    config.https_addr = SocketAddr::from(([127, 0, 0, 1], https_port));
    config.timeouts = timeouts;

    (config, http_port, https_port)
}

/// Create and start a test proxy server
async fn setup_proxy(backend_port: u16, timeouts: Timeouts) -> TestProxy {
    let dir = tempdir().unwrap();
    let (config, http_port, https_port) = test_config(&dir, backend_port, timeouts);

    let store = Arc::new(CertificateStore::new(&config.certs_dir).unwrap());
    let issuer = Arc::new(CountingIssuer::default());
    let manager = Arc::new(CertificateManager::new(
        DOMAIN,
        store,
        issuer.clone(),
        PendingChallenges::new(),
    ));
    let server = Arc::new(ProxyServer::new(config, manager));

    let server_clone = server.clone();
    tokio::spawn(async move {
        let _ = server_clone.run().await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(100)).await;

    TestProxy {
        dir,
        issuer,
        server,
        http_port,
        https_port,
    }
}

/// Client that resolves the test domains to loopback and never follows redirects
fn client() -> reqwest::Client {
    let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .resolve(DOMAIN, loopback)
        .resolve("other.test", loopback)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_http_redirects_to_https() {
    let proxy = setup_proxy(get_unique_port(), Timeouts::default()).await;

    let response = client()
        .get(format!("http://{}:{}/a/b?x=1", DOMAIN, proxy.http_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(
        response.headers().get("location").unwrap(),
        &format!("https://{}:{}/a/b?x=1", DOMAIN, proxy.http_port)
    );
    assert_eq!(proxy.issuer.calls(), 0);
}

#[tokio::test]
async fn test_http_redirect_for_other_host() {
    let proxy = setup_proxy(get_unique_port(), Timeouts::default()).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", proxy.http_port))
        .header("host", "other.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(response.headers().get("location").unwrap(), "https://other.test/");
}

#[tokio::test]
async fn test_acme_challenge_is_answered() {
    let proxy = setup_proxy(get_unique_port(), Timeouts::default()).await;
    let guard = proxy
        .server
        .manager()
        .challenges()
        .register("tok123", "tok123.thumbprint");

    let url = format!(
        "http://{}:{}/.well-known/acme-challenge/tok123",
        DOMAIN, proxy.http_port
    );
    let response = client().get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "tok123.thumbprint");

    // Once the issuance run is over the path is redirected like any other
    drop(guard);
    let response = client().get(&url).send().await.unwrap();
    assert_eq!(response.status(), 302);
}

#[tokio::test]
async fn test_unknown_challenge_token_redirects() {
    let proxy = setup_proxy(get_unique_port(), Timeouts::default()).await;

    let response = client()
        .get(format!(
            "http://{}:{}/.well-known/acme-challenge/unknown",
            DOMAIN, proxy.http_port
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
}

#[tokio::test]
async fn test_https_proxies_request() {
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port).await;
    let proxy = setup_proxy(backend_port, Timeouts::default()).await;

    let response = client()
        .post(format!("https://{}:{}/echo?x=1", DOMAIN, proxy.https_port))
        .header("x-custom", "kept")
        .header("proxy-authorization", "Basic c2VjcmV0")
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-backend").unwrap(), "echo");

    let text = response.text().await.unwrap();
    assert!(text.starts_with("POST /echo?x=1|"), "unexpected echo: {}", text);
    assert!(text.contains(&format!("|host={}:{}|", DOMAIN, proxy.https_port)));
    assert!(text.contains("|xff=127.0.0.1|"));
    assert!(text.contains("|proto=https|"));
    assert!(text.contains(&format!("|fwd-host={}:{}|", DOMAIN, proxy.https_port)));
    assert!(text.contains("|custom=kept|"));
    assert!(text.contains("|proxy-auth=none|"));
    assert!(text.ends_with("|body=hello"));

    assert_eq!(proxy.issuer.calls(), 1);
    assert!(proxy.dir.path().join("certs/proxy.test.crt").exists());
    assert!(proxy.dir.path().join("certs/proxy.test.key").exists());
}

#[tokio::test]
async fn test_concurrent_first_handshakes_issue_once() {
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port).await;
    let proxy = setup_proxy(backend_port, Timeouts::default()).await;

    let url = format!("https://{}:{}/", DOMAIN, proxy.https_port);
    let requests: Vec<_> = (0..8)
        .map(|_| {
            let url = url.clone();
            tokio::spawn(async move { client().get(url).send().await.map(|r| r.status()) })
        })
        .collect();

    for request in requests {
        assert_eq!(request.await.unwrap().unwrap(), 200);
    }
    assert_eq!(proxy.issuer.calls(), 1);
}

#[tokio::test]
async fn test_other_server_name_is_refused() {
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port).await;
    let proxy = setup_proxy(backend_port, Timeouts::default()).await;

    let result = client()
        .get(format!("https://other.test:{}/", proxy.https_port))
        .send()
        .await;

    assert!(result.is_err());
    assert_eq!(proxy.issuer.calls(), 0);
    assert!(!proxy.dir.path().join("certs/other.test.crt").exists());
}

#[tokio::test]
async fn test_dead_upstream_is_bad_gateway() {
    // Nothing listens on the backend port
    let proxy = setup_proxy(get_unique_port(), Timeouts::default()).await;

    let response = client()
        .get(format!("https://{}:{}/", DOMAIN, proxy.https_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_silent_connection_is_closed() {
    let timeouts = Timeouts {
        read: Duration::from_millis(200),
        write: Duration::from_millis(200),
        idle: Duration::from_millis(200),
    };
    let proxy = setup_proxy(get_unique_port(), timeouts).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.http_port))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("server kept a silent connection open");

    // Closed either cleanly or with a reset
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    let dir = tempdir().unwrap();
    let (config, _http_port, https_port) =
        test_config(&dir, get_unique_port(), Timeouts::default());

    // Occupy the HTTPS port before the server starts
    let _occupied = TcpListener::bind(("127.0.0.1", https_port)).await.unwrap();

    let store = Arc::new(CertificateStore::new(&config.certs_dir).unwrap());
    let manager = Arc::new(CertificateManager::new(
        DOMAIN,
        store,
        Arc::new(CountingIssuer::default()),
        PendingChallenges::new(),
    ));
    let server = Arc::new(ProxyServer::new(config, manager));

    let result = tokio::time::timeout(Duration::from_secs(3), server.run())
        .await
        .expect("server did not fail on an occupied port");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_trickling_request_is_closed() {
    let timeouts = Timeouts {
        read: Duration::from_millis(300),
        write: Duration::from_millis(300),
        idle: Duration::from_millis(300),
    };
    let proxy = setup_proxy(get_unique_port(), timeouts).await;

    let stream = TcpStream::connect(("127.0.0.1", proxy.http_port))
        .await
        .unwrap();
    let (mut reader, mut writer) = stream.into_split();

    // One header byte at a time, each well within the read timeout
    tokio::spawn(async move {
        if writer
            .write_all(b"GET / HTTP/1.1\r\nHost: proxy.test\r\nX-Slow: ")
            .await
            .is_err()
        {
            return;
        }
        for _ in 0..100 {
            sleep(Duration::from_millis(100)).await;
            if writer.write_all(b"a").await.is_err() {
                return;
            }
        }
    });

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(3), reader.read(&mut buf))
        .await
        .expect("server kept a trickling connection open");

    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_upgraded_connection_outlives_read_timeout() {
    let backend_port = get_unique_port();
    let _backend = run_upgrade_backend(backend_port).await;
    let timeouts = Timeouts {
        read: Duration::from_millis(200),
        write: Duration::from_secs(1),
        idle: Duration::from_secs(3),
    };
    let proxy = setup_proxy(backend_port, timeouts).await;

    let response = client()
        .get(format!("https://{}:{}/socket", DOMAIN, proxy.https_port))
        .header("connection", "upgrade")
        .header("upgrade", "echo")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    let mut upgraded = response.upgrade().await.unwrap();
    let mut buf = [0u8; 4];

    upgraded.write_all(b"ping").await.unwrap();
    upgraded.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Quiet for longer than the read timeout, shorter than the idle timeout
    sleep(Duration::from_millis(600)).await;

    upgraded.write_all(b"pong").await.unwrap();
    upgraded.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}
