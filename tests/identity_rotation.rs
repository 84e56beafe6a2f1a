mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CountingProbe, GatedProbe};
use crawlguard::{
    ControlChannel, ControlConfig, ControlError, CrawlRequest, DestinationKey, Identity,
    IdentityRotator, InstantSleeper, ProbeConfig, ProbeError, RetryDecision, RetryPolicy,
    ThrottleConfig, TorControlChannel,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Fake control port: answers AUTHENTICATE with `auth_reply` and every other command with
/// `250 OK`, forwarding each received line to the returned channel.
async fn fake_control_port(auth_reply: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = if line.starts_with("AUTHENTICATE") {
                auth_reply
            } else if line == "QUIT" {
                "250 closing connection\r\n"
            } else {
                "250 OK\r\n"
            };
            let quit = line == "QUIT";
            let _ = tx.send(line);
            if write.write_all(reply.as_bytes()).await.is_err() || quit {
                break;
            }
        }
    });
    (addr, rx)
}

/// Identity-check page serving one scripted identity per connection, then going away.
async fn identity_page(identities: &[&'static str]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let identities = identities.to_vec();
    tokio::spawn(async move {
        for identity in identities {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let body = format!("<p>Your IP address appears to be: <strong>{identity}</strong></p>");
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body.as_bytes()).await.unwrap();
        }
    });
    url
}

fn config_for(control_addr: &str, probe_url: String) -> ThrottleConfig {
    let addr: std::net::SocketAddr = control_addr.parse().unwrap();
    ThrottleConfig {
        control: Some(ControlConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            password: "secret".into(),
        }),
        probe: ProbeConfig {
            url: probe_url,
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn authenticates_signals_and_quits() {
    let (addr, mut rx) = fake_control_port("250 OK\r\n").await;
    let mut channel = TorControlChannel::connect(&addr, "pa\"ss").await.unwrap();
    channel.signal_new_identity().await.unwrap();
    channel.close().await.unwrap();
    assert!(matches!(channel.signal_new_identity().await, Err(ControlError::Closed)));

    assert_eq!(rx.recv().await.unwrap(), r#"AUTHENTICATE "pa\"ss""#);
    assert_eq!(rx.recv().await.unwrap(), "SIGNAL NEWNYM");
    assert_eq!(rx.recv().await.unwrap(), "QUIT");
}

#[tokio::test]
async fn rejected_password_is_fatal() {
    let (addr, _rx) = fake_control_port("515 Authentication failed: Password did not match\r\n").await;
    let err = TorControlChannel::connect(&addr, "wrong").await.unwrap_err();
    match err {
        ControlError::Authentication(msg) => assert!(msg.starts_with("515")),
        other => panic!("expected authentication error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_control_port_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    let err = TorControlChannel::connect(&addr, "").await.unwrap_err();
    assert!(matches!(err, ControlError::Connect { .. }));
}

#[tokio::test]
async fn rotator_over_tcp_channel() {
    let (addr, mut rx) = fake_control_port("250 OK\r\n").await;
    let channel = TorControlChannel::connect(&addr, "secret").await.unwrap();
    let mut rotator =
        IdentityRotator::new(channel, CountingProbe::default()).with_sleeper(InstantSleeper);
    let first = rotator.rotate().await.unwrap();
    let second = rotator.rotate().await.unwrap();
    assert_ne!(first.identity, second.identity);
    rotator.close().await.unwrap();

    let mut received = Vec::new();
    while let Some(line) = rx.recv().await {
        received.push(line);
    }
    assert_eq!(received, vec![r#"AUTHENTICATE "secret""#, "SIGNAL NEWNYM", "SIGNAL NEWNYM", "QUIT"]);
}

#[tokio::test]
async fn no_request_leaves_while_rotating() {
    let probe = GatedProbe::new(&["198.51.100.7"]);
    let rotator =
        IdentityRotator::new(common::FakeControl::default(), probe.clone()).with_sleeper(InstantSleeper);
    let policy = Arc::new(RetryPolicy::builder().rotator(rotator).build().unwrap());
    let key = DestinationKey::new("drive2");

    let blocked = {
        let policy = policy.clone();
        let key = key.clone();
        tokio::spawn(async move {
            policy.handle_response(CrawlRequest::new("blocked").with_destination(key), &403u16).await
        })
    };
    probe.entered.notified().await;

    let sender = {
        let policy = policy.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let mut request = CrawlRequest::new("next").with_destination(key);
            policy.prepare(&mut request).await;
            request
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sender.is_finished(), "request sent mid-rotation");

    // Other destinations keep flowing.
    let mut other = CrawlRequest::new("other").with_destination("autoru");
    tokio::time::timeout(Duration::from_secs(1), policy.prepare(&mut other)).await.unwrap();

    probe.release.notify_one();
    let decision = blocked.await.unwrap();
    assert!(matches!(decision, RetryDecision::RetryWithIdentityRotation { .. }));
    let request = sender.await.unwrap();
    assert_eq!(request.identity_epoch, Some(1));
}

#[tokio::test]
async fn connect_records_identity_before_first_rotation() {
    let (addr, mut rx) = fake_control_port("250 OK\r\n").await;
    let url = identity_page(&["6.6.6.6", "6.6.6.6", "6.6.6.6", "7.7.7.7"]).await;
    let cfg = config_for(&addr, url);

    let rotator = IdentityRotator::connect(&cfg).await.unwrap();
    assert_eq!(rotator.current_identity(), Some(&Identity::new("6.6.6.6")));
    assert_eq!(rotator.epoch(), 0);

    let policy = RetryPolicy::builder().config(cfg).rotator(rotator).build().unwrap();
    let mut request = CrawlRequest::new("https://www.drive2.ru/cars/").with_destination("drive2");
    policy.prepare(&mut request).await;
    let decision = policy.handle_response(request, &403u16).await;
    let RetryDecision::RetryWithIdentityRotation { identity, .. } = decision else {
        panic!("expected identity rotation, got {decision:?}");
    };
    assert_eq!(identity, Some(Identity::new("7.7.7.7")));
    policy.shutdown().await;

    let mut received = Vec::new();
    while let Some(line) = rx.recv().await {
        received.push(line);
    }
    assert_eq!(
        received,
        vec![
            r#"AUTHENTICATE "secret""#,
            "SIGNAL NEWNYM",
            "SIGNAL NEWNYM",
            "SIGNAL NEWNYM",
            "QUIT"
        ]
    );
}

#[tokio::test]
async fn connect_fails_when_identity_is_unreadable() {
    let (addr, _rx) = fake_control_port("250 OK\r\n").await;
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", closed.local_addr().unwrap());
    drop(closed);

    let err = IdentityRotator::connect(&config_for(&addr, url)).await.unwrap_err();
    assert!(matches!(err, ControlError::ProbeSetup(ProbeError::Request(_))), "got {err:?}");
}
