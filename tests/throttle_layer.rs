use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crawlguard::{
    CrawlRequest, CrawlResponse, DestinationKey, Jitter, MemorySink, RetryPolicy, ThrottleEvent,
    ThrottleLayer, TrackingSleeper, TransportFailure,
};
use tower::{service_fn, ServiceBuilder, ServiceExt};

#[tokio::test]
async fn rate_limited_requests_wait_the_destination_delay() {
    let sink = MemorySink::new();
    let policy = Arc::new(
        RetryPolicy::builder().sink(sink.clone()).with_jitter(Jitter::None).build().unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = {
        let calls = calls.clone();
        service_fn(move |req: CrawlRequest| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let status = if n < 3 { 429 } else { 200 };
                Ok::<_, TransportFailure>(CrawlResponse::new(req.url, status))
            }
        })
    };
    let sleeper = TrackingSleeper::new();
    let svc = ServiceBuilder::new()
        .layer(ThrottleLayer::new(policy.clone()).with_sleeper(sleeper.clone()))
        .service(transport);

    let response = svc.oneshot(CrawlRequest::new("https://www.drive2.ru/cars/")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // One pause per reissue, each equal to the delay after that 429.
    let pauses = sleeper.pauses();
    assert_eq!(pauses.len(), 3);
    assert!(pauses.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(pauses[2], policy.destination_delay(&DestinationKey::global()));

    let scheduled = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, ThrottleEvent::RetryScheduled { .. }))
        .count();
    assert_eq!(scheduled, 3);
}

#[tokio::test]
async fn io_errors_are_classified_and_surfaced() {
    let policy = Arc::new(RetryPolicy::builder().with_jitter(Jitter::None).build().unwrap());
    let transport = service_fn(|_req: CrawlRequest| async {
        Err::<CrawlResponse, _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    });
    let sleeper = TrackingSleeper::new();
    let svc = ThrottleLayer::new(policy).with_sleeper(sleeper.clone());
    let svc = tower::Layer::layer(&svc, transport);

    let err = svc.oneshot(CrawlRequest::new("u")).await.unwrap_err();
    assert_eq!(err.into_inner().kind(), std::io::ErrorKind::ConnectionRefused);
    assert_eq!(sleeper.pauses(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
}
