mod support;

use std::{sync::Arc, time::Duration};

use support::server;
use tether::{HttpState, Pool, Request};
use tokio::io::AsyncWriteExt;

fn get(url: String) -> Request {
    Request::get(url).build().unwrap()
}

#[tokio::test]
async fn connections_are_reused_per_origin() {
    let _ = env_logger::try_init();

    let mut server = server::http(|req| server::response("200 OK", req.request_line()));
    let pool = Pool::new();

    for path in ["/a", "/b", "/c"] {
        let res = pool.request(get(server.url(path))).await.unwrap();
        let line = res.text().await.unwrap();
        assert_eq!(line, format!("GET {path} HTTP/1.1"));
    }

    assert_eq!(pool.connections().len(), 1);
    assert_eq!(pool.connections()[0].state(), HttpState::Idle);
    assert_eq!(pool.in_flight(), 0);
    assert_eq!(server.accepted(), 1);

    pool.aclose().await.unwrap();
    assert!(pool.connections().is_empty());
}

#[tokio::test]
async fn concurrency_is_bounded_by_max_connections() {
    let _ = env_logger::try_init();

    let mut server = server::tcp(|mut io, _| async move {
        while let Ok(Some(_)) = server::read_request(&mut io).await {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if io.write_all(&server::response("200 OK", "slow")).await.is_err() {
                break;
            }
        }
    });

    let pool = Pool::builder().max_connections(2).build().unwrap();
    let requests = (0..6).map(|_| {
        let pool = pool.clone();
        let url = server.url("/");
        async move { pool.request(get(url)).await?.text().await }
    });
    let bodies = futures_util::future::join_all(requests).await;

    for body in bodies {
        assert_eq!(body.unwrap(), "slow");
    }
    assert_eq!(pool.connections().len(), 2);
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test]
async fn acquire_times_out_while_connection_is_busy() {
    let _ = env_logger::try_init();

    let server = server::http(|_| server::response("200 OK", "held"));
    let pool = Pool::builder()
        .max_connections(1)
        .acquire_connection_timeout(Some(Duration::from_millis(100)))
        .build()
        .unwrap();

    let held = pool.request(get(server.url("/"))).await.unwrap();

    let err = pool.request(get(server.url("/"))).await.unwrap_err();
    assert!(err.is_acquire_timeout());
    assert!(err.is_timeout());
    assert_eq!(pool.in_flight(), 1);

    assert_eq!(held.text().await.unwrap(), "held");
    assert_eq!(pool.in_flight(), 0);

    let res = pool.request(get(server.url("/"))).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "held");
}

#[tokio::test]
async fn idle_connection_is_evicted_for_another_origin() {
    let _ = env_logger::try_init();

    let first = server::http(|_| server::response("200 OK", "first"));
    let second = server::http(|_| server::response("200 OK", "second"));
    let pool = Pool::builder().max_connections(1).build().unwrap();

    let res = pool.request(get(first.url("/"))).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "first");
    let evicted = pool.connections().remove(0);

    let res = pool.request(get(second.url("/"))).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "second");

    let connections = pool.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].origin().port(), second.addr().port());

    evicted.transport().closed().await;
    assert_eq!(evicted.state(), HttpState::Closed);
    assert!(!evicted.should_reconnect());
}

#[tokio::test]
async fn waiting_requests_are_served_in_arrival_order() {
    let _ = env_logger::try_init();

    let server = server::http(|req| server::response("200 OK", req.request_line()));
    let pool = Pool::builder().max_connections(1).build().unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let held = pool.request(get(server.url("/0"))).await.unwrap();

    let mut tasks = Vec::new();
    for n in 1..=3 {
        let pool = pool.clone();
        let order = order.clone();
        let url = server.url(&format!("/{n}"));
        tasks.push(tokio::spawn(async move {
            let res = pool.request(get(url)).await.unwrap();
            order.lock().push(n);
            res.text().await.unwrap()
        }));
        // Let the request register before the next one arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pool.in_flight(), 4);

    assert_eq!(held.text().await.unwrap(), "GET /0 HTTP/1.1");
    for (n, task) in (1..=3).zip(tasks) {
        assert_eq!(task.await.unwrap(), format!("GET /{n} HTTP/1.1"));
    }
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[tokio::test]
async fn closing_with_requests_in_flight_is_an_error() {
    let _ = env_logger::try_init();

    let server = server::http(|_| server::response("200 OK", "unread"));
    let pool = Pool::new();

    let res = pool.request(get(server.url("/"))).await.unwrap();
    let conn = pool.connections().remove(0);

    let err = pool.aclose().await.unwrap_err();
    assert!(err.is_misuse());
    assert_eq!(conn.state(), HttpState::Closed);
    drop(res);

    let err = pool.request(get(server.url("/"))).await.unwrap_err();
    assert!(err.is_misuse());
}

#[tokio::test]
async fn streamed_request_runs_on_a_spawned_task() {
    let _ = env_logger::try_init();

    let server = server::http(|req| {
        server::response("200 OK", std::str::from_utf8(&req.body).unwrap())
    });
    let pool = Pool::new();

    let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("str"), Ok("eam")];
    let body = tether::Body::wrap_stream(futures_util::stream::iter(chunks));
    let request = Request::post(server.url("/")).body(body).build().unwrap();

    let task = tokio::spawn({
        let pool = pool.clone();
        async move { pool.request(request).await?.text().await }
    });
    assert_eq!(task.await.unwrap().unwrap(), "stream");
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test]
async fn evicted_connection_is_closed_before_the_next_dial() {
    let _ = env_logger::try_init();

    let first = server::http(|_| server::response("200 OK", "first"));
    let second = server::http(|_| server::response("200 OK", "second"));
    let pool = Pool::builder().max_connections(1).build().unwrap();

    let res = pool.request(get(first.url("/"))).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "first");
    let evicted = pool.connections().remove(0);

    let res = pool.request(get(second.url("/"))).await.unwrap();
    // The old socket was gone before the new one was opened.
    assert_eq!(evicted.transport().state(), tether::TransportState::Closed);
    assert_eq!(res.text().await.unwrap(), "second");
}
