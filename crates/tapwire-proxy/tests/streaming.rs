mod common;

use tapwire_proxy::{Addon, Flow, Options};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{read_response, spawn_http_stub, spawn_proxy, status_of, RecordingAddon};

const THRESHOLD: u64 = 64 * 1024;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_request_body_streams_without_buffered_hooks() {
    let stub = spawn_http_stub(|request| {
        assert_eq!(request.body.len(), 128 * 1024, "upstream body size");
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone".to_vec()
    })
    .await;

    let (recorder, log) = RecordingAddon::new();
    let options = Options {
        stream_large_bodies: THRESHOLD,
        ..Options::default()
    };
    let (proxy, handle, _root) = spawn_proxy(options, vec![Box::new(recorder)]).await;

    let body = vec![b'z'; 128 * 1024];
    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(
            format!(
                "POST http://{stub}/upload HTTP/1.1\r\nHost: {stub}\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .await
        .expect("send head");
    client.write_all(&body).await.expect("send body");

    let (head, response_body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(response_body, b"done");

    let log = log.lock().expect("log lock").clone();
    assert!(log.contains(&"request_headers".to_string()));
    assert!(log.contains(&"stream_request_modifier".to_string()));
    assert!(
        !log.contains(&"request".to_string()),
        "buffered request hook must not fire for streamed flows: {log:?}"
    );
    // Hook order within the flow is preserved.
    let headers_at = log.iter().position(|entry| entry == "request_headers");
    let modifier_at = log.iter().position(|entry| entry == "stream_request_modifier");
    assert!(headers_at < modifier_at);
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn body_exactly_at_threshold_stays_buffered() {
    let stub = spawn_http_stub(|request| {
        assert_eq!(request.body.len(), THRESHOLD as usize);
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()
    })
    .await;

    let (recorder, log) = RecordingAddon::new();
    let options = Options {
        stream_large_bodies: THRESHOLD,
        ..Options::default()
    };
    let (proxy, handle, _root) = spawn_proxy(options, vec![Box::new(recorder)]).await;

    let body = vec![b'z'; THRESHOLD as usize];
    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(
            format!(
                "POST http://{stub}/upload HTTP/1.1\r\nHost: {stub}\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .await
        .expect("send head");
    client.write_all(&body).await.expect("send body");

    let (head, _body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);

    let log = log.lock().expect("log lock").clone();
    assert!(log.contains(&"request".to_string()), "{log:?}");
    assert!(!log.contains(&"stream_request_modifier".to_string()), "{log:?}");
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn addon_forcing_stream_skips_buffered_hooks_for_small_bodies() {
    let stub = spawn_http_stub(|request| {
        assert_eq!(request.body, b"tiny body");
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nsmall".to_vec()
    })
    .await;

    struct ForceStream;
    impl Addon for ForceStream {
        fn request_headers(&self, flow: &mut Flow) {
            flow.stream = true;
        }
    }

    let (recorder, log) = RecordingAddon::new();
    let (proxy, handle, _root) = spawn_proxy(
        Options::default(),
        vec![Box::new(ForceStream), Box::new(recorder)],
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(
            format!(
                "POST http://{stub}/small HTTP/1.1\r\nHost: {stub}\r\nContent-Length: 9\r\n\r\ntiny body"
            )
            .as_bytes(),
        )
        .await
        .expect("send request");

    let (head, body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"small");

    let log = log.lock().expect("log lock").clone();
    assert!(log.contains(&"stream_request_modifier".to_string()), "{log:?}");
    assert!(log.contains(&"stream_response_modifier".to_string()), "{log:?}");
    assert!(
        !log.contains(&"request".to_string()),
        "forced streaming must skip the buffered request hook: {log:?}"
    );
    assert!(
        !log.contains(&"response".to_string()),
        "forced streaming must skip the buffered response hook: {log:?}"
    );
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn head_response_keeps_origin_content_length() {
    let stub = spawn_http_stub(|request| {
        if request.head.starts_with("HEAD") {
            b"HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n".to_vec()
        } else {
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
        }
    })
    .await;

    let (proxy, handle, _root) = spawn_proxy(Options::default(), Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(format!("HEAD http://{stub}/res HTTP/1.1\r\nHost: {stub}\r\n\r\n").as_bytes())
        .await
        .expect("send HEAD");

    // HEAD responses carry no body; read the bare head off the wire.
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        use tokio::io::AsyncReadExt;
        let read = client.read(&mut byte).await.expect("read head");
        assert!(read > 0, "connection closed before response head");
        head.push(byte[0]);
    }
    let head_text = String::from_utf8_lossy(&head).to_string();
    assert_eq!(status_of(&head_text), 200);
    assert_eq!(
        common::header_value(&head_text, "content-length").as_deref(),
        Some("500"),
        "origin length must survive a bodyless HEAD response"
    );

    // Framing stayed aligned: the same connection serves a normal GET.
    client
        .write_all(format!("GET http://{stub}/res HTTP/1.1\r\nHost: {stub}\r\n\r\n").as_bytes())
        .await
        .expect("send GET");
    let (head, body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"ok");
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_response_body_streams_back() {
    let payload = vec![b'r'; 200 * 1024];
    let stub = {
        let payload = payload.clone();
        spawn_http_stub(move |_request| {
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                payload.len()
            )
            .into_bytes();
            response.extend_from_slice(&payload);
            response
        })
        .await
    };

    let (recorder, log) = RecordingAddon::new();
    let options = Options {
        stream_large_bodies: THRESHOLD,
        ..Options::default()
    };
    let (proxy, handle, _root) = spawn_proxy(options, vec![Box::new(recorder)]).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(format!("GET http://{stub}/big HTTP/1.1\r\nHost: {stub}\r\n\r\n").as_bytes())
        .await
        .expect("send request");

    let (head, body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body.len(), payload.len());
    assert_eq!(body, payload);

    let log = log.lock().expect("log lock").clone();
    assert!(log.contains(&"response_headers".to_string()));
    assert!(log.contains(&"stream_response_modifier".to_string()));
    assert!(
        !log.contains(&"response".to_string()),
        "buffered response hook must not fire for streamed flows: {log:?}"
    );
    handle.shutdown();
}
