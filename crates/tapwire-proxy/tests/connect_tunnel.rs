mod common;

use tapwire_proxy::Options;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{read_response, spawn_proxy, status_of};

/// A raw TCP upstream echoing whatever it receives.
async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("echo bind");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut chunk = [0_u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => {
                            if stream.write_all(&chunk[..read]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_host_is_tunneled_opaquely() {
    let echo = spawn_echo().await;

    let options = Options {
        ignore_hosts: vec!["127.0.0.1".to_string()],
        ..Options::default()
    };
    let (proxy, handle, _root) = spawn_proxy(options, Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .expect("send CONNECT");

    let (head, _body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);
    assert!(head.contains("Connection Established"));

    // The tunnel is opaque: arbitrary bytes round-trip through the echo.
    client.write_all(b"ping-not-http").await.expect("send raw");
    let mut reply = [0_u8; 13];
    client.read_exact(&mut reply).await.expect("read echo");
    assert_eq!(&reply, b"ping-not-http");
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_to_refused_upstream_yields_502() {
    let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead_addr = dead.local_addr().expect("addr");
    drop(dead);

    let options = Options {
        ignore_hosts: vec!["*".to_string()],
        ..Options::default()
    };
    let (proxy, handle, _root) = spawn_proxy(options, Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n").as_bytes())
        .await
        .expect("send CONNECT");

    let (head, _body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 502);
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_attack_falls_back_to_direct_transfer_for_plaintext() {
    let echo = spawn_echo().await;

    // upstream_cert=false selects the lazy attack for intercepted hosts.
    let options = Options {
        upstream_cert: false,
        ..Options::default()
    };
    let (proxy, handle, _root) = spawn_proxy(options, Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .expect("send CONNECT");
    let (head, _body) = read_response(&mut client).await;
    assert_eq!(status_of(&head), 200);

    // First bytes after CONNECT are not a TLS record: the proxy falls back
    // to opaque tunneling.
    client.write_all(b"plaintext!").await.expect("send raw");
    let mut reply = [0_u8; 10];
    client.read_exact(&mut reply).await.expect("read echo");
    assert_eq!(&reply, b"plaintext!");
    handle.shutdown();
}
