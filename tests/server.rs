//! End-to-end: TCP in, configured chain, TCP out.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use sluice::config::parse_config;
use sluice::script::TransformRegistry;
use sluice::{Server, SluiceConfig};

fn config(transform: &str) -> SluiceConfig {
    config_with(transform, "")
}

fn config_with(transform: &str, listener: &str) -> SluiceConfig {
    parse_config(&format!(
        r#"
        [[listeners]]
        bind_address = "127.0.0.1:0"
        pipeline = "lines"
        {listener}

        [pipelines.lines]
        max_buffered_events = 256

        [[pipelines.lines.stages]]
        kind = "split-lines"
        max_line_bytes = 4096

        [[pipelines.lines.stages]]
        kind = "handle-body"
        transform = "{transform}"

        [[pipelines.lines.stages]]
        kind = "join-lines"
        "#
    ))
    .unwrap()
}

async fn roundtrip(addr: SocketAddr, input: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(input).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut output = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut output))
        .await
        .expect("server did not finish the stream")
        .unwrap();
    String::from_utf8(output).unwrap()
}

#[tokio::test]
async fn transforms_lines_end_to_end() {
    let server = Server::bind(&config("uppercase"), TransformRegistry::builtin())
        .await
        .unwrap();
    let addr = server.local_addrs()[0];
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    assert_eq!(roundtrip(addr, b"hello\nworld\n").await, "HELLO\nWORLD\n");

    assert!(handle.shutdown());
    assert!(!handle.shutdown());
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn deferred_transform_keeps_line_order() {
    let server = Server::bind(&config("delay:5"), TransformRegistry::builtin())
        .await
        .unwrap();
    let addr = server.local_addrs()[0];
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    let input: String = (0..20).map(|i| format!("line {i}\n")).collect();
    assert_eq!(roundtrip(addr, input.as_bytes()).await, input);

    handle.shutdown();
    running.await.unwrap();
}

#[tokio::test]
async fn reload_applies_to_new_connections() {
    let server = Server::bind(&config("identity"), TransformRegistry::builtin())
        .await
        .unwrap();
    let addr = server.local_addrs()[0];
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    assert_eq!(roundtrip(addr, b"abc\n").await, "abc\n");

    // Listener addresses are kept; only the chains are swapped.
    handle.reload(&config("reverse")).unwrap();
    assert_eq!(roundtrip(addr, b"abc\n").await, "cba\n");

    let mut broken = config("reverse");
    broken.pipelines.get_mut("lines").unwrap().stages[1].transform = Some("missing".into());
    assert!(handle.reload(&broken).is_err());
    assert_eq!(roundtrip(addr, b"xyz\n").await, "zyx\n");

    handle.shutdown();
    running.await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_idle_connections() {
    let server = Server::bind(&config("identity"), TransformRegistry::builtin())
        .await
        .unwrap();
    let addr = server.local_addrs()[0];
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    let mut idle = TcpStream::connect(addr).await.unwrap();
    idle.write_all(b"partial").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("server did not drain")
        .unwrap();

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut rest))
        .await
        .expect("connection left open");
    assert!(read.is_err() || rest.is_empty());
}

#[tokio::test]
async fn peer_that_stops_reading_stalls_its_own_writes() {
    let config = config_with("identity", "max_egress_bytes = 65536");
    let server = Server::bind(&config, TransformRegistry::builtin()).await.unwrap();
    let addr = server.local_addrs()[0];
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    let line = format!("{}\n", "x".repeat(1023));
    let total = 48 * 1024 * 1024;
    let (mut rx, mut tx) = TcpStream::connect(addr).await.unwrap().into_split();
    let writer = tokio::spawn(async move {
        for _ in 0..total / line.len() {
            tx.write_all(line.as_bytes()).await?;
        }
        tx.shutdown().await
    });

    // Nothing is read back yet: socket buffers fill and the server stops
    // reading instead of queueing the whole echo.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!writer.is_finished());

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(60), rx.read_to_end(&mut echoed))
        .await
        .expect("echo did not complete")
        .unwrap();
    writer.await.unwrap().unwrap();
    assert_eq!(echoed.len(), total);

    handle.shutdown();
    running.await.unwrap();
}
