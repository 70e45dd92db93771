// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the TCP admin link against a fake repository endpoint.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use common::TEST_UUID;
use conduit_protocol::frame::MessageType;
use conduit_protocol::messages::{Command, CommandAck, Hello};
use conduit_protocol::{Frame, FramedStream};
use conduit_runtime::admin::link::{LINK_PROTOCOL, RECONNECT_DELAY, link_address};
use conduit_runtime::admin::{AdminLink, LinkConnector, TcpAdminLink, TcpLinkConnector, TlsOptions};

type Session = FramedStream<BufReader<TcpStream>>;

/// Accept one connection and answer the upgrade with `status_line`.
async fn accept(listener: &TcpListener, status_line: &str) -> (String, Session) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await.unwrap();
    let mut upgrade = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade") {
                upgrade = Some(value.trim().to_string());
            }
        }
    }
    assert_eq!(upgrade.as_deref(), Some(LINK_PROTOCOL));

    let response = format!("{status_line}\r\nConnection: Upgrade\r\nUpgrade: {LINK_PROTOCOL}\r\n\r\n");
    reader.get_mut().write_all(response.as_bytes()).await.unwrap();
    (request_line.trim().to_string(), FramedStream::new(reader))
}

async fn wait_for_connection(link: &dyn AdminLink, id: u64) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while link.connect() != id {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("link did not reach the expected connection");
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/repo/app/", listener.local_addr().unwrap());
    (listener, link_address(&url, TEST_UUID))
}

#[tokio::test]
async fn test_link_session_hello_commands_and_data() {
    let (listener, address) = bind().await;
    let link = TcpAdminLink::spawn(&address, TEST_UUID, &TlsOptions::default()).unwrap();

    let reloads = Arc::new(AtomicU32::new(0));
    let counter = reloads.clone();
    link.register_command_handler(Arc::new(move |name, _payload| {
        if name == "reload" {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }));

    let (request_line, mut session) = accept(&listener, "HTTP/1.1 101 Switching Protocols").await;
    assert_eq!(
        request_line,
        format!("GET /repo/app/{TEST_UUID} HTTP/1.1")
    );

    let hello: Hello = session
        .read_frame()
        .await
        .unwrap()
        .decode_as(MessageType::Hello)
        .unwrap();
    assert_eq!(hello.instance_uuid, TEST_UUID);
    assert_eq!(hello.path, format!("/repo/app/{TEST_UUID}"));
    wait_for_connection(&link, 1).await;

    for (name, handled) in [("reload", true), ("shutdown", false)] {
        let command = Command {
            name: name.to_string(),
            payload: Bytes::new(),
        };
        session
            .write_frame(&Frame::command(&command).unwrap())
            .await
            .unwrap();
        let ack: CommandAck = session
            .read_frame()
            .await
            .unwrap()
            .decode_as(MessageType::CommandAck)
            .unwrap();
        assert_eq!(ack.name, name);
        assert_eq!(ack.handled, handled);
    }
    assert_eq!(reloads.load(Ordering::SeqCst), 1);

    link.send(Bytes::from_static(b"metrics\n{\"full\":true}\n"));
    let frame = session.read_frame().await.unwrap();
    assert_eq!(frame.message_type, MessageType::Data);
    assert_eq!(frame.payload, Bytes::from_static(b"metrics\n{\"full\":true}\n"));

    link.close();
}

#[tokio::test]
async fn test_link_reconnects_with_new_connection_id() {
    let (listener, address) = bind().await;
    let connector = TcpLinkConnector::new(TEST_UUID, TlsOptions::default());
    let link = connector.open(&address).unwrap();
    assert_eq!(link.connect(), 0);

    let (_, session) = accept(&listener, "HTTP/1.1 101 Switching Protocols").await;
    wait_for_connection(link.as_ref(), 1).await;
    drop(session);

    // The link retries after its reconnect delay.
    let started = tokio::time::Instant::now();
    let (_, mut session) = accept(&listener, "HTTP/1.1 101 Switching Protocols").await;
    assert!(started.elapsed() + Duration::from_millis(100) >= RECONNECT_DELAY);

    let hello: Hello = session.read_frame().await.unwrap().decode().unwrap();
    assert_eq!(hello.instance_uuid, TEST_UUID);
    wait_for_connection(link.as_ref(), 2).await;

    link.close();
}

#[tokio::test]
async fn test_rejected_upgrade_never_connects() {
    let (listener, address) = bind().await;
    let link = TcpAdminLink::spawn(&address, TEST_UUID, &TlsOptions::default()).unwrap();

    let (_, _session) = accept(&listener, "HTTP/1.1 404 Not Found").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(link.connect(), 0);

    // Sends before a session exists are dropped or queued, never fatal.
    link.send(Bytes::from_static(b"metrics\n{}\n"));
    link.close();
}

#[tokio::test]
async fn test_endless_handshake_headers_are_abandoned() {
    let (listener, address) = bind().await;
    let link = TcpAdminLink::spawn(&address, TEST_UUID, &TlsOptions::default()).unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await.unwrap();

    // A status line followed by header bytes that never end in a newline.
    let mut stream = reader.into_inner();
    let _ = stream.write_all(b"HTTP/1.1 101 x\r\nx-filler: ").await;
    let filler = vec![b'a'; 64 * 1024];
    for _ in 0..32 {
        if stream.write_all(&filler).await.is_err() {
            break;
        }
    }

    // The attempt is dropped and the link dials again after its delay.
    let (_, mut session) = tokio::time::timeout(
        RECONNECT_DELAY + Duration::from_secs(10),
        accept(&listener, "HTTP/1.1 101 Switching Protocols"),
    )
    .await
    .expect("link did not retry after an oversized handshake");
    let hello: Hello = session.read_frame().await.unwrap().decode().unwrap();
    assert_eq!(hello.instance_uuid, TEST_UUID);
    wait_for_connection(&link, 1).await;

    link.close();
}

#[test]
fn test_connector_rejects_bad_address() {
    let connector = TcpLinkConnector::new(TEST_UUID, TlsOptions::default());
    assert!(connector.open("not a url").is_err());
    assert!(connector.open("ftp://repo.example/app").is_err());
}
