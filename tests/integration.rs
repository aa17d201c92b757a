use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use yamux::{Config, ConfigBuilder, Session, StreamState, YamuxError};

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

fn quiet_config() -> Config {
    ConfigBuilder::new()
        .enable_keep_alive(false)
        .build()
        .unwrap()
}

test_with_timeout!(test_echo_stream_to_eof, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(4096);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    let mut client_stream = client.open_stream().await?;
    client_stream.write_all(&[0x41, 0x42, 0x43]).await?;
    client_stream.close().await?;

    let mut server_stream = server.accept_stream().await?;
    assert_eq!(server_stream.id(), client_stream.id());

    // Reads drain exactly the written bytes, then signal EOF.
    let mut received = Vec::new();
    server_stream.read_to_end(&mut received).await?;
    assert_eq!(received, vec![0x41, 0x42, 0x43]);

    // Server closes its half too; the client now sees EOF.
    server_stream.close().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut buf = [0u8; 8];
    assert_eq!(client_stream.read(&mut buf).await?, 0);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_bidirectional_transfer, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(4096);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    let client_stream = client.open_stream().await?;
    let server_stream = server.accept_stream().await?;

    let client_data = b"Client -> Server";
    let server_data = b"Server -> Client";

    let client_task = tokio::spawn(async move {
        let mut client_stream = client_stream;
        client_stream.write_all(client_data).await.unwrap();

        let mut buffer = vec![0u8; server_data.len()];
        client_stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(buffer, server_data);

        client_stream.close().await.unwrap();
    });

    let server_task = tokio::spawn(async move {
        let mut server_stream = server_stream;
        let mut buffer = vec![0u8; client_data.len()];
        server_stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(buffer, client_data);

        server_stream.write_all(server_data).await.unwrap();
        server_stream.close().await.unwrap();
    });

    tokio::try_join!(client_task, server_task)?;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_multiple_concurrent_streams, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(16 * 1024);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    // Fixed-size exchanges: the responder must reply before the requester
    // half-closes, since a FIN shuts the peer's write side too.
    const EXCHANGE: usize = 128;

    let server_task = tokio::spawn(async move {
        let mut echoed = 0;
        for _ in 0..8 {
            let mut stream = server.accept_stream().await.unwrap();
            let mut data = vec![0u8; EXCHANGE];
            stream.read_exact(&mut data).await.unwrap();
            stream.write_all(&data).await.unwrap();
            stream.close().await.unwrap();
            echoed += 1;
        }
        echoed
    });

    let mut handles = Vec::new();
    for i in 0u8..8 {
        let stream = client.open_stream().await?;
        handles.push(tokio::spawn(async move {
            let mut stream = stream;
            let payload = vec![i; EXCHANGE];
            stream.write_all(&payload).await.unwrap();

            let mut back = vec![0u8; EXCHANGE];
            stream.read_exact(&mut back).await.unwrap();
            assert_eq!(back, payload);
            stream.close().await.unwrap();
        }));
    }

    for handle in handles {
        handle.await?;
    }
    assert_eq!(server_task.await?, 8);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_reset_propagates_to_peer, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(4096);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    let mut client_stream = client.open_stream().await?;
    client_stream.write_all(&[9u8; 10]).await?;
    client_stream.reset().await?;

    let mut server_stream = server.accept_stream().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Pending reads fail once the RST lands.
    let mut buf = [0u8; 32];
    let err = loop {
        match server_stream.read(&mut buf).await {
            Ok(0) => panic!("expected reset, got EOF"),
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

    // And so do subsequent writes on the same stream.
    let err = server_stream.write(b"reply").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_go_away_stops_new_streams_only, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(4096);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    // One stream up and running before the GoAway.
    let mut client_stream = client.open_stream().await?;
    let mut server_stream = server.accept_stream().await?;

    server.go_away().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        client.open_stream().await,
        Err(YamuxError::RemoteGoAway)
    ));

    // The established stream keeps transferring until closed normally.
    client_stream.write_all(b"still flowing").await?;
    let mut buf = [0u8; 13];
    server_stream.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"still flowing");

    client_stream.close().await?;
    let mut rest = Vec::new();
    server_stream.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_accept_backlog_admits_all_eventually, 30, {
    let config = ConfigBuilder::new()
        .accept_backlog(2)
        .enable_keep_alive(false)
        .build()?;

    let (client_transport, server_transport) = tokio::io::duplex(4096);
    let client = Session::client(client_transport, config.clone()).await?;
    let server = Session::server(server_transport, config).await?;

    // Three opens against a backlog of two; the third SYN is admitted by
    // the pipe but only surfaces after an accept frees a slot.
    let s1 = client.open_stream().await?;
    let s2 = client.open_stream().await?;
    let s3 = client.open_stream().await?;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(server.accept_stream().await?.id());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![s1.id(), s2.id(), s3.id()]);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_session_close_reaches_peer, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(4096);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    client.close().await?;
    assert!(client.is_closed());

    // The pipe drops; the server session folds shortly after.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.is_closed());
    assert!(matches!(
        server.accept_stream().await,
        Err(YamuxError::SessionShutdown)
    ));

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_stream_states_track_handshake, 30, {
    let (client_transport, server_transport) = tokio::io::duplex(4096);

    let client = Session::client(client_transport, quiet_config()).await?;
    let server = Session::server(server_transport, quiet_config()).await?;

    let client_stream = client.open_stream().await?;
    assert!(matches!(
        client_stream.state(),
        StreamState::SynSent | StreamState::Established
    ));

    let server_stream = server.accept_stream().await?;
    assert_eq!(server_stream.state(), StreamState::Established);

    // The admission ACK establishes the opener.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client_stream.state(), StreamState::Established);
    assert_eq!(client.num_streams(), 1);
    assert_eq!(server.num_streams(), 1);

    Ok::<(), Box<dyn std::error::Error>>(())
});
