//! Request client tests against real servers on loopback

mod common;

use common::{binary_server, client_config, line_server, rpc_server, wait_until};
use futures::future::join_all;
use muxwire_codec::{BinaryProtocol, LineProtocol, RpcProtocol};
use muxwire_network::{Client, NetworkError, RequestOptions};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

async fn wait_live<P: muxwire_codec::FramingProtocol>(client: &Client<P>, expected: usize) {
    assert!(
        wait_until(Duration::from_secs(3), || client.pool().live_count() == expected).await,
        "expected {} live connections, have {}",
        expected,
        client.pool().live_count()
    );
}

mod multiplexed {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_round_trip() {
        let (_server, address) = binary_server("a").await;
        let client =
            Client::new(BinaryProtocol::default(), client_config(&[("a", address)])).unwrap();

        // Issued before the connection exists: waits in the pending queue
        let reply = client.call("echo", b"hello").await.unwrap();

        assert_eq!(reply.name, "echo");
        assert_eq!(&reply.body[..], b"hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_calls_are_correlated() {
        let (_server, address) = binary_server("a").await;
        let client =
            Client::new(BinaryProtocol::default(), client_config(&[("a", address)])).unwrap();
        wait_live(&client, 1).await;

        let bodies: Vec<String> = (0..200).map(|i| format!("payload-{}", i)).collect();
        let calls = bodies.iter().map(|body| client.call("echo", body.as_bytes()));
        let replies = join_all(calls).await;

        for (body, reply) in bodies.iter().zip(replies) {
            let reply = reply.unwrap();
            assert_eq!(&reply.body[..], body.as_bytes());
        }
        let stats = client.stats();
        assert_eq!(stats.in_flight_requests, 0);
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.live_connections, 1);
        assert_eq!(stats.registered_nodes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rpc_round_trip() {
        let (_server, address) = rpc_server().await;
        let client =
            Client::new(RpcProtocol::default(), client_config(&[("rpc", address)])).unwrap();

        let reply = client.call("user.get", b"42").await.unwrap();

        assert_eq!(reply.name, "user.get");
        assert_eq!(&reply.body[..], b"user:42");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_timeout_keeps_connection() {
        let (_server, address) = binary_server("a").await;
        let client =
            Client::new(BinaryProtocol::default(), client_config(&[("a", address)])).unwrap();
        wait_live(&client, 1).await;
        let before = client.pool().connection_for("a").unwrap().id();

        let options = RequestOptions::default().with_receive_timeout(Duration::from_millis(100));
        let result = client.call_with("silent", b"", options).await;

        match result {
            Err(NetworkError::ReceiveTimeout { connection_id, timeout_ms }) => {
                assert_eq!(connection_id, before);
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected receive timeout, got {:?}", other),
        }

        // Other requests on the same connection are unaffected
        let reply = client.call("echo", b"still here").await.unwrap();
        assert_eq!(&reply.body[..], b"still here");
        assert_eq!(client.pool().connection_for("a").unwrap().id(), before);
        assert_eq!(client.stats().in_flight_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_routing_key_reaches_ring_owner() {
        let (_a, address_a) = binary_server("a").await;
        let (_b, address_b) = binary_server("b").await;
        let (_c, address_c) = binary_server("c").await;
        let client = Client::new(
            BinaryProtocol::default(),
            client_config(&[("a", address_a), ("b", address_b), ("c", address_c)]),
        )
        .unwrap();
        wait_live(&client, 3).await;

        let snapshot = client.pool().snapshot();
        for i in 0..30 {
            let key = format!("user:{}", i);
            let owner = snapshot.owner_of(&key).unwrap().to_string();
            let options = RequestOptions::default().with_routing_key(key.clone());

            let reply = client.call_with("whoami", b"", options.clone()).await.unwrap();
            assert_eq!(&reply.body[..], owner.as_bytes(), "key {}", key);

            // Same key, same node
            let again = client.call_with("whoami", b"", options).await.unwrap();
            assert_eq!(again.body, reply.body);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_robin_uses_every_node() {
        let (_a, address_a) = binary_server("a").await;
        let (_b, address_b) = binary_server("b").await;
        let (_c, address_c) = binary_server("c").await;
        let client = Client::new(
            BinaryProtocol::default(),
            client_config(&[("a", address_a), ("b", address_b), ("c", address_c)]),
        )
        .unwrap();
        wait_live(&client, 3).await;

        let mut seen = HashSet::new();
        for _ in 0..9 {
            let reply = client.call("whoami", b"").await.unwrap();
            seen.insert(String::from_utf8(reply.body.to_vec()).unwrap());
        }

        let expected: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
    }
}

mod synchronous {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_line_echo() {
        let (_server, address) = line_server().await;
        let client =
            Client::new(LineProtocol::default(), client_config(&[("line", address)])).unwrap();

        let reply = client.call("echo", b"hello world").await.unwrap();

        assert_eq!(reply.line, "hello world");
        assert_eq!(reply.command, "hello");
        assert_eq!(reply.args, vec!["world".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_calls_are_serialized_per_connection() {
        let (_server, address) = line_server().await;
        let client =
            Client::new(LineProtocol::default(), client_config(&[("line", address)])).unwrap();
        wait_live(&client, 1).await;

        let bodies: Vec<String> = (0..20).map(|i| format!("item {}", i)).collect();
        let calls = bodies.iter().map(|body| client.call("echo", body.as_bytes()));
        let replies = join_all(calls).await;

        for (body, reply) in bodies.iter().zip(replies) {
            assert_eq!(&reply.unwrap().line, body);
        }
        assert_eq!(client.stats().in_flight_requests, 0);
        assert_eq!(client.stats().pending_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_timeout_replaces_connection() {
        let (_server, address) = line_server().await;
        let client =
            Client::new(LineProtocol::default(), client_config(&[("line", address)])).unwrap();
        wait_live(&client, 1).await;
        let before = client.pool().connection_for("line").unwrap().id();

        let options = RequestOptions::default().with_receive_timeout(Duration::from_millis(100));
        let result = client.call_with("silent", b"", options).await;
        assert!(
            matches!(
                result,
                Err(NetworkError::ReceiveTimeout { connection_id, .. }) if connection_id == before
            ),
            "got {:?}",
            result
        );

        let replaced = wait_until(Duration::from_secs(3), || {
            client
                .pool()
                .connection_for("line")
                .is_some_and(|c| c.id() != before && c.is_active())
        })
        .await;
        assert!(replaced, "connection should be re-established with a new id");

        let reply = client.call("echo", b"after").await.unwrap();
        assert_eq!(reply.line, "after");
    }
}

mod failures {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_nodes_times_out_pending() {
        let mut config = client_config(&[]);
        config.send_timeout_ms = 200;
        let client = Client::new(BinaryProtocol::default(), config).unwrap();

        let started = std::time::Instant::now();
        let result = client.call("echo", b"nowhere").await;

        assert!(matches!(result, Err(NetworkError::PendingSendTimeout { timeout_ms: 200 })));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(client.stats().pending_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_fails_in_flight_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Read whatever arrives, then hang up without replying
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                let _ = socket.read(&mut buf).await;
            }
        });

        let client =
            Client::new(BinaryProtocol::default(), client_config(&[("mute", address)])).unwrap();
        wait_live(&client, 1).await;

        let result = client
            .call_with("echo", b"lost", RequestOptions::default().without_retry())
            .await;

        assert!(matches!(result, Err(NetworkError::Disconnected { .. })), "got {:?}", result);
        assert_eq!(client.stats().in_flight_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_fails_waiting_calls() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = unused.local_addr().unwrap();
        drop(unused);

        let mut config = client_config(&[("gone", address)]);
        config.send_timeout_ms = 10_000;
        let client = Arc::new(Client::new(BinaryProtocol::default(), config).unwrap());

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.call("echo", b"never").await })
        };
        assert!(wait_until(Duration::from_secs(1), || client.stats().pending_requests == 1).await);

        client.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetworkError::Disconnected { .. })));

        let after = client.call("echo", b"late").await;
        assert!(matches!(after, Err(NetworkError::Disconnected { .. })));
        assert!(client.pool().is_shutdown());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_config_rejected() {
        let mut config = client_config(&[]);
        config.receive_timeout_ms = 0;

        let result = Client::new(BinaryProtocol::default(), config);
        assert!(matches!(result, Err(NetworkError::Configuration { .. })));
    }
}

mod limits {
    use super::*;
    use common::listener_config;
    use muxwire_codec::{BinaryMessage, FramingProtocol, ProtocolError};
    use muxwire_config::{ConnectionConfig, ListenerConfig};
    use muxwire_network::{CommandTable, Server};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn small_frames() -> ConnectionConfig {
        ConnectionConfig {
            max_message_size: 64,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_drops_peer_over_configured_limit() {
        common::init_tracing();
        let mut table = CommandTable::<BinaryProtocol>::new();
        table.register_fn("echo", |m: &BinaryMessage| Some(m.body.clone()));
        let config = ListenerConfig {
            connection: small_frames(),
            ..listener_config()
        };
        let mut server = Server::new(BinaryProtocol::default(), table, config).unwrap();
        let address = server.start().await.unwrap();
        assert_eq!(server.host().protocol().max_message_size(), 64);

        let mut peer = TcpStream::connect(address).await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || server.host().connection_count() == 1).await);

        // Valid under the protocol's own limit, too large for the configured one
        let wire = BinaryProtocol::default().encode(1, "echo", &[7u8; 1000]).unwrap();
        let _ = peer.write_all(&wire).await;

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "no reply expected for an oversized frame");
        assert!(wait_until(Duration::from_secs(1), || server.host().connection_count() == 0).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_rejects_request_over_configured_limit() {
        let (_server, address) = binary_server("a").await;
        let mut config = client_config(&[("a", address)]);
        config.connection = small_frames();
        let client = Client::new(BinaryProtocol::default(), config).unwrap();

        let result = client.call("echo", &[0u8; 1000]).await;
        assert!(
            matches!(
                result,
                Err(NetworkError::BadProtocol(ProtocolError::FrameTooLarge { max: 64, .. }))
            ),
            "got {:?}",
            result
        );
        assert_eq!(client.stats().pending_requests, 0);

        let reply = client.call("echo", b"fits").await.unwrap();
        assert_eq!(&reply.body[..], b"fits");
    }
}

mod retry {
    use super::*;

    /// Accepts one connection and never reads it; `release` drops socket and listener
    async fn stalled_node() -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (release, released) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let accepted = listener.accept().await;
            let _ = released.await;
            drop(accepted);
            drop(listener);
        });
        (address, release)
    }

    struct Stalled {
        client: Arc<Client<BinaryProtocol>>,
        release: oneshot::Sender<()>,
        healthy: common::BinaryServer,
        /// Routing keys owned by the stalled node, first one carries the large call
        keys: Vec<String>,
    }

    /// Node "a" stops reading, so a large send holds its writer and later
    /// requests for "a" wait in its queue
    async fn stalled_client() -> Stalled {
        let (stalled, release) = stalled_node().await;
        let (healthy, healthy_address) = binary_server("b").await;
        let mut config = client_config(&[("a", stalled), ("b", healthy_address)]);
        config.send_timeout_ms = 5_000;
        config.receive_timeout_ms = 5_000;
        config.connection.socket_buffer_size = 8192;
        let client = Arc::new(Client::new(BinaryProtocol::default(), config).unwrap());
        wait_live(&client, 2).await;

        let snapshot = client.pool().snapshot();
        let keys: Vec<String> = (0..500)
            .map(|i| format!("key:{}", i))
            .filter(|key| snapshot.owner_of(key) == Some("a"))
            .take(4)
            .collect();
        assert_eq!(keys.len(), 4);

        let connection = client.pool().connection_for("a").unwrap();
        let options = RequestOptions::default().with_routing_key(keys[0].clone());
        let large = vec![0u8; 12 * 1024 * 1024];
        let caller = client.clone();
        tokio::spawn(async move { caller.call_with("echo", &large, options).await });
        assert!(wait_until(Duration::from_secs(2), || connection.pending_packets() == 1).await);

        Stalled {
            client,
            release,
            healthy,
            keys,
        }
    }

    /// One echo call per key, each echoing its own key
    async fn queue_behind_stall(
        client: &Arc<Client<BinaryProtocol>>,
        keys: &[String],
        allow_retry: bool,
    ) -> Vec<tokio::task::JoinHandle<Result<Vec<u8>, NetworkError>>> {
        let handles: Vec<_> = keys
            .iter()
            .map(|key| {
                let client = client.clone();
                let key = key.clone();
                let mut options = RequestOptions::default().with_routing_key(key.clone());
                if !allow_retry {
                    options = options.without_retry();
                }
                tokio::spawn(async move {
                    let reply = client.call_with("echo", key.as_bytes(), options).await?;
                    Ok::<_, NetworkError>(reply.body.to_vec())
                })
            })
            .collect();

        let connection = client.pool().connection_for("a").unwrap();
        let queued = || connection.pending_packets() == 1 + keys.len();
        assert!(wait_until(Duration::from_secs(2), queued).await);
        handles
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_requests_move_to_surviving_node() {
        let Stalled {
            client,
            release,
            healthy: _healthy,
            keys,
        } = stalled_client().await;
        let calls = queue_behind_stall(&client, &keys[1..], true).await;

        release.send(()).unwrap();

        for (key, call) in keys[1..].iter().zip(calls) {
            let body = tokio::time::timeout(Duration::from_secs(5), call)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(body, key.as_bytes());
        }
        assert!(client.pool().connection_for("a").map_or(true, |c| !c.is_active()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_requests_without_retry_fail() {
        let Stalled {
            client,
            release,
            healthy: _healthy,
            keys,
        } = stalled_client().await;
        let calls = queue_behind_stall(&client, &keys[1..], false).await;

        release.send(()).unwrap();

        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(5), call)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(NetworkError::SendFailed { .. })), "got {:?}", result);
        }
    }
}
