mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use nfs_mamont_rpc::protocol::rpc::{AuthUnix, CallError, Framer, Transport};
use nfs_mamont_rpc::xdr::rpc::auth_unix;
use nfs_mamont_rpc::xdr::{deserialize, nfs3};
use nfs_mamont_rpc::{ReconnectPolicy, RpcCaller, RpcClient, RpcConfig};

use support::{init_logging, parse_call, reply_message, tcp_reply, test_config, SeenCall};

const PROG: u32 = nfs3::PROGRAM;
const VERS: u32 = nfs3::VERSION;
const LIMIT: Duration = Duration::from_secs(5);

/// What the stub server does with one call.
enum Action {
    Reply(Vec<u8>),
    Ignore,
    Hangup,
}

/// Starts a record-marked TCP server; `handler` gets the connection number
/// (0 for the first) and the call.
async fn tcp_server<F>(handler: F) -> SocketAddr
where
    F: Fn(usize, &SeenCall) -> Action + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, connection, handler.clone()));
            connection += 1;
        }
    });
    addr
}

async fn serve_connection<F>(mut stream: TcpStream, connection: usize, handler: Arc<F>)
where
    F: Fn(usize, &SeenCall) -> Action + Send + Sync + 'static,
{
    let mut framer = Framer::new(usize::MAX);
    let mut buf = vec![0u8; 65536];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut messages = Vec::new();
        if framer.feed(&buf[..n], |m| messages.push(m)).is_err() {
            return;
        }
        for message in messages {
            let call = parse_call(&message);
            match handler(connection, &call) {
                Action::Reply(results) => {
                    if stream.write_all(&tcp_reply(call.xid, &results)).await.is_err() {
                        return;
                    }
                }
                Action::Ignore => {}
                Action::Hangup => return,
            }
        }
    }
}

async fn echo_server() -> SocketAddr {
    tcp_server(|_, call| Action::Reply(call.args.clone())).await
}

async fn silent_server() -> SocketAddr {
    tcp_server(|_, _| Action::Ignore).await
}

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let addr = socket.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let call = parse_call(&buf[..n]);
            let _ = socket.send_to(&reply_message(call.xid, &call.args), from).await;
        }
    });
    addr
}

async fn start_client(addr: SocketAddr, config: RpcConfig) -> RpcClient {
    init_logging();
    RpcClient::connect(addr, Transport::Tcp, config).await.expect("connect")
}

fn fast_config() -> RpcConfig {
    RpcConfig {
        poll_interval: Duration::from_millis(10),
        reconnect_delay: Duration::from_millis(10),
        ..test_config()
    }
}

#[tokio::test]
async fn call_and_ping() {
    let client = start_client(echo_server().await, test_config()).await;

    let results = client.call(PROG, VERS, 1, vec![1, 2, 3, 4]).await;
    assert_eq!(results, Ok(vec![1, 2, 3, 4]));
    client.ping(PROG, VERS).await.expect("ping");

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.responses_received, 2);
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let client = start_client(echo_server().await, test_config()).await;

    let calls = (0..32u8).map(|i| client.call(PROG, VERS, 6, vec![i; 4 + i as usize]));
    let replies = tokio::time::timeout(LIMIT, join_all(calls)).await.expect("replies in time");

    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply, Ok(vec![i as u8; 4 + i]));
    }
}

#[tokio::test]
async fn udp_calls() {
    init_logging();
    let addr = udp_echo_server().await;
    let client = RpcClient::connect(addr, Transport::Udp, test_config()).await.expect("connect");
    assert_eq!(client.transport(), Transport::Udp);
    assert_eq!(client.peer(), addr);

    let reply = tokio::time::timeout(LIMIT, client.call(PROG, VERS, 3, vec![9; 8])).await;
    assert_eq!(reply.expect("reply in time"), Ok(vec![9; 8]));
}

#[tokio::test]
async fn unanswered_call_times_out_after_retransmissions() {
    let config = RpcConfig { timeout: Duration::from_millis(50), retrans: 1, ..fast_config() };
    let client = start_client(silent_server().await, config).await;

    let reply = tokio::time::timeout(LIMIT, client.call(PROG, VERS, 1, vec![0; 4])).await;
    assert_eq!(reply.expect("outcome in time"), Err(CallError::Timeout));

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.timed_out, 2);
    assert_eq!(stats.retransmitted, 1);
    assert_eq!(stats.major_timed_out, 1);
}

#[tokio::test]
async fn call_survives_server_hangup() {
    let addr = tcp_server(|connection, call| match connection {
        0 => Action::Hangup,
        _ => Action::Reply(call.args.clone()),
    })
    .await;
    let config = RpcConfig { auto_reconnect: ReconnectPolicy::Infinite, ..fast_config() };
    let client = start_client(addr, config).await;

    let reply = tokio::time::timeout(LIMIT, client.call(PROG, VERS, 7, vec![5; 12])).await;
    assert_eq!(reply.expect("reply in time"), Ok(vec![5; 12]));

    let stats = client.stats().await.expect("stats");
    assert!(stats.reconnects >= 1);
    assert!(stats.retransmitted >= 1);
}

#[tokio::test]
async fn call_survives_back_to_back_hangups() {
    let addr = tcp_server(|connection, call| match connection {
        0..=2 => Action::Hangup,
        _ => Action::Reply(call.args.clone()),
    })
    .await;
    let config = RpcConfig { auto_reconnect: ReconnectPolicy::Infinite, ..fast_config() };
    let client = start_client(addr, config).await;

    let reply = tokio::time::timeout(LIMIT, client.call(PROG, VERS, 7, vec![3; 8])).await;
    assert_eq!(reply.expect("reply in time"), Ok(vec![3; 8]));

    let stats = client.stats().await.expect("stats");
    assert!(stats.reconnects >= 3);
    assert_eq!(stats.responses_received, 1);
}

#[tokio::test]
async fn hangup_without_reconnect_fails_calls() {
    let client = start_client(tcp_server(|_, _| Action::Hangup).await, fast_config()).await;

    let reply = tokio::time::timeout(LIMIT, client.call(PROG, VERS, 1, Vec::new())).await;
    assert_eq!(reply.expect("outcome in time"), Err(CallError::ConnectionLost));

    // the task is gone; later calls fail straight away
    let reply = tokio::time::timeout(LIMIT, client.call(PROG, VERS, 1, Vec::new())).await;
    assert_eq!(reply.expect("outcome in time"), Err(CallError::ConnectionLost));
}

#[tokio::test]
async fn connect_failure_without_reconnect() {
    init_logging();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    };
    let result = RpcClient::connect(addr, Transport::Tcp, fast_config()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cancel_pending_call() {
    let client = start_client(silent_server().await, test_config()).await;

    let (handle, reply) = client.submit(PROG, VERS, 1, vec![0; 4], None).await.expect("submit");
    assert!(client.cancel(handle).await);
    assert_eq!(reply.await, Err(CallError::Cancelled));
    assert!(!client.cancel(handle).await);
}

#[tokio::test]
async fn shutdown_fails_pending_calls() {
    let client = start_client(silent_server().await, test_config()).await;

    let (_, reply) = client.submit(PROG, VERS, 1, Vec::new(), None).await.expect("submit");
    client.shutdown().await.expect("shutdown");
    assert_eq!(reply.await, Err(CallError::ConnectionLost));
}

/// Server answering every call with the credential body it carried.
async fn credential_server() -> SocketAddr {
    tcp_server(|_, call| Action::Reply(call.call.cred.body.clone())).await
}

async fn credential_of(client: &RpcClient, auth: Option<AuthUnix>) -> auth_unix {
    let body = client.call_with(PROG, VERS, 0, Vec::new(), auth).await.expect("call");
    deserialize(&mut &body[..]).expect("auth_unix body")
}

#[tokio::test]
async fn identity_follows_configuration() {
    let client = start_client(credential_server().await, test_config()).await;

    let cred = credential_of(&client, None).await;
    assert_eq!(cred.machinename, b"test-host".to_vec());
    assert_eq!((cred.uid, cred.gid, cred.gids), (1000, 1000, vec![10, 20]));

    client
        .configure(|engine| {
            engine.set_uid(4242);
            engine.set_groups(Vec::new());
        })
        .expect("configure");
    let cred = credential_of(&client, None).await;
    assert_eq!((cred.uid, cred.gid), (4242, 1000));
    assert!(cred.gids.is_empty());

    let other = AuthUnix::new("elsewhere", 1, 2, vec![3]);
    let cred = credential_of(&client, Some(other)).await;
    assert_eq!(cred.machinename, b"elsewhere".to_vec());
    assert_eq!((cred.uid, cred.gid, cred.gids), (1, 2, vec![3]));
}

#[tokio::test]
async fn usable_as_a_caller() {
    let client = start_client(echo_server().await, test_config()).await;
    let caller: Arc<dyn RpcCaller> = Arc::new(client);

    let reply = caller.call(PROG, VERS, 4, vec![7; 4]).await;
    assert_eq!(reply, Ok(vec![7; 4]));
}
