//! End-to-end tests against an in-process C2 over real TCP sockets

use backhaul_agent::reconnect::{Exit, Reconnector};
use backhaul_agent::transport::{TcpBeaconDialer, TcpDialer};
use backhaul_agent::{AgentConfig, AgentContext, BeaconEngine, Mode, SessionEngine};
use backhaul_proto::message::{
    AddTransport, BeaconRegister, BeaconTasks, PortfwdReply, PortfwdStart, Register, TransportId,
    TransportsReply, TunnelData, TunnelOpen,
};
use backhaul_proto::{decode, encode, Envelope, EnvelopeCodec, MsgType};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Server side of one agent connection
struct FakeC2 {
    stream: TcpStream,
    codec: EnvelopeCodec,
}

impl FakeC2 {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        Self {
            stream,
            codec: EnvelopeCodec::new(),
        }
    }

    async fn send(&mut self, envelope: Envelope) {
        self.codec.write_envelope(&mut self.stream, &envelope).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        timeout(WAIT, self.codec.read_envelope(&mut self.stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("tcp://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn spawn_session(ctx: Arc<AgentContext>) -> JoinHandle<Exit> {
    tokio::spawn(async move {
        let engine = SessionEngine::new(Arc::clone(&ctx));
        let mut reconnector = Reconnector::for_context(&ctx);
        reconnector
            .run(&TcpDialer, |connection| {
                let engine = engine.clone();
                async move { engine.run(connection).await }
            })
            .await
            .unwrap()
    })
}

#[tokio::test]
async fn test_session_over_tcp() {
    let (listener, url) = listener().await;
    let ctx = AgentContext::with_builtins(AgentConfig::new(vec![url.clone()])).unwrap();
    let agent = spawn_session(ctx);

    let mut c2 = FakeC2::accept(&listener).await;
    let register = c2.recv().await;
    assert_eq!(register.msg_type, MsgType::REGISTER);
    let register: Register = decode(&register.data).unwrap();
    assert_eq!(register.active_c2, url);
    assert_eq!(register.pid, std::process::id());

    c2.send(Envelope::request(MsgType::PING, 1, Bytes::from("are you there"))).await;
    c2.send(Envelope::request(0xdead, 2, Bytes::new())).await;

    let mut replies = vec![c2.recv().await, c2.recv().await];
    replies.sort_by_key(|e| e.id);
    assert_eq!(replies[0].data, Bytes::from("are you there"));
    assert!(!replies[0].unknown_message_type);
    assert!(replies[1].unknown_message_type);

    c2.send(Envelope::request(MsgType::KILL_SESSION, 3, Bytes::new())).await;
    assert_eq!(timeout(WAIT, agent).await.unwrap().unwrap(), Exit::Terminated);
}

#[tokio::test]
async fn test_session_reconnects_after_drop() {
    let (listener, url) = listener().await;
    let config = AgentConfig::new(vec![url]).with_reconnect_interval(Duration::ZERO);
    let ctx = AgentContext::with_builtins(config).unwrap();
    let agent = spawn_session(ctx);

    let mut first = FakeC2::accept(&listener).await;
    assert_eq!(first.recv().await.msg_type, MsgType::REGISTER);
    drop(first);

    let mut second = FakeC2::accept(&listener).await;
    assert_eq!(second.recv().await.msg_type, MsgType::REGISTER);
    second.send(Envelope::request(MsgType::KILL_SESSION, 1, Bytes::new())).await;
    assert_eq!(timeout(WAIT, agent).await.unwrap().unwrap(), Exit::Terminated);
}

#[tokio::test]
async fn test_switch_to_added_transport() {
    let (first_listener, first_url) = listener().await;
    let (second_listener, second_url) = listener().await;
    let config = AgentConfig::new(vec![first_url]).with_reconnect_interval(Duration::ZERO);
    let ctx = AgentContext::with_builtins(config).unwrap();
    let agent = spawn_session(ctx);

    let mut first = FakeC2::accept(&first_listener).await;
    assert_eq!(first.recv().await.msg_type, MsgType::REGISTER);

    let add = AddTransport {
        url: second_url.clone(),
    };
    first
        .send(Envelope::request(MsgType::ADD_TRANSPORT, 1, encode(&add).unwrap()))
        .await;
    let reply: TransportsReply = decode(&first.recv().await.data).unwrap();
    assert!(reply.error.is_empty(), "{}", reply.error);
    let added = reply.transports.iter().find(|t| t.url == second_url).unwrap().id;

    first
        .send(Envelope::request(
            MsgType::SWITCH_TRANSPORT,
            2,
            encode(&TransportId { id: added }).unwrap(),
        ))
        .await;

    let mut second = FakeC2::accept(&second_listener).await;
    let register: Register = decode(&second.recv().await.data).unwrap();
    assert_eq!(register.active_c2, second_url);

    second.send(Envelope::request(MsgType::KILL_SESSION, 3, Bytes::new())).await;
    assert_eq!(timeout(WAIT, agent).await.unwrap().unwrap(), Exit::Terminated);
}

#[tokio::test]
async fn test_port_forward_through_channel() {
    let (listener, url) = listener().await;
    let ctx = AgentContext::with_builtins(AgentConfig::new(vec![url])).unwrap();
    let agent = spawn_session(Arc::clone(&ctx));

    let mut c2 = FakeC2::accept(&listener).await;
    assert_eq!(c2.recv().await.msg_type, MsgType::REGISTER);

    let start = PortfwdStart {
        bind_addr: "127.0.0.1:0".to_string(),
        remote_addr: "10.0.0.5:9222".to_string(),
        via_channel: true,
    };
    c2.send(Envelope::request(MsgType::PORTFWD_START, 1, encode(&start).unwrap())).await;
    let reply = c2.recv().await;
    assert_eq!(reply.id, 1);
    let reply: PortfwdReply = decode(&reply.data).unwrap();
    assert!(reply.error.is_empty(), "{}", reply.error);
    let bind_port = reply.forwards[0].bind_port;

    let mut client = TcpStream::connect(("127.0.0.1", bind_port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let open = c2.recv().await;
    assert_eq!(open.msg_type, MsgType::TUNNEL_OPEN);
    let open: TunnelOpen = decode(&open.data).unwrap();
    assert_eq!(open.remote_addr, "10.0.0.5:9222");

    let mut upstream = Vec::new();
    while upstream.len() < 5 {
        let envelope = c2.recv().await;
        assert_eq!(envelope.msg_type, MsgType::TUNNEL_DATA);
        let chunk: TunnelData = decode(&envelope.data).unwrap();
        assert_eq!(chunk.tunnel_id, open.tunnel_id);
        upstream.extend_from_slice(&chunk.data);
    }
    assert_eq!(upstream, b"hello");

    // Out of order on purpose
    let closing = TunnelData {
        tunnel_id: open.tunnel_id,
        sequence: 1,
        data: Bytes::new(),
        closed: true,
    };
    let payload = TunnelData {
        tunnel_id: open.tunnel_id,
        sequence: 0,
        data: Bytes::from("world"),
        closed: false,
    };
    c2.send(Envelope::new(MsgType::TUNNEL_DATA, encode(&closing).unwrap())).await;
    c2.send(Envelope::new(MsgType::TUNNEL_DATA, encode(&payload).unwrap())).await;

    let mut downstream = Vec::new();
    timeout(WAIT, client.read_to_end(&mut downstream)).await.unwrap().unwrap();
    assert_eq!(downstream, b"world");

    c2.send(Envelope::request(MsgType::KILL_SESSION, 2, Bytes::new())).await;
    assert_eq!(timeout(WAIT, agent).await.unwrap().unwrap(), Exit::Terminated);
    assert!(ctx.forwards.is_empty().await);
}

fn batch(tasks: Vec<Envelope>) -> Envelope {
    let batch = BeaconTasks {
        id: "c2".to_string(),
        interval: 1,
        jitter: 0,
        next_checkin: 0,
        tasks,
    };
    Envelope::new(MsgType::BEACON_TASKS, encode(&batch).unwrap())
}

#[tokio::test]
async fn test_beacon_over_tcp() {
    let (listener, url) = listener().await;
    let config = AgentConfig::new(vec![url])
        .with_mode(Mode::Beacon)
        .with_beacon_schedule(Duration::from_secs(1), Duration::ZERO);
    let ctx = AgentContext::with_builtins(config).unwrap();
    let instance_id = ctx.config.instance_id.to_string();

    let agent = tokio::spawn(async move {
        let mut reconnector = Reconnector::for_context(&ctx);
        let engine = BeaconEngine::new(Arc::clone(&ctx)).with_budget(reconnector.budget());
        reconnector
            .run(&TcpBeaconDialer, |beacon| {
                let engine = engine.clone();
                async move { engine.run(beacon).await }
            })
            .await
            .unwrap()
    });

    let mut registration = FakeC2::accept(&listener).await;
    let register = registration.recv().await;
    assert_eq!(register.msg_type, MsgType::BEACON_REGISTER);
    let register: BeaconRegister = decode(&register.data).unwrap();
    assert_eq!(register.id, instance_id);
    assert_eq!(register.interval, 1);

    let mut checkin = FakeC2::accept(&listener).await;
    let tasks: BeaconTasks = decode(&checkin.recv().await.data).unwrap();
    assert!(tasks.tasks.is_empty());
    checkin
        .send(batch(vec![
            Envelope::request(MsgType::PING, 7, Bytes::from("seven")),
            Envelope::request(0xbeef, 8, Bytes::new()),
        ]))
        .await;

    let mut report = FakeC2::accept(&listener).await;
    let results: BeaconTasks = decode(&report.recv().await.data).unwrap();
    let mut results = results.tasks;
    results.sort_by_key(|e| e.id);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data, Bytes::from("seven"));
    assert!(results[1].unknown_message_type);

    let mut checkin = FakeC2::accept(&listener).await;
    checkin.recv().await;
    checkin
        .send(batch(vec![Envelope::request(MsgType::KILL_SESSION, 9, Bytes::new())]))
        .await;
    let mut report = FakeC2::accept(&listener).await;
    let results: BeaconTasks = decode(&report.recv().await.data).unwrap();
    assert_eq!(results.tasks[0].id, 9);

    assert_eq!(timeout(WAIT, agent).await.unwrap().unwrap(), Exit::Terminated);
}
