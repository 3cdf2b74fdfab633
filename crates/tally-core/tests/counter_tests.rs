//! Integration tests for counter replicas, the connection registry and
//! fan-out dispatch over real loopback connections.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::server::ItemStream;
use tally_core::{
    BoundListener, ClientOptions, ConnectionRegistry, ConnectivityState, CounterServer,
    CounterService, DispatchOutcome, Dispatcher, GreetOutcome, GreetingMessage, IncrementRequest,
    ProtocolVersion, RpcClient, RpcConfig, RpcDispatch, ServerHandle, ServerOptions, TallyError,
    GREETING_SCRIPT,
};

fn local_options(name: &str, ports: Vec<u16>) -> ServerOptions {
    ServerOptions {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        candidate_ports: ports,
    }
}

/// Start a replica on an OS-assigned port.
async fn start_replica(name: &str) -> (ServerHandle, Arc<CounterService>) {
    CounterServer::bind(&local_options(name, vec![0]))
        .await
        .expect("Failed to bind replica")
        .spawn()
}

/// An address with nothing listening on it.
async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn client_options(targets: Vec<String>) -> ClientOptions {
    ClientOptions {
        name: "tester".to_string(),
        targets,
        dial_timeout: Duration::from_millis(500),
        ..ClientOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_never_lost() {
    let (handle, service) = start_replica("p1").await;
    let address = handle.addr().to_string();

    let amounts: Vec<i64> = (1..=40).map(|n| if n % 3 == 0 { -n } else { n * 7 }).collect();
    let tasks: Vec<_> = amounts
        .iter()
        .map(|&amount| {
            let address = address.clone();
            tokio::spawn(async move {
                let client = RpcClient::connect(&address, RpcConfig::DIAL_TIMEOUT)
                    .await
                    .unwrap();
                for _ in 0..5 {
                    client
                        .increment(&IncrementRequest::new("c", amount), ProtocolVersion::V1)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let expected: i64 = amounts.iter().map(|a| a * 5).sum();
    assert_eq!(service.value(), expected);
    handle.stop().await;
}

#[tokio::test]
async fn test_sequential_acks_are_running_totals() {
    let (handle, _service) = start_replica("p2").await;
    let dispatcher = Dispatcher::connect(client_options(vec![handle.addr().to_string()])).await;

    let mut acks = Vec::new();
    for amount in [1, 2, 3] {
        let report = dispatcher.dispatch_increment(amount).await;
        match &report.outcomes[0].1 {
            DispatchOutcome::Acked { new_value } => acks.push(*new_value),
            other => panic!("Expected Acked, got: {:?}", other),
        }
    }

    assert_eq!(acks, vec![1, 3, 6]);
    handle.stop().await;
}

#[tokio::test]
async fn test_replicas_are_independent() {
    let (first, first_service) = start_replica("a").await;
    let (second, second_service) = start_replica("b").await;
    let first_addr = first.addr().to_string();
    let second_addr = second.addr().to_string();

    let both = Dispatcher::connect(client_options(vec![first_addr.clone(), second_addr.clone()])).await;
    let report = both.dispatch_increment(5).await;
    assert_eq!(report.applied(), 2);

    let only_second = Dispatcher::connect(client_options(vec![second_addr.clone()])).await;
    only_second.dispatch_increment(3).await;

    assert_eq!(first_service.value(), 5);
    assert_eq!(second_service.value(), 8);

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_bootstrap_falls_back_to_free_port() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let occupied_port = occupied.local_addr().unwrap().port();

    // Find a free port, then release it for the bootstrap to claim.
    let free_port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let server = CounterServer::bind(&local_options("p4", vec![occupied_port, free_port]))
        .await
        .unwrap();
    assert_eq!(server.local_addr().port(), free_port);
}

#[tokio::test]
async fn test_bootstrap_fails_cleanly_when_all_ports_taken() {
    let a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ports = vec![a.local_addr().unwrap().port(), b.local_addr().unwrap().port()];

    let result = CounterServer::bind(&local_options("p4", ports.clone())).await;
    match result {
        Err(TallyError::BindExhausted { attempted, .. }) => assert_eq!(attempted, ports),
        Err(other) => panic!("Expected BindExhausted, got: {:?}", other),
        Ok(_) => panic!("Expected BindExhausted, got a bound server"),
    }

    let single = CounterServer::bind(&local_options("p4", vec![ports[0]])).await;
    assert!(matches!(single, Err(TallyError::BindExhausted { .. })));
}

#[tokio::test]
async fn test_partial_connectivity_only_reaches_live_replica() {
    let (handle, service) = start_replica("p5").await;
    let live = handle.addr().to_string();
    let dead = dead_address().await;

    let dispatcher = Dispatcher::connect(client_options(vec![live.clone(), dead.clone()])).await;
    assert_eq!(dispatcher.registry().addresses().await, vec![live.clone()]);
    let entry = dispatcher.registry().get(&live).await.unwrap();
    assert_eq!(entry.readiness(), ConnectivityState::Ready);

    let report = dispatcher.dispatch_increment(4).await;
    assert_eq!(
        report.outcome(&live),
        Some(&DispatchOutcome::Acked { new_value: 4 })
    );
    assert_eq!(report.outcome(&dead), Some(&DispatchOutcome::NotConnected));
    assert_eq!(service.value(), 4);

    handle.stop().await;
}

#[tokio::test]
async fn test_dispatch_skips_replica_that_went_away() {
    let (kept, kept_service) = start_replica("kept").await;
    let (stopped, _stopped_service) = start_replica("stopped").await;
    let kept_addr = kept.addr().to_string();
    let stopped_addr = stopped.addr().to_string();

    let dispatcher =
        Dispatcher::connect(client_options(vec![kept_addr.clone(), stopped_addr.clone()])).await;
    assert_eq!(dispatcher.registry().len().await, 2);

    stopped.stop().await;
    let entry = dispatcher.registry().get(&stopped_addr).await.unwrap();
    for _ in 0..40 {
        if !ConnectionRegistry::is_ready(&entry) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = dispatcher.dispatch_increment(2).await;
    assert_eq!(
        report.outcome(&kept_addr),
        Some(&DispatchOutcome::Acked { new_value: 2 })
    );
    assert_eq!(
        report.outcome(&stopped_addr),
        Some(&DispatchOutcome::Skipped {
            state: ConnectivityState::TransientFailure
        })
    );
    assert_eq!(kept_service.value(), 2);

    kept.stop().await;
}

#[tokio::test]
async fn test_small_ack_is_reported_as_suspicious() {
    let (handle, _service) = start_replica("neg").await;
    let address = handle.addr().to_string();
    let dispatcher = Dispatcher::connect(client_options(vec![address.clone()])).await;

    dispatcher.dispatch_increment(-10).await;
    let report = dispatcher.dispatch_increment(1).await;

    assert_eq!(
        report.outcome(&address),
        Some(&DispatchOutcome::Suspicious {
            new_value: -9,
            amount: 1
        })
    );
    handle.stop().await;
}

#[tokio::test]
async fn test_greeting_gets_single_farewell() {
    let (handle, service) = start_replica("p6").await;
    let address = handle.addr().to_string();
    let dispatcher = Dispatcher::connect(client_options(vec![address.clone()])).await;

    let report = dispatcher.dispatch_greeting(&GREETING_SCRIPT).await;

    assert_eq!(report.outcomes.len(), 1);
    match &report.outcomes[0].1 {
        GreetOutcome::Farewell(farewell) => assert_eq!(farewell.message, "Goodbye"),
        other => panic!("Expected Farewell, got: {:?}", other),
    }
    assert_eq!(service.greetings_received(), 3);
    handle.stop().await;
}

/// Counter service wrapper that records greetings in arrival order.
struct RecordingService {
    inner: CounterService,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl RpcDispatch for RecordingService {
    async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> tally_core::Result<serde_json::Value> {
        self.inner.dispatch(method, params).await
    }

    async fn dispatch_stream(
        &self,
        method: &str,
        items: ItemStream,
    ) -> tally_core::Result<serde_json::Value> {
        use futures::StreamExt;

        let seen = self.seen.clone();
        let recorded = items
            .inspect(move |item| {
                if let Ok(value) = item {
                    if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
                        seen.lock().unwrap().push(message.to_string());
                    }
                }
            })
            .boxed();
        self.inner.dispatch_stream(method, recorded).await
    }
}

#[tokio::test]
async fn test_greetings_arrive_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let service = Arc::new(RecordingService {
        inner: CounterService::new("recorder"),
        seen: seen.clone(),
    });
    let handle = BoundListener::bind("127.0.0.1", &[0])
        .await
        .unwrap()
        .spawn(service.clone());

    let client = RpcClient::connect(&handle.addr().to_string(), RpcConfig::DIAL_TIMEOUT)
        .await
        .unwrap();
    let messages: Vec<GreetingMessage> = GREETING_SCRIPT
        .iter()
        .map(|m| GreetingMessage::new("tester", *m))
        .collect();
    let farewell = client.greet(&messages).await.unwrap();

    assert_eq!(farewell.message, "Goodbye");
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["Hi", "How are you?", "I'm fine, thanks."]
    );
    assert_eq!(service.inner.greetings_received(), 3);
    handle.stop().await;
}

#[tokio::test]
async fn test_dropped_stream_gets_no_farewell() {
    use tally_core::protocol::{write_frame, RpcRequest};

    let (handle, service) = start_replica("abort").await;
    let mut stream = tokio::net::TcpStream::connect(handle.addr()).await.unwrap();

    let item = RpcRequest::notification(
        "greet",
        serde_json::to_value(GreetingMessage::new("tester", "Hi")).unwrap(),
    );
    write_frame(&mut stream, &serde_json::to_vec(&item).unwrap())
        .await
        .unwrap();
    drop(stream);

    // The message is received, but the aborted stream never completes.
    for _ in 0..40 {
        if service.greetings_received() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(service.greetings_received(), 1);
    assert_eq!(service.value(), 0);
    handle.stop().await;
}

#[tokio::test]
async fn test_rejoin_after_replica_restart() {
    let (handle, _service) = start_replica("restart").await;
    let port = handle.addr().port();
    let address = handle.addr().to_string();

    let dispatcher = Dispatcher::connect(client_options(vec![address.clone()])).await;
    handle.stop().await;

    // Same port, fresh counter.
    let (restarted, restarted_service) = CounterServer::bind(&local_options("restart", vec![port]))
        .await
        .unwrap()
        .spawn();

    let entry = dispatcher.registry().get(&address).await.unwrap();
    for _ in 0..40 {
        if !entry.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!entry.is_ready());

    let joined = dispatcher
        .registry()
        .rejoin(&[address.clone()], Duration::from_millis(500))
        .await;
    assert_eq!(joined, 1);

    let report = dispatcher.dispatch_increment(9).await;
    assert_eq!(
        report.outcome(&address),
        Some(&DispatchOutcome::Acked { new_value: 9 })
    );
    assert_eq!(restarted_service.value(), 9);
    restarted.stop().await;
}
