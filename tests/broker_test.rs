use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rail_protocol::{
    Endpoint, Envelope, FunctionDecl, MAX_FRAME_LEN, Manifest, StreamTransport, TransportExt,
    client::{ClientError, ClientOptions, FunctionHandler, RailClient},
    frame::{read_frame, write_frame},
    message::ConnectMessage,
};
use railhost::{
    AssetCatalog, Broker, BrokerConfig, BrokerEvent, DiskCatalog, GatewayError, Target,
    events::AssociationOutcome, listener::TcpAcceptor,
};
use serde_json::{Map, Value, json};
use tokio::{
    io::{AsyncWriteExt, duplex},
    sync::broadcast,
    time::{sleep, timeout},
};

/// Test application: `Calc.Add`, `Div`, `Echo` and `Sleep`. Records every call it serves.
#[derive(Default)]
struct Calc {
    declare: bool,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl Calc {
    fn declared() -> Arc<Self> {
        Arc::new(Self {
            declare: true,
            ..Default::default()
        })
    }

    /// Answers calls but tells the broker nothing about them.
    fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seen(&self) -> Vec<(String, Option<String>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionHandler for Calc {
    fn manifest(&self) -> Manifest {
        let manifest = Manifest::new("cpp");
        if !self.declare {
            return manifest;
        }
        manifest
            .with_function(
                FunctionDecl::new("Add")
                    .class("Calc")
                    .param("a", "int", true)
                    .param("b", "int", true),
            )
            .with_function(FunctionDecl::new("Div"))
            .with_function(FunctionDecl::new("Echo"))
            .with_function(FunctionDecl::new("Sleep"))
    }

    async fn call(
        &self,
        method: &str,
        class: Option<&str>,
        args: Map<String, Value>,
    ) -> Result<Value, String> {
        self.seen
            .lock()
            .unwrap()
            .push((method.to_string(), class.map(str::to_string)));
        match method {
            "Add" => {
                let a = args.get("a").and_then(Value::as_i64).ok_or("missing a")?;
                let b = args.get("b").and_then(Value::as_i64).ok_or("missing b")?;
                Ok(json!(a + b))
            }
            "Div" => Err("division by zero".to_string()),
            "Echo" => Ok(Value::Object(args)),
            "Sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(10_000);
                sleep(Duration::from_millis(ms)).await;
                Ok(json!("done"))
            }
            other => Err(format!("Method not found: {other}")),
        }
    }
}

fn config() -> BrokerConfig {
    BrokerConfig {
        handshake_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn connect(
    broker: &Broker,
    instance: &str,
    tag: Option<&str>,
    handler: Option<Arc<dyn FunctionHandler>>,
) -> RailClient {
    let (broker_end, client_end) = duplex(64 * 1024);
    broker.attach(Arc::new(StreamTransport::from_stream("test", broker_end)));

    let mut options = ClientOptions::new(instance);
    if let Some(tag) = tag {
        options = options.process_tag(tag);
    }
    RailClient::connect(
        Arc::new(StreamTransport::from_stream(instance.to_string(), client_end)),
        options,
        handler,
    )
    .await
    .unwrap()
}

async fn next_event(
    rx: &mut broadcast::Receiver<BrokerEvent>,
    wanted: impl Fn(&BrokerEvent) -> bool,
) -> BrokerEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

async fn wait_until(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn add_returns_five() {
    let broker = Broker::new(config(), None);
    let calc = Calc::declared();
    let _client = connect(&broker, "calc", None, Some(calc.clone())).await;

    let out = broker
        .gateway()
        .execute(Target::Auto, "Add", args(json!({"a": 2, "b": 3})), None)
        .await;

    assert_eq!(out, Ok(json!(5)));
    assert_eq!(calc.seen(), [("Add".to_string(), Some("Calc".to_string()))]);
}

#[tokio::test]
async fn unknown_function_never_reaches_a_client() {
    let broker = Broker::new(config(), None);
    let calc = Calc::declared();
    let _client = connect(&broker, "calc", None, Some(calc.clone())).await;

    let out = broker
        .gateway()
        .execute(Target::Auto, "Unknown", Map::new(), None)
        .await;

    assert_eq!(out, Err(GatewayError::NoClientFound("Unknown".into())));
    assert!(calc.seen().is_empty());
}

#[tokio::test]
async fn remote_errors_are_surfaced() {
    let broker = Broker::new(config(), None);
    let _client = connect(&broker, "calc", None, Some(Calc::declared())).await;

    let out = broker.gateway().execute(Target::Auto, "Div", Map::new(), None).await;
    assert_eq!(out, Err(GatewayError::Remote("division by zero".into())));
}

#[tokio::test]
async fn late_results_are_dropped_and_the_session_survives() {
    let broker = Broker::new(config(), None);
    let mut events = broker.subscribe();
    let _client = connect(&broker, "calc", None, Some(Calc::declared())).await;
    let gateway = broker.gateway();

    let err = gateway
        .execute(
            Target::Auto,
            "Sleep",
            args(json!({"ms": 300})),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }));

    next_event(&mut events, |e| matches!(e, BrokerEvent::StaleResult { .. })).await;

    let out = gateway
        .execute(Target::Auto, "Echo", args(json!({"x": 1})), None)
        .await;
    assert_eq!(out, Ok(json!({"x": 1})));
    assert_eq!(broker.registry().len(), 1);
}

#[tokio::test]
async fn disconnect_fails_every_pending_call() {
    let broker = Broker::new(config(), None);
    let mut events = broker.subscribe();
    let client = connect(&broker, "sleepy", None, Some(Calc::declared())).await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .gateway()
                    .execute(Target::Auto, "Sleep", Map::new(), None)
                    .await
            })
        })
        .collect();

    let registry = broker.registry().clone();
    wait_until(|| {
        registry
            .get("sleepy")
            .is_some_and(|s| s.pending().len() == 3)
    })
    .await;

    client.disconnect().await.unwrap();

    for call in calls {
        assert_eq!(
            call.await.unwrap(),
            Err(GatewayError::Disconnected("client disconnected".into()))
        );
    }
    assert_eq!(
        next_event(&mut events, |e| matches!(e, BrokerEvent::SessionClosed { .. })).await,
        BrokerEvent::SessionClosed {
            instance_id: "sleepy".into(),
            failed_calls: 3,
        }
    );
    assert!(broker.registry().is_empty());
}

#[tokio::test]
async fn dropped_connection_fails_every_pending_call() {
    let broker = Broker::new(config(), None);
    let mut events = broker.subscribe();
    let (broker_end, mut raw) = duplex(64 * 1024);
    broker.attach(Arc::new(StreamTransport::from_stream("raw", broker_end)));

    let hello = Envelope::Connect(ConnectMessage {
        instance_id: "crashy".into(),
        manifest: Manifest::new("cpp").with_function(FunctionDecl::new("Sleep")),
        ..Default::default()
    });
    write_frame(&mut raw, &hello.to_bytes().unwrap()).await.unwrap();
    let ack = read_frame(&mut raw).await.unwrap().unwrap();
    assert_eq!(Envelope::from_bytes(&ack).unwrap(), Envelope::Ack);

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .gateway()
                    .execute(Target::Auto, "Sleep", Map::new(), None)
                    .await
            })
        })
        .collect();

    let registry = broker.registry().clone();
    wait_until(|| {
        registry
            .get("crashy")
            .is_some_and(|s| s.pending().len() == 3)
    })
    .await;

    // no DISCONNECT frame, the pipe just goes away
    drop(raw);

    for call in calls {
        assert_eq!(
            call.await.unwrap(),
            Err(GatewayError::Disconnected("client disconnected".into()))
        );
    }
    assert_eq!(
        next_event(&mut events, |e| matches!(e, BrokerEvent::SessionClosed { .. })).await,
        BrokerEvent::SessionClosed {
            instance_id: "crashy".into(),
            failed_calls: 3,
        }
    );
    assert!(broker.registry().is_empty());
}

#[tokio::test]
async fn client_initiated_calls_are_routed() {
    let broker = Broker::new(config(), None);
    let _calc = connect(&broker, "calc", None, Some(Calc::declared())).await;
    let caller = connect(&broker, "caller", None, None).await;
    let wait = Duration::from_secs(5);

    assert_eq!(
        caller.call("Add", args(json!({"a": 2, "b": 3})), wait).await.unwrap(),
        json!(5)
    );
    assert_eq!(
        caller.call("Calc.Add", args(json!({"a": 1, "b": 1})), wait).await.unwrap(),
        json!(2)
    );
    match caller.call("Nope", Map::new(), wait).await {
        Err(ClientError::Remote(message)) => assert!(message.contains("Nope")),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn catalog_fills_in_silent_clients() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("Calculator.manifest.json"),
        r#"{"language":"cpp","functions":[{"name":"Add","class":"Calc"}]}"#,
    )
    .unwrap();
    let catalog: Arc<dyn AssetCatalog> = Arc::new(DiskCatalog::load(dir.path()).unwrap());
    let broker = Broker::new(config(), Some(catalog));
    let mut events = broker.subscribe();

    let calc = Calc::silent();
    let _hit = connect(&broker, "calc", Some("Calculator.exe"), Some(calc.clone())).await;
    assert_eq!(
        next_event(&mut events, |e| matches!(e, BrokerEvent::AutoAssociation { .. })).await,
        BrokerEvent::AutoAssociation {
            instance_id: "calc".into(),
            process_tag: "Calculator.exe".into(),
            outcome: AssociationOutcome::Matched { functions: 1 },
        }
    );

    let out = broker
        .gateway()
        .execute(Target::Auto, "Add", args(json!({"a": 2, "b": 3})), None)
        .await;
    assert_eq!(out, Ok(json!(5)));
    assert_eq!(calc.seen(), [("Add".to_string(), Some("Calc".to_string()))]);

    let _miss = connect(&broker, "other", Some("Notepad"), Some(Calc::silent())).await;
    match next_event(&mut events, |e| matches!(e, BrokerEvent::AutoAssociation { .. })).await {
        BrokerEvent::AutoAssociation { outcome, .. } => {
            assert_eq!(outcome, AssociationOutcome::NotFound)
        }
        other => panic!("unexpected {other:?}"),
    }
    let info = broker
        .sessions()
        .into_iter()
        .find(|s| s.instance_id == "other")
        .unwrap();
    assert!(info.functions.is_empty());
    assert!(!info.auto_associated);
}

#[tokio::test]
async fn reconnecting_replaces_the_old_session() {
    let broker = Broker::new(config(), None);
    let mut events = broker.subscribe();
    let first = connect(&broker, "calc", None, Some(Calc::declared())).await;
    let _second = connect(&broker, "calc", None, Some(Calc::declared())).await;

    next_event(&mut events, |e| matches!(e, BrokerEvent::SessionReplaced { .. })).await;
    timeout(Duration::from_secs(3), first.closed()).await.unwrap();
    assert_eq!(broker.registry().len(), 1);

    let out = broker
        .gateway()
        .execute(Target::Instance("calc".into()), "Echo", args(json!({"v": true})), None)
        .await;
    assert_eq!(out, Ok(json!({"v": true})));
}

#[tokio::test]
async fn bad_handshakes_are_rejected_and_serving_continues() {
    let broker = Broker::new(config(), None);
    let mut events = broker.subscribe();
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::Tcp(acceptor.local_addr().unwrap().to_string());
    broker.serve(Box::new(acceptor)).await;

    // EXECUTE before CONNECT
    let rogue = endpoint.connect().await.unwrap();
    rogue
        .send_envelope(&Envelope::execute("r1", "Add", None, Map::new()))
        .await
        .unwrap();
    assert_eq!(rogue.receive_envelope().await.unwrap(), None);
    next_event(&mut events, |e| matches!(e, BrokerEvent::ProtocolViolation { .. })).await;

    // CONNECT without an instance id
    let anonymous = endpoint.connect().await.unwrap();
    anonymous
        .send_envelope(&Envelope::Connect(ConnectMessage::default()))
        .await
        .unwrap();
    assert_eq!(anonymous.receive_envelope().await.unwrap(), None);

    // silent peer hits the handshake timeout
    let silent = endpoint.connect().await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(3), silent.receive_envelope())
            .await
            .unwrap()
            .unwrap(),
        None
    );
    assert!(broker.registry().is_empty());

    let client = RailClient::connect(
        Arc::new(endpoint.connect().await.unwrap()),
        ClientOptions::new("calc"),
        Some(Calc::declared()),
    )
    .await
    .unwrap();
    assert!(client.is_connected());
    assert_eq!(broker.registry().len(), 1);

    broker.shutdown().await;
    timeout(Duration::from_secs(3), client.closed()).await.unwrap();
    assert!(broker.registry().is_empty());
}

/// Hand-rolled client on a raw duplex, for frames a well-behaved client never sends.
async fn raw_session(broker: &Broker, instance: &str) -> tokio::io::DuplexStream {
    let (broker_end, mut raw) = duplex(64 * 1024);
    broker.attach(Arc::new(StreamTransport::from_stream("raw", broker_end)));

    let hello = Envelope::Connect(ConnectMessage {
        instance_id: instance.to_string(),
        ..Default::default()
    });
    write_frame(&mut raw, &hello.to_bytes().unwrap()).await.unwrap();
    let ack = read_frame(&mut raw).await.unwrap().unwrap();
    assert_eq!(Envelope::from_bytes(&ack).unwrap(), Envelope::Ack);
    raw
}

#[tokio::test]
async fn malformed_json_is_logged_but_not_fatal() {
    let broker = Broker::new(config(), None);
    let mut events = broker.subscribe();
    let mut raw = raw_session(&broker, "raw").await;

    write_frame(&mut raw, b"{ not json").await.unwrap();
    write_frame(&mut raw, br#"{"type":"HELLO"}"#).await.unwrap();
    next_event(&mut events, |e| matches!(e, BrokerEvent::ProtocolViolation { .. })).await;
    next_event(&mut events, |e| matches!(e, BrokerEvent::ProtocolViolation { .. })).await;

    assert!(broker.registry().get("raw").is_some_and(|s| s.is_connected()));
}

#[tokio::test]
async fn zero_length_frame_closes_the_connection() {
    let broker = Broker::new(config(), None);
    let mut raw = raw_session(&broker, "raw").await;

    raw.write_all(&0u32.to_le_bytes()).await.unwrap();

    assert!(matches!(read_frame(&mut raw).await, Ok(None)));
    wait_until(|| broker.registry().is_empty()).await;
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let broker = Broker::new(config(), None);
    let mut raw = raw_session(&broker, "raw").await;

    raw.write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes())
        .await
        .unwrap();

    assert!(matches!(read_frame(&mut raw).await, Ok(None)));
    wait_until(|| broker.registry().is_empty()).await;
}

#[tokio::test]
async fn exported_tools_round_trip_through_the_gateway() {
    let broker = Broker::new(config(), None);
    let _client = connect(&broker, "calc", None, Some(Calc::declared())).await;

    let tools = broker.tools();
    let add = tools.iter().find(|t| t.name == "Calc__Add").unwrap();
    assert_eq!(add.parameters["required"], json!(["a", "b"]));

    let text = broker
        .gateway()
        .execute_for_llm(&add.name, args(json!({"a": 20, "b": 22})))
        .await;
    assert_eq!(text, "42");
}

#[cfg(unix)]
#[tokio::test]
async fn serves_a_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::Unix(dir.path().join("railhost.sock"));
    let broker = Broker::new(config(), None);
    broker.serve_endpoint(&endpoint).await.unwrap();

    let _calc = RailClient::connect(
        Arc::new(endpoint.connect().await.unwrap()),
        ClientOptions::new("calc"),
        Some(Calc::declared()),
    )
    .await
    .unwrap();

    let out = broker
        .gateway()
        .execute(Target::Auto, "calc.add", args(json!({"a": 2, "b": 3})), None)
        .await;
    assert_eq!(out, Ok(json!(5)));
    broker.shutdown().await;
}
