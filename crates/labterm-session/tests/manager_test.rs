#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Session lifecycle, command dispatch, and link monitoring through the
//! `ConsoleManager` facade.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use labterm_session::config::ConsoleConfig;
use labterm_session::error::ConsoleError;
use labterm_session::event::{ConsoleEventKind, InMemoryEventSink};
use labterm_session::manager::ConsoleManager;
use labterm_session::mock::{MockCall, MockConsoleBackend};
use labterm_session::quality::ProbeReading;
use labterm_session::types::{
    ConnectionState, ConsoleInfo, LogPayload, ProbeResult, QualityTier, SendOutcome,
};

fn config() -> ConsoleConfig {
    let mut cfg = ConsoleConfig::default();
    cfg.polling.initial_jitter_max_ms = 0;
    cfg
}

fn setup(
    mock: MockConsoleBackend,
) -> (ConsoleManager, Arc<MockConsoleBackend>, Arc<InMemoryEventSink>) {
    let mock = Arc::new(mock);
    let sink = Arc::new(InMemoryEventSink::new());
    let manager = ConsoleManager::new(mock.clone(), config(), sink.clone());
    (manager, mock, sink)
}

fn server_error() -> ConsoleError {
    ConsoleError::Request {
        status: 500,
        message: "internal".into(),
    }
}

// ── open / close ──

#[tokio::test(start_paused = true)]
async fn open_reaches_open_state_and_emits_once() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    assert_eq!(manager.state(), ConnectionState::Idle);

    let session = manager.open("lab-1", "r1", None).await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Open);
    assert_eq!(session.node_id, "r1");
    assert_eq!(session.console_id, "con-r1");
    assert_eq!(manager.session().unwrap().session_id, session.session_id);
    assert_eq!(sink.count_of("session_opened"), 1);
    // The open gate probe ran before the create call.
    let calls = mock.calls();
    let probe_at = calls.iter().position(|c| *c == MockCall::Probe).unwrap();
    let create_at = calls
        .iter()
        .position(|c| matches!(c, MockCall::CreateSession { .. }))
        .unwrap();
    assert!(probe_at < create_at);
    assert_eq!(manager.quality().unwrap().tier, QualityTier::Excellent);
}

#[tokio::test(start_paused = true)]
async fn switching_nodes_closes_previous_before_opening_next() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    let first = manager.open("lab-1", "r1", None).await.unwrap();

    let second = manager.open("lab-1", "r2", None).await.unwrap();

    let lifecycle: Vec<MockCall> = mock
        .calls()
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                MockCall::CreateSession { .. } | MockCall::CloseSession { .. }
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            MockCall::CreateSession {
                lab_id: "lab-1".into(),
                node_id: "r1".into(),
                console_type: None,
            },
            MockCall::CloseSession {
                session_id: first.session_id.clone(),
            },
            MockCall::CreateSession {
                lab_id: "lab-1".into(),
                node_id: "r2".into(),
                console_type: None,
            },
        ]
    );
    assert_eq!(manager.session().unwrap().session_id, second.session_id);

    let closed: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind.name() == "session_closed")
        .collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].session_id.as_deref(), Some(first.session_id.as_str()));
    assert_eq!(
        closed[0].kind.to_string(),
        "session closed: node switch"
    );
}

#[tokio::test(start_paused = true)]
async fn reopening_same_node_replaces_session() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();
    manager.open("lab-1", "r1", None).await.unwrap();

    assert_eq!(mock.closed_sessions(), vec!["sess-1"]);
    assert_eq!(mock.create_count(), 2);
    assert_eq!(sink.count_of("session_opened"), 2);
}

#[tokio::test(start_paused = true)]
async fn close_stops_polling_and_releases_remote_session() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    let closed = manager.close("user closed panel").await.unwrap();
    let fetches = mock.fetch_count();
    sleep(Duration::from_secs(120)).await;

    assert_eq!(closed.session_id, "sess-1");
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(manager.session().is_none());
    assert_eq!(mock.closed_sessions(), vec!["sess-1"]);
    assert_eq!(mock.fetch_count(), fetches);
    assert_eq!(sink.count_of("session_closed"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_remote_close_still_closes_locally() {
    let (manager, _mock, sink) = setup(MockConsoleBackend::new().with_close_error(server_error()));
    manager.open("lab-1", "r1", None).await.unwrap();

    assert!(manager.close("user").await.is_some());
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(sink.count_of("session_closed"), 1);
}

#[tokio::test(start_paused = true)]
async fn close_with_nothing_open_still_reports_reason() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    assert!(manager.close("user").await.is_none());
    assert!(mock.closed_sessions().is_empty());
    assert_eq!(manager.state(), ConnectionState::Idle);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].node_id, None);
    assert_eq!(events[0].session_id, None);
    assert_eq!(
        events[0].kind,
        ConsoleEventKind::SessionClosed {
            reason: "user".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_refuses_open_without_create() {
    let mock = MockConsoleBackend::new();
    mock.set_reachable(false);
    let (manager, mock, sink) = setup(mock);

    let err = manager.open("lab-1", "r1", None).await.unwrap_err();

    assert!(matches!(err, ConsoleError::Unreachable { .. }));
    assert_eq!(mock.create_count(), 0);
    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(sink.count_of("session_failed"), 1);
}

#[tokio::test(start_paused = true)]
async fn create_failure_lands_in_error_and_allows_retry() {
    let (manager, _mock, sink) = setup(
        MockConsoleBackend::new().with_create_error(ConsoleError::Request {
            status: 503,
            message: "node busy".into(),
        }),
    );

    let err = manager.open("lab-1", "r1", None).await.unwrap_err();
    assert!(matches!(err, ConsoleError::CreateFailed { ref node_id, .. } if node_id == "r1"));
    assert_eq!(manager.state(), ConnectionState::Error);
    assert!(manager.session().is_none());
    assert_eq!(sink.count_of("session_failed"), 1);

    manager.open("lab-1", "r1", None).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_on_create_is_surfaced_as_is() {
    let (manager, _mock, _sink) = setup(MockConsoleBackend::new().with_create_error(
        ConsoleError::AuthExpired {
            message: "token expired".into(),
        },
    ));
    let err = manager.open("lab-1", "r1", None).await.unwrap_err();
    assert!(matches!(err, ConsoleError::AuthExpired { .. }));
}

#[tokio::test(start_paused = true)]
async fn auth_failure_on_open_health_check_is_surfaced_without_create() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    mock.push_probe(Err(ConsoleError::AuthExpired {
        message: "token expired".into(),
    }));

    let err = manager.open("lab-1", "r1", None).await.unwrap_err();

    assert_eq!(
        err,
        ConsoleError::AuthExpired {
            message: "token expired".into()
        }
    );
    assert_eq!(mock.create_count(), 0);
    assert_eq!(sink.count_of("session_failed"), 1);
}

#[tokio::test(start_paused = true)]
async fn console_is_looked_up_when_create_omits_it() {
    let consoles = vec![
        ConsoleInfo {
            id: "aux-0".into(),
            console_type: Some("aux".into()),
            protocol: Some("telnet".into()),
        },
        ConsoleInfo {
            id: "serial-0".into(),
            console_type: Some("serial".into()),
            protocol: Some("telnet".into()),
        },
    ];
    let (manager, _mock, _sink) = setup(
        MockConsoleBackend::new()
            .without_console_on_create()
            .with_consoles("r1", consoles),
    );

    let session = manager.open("lab-1", "r1", Some("serial")).await.unwrap();
    assert_eq!(session.console_id, "serial-0");
    assert_eq!(session.console_type.as_deref(), Some("serial"));
}

#[tokio::test(start_paused = true)]
async fn node_without_consoles_fails_and_releases_session() {
    let (manager, mock, _sink) = setup(
        MockConsoleBackend::new()
            .without_console_on_create()
            .with_consoles("r1", Vec::new()),
    );

    let err = manager.open("lab-1", "r1", None).await.unwrap_err();
    assert!(matches!(err, ConsoleError::CreateFailed { .. }));
    assert_eq!(mock.closed_sessions(), vec!["sess-1"]);
    assert_eq!(manager.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn blank_node_id_is_rejected() {
    let (manager, mock, _sink) = setup(MockConsoleBackend::new());
    let err = manager.open("lab-1", "  ", None).await.unwrap_err();
    assert!(matches!(err, ConsoleError::InvalidArgument { .. }));
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_manager_tears_session_down() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();
    drop(manager);

    sleep(Duration::from_millis(10)).await;
    let fetches = mock.fetch_count();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(mock.closed_sessions(), vec!["sess-1"]);
    assert_eq!(mock.fetch_count(), fetches);
    assert_eq!(sink.count_of("session_closed"), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_tears_down_locally_and_publishes_state() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    let mut states = manager.subscribe_state();
    manager.open("lab-1", "r1", None).await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Open);

    manager.shutdown("interrupted");

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);
    assert!(manager.session().is_none());
    assert!(manager.polling().is_none());

    // The remote close runs in the background.
    sleep(Duration::from_millis(10)).await;
    assert_eq!(mock.closed_sessions(), vec!["sess-1"]);
    let closed: Vec<ConsoleEventKind> = sink
        .events()
        .into_iter()
        .map(|event| event.kind)
        .filter(|kind| kind.name() == "session_closed")
        .collect();
    assert_eq!(
        closed,
        vec![ConsoleEventKind::SessionClosed {
            reason: "interrupted".into()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_create_releases_the_new_session() {
    let (manager, mock, sink) =
        setup(MockConsoleBackend::new().with_create_delay(Duration::from_secs(1)));

    let (opened, ()) = tokio::join!(manager.open("lab-1", "r1", None), async {
        sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.shutdown("interrupted");
    });

    assert!(matches!(opened, Err(ConsoleError::Cancelled { .. })));
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(manager.session().is_none());
    assert!(manager.polling().is_none());
    assert_eq!(mock.create_count(), 1);
    assert_eq!(mock.closed_sessions(), vec!["sess-1"]);
    assert_eq!(sink.count_of("session_failed"), 1);
    assert_eq!(sink.count_of("session_opened"), 0);

    // Nothing keeps polling the abandoned console.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.fetch_count(), 0);
}

// ── dispatch ──

#[tokio::test(start_paused = true)]
async fn command_while_closed_is_queued_not_sent() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());

    let outcome = manager.send("show ip interface brief").await.unwrap();

    assert!(matches!(outcome, SendOutcome::Queued { position: 1, .. }));
    assert_eq!(manager.pending_commands().len(), 1);
    assert_eq!(manager.pending_commands()[0].text, "show ip interface brief");
    assert!(mock.sent_commands().is_empty());
    assert_eq!(sink.count_of("command_queued"), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_commands_flush_in_order_before_new_input() {
    let (manager, mock, _sink) = setup(MockConsoleBackend::new());
    for cmd in ["c1", "c2", "c3"] {
        manager.send(cmd).await.unwrap();
    }
    let manager = Arc::new(manager);

    let typing = manager.clone();
    let (opened, typed) = tokio::join!(manager.open("lab-1", "r1", None), async move {
        tokio::task::yield_now().await;
        typing.send("c4").await
    });
    opened.unwrap();
    typed.unwrap();

    assert_eq!(mock.sent_commands(), vec!["c1", "c2", "c3", "c4"]);
    assert!(manager.pending_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn open_send_echoes_command_and_surfaces_output() {
    let (manager, mock, sink) = setup(
        MockConsoleBackend::new()
            .with_command_output("show clock", LogPayload::Blob("*10:00:01.123 UTC\n".into())),
    );
    manager.open("lab-1", "r1", None).await.unwrap();

    let outcome = manager.send("show clock").await.unwrap();
    assert_eq!(outcome, SendOutcome::Accepted);
    assert_eq!(manager.log_lines(), vec!["> show clock"]);
    assert_eq!(sink.count_of("command_sent"), 1);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        manager.log_lines(),
        vec!["> show clock", "*10:00:01.123 UTC"]
    );
    assert_eq!(mock.sent_commands(), vec!["show clock"]);
}

#[tokio::test(start_paused = true)]
async fn repeated_command_echoes_are_not_deduplicated() {
    let (manager, _mock, _sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();

    manager.send("show version").await.unwrap();
    manager.send("show version").await.unwrap();

    assert_eq!(manager.log_lines(), vec!["> show version", "> show version"]);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_keeps_remaining_commands_in_order() {
    let (manager, mock, _sink) = setup(MockConsoleBackend::new());
    for cmd in ["c1", "c2", "c3"] {
        manager.send(cmd).await.unwrap();
    }
    mock.fail_next_send(server_error());

    manager.open("lab-1", "r1", None).await.unwrap();
    let pending: Vec<String> = manager
        .pending_commands()
        .into_iter()
        .map(|p| p.text)
        .collect();
    assert_eq!(pending, vec!["c1", "c2", "c3"]);

    // The next command drains the backlog first.
    assert_eq!(manager.send("c4").await.unwrap(), SendOutcome::Accepted);
    assert_eq!(mock.sent_commands(), vec!["c1", "c1", "c2", "c3", "c4"]);
    assert!(manager.pending_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_failure_while_open_is_returned() {
    let (manager, mock, _sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();
    mock.fail_next_send(server_error());

    let err = manager.send("reload").await.unwrap_err();
    assert!(matches!(err, ConsoleError::Request { status: 500, .. }));
    assert!(manager.log_lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_command_is_rejected() {
    let (manager, _mock, _sink) = setup(MockConsoleBackend::new());
    let err = manager.send("   ").await.unwrap_err();
    assert!(matches!(err, ConsoleError::InvalidArgument { .. }));
    assert!(manager.pending_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_queue_drops_pending_commands() {
    let (manager, _mock, _sink) = setup(MockConsoleBackend::new());
    manager.send("a").await.unwrap();
    manager.send("b").await.unwrap();
    assert_eq!(manager.clear_queue(), 2);
    assert!(manager.pending_commands().is_empty());
}

// ── link quality ──

#[tokio::test(start_paused = true)]
async fn probe_failure_degrades_and_success_recovers_once() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();

    mock.set_reachable(false);
    assert!(matches!(manager.probe_now().await, ProbeReading::Unreachable(_)));
    assert_eq!(manager.state(), ConnectionState::Error);
    manager.probe_now().await;
    assert_eq!(sink.count_of("link_degraded"), 1);
    // Degraded is not closed.
    assert!(manager.session().is_some());

    mock.set_reachable(true);
    assert!(matches!(manager.probe_now().await, ProbeReading::Reachable(_)));
    assert_eq!(manager.state(), ConnectionState::Open);
    manager.probe_now().await;
    assert_eq!(sink.count_of("link_recovered"), 1);
}

#[tokio::test(start_paused = true)]
async fn periodic_probe_drives_degrade_and_recover() {
    let (manager, mock, sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();
    let probes_at_open = mock.probe_count();

    mock.set_reachable(false);
    sleep(Duration::from_secs(31)).await;
    assert_eq!(mock.probe_count(), probes_at_open + 1);
    assert_eq!(manager.state(), ConnectionState::Error);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(sink.count_of("link_degraded"), 1);

    mock.set_probe_fallback(Ok(ProbeResult {
        reachable: true,
        latency: Duration::from_millis(250),
    }));
    sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.state(), ConnectionState::Open);
    assert_eq!(sink.count_of("link_recovered"), 1);
    assert_eq!(manager.quality().unwrap().tier, QualityTier::Good);
}

#[tokio::test(start_paused = true)]
async fn degraded_session_pauses_polling() {
    let (manager, mock, _sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    mock.set_reachable(false);
    manager.probe_now().await;
    let fetches = mock.fetch_count();
    sleep(Duration::from_secs(20)).await;
    assert_eq!(mock.fetch_count(), fetches);

    mock.set_reachable(true);
    manager.probe_now().await;
    sleep(Duration::from_secs(5)).await;
    assert!(mock.fetch_count() > fetches);
}

#[tokio::test(start_paused = true)]
async fn commands_typed_while_degraded_flush_on_recovery() {
    let (manager, mock, _sink) = setup(MockConsoleBackend::new());
    manager.open("lab-1", "r1", None).await.unwrap();

    mock.set_reachable(false);
    manager.probe_now().await;
    let outcome = manager.send("show interfaces").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Queued { .. }));
    assert!(mock.sent_commands().is_empty());

    mock.set_reachable(true);
    manager.probe_now().await;
    assert_eq!(mock.sent_commands(), vec!["show interfaces"]);
}

#[tokio::test(start_paused = true)]
async fn probe_with_nothing_open_changes_nothing() {
    let (manager, _mock, sink) = setup(MockConsoleBackend::new());
    let reading = manager.probe_now().await;
    assert!(matches!(reading, ProbeReading::Reachable(_)));
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert_eq!(sink.count(), 0);
}
