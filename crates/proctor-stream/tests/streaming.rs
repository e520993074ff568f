use std::sync::Arc;
use std::time::Duration;

use proctor_protocol::StreamType;
use proctor_relay::config::RelayConfig;
use proctor_relay::{serve, AppState};
use proctor_stream::capture::SurfaceKind;
use proctor_stream::client::SessionRole;
use proctor_stream::mock::{MockCall, MockConnector, MockDevices};
use proctor_stream::{
    start_student, start_teacher, ClientEvent, ClientRuntime, Connectivity, LinkState,
    ReconnectPolicy, StreamConfig,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

struct TestRelay {
    url: String,
    state: Arc<AppState>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay() -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(&RelayConfig::default(), None));
    let (shutdown, signal) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, state.clone(), async move {
        let _ = signal.await;
    }));
    TestRelay {
        url: format!("ws://{addr}/ws"),
        state,
        _shutdown: shutdown,
    }
}

fn config(url: &str) -> StreamConfig {
    StreamConfig {
        signaling_url: url.to_string(),
        stun_urls: Vec::new(),
        negotiation_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            degraded_after: 5,
        },
        heartbeat_interval: Duration::from_secs(1),
    }
}

async fn registered<S: SessionRole>(runtime: &mut ClientRuntime<S>) {
    loop {
        let event = timeout(Duration::from_secs(5), runtime.events.recv())
            .await
            .expect("timed out waiting for registration")
            .expect("event channel closed");
        match event {
            ClientEvent::Registered { .. } => return,
            ClientEvent::RegistrationRejected { reason } => panic!("registration rejected: {reason}"),
            _ => continue,
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn teacher_watches_student_webcam_through_the_relay() {
    let relay = start_relay().await;
    let teacher_connector = Arc::new(MockConnector::auto_connect());
    let student_connector = Arc::new(MockConnector::auto_connect());
    let devices = Arc::new(MockDevices::new());

    let mut teacher = start_teacher(&config(&relay.url), "teacher-1", 11, teacher_connector.clone());
    let mut student = start_student(
        &config(&relay.url),
        "student-1",
        11,
        student_connector.clone(),
        devices.clone(),
    );
    registered(&mut teacher).await;
    registered(&mut student).await;

    let viewer = teacher
        .session
        .request_stream("student-1", StreamType::Webcam)
        .unwrap();
    let state = timeout(
        Duration::from_secs(5),
        viewer.wait_for(|state| state == LinkState::Connected || state.is_terminal()),
    )
    .await
    .unwrap();
    assert_eq!(state, LinkState::Connected);

    eventually(|| student.session.link_state("teacher-1") == Some(LinkState::Connected)).await;
    let teacher_calls = teacher_connector.last().unwrap().calls();
    assert_eq!(teacher_calls[0], MockCall::PrepareReceiveOnly);
    assert!(teacher_calls.contains(&MockCall::CreateAnswer));
    assert!(student_connector
        .last()
        .unwrap()
        .calls()
        .contains(&MockCall::CreateOffer));

    teacher.session.stop_viewing_stream("student-1").unwrap();
    eventually(|| student.session.link_state("teacher-1").is_none()).await;
    eventually(|| devices.created().iter().all(|track| track.stop_count() == 1)).await;

    teacher.shutdown().await;
    student.shutdown().await;
}

#[tokio::test]
async fn window_share_is_rejected_before_any_offer() {
    let relay = start_relay().await;
    let teacher_connector = Arc::new(MockConnector::auto_connect());
    let devices = Arc::new(MockDevices::new());
    devices.set_display_surface(Some(SurfaceKind::Window));

    let mut teacher_config = config(&relay.url);
    teacher_config.negotiation_timeout = Duration::from_millis(300);
    let mut teacher = start_teacher(&teacher_config, "teacher-1", 12, teacher_connector.clone());
    let mut student = start_student(
        &config(&relay.url),
        "student-1",
        12,
        Arc::new(MockConnector::auto_connect()),
        devices.clone(),
    );
    registered(&mut teacher).await;
    registered(&mut student).await;

    let viewer = teacher
        .session
        .request_stream("student-1", StreamType::Screen)
        .unwrap();

    let reason = loop {
        match timeout(Duration::from_secs(5), student.events.recv()).await.unwrap() {
            Some(ClientEvent::CaptureFailed { reason, .. }) => break reason,
            Some(_) => continue,
            None => panic!("student events closed"),
        }
    };
    assert_eq!(reason, "not entire screen");

    let state = timeout(Duration::from_secs(5), viewer.wait_for(|state| state.is_terminal()))
        .await
        .unwrap();
    assert_eq!(state, LinkState::Failed);
    assert_eq!(viewer.last_error().as_deref(), Some("negotiation timed out"));
    assert!(!teacher_connector
        .last()
        .unwrap()
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::ApplyRemote(_))));
    assert!(devices.created().iter().all(|track| track.stop_count() == 1));

    teacher.shutdown().await;
    student.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_closes_links_and_re_registers() {
    let relay = start_relay().await;
    let devices = Arc::new(MockDevices::new());
    let mut teacher = start_teacher(
        &config(&relay.url),
        "teacher-1",
        13,
        Arc::new(MockConnector::new()),
    );
    let mut student = start_student(
        &config(&relay.url),
        "student-1",
        13,
        Arc::new(MockConnector::new()),
        devices,
    );
    registered(&mut teacher).await;
    registered(&mut student).await;

    let viewer = teacher
        .session
        .request_stream("student-1", StreamType::Webcam)
        .unwrap();
    eventually(|| student.session.link_state("teacher-1") == Some(LinkState::Negotiating)).await;

    let closed = relay
        .state
        .directory()
        .force_close_idle(u64::MAX, Duration::ZERO);
    assert_eq!(closed, 2);

    registered(&mut teacher).await;
    registered(&mut student).await;
    assert_eq!(viewer.state(), LinkState::Closed);
    assert!(teacher.session.links().is_empty());
    assert!(student.session.links().is_empty());
    assert_eq!(teacher.signaling.status(), Connectivity::Connected);
    eventually(|| relay.state.directory().len() == 2).await;

    teacher.shutdown().await;
    student.shutdown().await;
}
