mod common;

use common::{eventually, restricted, Harness, PlatformCall, TestClient};
use std::time::Duration;
use tunhost_config::Preferences;
use tunhost_core::{
    ClientToService, IntentAction, ServiceToClient, TunnelState, EXTRA_HOME_PAGES, EXTRA_REGION,
    REGION_CODE_ANY,
};
use tunhost_service::{NotificationId, StartCommand};

fn is_waiting_for_app(state: &TunnelState) -> bool {
    state.connection_data().is_some_and(|d| d.waiting_for_app)
}

#[tokio::test]
async fn test_routing_waits_for_reachable_client() {
    let harness = Harness::new(Preferences::default(), restricted(), false).await;
    let mut widget = TestClient::register(&harness.service, false);

    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    let host = harness.engine.host();
    host.on_homepage("https://home.example/");
    host.on_connected();

    // Nobody answers: the service waits behind the open-app notification.
    harness.wait_state("waiting for app", is_waiting_for_app).await;
    eventually("open app notification", || {
        harness.platform.notifications(NotificationId::OpenApp) == 1
    })
    .await;
    assert_eq!(harness.engine.count("begin_routing"), 0);
    assert!(widget.drain().iter().all(|m| *m != ServiceToClient::Ping));

    // An activity shows up and proves it is alive.
    let mut activity = TestClient::register(&harness.service, true);
    activity
        .recv_matching("ping", |m| *m == ServiceToClient::Ping)
        .await;
    assert_eq!(harness.engine.count("begin_routing"), 0);
    activity.send(ClientToService::Pong);

    let handshake = activity
        .recv_matching("handshake", |m| matches!(m, ServiceToClient::Intent(_)))
        .await;
    match handshake {
        ServiceToClient::Intent(intent) => {
            assert_eq!(intent.action, IntentAction::Handshake);
            assert_eq!(
                intent.extras.get_string_list(EXTRA_HOME_PAGES).unwrap(),
                vec!["https://home.example/".to_string()]
            );
        }
        _ => unreachable!(),
    }

    let state = harness.wait_state("routed", |s| !is_waiting_for_app(s)).await;
    assert!(state.connection_data().unwrap().is_connected());
    eventually("routing", || harness.engine.count("begin_routing") == 1).await;
    assert_eq!(harness.platform.count(&PlatformCall::Cancel(NotificationId::OpenApp)), 1);
}

#[tokio::test]
async fn test_pong_within_deadline_routes_without_notification() {
    let harness = Harness::new(Preferences::default(), restricted(), false).await;
    let mut activity = TestClient::register(&harness.service, true);

    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    harness.engine.host().on_connected();

    activity
        .recv_matching("ping", |m| *m == ServiceToClient::Ping)
        .await;
    activity.send(ClientToService::Pong);

    eventually("routing", || harness.engine.count("begin_routing") == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.platform.notifications(NotificationId::OpenApp), 0);
    assert!(!is_waiting_for_app(&harness.service.state()));

    // No home pages, no handshake.
    assert!(activity
        .drain()
        .iter()
        .all(|m| !matches!(m, ServiceToClient::Intent(_))));
}

#[tokio::test]
async fn test_pong_from_non_activity_does_not_route() {
    let harness = Harness::new(Preferences::default(), restricted(), false).await;
    let widget = TestClient::register(&harness.service, false);

    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    harness.engine.host().on_connected();
    widget.send(ClientToService::Pong);

    harness.wait_state("waiting for app", is_waiting_for_app).await;
    assert_eq!(harness.engine.count("begin_routing"), 0);
}

#[tokio::test]
async fn test_stop_cancels_routing_wait() {
    let harness = Harness::new(Preferences::default(), restricted(), false).await;
    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    harness.engine.host().on_connected();
    harness.wait_state("waiting for app", is_waiting_for_app).await;

    harness.service.on_start_command(StartCommand::Stop);
    harness.wait_stopped().await;

    // A late activity gets no ping and routing never starts.
    let mut activity = TestClient::register(&harness.service, true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(activity.drain().iter().all(|m| *m != ServiceToClient::Ping));
    assert_eq!(harness.engine.count("begin_routing"), 0);
    assert_eq!(harness.platform.count(&PlatformCall::Cancel(NotificationId::OpenApp)), 1);
}

#[tokio::test]
async fn test_unavailable_region_resets_selection_once() {
    let prefs = Preferences {
        egress_region: "DE".into(),
        ..Preferences::default()
    };
    let harness = Harness::new(prefs, restricted(), false).await;
    let mut client = TestClient::register(&harness.service, false);

    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    let host = harness.engine.host();
    host.on_available_egress_regions(vec!["US".into(), "FR".into()]);
    host.on_available_egress_regions(vec!["US".into(), "FR".into()]);

    harness.wait_stopped().await;
    assert_eq!(harness.store.egress_region(), REGION_CODE_ANY);
    assert_eq!(harness.store.known_regions(), vec!["US".to_string(), "FR".to_string()]);
    client
        .recv_matching("regions", |m| *m == ServiceToClient::KnownServerRegions)
        .await;

    // No activity answered, so the user is told through a notification.
    eventually("region notification", || {
        harness.platform.notifications(NotificationId::RegionNotAvailable) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.platform.notifications(NotificationId::RegionNotAvailable), 1);
}

#[tokio::test]
async fn test_unavailable_region_goes_to_reachable_activity() {
    let prefs = Preferences {
        egress_region: "DE".into(),
        ..Preferences::default()
    };
    let harness = Harness::new(prefs, restricted(), false).await;
    let mut activity = TestClient::register(&harness.service, true);

    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    harness
        .engine
        .host()
        .on_available_egress_regions(vec!["US".into()]);

    activity
        .recv_matching("ping", |m| *m == ServiceToClient::Ping)
        .await;
    activity.send(ClientToService::Pong);
    let intent = activity
        .recv_matching("region intent", |m| matches!(m, ServiceToClient::Intent(_)))
        .await;
    match intent {
        ServiceToClient::Intent(intent) => {
            assert_eq!(intent.action, IntentAction::SelectedRegionNotAvailable);
            assert_eq!(intent.extras.get_string(EXTRA_REGION).unwrap(), "DE");
        }
        _ => unreachable!(),
    }

    harness.wait_stopped().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.platform.notifications(NotificationId::RegionNotAvailable), 0);
}

#[tokio::test]
async fn test_available_selected_region_keeps_running() {
    let prefs = Preferences {
        egress_region: "FR".into(),
        ..Preferences::default()
    };
    let harness = Harness::new(prefs, restricted(), false).await;
    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;

    harness
        .engine
        .host()
        .on_available_egress_regions(vec!["US".into(), "FR".into()]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.service.state().is_running());
    assert_eq!(harness.store.egress_region(), "FR");
}

#[tokio::test]
async fn test_unavailable_region_is_handled_again_in_next_run() {
    let prefs = Preferences {
        egress_region: "DE".into(),
        ..Preferences::default()
    };
    let harness = Harness::new(prefs, restricted(), false).await;

    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    let host = harness.engine.host();
    host.on_available_egress_regions(vec!["US".into(), "FR".into()]);
    harness.wait_stopped().await;
    assert_eq!(harness.store.egress_region(), REGION_CODE_ANY);

    // The user picks the same region and it is still gone.
    harness.store.set_egress_region("DE").unwrap();
    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    host.on_available_egress_regions(vec!["US".into(), "FR".into()]);

    harness.wait_stopped().await;
    assert_eq!(harness.store.egress_region(), REGION_CODE_ANY);
    eventually("second region notification", || {
        harness.platform.notifications(NotificationId::RegionNotAvailable) == 2
    })
    .await;
}

#[tokio::test]
async fn test_quiet_restart_cancels_routing_wait() {
    let harness = Harness::new(Preferences::default(), restricted(), false).await;
    harness.service.on_start_command(StartCommand::Start);
    harness.wait_running().await;
    let host = harness.engine.host();
    host.on_connected();
    harness.wait_state("waiting for app", is_waiting_for_app).await;
    eventually("open app notification", || {
        harness.platform.notifications(NotificationId::OpenApp) == 1
    })
    .await;

    // A companion change republishes the config with a quiet restart.
    assert!(harness.config.update_companion_state_conditional(true, false));
    let state = harness.wait_state("wait cancelled", |s| !is_waiting_for_app(s)).await;
    assert!(state.is_running());
    assert_eq!(harness.platform.count(&PlatformCall::Cancel(NotificationId::OpenApp)), 1);
    eventually("engine restart", || harness.engine.count("restart") == 1).await;

    // An activity answering while the engine reconnects does not start routing.
    let mut activity = TestClient::register(&harness.service, true);
    activity.send(ClientToService::Pong);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.engine.count("begin_routing"), 0);
    assert!(activity.drain().iter().all(|m| *m != ServiceToClient::Ping));

    // The reconnect asks for a reachable client again.
    host.on_connected();
    activity
        .recv_matching("ping", |m| *m == ServiceToClient::Ping)
        .await;
    activity.send(ClientToService::Pong);
    eventually("routing", || harness.engine.count("begin_routing") == 1).await;
}
