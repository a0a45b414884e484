//! Integration tests for the connection controller.
//!
//! Drives `ConnectionController` and `SessionActor` against the in-memory
//! collaborators of `ikemob_integration_tests`, covering setup and teardown,
//! NAT detection, socket switching, mobility and user-directed migration.

use ikemob_core::{
    ConnectionCallback, ConnectionController, ConnectionError, ControllerEvent, ControllerState,
    EncapType, EventSink, IpVersion, KeepaliveDelay, LinkProperties, MigrationError, Nat64Prefix,
    NatStatus, NetworkCapabilities, NetworkEvent, NetworkRequest, NetworkType, SessionActor,
    StaticDeviceConfig,
    keepalive::{CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS, CONFIG_USE_CACHED_ADDRS},
};
use ikemob_integration_tests::{
    CELL_V4, CELL_V6, FakeRecord, Harness, NET_CELL, NET_WIFI, SERVER_V4, SERVER_V6,
    SubscriptionKind, WIFI_V4, WIFI_V6, cell_link, ike_packet, link, params, params_v4, pump,
    wifi_link,
};
use ikemob_transport::{IkeSocket, IpFamily, SocketVariant};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

fn ip(addr: impl Into<IpAddr>) -> IpAddr {
    addr.into()
}

fn variant(controller: &ConnectionController) -> SocketVariant {
    controller.socket().expect("no active socket").variant()
}

/// Active v6 session on Wi-Fi with mobility enabled (on the port-4500 IPv6 socket)
fn mobile_session(h: &Harness) -> (ConnectionController, std::sync::mpsc::Receiver<ControllerEvent>) {
    let (mut controller, events) = h.active_controller(params());
    controller.enable_mobility().unwrap();
    assert_eq!(variant(&controller), SocketVariant::Udp6WithEncapPort);
    (controller, events)
}

// ============================================================================
// Setup
// ============================================================================

/// Test default setup prefers IPv6 when both families are connectable.
#[test]
fn test_set_up_selects_ipv6_by_default() {
    let h = Harness::new();
    let (controller, _events) = h.active_controller(params());

    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(controller.network(), NET_WIFI);
    assert_eq!(controller.remote_address(), Some(ip(SERVER_V6)));
    assert_eq!(controller.local_address(), Some(ip(WIFI_V6)));
    assert_eq!(variant(&controller), SocketVariant::Udp6);
    assert_eq!(controller.remote_port(), Some(500));
    assert!(!controller.uses_udp_encap_socket());
    assert_eq!(controller.network_type(), NetworkType::Wifi);
    assert_eq!(h.network.subscriptions(), vec![SubscriptionKind::Default]);
    assert_eq!(h.local.remote_ports(), vec![500]);
}

/// Test automatic address family selection picks IPv4 on Wi-Fi.
#[test]
fn test_set_up_prefers_ipv4_on_wifi_with_auto_selection() {
    let h = Harness::new();
    let mut params = params();
    params.options.automatic_address_family_selection = true;
    let (controller, _events) = h.active_controller(params);

    assert_eq!(controller.remote_address(), Some(ip(SERVER_V4)));
    assert_eq!(controller.local_address(), Some(ip(WIFI_V4)));
    assert_eq!(variant(&controller), SocketVariant::Udp4);
}

/// Test an IPv4-only link selects IPv4 even without a preference.
#[test]
fn test_set_up_ipv4_only_link_selects_ipv4() {
    let h = Harness::new();
    h.network.add_network(
        NET_WIFI,
        link("wlan0", &[ip(WIFI_V4)]),
        NetworkCapabilities::wifi(),
    );
    let server: IpAddr = "1.2.3.4".parse().unwrap();
    h.network.set_dns(NET_WIFI, &[server]);

    let (controller, _events) = h.active_controller(params());

    assert_eq!(controller.remote_address(), Some(server));
    assert_eq!(variant(&controller).family(), IpFamily::V4);
}

/// Test the encapsulation type pins the IP version.
#[test]
fn test_set_up_encap_type_adjusts_ip_version() {
    let h = Harness::new();
    let mut udp = params();
    udp.encap_type = EncapType::Udp;
    let (controller, _events) = h.active_controller(udp);
    assert_eq!(controller.ip_version(), IpVersion::V4);
    assert_eq!(controller.remote_address(), Some(ip(SERVER_V4)));

    let h = Harness::new();
    let mut none = params();
    none.encap_type = EncapType::None;
    none.options.automatic_address_family_selection = true;
    let (controller, _events) = h.active_controller(none);
    assert_eq!(controller.ip_version(), IpVersion::V6);
    assert_eq!(controller.remote_address(), Some(ip(SERVER_V6)));
}

/// Test forcing port 4500 on IPv4 starts the keepalive at setup.
#[test]
fn test_set_up_force_port_4500() {
    let h = Harness::new();
    let mut params = params_v4();
    params.options.force_port_4500 = true;
    let (controller, _events) = h.active_controller(params);

    assert_eq!(variant(&controller), SocketVariant::Udp4Encap);
    assert!(controller.uses_udp_encap_socket());
    assert_eq!(controller.remote_port(), Some(4500));
    assert!(controller.is_keepalive_running());
    assert_eq!(h.local.remote_ports(), vec![4500]);
}

/// Test a caller-pinned network gets the specific watcher and bound sockets.
#[test]
fn test_set_up_with_configured_network() {
    let h = Harness::new();
    let mut params = params();
    params.configured_network = Some(NET_CELL);
    params.dscp = 46;
    let (controller, _events) = h.active_controller(params);

    assert_eq!(controller.network(), NET_CELL);
    assert_eq!(controller.local_address(), Some(ip(CELL_V6)));
    assert_eq!(controller.dscp(), 46);
    assert_eq!(controller.network_type(), NetworkType::Cellular);
    assert_eq!(
        h.network.subscriptions(),
        vec![SubscriptionKind::Specific(NetworkRequest::wildcard())]
    );

    let request = &h.sockets.requests()[0];
    assert_eq!(request.network, NET_CELL);
    assert_eq!(request.interface.as_deref(), Some("rmnet0"));
    assert_eq!(request.dscp, 46);
}

/// Test construction fails without any network to bind to.
#[test]
fn test_new_without_network_fails() {
    let h = Harness::new();
    h.network.set_active(None);

    let result = ConnectionController::new(
        params(),
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
        EventSink::discard(),
    );
    assert!(matches!(result, Err(ConnectionError::SetupFailed(_))));
}

/// Test construction rejects invalid parameters.
#[test]
fn test_new_with_invalid_params_fails() {
    let h = Harness::new();
    let mut params = params();
    params.dscp = 64;

    let result = ConnectionController::new(
        params,
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
        EventSink::discard(),
    );
    assert!(matches!(result, Err(ConnectionError::SetupFailed(_))));
}

/// Test missing link properties fail setup without side effects.
#[test]
fn test_set_up_missing_link_properties() {
    let h = Harness::new();
    let mut params = params();
    params.configured_network = Some(NET_CELL);
    h.network.remove_network(NET_CELL);
    let (mut controller, _events) = h.controller(params);

    let err = controller.set_up().unwrap_err();

    assert!(matches!(err, ConnectionError::SetupFailed(_)));
    assert_eq!(controller.state(), ControllerState::TornDown);
    assert!(h.sockets.requests().is_empty());
    assert!(h.network.subscriptions().is_empty());
}

/// Test DNS is retried up to three times.
#[test]
fn test_set_up_dns_retries() {
    let h = Harness::new();
    h.network.fail_dns(2);
    let (controller, _events) = h.active_controller(params());
    assert_eq!(h.network.dns_calls().len(), 3);
    assert_eq!(controller.remote_ipv4_addresses(), vec![SERVER_V4]);
    assert_eq!(controller.remote_ipv6_addresses(), vec![SERVER_V6]);
}

/// Test exhausted DNS fails setup with nothing acquired.
#[test]
fn test_set_up_dns_exhausted() {
    let h = Harness::new();
    h.network.fail_dns(3);
    let (mut controller, _events) = h.controller(params());

    let err = controller.set_up().unwrap_err();

    assert!(matches!(err, ConnectionError::ResolutionFailed(_)));
    assert!(err.is_recoverable());
    assert_eq!(h.network.dns_calls().len(), 3);
    assert_eq!(h.sockets.live_sockets(), 0);
}

/// Test a required family that is not connectable fails setup.
#[test]
fn test_set_up_no_usable_address() {
    let h = Harness::new();
    h.network.add_network(
        NET_WIFI,
        link("wlan0", &[ip(WIFI_V4)]),
        NetworkCapabilities::wifi(),
    );
    let mut params = params();
    params.ip_version = IpVersion::V6;
    let (mut controller, _events) = h.controller(params);

    let err = controller.set_up().unwrap_err();

    assert!(matches!(err, ConnectionError::NoUsableAddress(_)));
    assert!(h.sockets.requests().is_empty());
}

/// Test socket failure leaves no subscription behind.
#[test]
fn test_set_up_socket_failure_is_all_or_nothing() {
    let h = Harness::new();
    h.sockets.fail_variant(Some(SocketVariant::Udp6));
    let (mut controller, _events) = h.controller(params());

    let err = controller.set_up().unwrap_err();

    assert!(matches!(err, ConnectionError::SocketUnavailable(_)));
    assert_eq!(h.sockets.live_sockets(), 0);
    assert!(h.network.subscriptions().is_empty());
    assert!(controller.socket().is_none());
}

/// Test keepalive failure at setup releases the acquired socket.
#[test]
fn test_set_up_keepalive_failure_releases_socket() {
    let h = Harness::new();
    h.keepalive.with_log(|log| log.fail_next = true);
    let mut params = params_v4();
    params.options.force_port_4500 = true;
    let (mut controller, _events) = h.controller(params);

    let err = controller.set_up().unwrap_err();

    assert!(matches!(err, ConnectionError::Keepalive(_)));
    assert_eq!(h.sockets.live_sockets(), 0);
    assert!(h.network.subscriptions().is_empty());
    assert_eq!(
        h.journal.entries(),
        vec!["acquire sock#0 udp4-encap", "release sock#0 spis=[]"]
    );
}

/// Test calling setup twice does not leak the first socket or subscription.
#[test]
fn test_set_up_twice_releases_previous_resources() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params());
    controller.register_new_record(0x77).unwrap();

    controller.set_up().unwrap();

    assert_eq!(h.sockets.live_sockets(), 1);
    assert_eq!(h.network.subscriptions().len(), 1);
    assert!(controller.registered_spis().is_empty());
    let id = controller.socket().unwrap().id();
    assert_eq!(h.sockets.reference_count(id), 1);
}

// ============================================================================
// Teardown
// ============================================================================

/// Test teardown releases in order and is idempotent.
#[test]
fn test_tear_down_order_and_idempotence() {
    let h = Harness::new();
    let mut params = params_v4();
    params.options.force_port_4500 = true;
    let (mut controller, _events) = h.active_controller(params);
    controller.register_new_record(0x11).unwrap();
    let socket = h.active_socket(&controller);
    h.journal.clear();

    controller.tear_down();
    controller.tear_down();

    assert_eq!(
        h.journal.entries(),
        vec!["release sock#0 spis=[]", "keepalive stop", "unsubscribe 1"]
    );
    assert_eq!(controller.state(), ControllerState::TornDown);
    assert!(controller.registered_spis().is_empty());
    assert!(socket.is_closed());
    assert!(!controller.is_keepalive_running());
}

/// Test teardown before setup is harmless.
#[test]
fn test_tear_down_before_set_up() {
    let h = Harness::new();
    let (mut controller, _events) = h.controller(params());

    controller.tear_down();
    controller.tear_down();

    assert_eq!(controller.state(), ControllerState::TornDown);
    assert!(h.journal.entries().is_empty());
}

/// Test dropping a controller releases its socket.
#[test]
fn test_drop_releases_socket() {
    let h = Harness::new();
    let (controller, _events) = h.active_controller(params());
    assert_eq!(h.sockets.live_sockets(), 1);

    drop(controller);

    assert_eq!(h.sockets.live_sockets(), 0);
    assert!(h.network.subscriptions().is_empty());
}

/// Test sessions on the same network share one socket per variant.
#[test]
fn test_sessions_share_sockets() {
    let h = Harness::new();
    let (mut first, _first_events) = h.active_controller(params());
    let (mut second, _second_events) = h.active_controller(params());

    let id = first.socket().unwrap().id();
    assert_eq!(second.socket().unwrap().id(), id);
    assert_eq!(h.sockets.reference_count(id), 2);

    first.tear_down();
    assert_eq!(h.sockets.reference_count(id), 1);
    assert!(!h.sockets.socket(id).is_closed());

    second.tear_down();
    assert!(h.sockets.socket(id).is_closed());
}

// ============================================================================
// Records and data plane
// ============================================================================

/// Test record registration tracks the active socket.
#[test]
fn test_register_and_unregister_records() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params());

    controller.register_new_record(1).unwrap();
    controller
        .register_existing_record(FakeRecord::new(2))
        .unwrap();
    assert_eq!(controller.registered_spis(), vec![1, 2]);
    assert_eq!(h.active_socket(&controller).registered_spis(), vec![1, 2]);

    controller.unregister_record(1);
    assert_eq!(controller.registered_spis(), vec![2]);
    assert_eq!(h.active_socket(&controller).registered_spis(), vec![2]);
}

/// Test operations before setup fail with an invalid state.
#[test]
fn test_operations_before_set_up_are_invalid() {
    let h = Harness::new();
    let (mut controller, _events) = h.controller(params());

    let err = controller.register_new_record(1).unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidState(_)));
    assert!(!err.is_recoverable());
    assert!(controller.send_packet(b"x").is_err());
    assert!(matches!(
        controller.handle_nat_detection_result(true, 1),
        Err(ConnectionError::InvalidState(_))
    ));
    assert!(matches!(
        controller.enable_mobility(),
        Err(ConnectionError::InvalidState(_))
    ));
    assert!(!controller.is_mobility_enabled());
    assert!(controller.local_port().is_err());
    assert!(controller.connection_info().is_none());
}

/// Test inbound packets reach the callback through the event queue.
#[test]
fn test_inbound_packet_delivered_through_queue() {
    let h = Harness::new();
    let (mut controller, events) = h.active_controller(params());
    controller.register_new_record(0xAA).unwrap();

    assert!(h.active_socket(&controller).inject(ike_packet(0xAA, 0)));
    assert!(!h.active_socket(&controller).inject(ike_packet(0xBB, 0xCC)));
    assert!(h.callback.packets().is_empty());

    pump(&mut controller, &events);

    let packets = h.callback.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].0.initiator_spi, 0xAA);
}

/// Test outbound packets go to the remote on the active socket.
#[test]
fn test_send_packet() {
    let h = Harness::new();
    let (controller, _events) = h.active_controller(params());

    assert_eq!(controller.send_packet(b"hello").unwrap(), 5);
    assert_eq!(
        h.active_socket(&controller).sent(),
        vec![(b"hello".to_vec(), ip(SERVER_V6))]
    );
}

/// Test accessors after setup.
#[test]
fn test_accessors_and_dump() {
    let h = Harness::new();
    let (controller, _events) = h.active_controller(params());

    assert_eq!(controller.local_port().unwrap(), 40000);
    let info = controller.connection_info().unwrap();
    assert_eq!(info.local, ip(WIFI_V6));
    assert_eq!(info.remote, ip(SERVER_V6));
    assert_eq!(info.network, NET_WIFI);

    let dump = controller.to_string();
    assert!(dump.contains("Network: net:100"));
    assert!(dump.contains("Nat status: NAT_TRAVERSAL_SUPPORT_NOT_CHECKED"));
    assert!(dump.contains("Local port: 40000"));
    assert!(dump.contains("Remote(server) port: 500"));
    assert!(dump.contains("Mobility status: false"));
}

// ============================================================================
// NAT detection
// ============================================================================

/// Test no NAT keeps the port-500 socket.
#[test]
fn test_nat_not_detected() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params_v4());

    controller.handle_nat_detection_result(false, 1).unwrap();

    assert_eq!(controller.nat_status(), NatStatus::NotDetected);
    assert_eq!(variant(&controller), SocketVariant::Udp4);
}

/// Test detected NAT moves every SPI to the encapsulation socket before release.
#[test]
fn test_nat_detected_switches_socket() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params_v4());
    controller.register_new_record(0x10).unwrap();
    controller
        .register_existing_record(FakeRecord::new(0x20))
        .unwrap();
    let old = h.active_socket(&controller);
    h.journal.clear();

    controller.handle_nat_detection_result(true, 0x30).unwrap();

    assert_eq!(controller.nat_status(), NatStatus::Detected);
    assert!(controller.uses_udp_encap_socket());
    assert_eq!(controller.remote_port(), Some(4500));
    assert_eq!(controller.registered_spis(), vec![0x10, 0x20, 0x30]);
    assert_eq!(
        h.active_socket(&controller).registered_spis(),
        vec![0x10, 0x20, 0x30]
    );
    assert!(old.registered_spis().is_empty());
    assert!(old.is_closed());
    assert!(controller.is_keepalive_running());
    assert_eq!(
        h.journal.entries(),
        vec![
            "acquire sock#1 udp4-encap",
            "keepalive start sock#1 10s",
            "release sock#0 spis=[]",
        ]
    );
}

/// Test NAT over IPv6 is rejected but still recorded.
#[test]
fn test_nat_detected_on_ipv6_is_unsupported() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params());
    controller.register_new_record(0x10).unwrap();
    h.journal.clear();

    let err = controller.handle_nat_detection_result(true, 0x10).unwrap_err();

    assert!(matches!(err, ConnectionError::Unsupported(_)));
    assert_eq!(controller.nat_status(), NatStatus::Detected);
    assert_eq!(variant(&controller), SocketVariant::Udp6);
    assert!(h.journal.entries().is_empty());
}

/// Test MOBIKE NAT detection switches once and then stays.
#[test]
fn test_nat_detected_in_mobike() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params_v4());

    controller.handle_nat_detection_result_in_mobike(true).unwrap();
    let id = controller.socket().unwrap().id();
    assert!(controller.uses_udp_encap_socket());

    controller.handle_nat_detection_result_in_mobike(true).unwrap();
    assert_eq!(controller.socket().unwrap().id(), id);
    assert_eq!(h.sockets.live_sockets(), 1);
    assert_eq!(h.sockets.reference_count(id), 1);
}

/// Test NAT-T support markers.
#[test]
fn test_mark_and_reset_natt_support() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params());

    controller.mark_server_natt_unsupported();
    assert_eq!(controller.nat_status(), NatStatus::Unsupported);
    controller.reset_server_natt_support();
    assert_eq!(controller.nat_status(), NatStatus::NotChecked);
}

// ============================================================================
// Keepalive
// ============================================================================

/// Test the cellular override caps the automatic keepalive delay.
#[test]
fn test_keepalive_delay_cellular_override() {
    let mut h = Harness::new();
    h.device = StaticDeviceConfig::new()
        .with_int(CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS, 90);
    let mut params = params_v4();
    params.configured_network = Some(NET_CELL);
    params.options.force_port_4500 = true;
    params.options.automatic_natt_keepalives = true;
    params.natt_keepalive_delay_seconds = 120;

    let (controller, _events) = h.active_controller(params);

    assert_eq!(controller.keepalive_delay_seconds(), 90);
    let delay = h.keepalive.with_log(|log| log.starts[0].delay);
    assert_eq!(delay, Duration::from_secs(90));
}

/// Test keepalive alarms are forwarded only while a keepalive runs.
#[test]
fn test_keepalive_alarm_forwarding() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params_v4());
    controller.handle_event(ControllerEvent::KeepaliveAlarm);
    assert_eq!(h.keepalive.with_log(|log| log.alarms), 0);

    controller.handle_nat_detection_result(true, 1).unwrap();
    controller.fire_keepalive();
    controller.handle_event(ControllerEvent::KeepaliveAlarm);
    assert_eq!(h.keepalive.with_log(|log| log.alarms), 2);
}

/// Test setting the underpinned network restarts the keepalive.
#[test]
fn test_underpinned_network_restarts_keepalive() {
    let h = Harness::new();
    let mut params = params_v4();
    params.options.force_port_4500 = true;
    let (mut controller, _events) = h.active_controller(params);

    controller.on_underpinned_network_set_by_user(NET_CELL).unwrap();

    assert_eq!(controller.underpinned_network(), Some(NET_CELL));
    let restarts = h.keepalive.with_log(|log| log.restarts.clone());
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].underpinned_network, Some(NET_CELL));
}

// ============================================================================
// Mobility
// ============================================================================

/// Test enabling mobility moves IPv6 sessions to port 4500 without keepalive.
#[test]
fn test_enable_mobility_ipv6() {
    let h = Harness::new();
    let (controller, _events) = mobile_session(&h);

    assert!(controller.is_mobility_enabled());
    assert_eq!(controller.remote_port(), Some(4500));
    assert!(!controller.uses_udp_encap_socket());
    assert!(!controller.is_keepalive_running());
    assert_eq!(h.sockets.live_sockets(), 1);
}

/// Test enabling mobility on IPv4 moves to the encapsulation socket.
#[test]
fn test_enable_mobility_ipv4() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params_v4());

    controller.enable_mobility().unwrap();

    assert_eq!(variant(&controller), SocketVariant::Udp4Encap);
    assert!(controller.is_keepalive_running());
}

/// Test enabling mobility keeps port 500 when the server lacks NAT-T.
#[test]
fn test_enable_mobility_natt_unsupported() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params_v4());
    let id = controller.socket().unwrap().id();
    controller.mark_server_natt_unsupported();

    controller.enable_mobility().unwrap();

    assert!(controller.is_mobility_enabled());
    assert_eq!(controller.socket().unwrap().id(), id);
    assert_eq!(variant(&controller), SocketVariant::Udp4);
}

/// Test network loss with mobility disabled reports the network dead once.
#[test]
fn test_network_lost_without_mobility() {
    let h = Harness::new();
    let (mut controller, events) = h.active_controller(params());
    h.journal.clear();

    h.network.emit(NetworkEvent::Lost(NET_WIFI));
    pump(&mut controller, &events);

    assert_eq!(h.callback.died(), vec![NET_WIFI]);
    assert_eq!(h.network.dns_calls().len(), 1);
    assert!(h.journal.entries().is_empty());
}

/// Test a network update with mobility disabled reports the current network dead.
#[test]
fn test_network_update_without_mobility() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params());

    controller.on_network_updated(NET_CELL, cell_link(), NetworkCapabilities::cellular(), true);

    assert_eq!(h.callback.died(), vec![NET_WIFI]);
    assert_eq!(controller.network(), NET_WIFI);
    assert_eq!(h.callback.updates(), 0);
}

/// Test a skippable update with nothing changed does nothing.
#[test]
fn test_skippable_update_without_change() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);
    let record = FakeRecord::new(0x42);
    controller.register_existing_record(record.clone()).unwrap();
    h.journal.clear();

    controller.on_network_updated(NET_WIFI, wifi_link(), NetworkCapabilities::wifi(), true);

    assert!(h.journal.entries().is_empty());
    assert_eq!(h.callback.updates(), 0);
    assert!(record.migrations().is_empty());
    assert!(h.callback.take_errors().is_empty());
}

/// Test the skip can be disabled in the session parameters.
#[test]
fn test_skip_disabled_by_params() {
    let h = Harness::new();
    let mut params = params();
    params.skip_if_same_network = false;
    let (mut controller, _events) = h.active_controller(params);
    controller.enable_mobility().unwrap();

    controller.on_network_updated(NET_WIFI, wifi_link(), NetworkCapabilities::wifi(), true);

    assert_eq!(h.callback.updates(), 1);
}

/// Test a forced update on the same network migrates records in place.
#[test]
fn test_non_skippable_update_on_same_network() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);
    let record = FakeRecord::new(0x42);
    controller.register_existing_record(record.clone()).unwrap();
    let id = controller.socket().unwrap().id();

    controller.on_network_updated(NET_WIFI, wifi_link(), NetworkCapabilities::wifi(), false);

    assert_eq!(controller.socket().unwrap().id(), id);
    assert_eq!(record.migrations(), vec![(ip(WIFI_V6), ip(SERVER_V6))]);
    assert_eq!(h.callback.updates(), 1);
    assert_eq!(h.network.dns_calls().len(), 1);
}

/// Test the default watcher follows a new default network.
#[test]
fn test_default_network_change() {
    let h = Harness::new();
    let (mut controller, events) = mobile_session(&h);
    let record = FakeRecord::new(0x42);
    controller.register_existing_record(record.clone()).unwrap();
    let old = h.active_socket(&controller);
    h.journal.clear();

    h.network.emit(NetworkEvent::Updated {
        network: NET_CELL,
        link: cell_link(),
        capabilities: NetworkCapabilities::cellular(),
    });
    pump(&mut controller, &events);

    assert!(h.callback.take_errors().is_empty());
    assert_eq!(controller.network(), NET_CELL);
    assert_eq!(controller.local_address(), Some(ip(CELL_V6)));
    assert_eq!(controller.remote_address(), Some(ip(SERVER_V6)));
    assert_eq!(controller.network_type(), NetworkType::Cellular);
    assert_eq!(variant(&controller), SocketVariant::Udp6WithEncapPort);
    assert_eq!(h.active_socket(&controller).network(), NET_CELL);
    assert_eq!(h.active_socket(&controller).registered_spis(), vec![0x42]);
    assert!(old.is_closed());
    assert_eq!(record.migrations(), vec![(ip(CELL_V6), ip(SERVER_V6))]);
    assert_eq!(h.callback.updates(), 1);
    assert_eq!(h.network.dns_calls(), vec![NET_WIFI, NET_CELL]);
    assert_eq!(
        h.journal.entries(),
        vec!["acquire sock#2 udp6-encap-port", "release sock#1 spis=[]"]
    );
    let request = h.sockets.requests().pop().unwrap();
    assert_eq!(request.interface.as_deref(), Some("rmnet0"));
}

/// Test the specific watcher ignores other networks but reports its own loss.
#[test]
fn test_specific_network_watcher() {
    let h = Harness::new();
    let mut params = params();
    params.configured_network = Some(NET_WIFI);
    let (mut controller, events) = h.active_controller(params);
    controller.enable_mobility().unwrap();

    h.network.emit(NetworkEvent::Updated {
        network: NET_CELL,
        link: cell_link(),
        capabilities: NetworkCapabilities::cellular(),
    });
    h.network.emit(NetworkEvent::Lost(NET_CELL));
    pump(&mut controller, &events);
    assert_eq!(controller.network(), NET_WIFI);
    assert_eq!(h.callback.updates(), 0);
    assert!(h.callback.died().is_empty());

    h.network.emit(NetworkEvent::Lost(NET_WIFI));
    pump(&mut controller, &events);
    assert_eq!(h.callback.died(), vec![NET_WIFI]);
}

/// Test a link change on the tracked network is handled as a mobility update.
#[test]
fn test_link_change_switches_family() {
    let h = Harness::new();
    let (mut controller, events) = mobile_session(&h);

    h.network.emit(NetworkEvent::Updated {
        network: NET_WIFI,
        link: link("wlan0", &[ip(WIFI_V4)]),
        capabilities: NetworkCapabilities::wifi(),
    });
    pump(&mut controller, &events);

    assert_eq!(controller.remote_address(), Some(ip(SERVER_V4)));
    assert_eq!(controller.local_address(), Some(ip(WIFI_V4)));
    assert_eq!(variant(&controller), SocketVariant::Udp4Encap);
    assert!(controller.is_keepalive_running());
    assert_eq!(h.network.dns_calls().len(), 2);
    assert_eq!(h.callback.updates(), 1);
    assert_eq!(h.sockets.live_sockets(), 1);
}

/// Test a capabilities-only change updates state without a mobility update.
#[test]
fn test_capabilities_only_change() {
    let h = Harness::new();
    let (mut controller, events) = mobile_session(&h);

    h.network.emit(NetworkEvent::CapabilitiesChanged {
        network: NET_WIFI,
        capabilities: NetworkCapabilities::cellular(),
    });
    pump(&mut controller, &events);

    assert_eq!(controller.network_type(), NetworkType::Cellular);
    assert_eq!(h.callback.updates(), 0);
}

/// Test a new link without addresses is reported as an error.
#[test]
fn test_update_without_local_address() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);

    controller.on_network_updated(
        NET_CELL,
        LinkProperties::new("rmnet0", Vec::new()),
        NetworkCapabilities::cellular(),
        true,
    );

    let errors = h.callback.take_errors();
    assert!(matches!(errors.as_slice(), [ConnectionError::NoUsableAddress(_)]));
    assert_eq!(controller.network(), NET_WIFI);
    assert_eq!(h.callback.updates(), 0);
}

/// Test a failed socket switch aborts before any record migration.
#[test]
fn test_update_socket_failure_aborts() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);
    let record = FakeRecord::new(0x42);
    controller.register_existing_record(record.clone()).unwrap();
    let id = controller.socket().unwrap().id();
    h.sockets.fail_variant(Some(SocketVariant::Udp6WithEncapPort));

    controller.on_network_updated(NET_CELL, cell_link(), NetworkCapabilities::cellular(), true);

    let errors = h.callback.take_errors();
    assert!(matches!(errors.as_slice(), [ConnectionError::SocketUnavailable(_)]));
    assert!(record.migrations().is_empty());
    assert_eq!(h.callback.updates(), 0);
    assert_eq!(controller.socket().unwrap().id(), id);
    assert_eq!(h.sockets.reference_count(id), 1);
    assert_eq!(h.active_socket(&controller).registered_spis(), vec![0x42]);
    assert_eq!(controller.network(), NET_WIFI);
    assert_eq!(controller.local_address(), Some(ip(WIFI_V6)));
    assert_eq!(controller.socket().unwrap().socket().network(), NET_WIFI);
}

/// Test a failed DNS lookup keeps the old path and a retry switches sockets.
#[test]
fn test_update_dns_failure_keeps_path_for_retry() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);
    let record = FakeRecord::new(0x42);
    controller.register_existing_record(record.clone()).unwrap();
    h.network.fail_dns(3);

    controller.on_network_updated(NET_CELL, cell_link(), NetworkCapabilities::cellular(), true);

    let errors = h.callback.take_errors();
    assert!(matches!(errors.as_slice(), [ConnectionError::ResolutionFailed(_)]));
    assert_eq!(controller.network(), NET_WIFI);
    assert_eq!(controller.network_type(), NetworkType::Wifi);
    assert_eq!(controller.local_address(), Some(ip(WIFI_V6)));
    assert_eq!(controller.remote_address(), Some(ip(SERVER_V6)));
    assert_eq!(h.active_socket(&controller).network(), NET_WIFI);
    assert!(record.migrations().is_empty());

    controller.on_network_updated(NET_CELL, cell_link(), NetworkCapabilities::cellular(), false);

    assert!(h.callback.take_errors().is_empty());
    assert_eq!(h.callback.updates(), 1);
    assert_eq!(controller.network(), NET_CELL);
    assert_eq!(controller.local_address(), Some(ip(CELL_V6)));
    let socket = h.active_socket(&controller);
    assert_eq!(socket.network(), controller.network());
    assert_eq!(socket.registered_spis(), vec![0x42]);
    assert_eq!(h.sockets.live_sockets(), 1);
    assert_eq!(record.migrations(), vec![(ip(CELL_V6), ip(SERVER_V6))]);
}

/// Test a record that cannot migrate is reported with its SPI.
#[test]
fn test_update_record_migration_failure() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);
    let record = FakeRecord::new(0x42);
    record.set_failing(true);
    controller.register_existing_record(record).unwrap();

    controller.on_network_updated(NET_CELL, cell_link(), NetworkCapabilities::cellular(), true);

    let errors = h.callback.take_errors();
    assert!(matches!(
        errors.as_slice(),
        [ConnectionError::MigrationFailed {
            spi: 0x42,
            source: MigrationError::Busy(_),
        }]
    ));
    assert!(!errors[0].is_recoverable());
    assert_eq!(h.callback.updates(), 0);
}

/// Test NAT64 candidates are dropped and re-resolved on every update.
#[test]
fn test_nat64_candidates_are_refreshed() {
    let h = Harness::new();
    let nat64_server: Ipv6Addr = "64:ff9b::c633:6407".parse().unwrap();
    let nat64_link = LinkProperties {
        interface_name: Some("wlan0".to_string()),
        addresses: vec![ip(WIFI_V6)],
        nat64_prefix: Some(Nat64Prefix::new("64:ff9b::".parse().unwrap(), 96)),
    };
    h.network
        .add_network(NET_WIFI, nat64_link.clone(), NetworkCapabilities::wifi());
    h.network.set_dns(NET_WIFI, &[ip(nat64_server)]);
    let (mut controller, _events) = h.active_controller(params());
    controller.enable_mobility().unwrap();
    assert_eq!(controller.remote_address(), Some(ip(nat64_server)));

    controller.on_network_updated(NET_WIFI, nat64_link, NetworkCapabilities::wifi(), false);

    assert_eq!(h.network.dns_calls().len(), 2);
    assert_eq!(controller.remote_ipv6_addresses(), vec![nat64_server]);
    assert_eq!(h.callback.updates(), 1);
}

// ============================================================================
// DNS lookup decisions
// ============================================================================

/// Test the DNS lookup decision table.
#[test]
fn test_is_dns_lookup_required() {
    let h = Harness::new();
    let (controller, _events) = h.active_controller(params());

    assert!(!controller.is_dns_lookup_required(NET_WIFI, NET_WIFI, &wifi_link()));
    assert!(controller.is_dns_lookup_required(NET_WIFI, NET_CELL, &cell_link()));
    assert!(controller.is_dns_lookup_required(
        NET_WIFI,
        NET_WIFI,
        &link("wlan0", &[ip(WIFI_V4)])
    ));
    assert!(controller.is_dns_lookup_required(
        NET_WIFI,
        NET_WIFI,
        &LinkProperties::new("wlan0", Vec::new())
    ));
}

/// Test cached addresses are reused across networks when the device allows it.
#[test]
fn test_is_dns_lookup_required_with_cached_addresses() {
    let mut h = Harness::new();
    h.device = StaticDeviceConfig::new().with_flag(CONFIG_USE_CACHED_ADDRS, true);
    let (controller, _events) = h.active_controller(params());

    assert!(!controller.is_dns_lookup_required(NET_WIFI, NET_CELL, &cell_link()));
    assert!(!controller.is_dns_lookup_required(
        NET_WIFI,
        NET_CELL,
        &link("rmnet0", &[ip(CELL_V4)])
    ));
}

/// Test forced DNS resolution always looks up.
#[test]
fn test_is_dns_lookup_required_forced() {
    let h = Harness::new();
    let mut params = params();
    params.options.force_dns_resolution = true;
    let (controller, _events) = h.active_controller(params);

    assert!(controller.is_dns_lookup_required(NET_WIFI, NET_WIFI, &wifi_link()));
}

// ============================================================================
// User-directed migration
// ============================================================================

/// Test setting the network requires mobility.
#[test]
fn test_set_network_requires_mobility() {
    let h = Harness::new();
    let (mut controller, _events) = h.active_controller(params());

    let err = controller
        .on_network_set_by_user(NET_CELL, IpVersion::Auto, EncapType::Auto, KeepaliveDelay::Auto)
        .unwrap_err();

    assert!(matches!(err, ConnectionError::InvalidState(_)));
    assert_eq!(controller.network(), NET_WIFI);
}

/// Test setting an unknown network fails.
#[test]
fn test_set_network_missing_link_properties() {
    let h = Harness::new();
    let (mut controller, _events) = mobile_session(&h);
    h.network.remove_network(NET_CELL);

    let err = controller
        .on_network_set_by_user(NET_CELL, IpVersion::Auto, EncapType::Auto, KeepaliveDelay::Auto)
        .unwrap_err();

    assert!(matches!(err, ConnectionError::SetupFailed(_)));
}

/// Test user-directed migration to another network and IP version.
#[test]
fn test_set_network_by_user() {
    let h = Harness::new();
    let (mut controller, events) = mobile_session(&h);

    controller
        .on_network_set_by_user(
            NET_CELL,
            IpVersion::V4,
            EncapType::Auto,
            KeepaliveDelay::Seconds(20),
        )
        .unwrap();

    assert!(h.callback.take_errors().is_empty());
    assert_eq!(controller.network(), NET_CELL);
    assert_eq!(controller.ip_version(), IpVersion::V4);
    assert_eq!(controller.local_address(), Some(ip(CELL_V4)));
    assert_eq!(controller.remote_address(), Some(ip(SERVER_V4)));
    assert_eq!(variant(&controller), SocketVariant::Udp4Encap);
    assert_eq!(controller.keepalive_delay_seconds(), 20);
    assert_eq!(h.callback.updates(), 1);

    let start = h.keepalive.with_log(|log| log.starts.last().cloned()).unwrap();
    assert_eq!(start.local, CELL_V4);
    assert_eq!(start.remote, SERVER_V4);
    assert_eq!(start.network, NET_CELL);
    assert_eq!(start.delay, Duration::from_secs(20));

    // The watcher now tracks the cellular network
    h.network.emit(NetworkEvent::Lost(NET_CELL));
    pump(&mut controller, &events);
    assert_eq!(h.callback.died(), vec![NET_CELL]);
}

/// Test a user-set keepalive delay restarts a running keepalive.
#[test]
fn test_set_network_restarts_running_keepalive() {
    let h = Harness::new();
    let mut params = params_v4();
    params.options.force_port_4500 = true;
    let (mut controller, _events) = h.active_controller(params);
    controller.enable_mobility().unwrap();

    controller
        .on_network_set_by_user(
            NET_WIFI,
            IpVersion::V4,
            EncapType::Auto,
            KeepaliveDelay::Seconds(30),
        )
        .unwrap();

    let restarts = h.keepalive.with_log(|log| log.restarts.clone());
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].delay, Duration::from_secs(30));
    assert_eq!(h.callback.updates(), 1);
}

// ============================================================================
// Session actor
// ============================================================================

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Test the actor runs setup and reports status.
#[tokio::test]
async fn test_actor_set_up_and_status() {
    let h = Harness::new();
    let session = SessionActor::spawn(
        params(),
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
    )
    .unwrap();

    session.set_up().await.unwrap();
    session.register_new_record(0x99).await.unwrap();

    let status = session.status().await.unwrap();
    assert_eq!(status.state, ControllerState::Active);
    assert_eq!(status.network, NET_WIFI);
    assert_eq!(status.connection.unwrap().remote, ip(SERVER_V6));
    assert_eq!(status.registered_spis, vec![0x99]);
    assert_eq!(status.remote_port, Some(500));
    assert!(session.dump().await.unwrap().contains("Network: net:100"));

    session.shutdown();
    assert!(matches!(
        session.status().await,
        Err(ConnectionError::InvalidState(_))
    ));
    assert!(wait_for(|| h.sockets.live_sockets() == 0).await);
}

/// Test network events reach the actor through the subscription sink.
#[tokio::test]
async fn test_actor_follows_network_change() {
    let h = Harness::new();
    let session = SessionActor::spawn(
        params(),
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
    )
    .unwrap();
    session.set_up().await.unwrap();
    session.enable_mobility().await.unwrap();

    h.network.emit(NetworkEvent::Updated {
        network: NET_CELL,
        link: cell_link(),
        capabilities: NetworkCapabilities::cellular(),
    });

    let status = session.status().await.unwrap();
    assert_eq!(status.network, NET_CELL);
    assert_eq!(status.network_type, NetworkType::Cellular);
    assert!(status.mobility_enabled);
    assert_eq!(h.callback.updates(), 1);
}

/// Test NAT detection and inbound packets through the actor.
#[tokio::test]
async fn test_actor_nat_detection_and_packets() {
    let h = Harness::new();
    let session = SessionActor::spawn(
        params_v4(),
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
    )
    .unwrap();
    session.set_up().await.unwrap();

    session.handle_nat_detection_result(true, 0x55).await.unwrap();
    let status = session.status().await.unwrap();
    assert_eq!(status.nat_status, NatStatus::Detected);
    assert!(status.uses_udp_encap_socket);
    assert!(status.keepalive_running);
    assert_eq!(status.registered_spis, vec![0x55]);

    assert_eq!(session.send_packet(vec![1, 2, 3]).await.unwrap(), 3);

    let socket = h.sockets.last_created();
    assert_eq!(socket.variant(), SocketVariant::Udp4Encap);
    assert!(socket.inject(ike_packet(0x55, 0)));
    session.status().await.unwrap();
    assert_eq!(h.callback.packets().len(), 1);
}

/// Test dropping every handle tears the session down.
#[tokio::test]
async fn test_actor_stops_when_handles_dropped() {
    let h = Harness::new();
    let session = SessionActor::spawn(
        params(),
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
    )
    .unwrap();
    session.set_up().await.unwrap();
    assert_eq!(h.sockets.live_sockets(), 1);

    drop(session);

    assert!(wait_for(|| h.sockets.live_sockets() == 0).await);
    assert!(h.network.subscriptions().is_empty());
}

/// Test spawn reports construction errors synchronously.
#[tokio::test]
async fn test_actor_spawn_without_network() {
    let h = Harness::new();
    h.network.set_active(None);

    let result = SessionActor::spawn(
        params(),
        h.collaborators(),
        Arc::clone(&h.callback) as Arc<dyn ConnectionCallback>,
    );

    assert!(matches!(result, Err(ConnectionError::SetupFailed(_))));
}
