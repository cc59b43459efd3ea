use simnet::ConnectionState;
use simnet::NetworkEdge;
use simnet::NetworkSimulator;
use simnet::SimError;
use tokio::time::Duration;

fn reliable_pair(sim: &NetworkSimulator) -> (simnet::SimNode, simnet::SimNode) {
    sim.add_edge("client", "server", NetworkEdge::new(Duration::from_millis(50), 1.0));
    sim.add_edge("server", "client", NetworkEdge::new(Duration::from_millis(50), 1.0));
    (sim.create_node("client"), sim.create_node("server"))
}

#[tokio::test(start_paused = true)]
async fn connect_establishes_within_timeout() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(17);
    sim.start();
    let (client, server) = reliable_pair(&sim);
    let _listener = server.bind(10_000).unwrap();

    let conn = client.connect("server", 10_000, Duration::from_secs(2)).await.unwrap();

    assert!(conn.is_open());
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.peer().address, "server");
}

#[tokio::test(start_paused = true)]
async fn connect_without_edge_fails_unreachable() {
    let sim = NetworkSimulator::new();
    sim.start();
    sim.add_node("client");
    let client = sim.create_node("client");
    let server = sim.create_node("server");
    let _listener = server.bind(10_000).unwrap();

    let res = client.connect("server", 10_000, Duration::from_secs(2)).await;

    assert_eq!(res.unwrap_err(), SimError::Unreachable);
}

#[tokio::test(start_paused = true)]
async fn connect_without_listener_fails_unreachable() {
    let sim = NetworkSimulator::new();
    sim.start();
    let (client, _server) = reliable_pair(&sim);

    let res = client.connect("server", 10_000, Duration::from_secs(2)).await;

    assert_eq!(res.unwrap_err(), SimError::Unreachable);
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_when_no_delivery_within_deadline() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(19);
    // The handshake is swallowed by a zero-reliability edge.
    sim.add_edge("client", "server", NetworkEdge::new(Duration::from_millis(10), 0.0));
    sim.start();
    let client = sim.create_node("client");
    let server = sim.create_node("server");
    let _listener = server.bind(10_000).unwrap();

    let res = client.connect("server", 10_000, Duration::from_millis(500)).await;

    assert_eq!(res.unwrap_err(), SimError::Timeout);
}

#[tokio::test(start_paused = true)]
async fn connection_close_walks_the_lifecycle() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(23);
    sim.start();
    let (client, server) = reliable_pair(&sim);
    let _listener = server.bind(10_000).unwrap();

    let conn = client.connect("server", 10_000, Duration::from_secs(2)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(!conn.is_open());
}

/// Tracking entries for closed or errored connections are removed on cleanup, so stats do not
/// leak over the lifetime of a long test.
#[tokio::test(start_paused = true)]
async fn cleanup_drops_closed_and_errored_tracking_entries() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(29);
    sim.start();
    let (client, server) = reliable_pair(&sim);
    let _listener = server.bind(10_000).unwrap();

    let conn_a = client.connect("server", 10_000, Duration::from_secs(2)).await.unwrap();
    let conn_b = client.connect("server", 10_000, Duration::from_secs(2)).await.unwrap();
    let conn_c = client.connect("server", 10_000, Duration::from_secs(2)).await.unwrap();
    assert_eq!(sim.connections().tracked(), 3);

    conn_a.close();
    conn_b.mark_error();
    sim.connections().cleanup();

    assert_eq!(sim.connections().tracked(), 1);
    assert!(conn_c.is_open());
    assert_eq!(sim.connections().count_in_state(ConnectionState::Connected), 1);
}

#[tokio::test(start_paused = true)]
async fn removing_a_node_closes_its_connections() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(31);
    sim.start();
    let (client, server) = reliable_pair(&sim);
    let _listener = server.bind(10_000).unwrap();

    let conn = client.connect("server", 10_000, Duration::from_secs(2)).await.unwrap();
    sim.remove_node("server");

    assert_eq!(conn.state(), ConnectionState::Closed);
}
