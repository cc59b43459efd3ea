use simnet::Endpoint;
use simnet::NetworkEdge;
use simnet::NetworkSimulator;
use simnet::SimError;
use tokio::time::Duration;
use tokio::time::Instant;

#[test]
fn reliability_draws_converge_to_edge_reliability() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(7);
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(10), 0.3));

    let trials = 1000usize;
    let successes = (0..trials).filter(|_| sim.check_reliability("node_a", "node_b")).count();

    // With reliability 0.3 we expect roughly 300 of 1000 deliveries; allow for
    // statistical variation.
    let rate = successes as f64 / trials as f64;
    assert!((0.20..=0.40).contains(&rate), "observed delivery rate {} out of bounds", rate);
}

#[test]
fn reliability_draws_are_deterministic_for_a_seed() {
    let run = || {
        let sim = NetworkSimulator::new();
        sim.seed_rng(42);
        sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(10), 0.5));
        (0..256).map(|_| sim.check_reliability("node_a", "node_b")).collect::<Vec<bool>>()
    };

    assert_eq!(run(), run());
}

#[tokio::test(start_paused = true)]
async fn datagram_is_delivered_after_edge_latency() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(1);
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(50), 1.0));
    sim.start();

    let sender = sim.create_node("node_a");
    let receiver = sim.create_node("node_b");
    let mut listener = receiver.bind(9000).unwrap();

    let sent_at = Instant::now();
    sender.send(4000, Endpoint::new("node_b", 9000), vec![0x01, 0x02]).unwrap();

    let datagram = listener.recv().await.unwrap();
    assert!(Instant::now() - sent_at >= Duration::from_millis(50));
    assert_eq!(datagram.payload, vec![0x01, 0x02]);
    assert_eq!(datagram.from, Endpoint::new("node_a", 4000));
    assert_eq!(datagram.to, Endpoint::new("node_b", 9000));
}

#[tokio::test(start_paused = true)]
async fn send_without_edge_is_unreachable() {
    let sim = NetworkSimulator::new();
    sim.start();
    sim.add_node("node_a");
    sim.add_node("node_b");

    let sender = sim.create_node("node_a");
    let receiver = sim.create_node("node_b");
    let _listener = receiver.bind(9000).unwrap();

    let res = sender.send(4000, Endpoint::new("node_b", 9000), vec![0xff]);
    assert_eq!(res.unwrap_err(), SimError::Unreachable);
}

#[tokio::test(start_paused = true)]
async fn send_without_listener_is_unreachable() {
    let sim = NetworkSimulator::new();
    sim.start();
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(10), 1.0));

    let sender = sim.create_node("node_a");

    let res = sender.send(4000, Endpoint::new("node_b", 9000), vec![0xff]);
    assert_eq!(res.unwrap_err(), SimError::Unreachable);
}

#[tokio::test(start_paused = true)]
async fn dropped_datagram_still_reports_send_success() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(3);
    // Reliability zero: every datagram is dropped.
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(10), 0.0));
    sim.start();

    let sender = sim.create_node("node_a");
    let receiver = sim.create_node("node_b");
    let mut listener = receiver.bind(9000).unwrap();

    sender.send(4000, Endpoint::new("node_b", 9000), vec![0xff]).unwrap();

    // Nothing arrives no matter how long we wait.
    tokio::time::advance(Duration::from_secs(1)).await;
    let got = tokio::time::timeout(Duration::from_millis(10), listener.recv()).await;
    assert!(got.is_err(), "expected no delivery over a zero-reliability edge");
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_scheduled_deliveries() {
    let sim = NetworkSimulator::new();
    sim.seed_rng(5);
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(100), 1.0));
    sim.start();

    let sender = sim.create_node("node_a");
    let receiver = sim.create_node("node_b");
    let mut listener = receiver.bind(9000).unwrap();

    sender.send(4000, Endpoint::new("node_b", 9000), vec![0x01]).unwrap();
    sim.stop();

    // The listener was closed by stop; any in-flight delivery was cancelled.
    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(listener.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn send_requires_the_simulator_to_be_running() {
    let sim = NetworkSimulator::new();
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(10), 1.0));

    let sender = sim.create_node("node_a");

    let res = sender.send(4000, Endpoint::new("node_b", 9000), vec![0x01]);
    assert_eq!(res.unwrap_err(), SimError::NotRunning);
}
