use simnet::NetworkEdge;
use simnet::NetworkSimulator;
use tokio::time::Duration;

fn edge() -> NetworkEdge {
    NetworkEdge::new(Duration::from_millis(50), 0.95)
}

#[test]
fn add_node_creates_node_in_topology() {
    let sim = NetworkSimulator::new();

    sim.add_node("node_a");

    assert!(sim.has_node("node_a"));
}

#[test]
fn remove_node_removes_from_topology() {
    let sim = NetworkSimulator::new();

    sim.add_node("node_a");
    sim.remove_node("node_a");

    assert!(!sim.has_node("node_a"));
}

#[test]
fn add_edge_creates_nodes_if_not_exist() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());

    assert!(sim.has_node("node_a"));
    assert!(sim.has_node("node_b"));
    assert!(sim.has_edge("node_a", "node_b"));
}

#[test]
fn edges_are_directional() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());

    assert!(sim.has_edge("node_a", "node_b"));
    assert!(!sim.has_edge("node_b", "node_a"));
}

#[test]
fn re_adding_an_edge_overwrites_its_properties() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());
    sim.add_edge("node_a", "node_b", NetworkEdge::new(Duration::from_millis(10), 1.0));

    let got = sim.get_edge("node_a", "node_b").unwrap();
    assert_eq!(got.latency(), Duration::from_millis(10));
    assert!((got.reliability() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn remove_node_removes_incident_edges() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());
    sim.add_edge("node_c", "node_a", edge());
    sim.remove_node("node_a");

    assert!(!sim.has_edge("node_a", "node_b"));
    assert!(!sim.has_edge("node_c", "node_a"));
    assert!(sim.has_node("node_b"));
    assert!(sim.has_node("node_c"));
}

#[test]
fn remove_edge_removes_edge_from_topology() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());
    sim.remove_edge("node_a", "node_b");

    assert!(!sim.has_edge("node_a", "node_b"));
}

#[test]
fn get_edge_returns_correct_edge() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());

    let got = sim.get_edge("node_a", "node_b").unwrap();
    assert_eq!(got.latency(), Duration::from_millis(50));
    assert!((got.reliability() - 0.95).abs() < f64::EPSILON);
}

#[test]
fn create_node_adds_to_topology() {
    let sim = NetworkSimulator::new();

    let node = sim.create_node("node_a");

    assert_eq!(node.address(), "node_a");
    assert!(sim.has_node("node_a"));
}

#[test]
fn reset_clears_all_state_and_allows_reuse() {
    let sim = NetworkSimulator::new();

    sim.add_edge("node_a", "node_b", edge());
    sim.start();
    sim.reset();

    assert!(!sim.has_node("node_a"));
    assert!(!sim.has_node("node_b"));
    assert!(!sim.has_edge("node_a", "node_b"));
    assert!(!sim.is_running());

    // The simulator is reusable after a reset.
    sim.add_node("node_c");
    assert!(sim.has_node("node_c"));
    assert!(!sim.has_node("node_a"));
}
