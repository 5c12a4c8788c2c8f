use std::time::Duration;

use bson::{doc, oid::ObjectId, Document};
use pretty_assertions::assert_eq;

use crate::{
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::ServerDescription,
        description::topology::TopologyDescription,
        ServerType,
        Topology,
        TopologyType,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

fn server_address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

/// Builds a server description as if the monitor had received `response` from `address`.
fn description_from_response(address: &str, response: Document) -> ServerDescription {
    let address = server_address(address);
    let command_response: HelloCommandResponse = bson::from_document(response.clone()).unwrap();
    let reply = HelloReply {
        server_address: address.clone(),
        command_response,
        raw_command_response: response,
        cluster_time: None,
    };
    ServerDescription::new_from_hello_reply(address, reply, Duration::from_millis(10))
}

fn options_for(uri: &str) -> ClientOptions {
    ClientOptions::parse_without_srv_resolution(uri).unwrap()
}

fn initialized_description(uri: &str) -> TopologyDescription {
    let mut description = TopologyDescription::default();
    description.initialize(&options_for(uri));
    description
}

#[test]
fn single_seed_standalone_becomes_single() {
    let mut description = initialized_description("mongodb://127.0.0.1:27017");
    assert_eq!(description.topology_type, TopologyType::Unknown);

    description
        .update(description_from_response(
            "127.0.0.1:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 21, "minWireVersion": 0 },
        ))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::Single);
    assert!(description.compatibility_error().is_none());

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let suitable = description
        .suitable_servers_in_latency_window(&criteria)
        .unwrap();
    assert_eq!(suitable.len(), 1);
    assert_eq!(suitable[0].address, server_address("127.0.0.1:27017"));
}

#[test]
fn standalone_removed_from_multi_seed_topology() {
    let mut description = initialized_description("mongodb://a:27017,b:27017");

    description
        .update(description_from_response(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 21 },
        ))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::Unknown);
    assert!(!description.servers.contains_key(&server_address("a:27017")));
    assert!(description.servers.contains_key(&server_address("b:27017")));
}

#[test]
fn replica_set_discovery_adds_new_members() {
    let mut description = initialized_description("mongodb://a:27017/?replicaSet=rs0");
    assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);

    description
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
                "minWireVersion": 0,
            },
        ))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert!(description.servers.contains_key(&server_address("b:27017")));
    assert_eq!(
        description
            .servers
            .get(&server_address("b:27017"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );
}

#[test]
fn primary_hello_prunes_absent_members() {
    let mut description = initialized_description("mongodb://a:27017,c:27017/?replicaSet=rs0");

    description
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .unwrap();

    // "c" was not in the primary's host list, so it is gone; "b" was added.
    assert!(!description.servers.contains_key(&server_address("c:27017")));
    assert!(description.servers.contains_key(&server_address("b:27017")));
}

#[test]
fn stale_primary_claim_is_demoted() {
    let mut description = initialized_description("mongodb://a:27017,b:27017/?replicaSet=rs0");

    let newer_election_id = ObjectId::from_bytes([5; 12]);
    let older_election_id = ObjectId::from_bytes([4; 12]);

    description
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "setVersion": 1,
                "electionId": newer_election_id,
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .unwrap();
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);

    // Another host claims to be primary with an older election id: the claimant is reset
    // to Unknown and the topology keeps its primary.
    description
        .update(description_from_response(
            "b:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "setVersion": 1,
                "electionId": older_election_id,
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        description
            .servers
            .get(&server_address("b:27017"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );
    assert_eq!(
        description
            .servers
            .get(&server_address("a:27017"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
    assert_eq!(description.max_election_id, Some(newer_election_id));
}

#[test]
fn newer_primary_claim_displaces_old_primary() {
    let mut description = initialized_description("mongodb://a:27017,b:27017/?replicaSet=rs0");

    description
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "setVersion": 1,
                "electionId": ObjectId::from_bytes([4; 12]),
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .unwrap();

    description
        .update(description_from_response(
            "b:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "setVersion": 1,
                "electionId": ObjectId::from_bytes([5; 12]),
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .unwrap();

    assert_eq!(
        description
            .servers
            .get(&server_address("a:27017"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );
    assert_eq!(
        description
            .servers
            .get(&server_address("b:27017"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
}

#[test]
fn mongos_reply_moves_topology_to_sharded() {
    let mut description = initialized_description("mongodb://a:27017,b:27017");

    description
        .update(description_from_response(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid", "maxWireVersion": 21 },
        ))
        .unwrap();
    assert_eq!(description.topology_type, TopologyType::Sharded);

    // A non-mongos reply in a sharded topology removes the server.
    description
        .update(description_from_response(
            "b:27017",
            doc! { "ok": 1, "ismaster": true, "setName": "rs0", "maxWireVersion": 21 },
        ))
        .unwrap();
    assert!(!description.servers.contains_key(&server_address("b:27017")));
}

#[test]
fn wire_version_mismatch_sets_compatibility_error() {
    let mut description = initialized_description("mongodb://a:27017");

    description
        .update(description_from_response(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 2, "minWireVersion": 0 },
        ))
        .unwrap();

    let error = description.compatibility_error().expect("expected error");
    assert!(error.contains("wire version"), "{}", error);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    assert!(description
        .suitable_servers_in_latency_window(&criteria)
        .is_err());
}

#[test]
fn load_balanced_description_ignores_updates() {
    let mut description = initialized_description("mongodb://a:27017/?loadBalanced=true");
    assert_eq!(description.topology_type, TopologyType::LoadBalanced);

    description
        .update(description_from_response(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "setName": "rs0", "maxWireVersion": 21 },
        ))
        .unwrap();

    // Monitoring never modifies a load-balanced topology.
    assert_eq!(description.topology_type, TopologyType::LoadBalanced);
    assert!(description.servers.contains_key(&server_address("a:27017")));
}

#[test]
fn replica_set_member_with_foreign_set_name_removed() {
    let mut description = initialized_description("mongodb://a:27017,b:27017/?replicaSet=rs0");

    description
        .update(description_from_response(
            "b:27017",
            doc! {
                "ok": 1,
                "secondary": true,
                "setName": "other",
                "hosts": ["b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .unwrap();

    assert!(!description.servers.contains_key(&server_address("b:27017")));
}

#[test]
fn topology_version_staleness_filter() {
    let mut description = initialized_description("mongodb://a:27017/?directConnection=true");

    let process_id = ObjectId::new();
    description
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "ismaster": true,
                "maxWireVersion": 21,
                "topologyVersion": { "processId": process_id, "counter": 2i64 },
            },
        ))
        .unwrap();

    // An older counter from the same process is discarded.
    description
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "ismaster": false,
                "secondary": true,
                "setName": "rs0",
                "maxWireVersion": 21,
                "topologyVersion": { "processId": process_id, "counter": 1i64 },
            },
        ))
        .unwrap();

    let sd = description
        .servers
        .get(&server_address("a:27017"))
        .unwrap();
    assert_eq!(sd.server_type, ServerType::Standalone);
}

async fn topology_with_disabled_monitoring(uri: &str) -> Topology {
    let mut options = options_for(uri);
    options.test_options_mut().disable_monitoring_threads = true;
    Topology::new(options).unwrap()
}

#[tokio::test]
async fn topology_worker_reconciles_server_set() {
    let topology = topology_with_disabled_monitoring("mongodb://a:27017/?replicaSet=rs0").await;
    let updater = topology.updater();

    let changed = updater
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "hosts": ["a:27017", "b:27017"],
                "maxWireVersion": 21,
            },
        ))
        .await;
    assert!(changed);

    let state = topology.watch().observe_latest();
    assert_eq!(
        state.description.topology_type,
        TopologyType::ReplicaSetWithPrimary
    );
    // A server handle (and hence a monitor slot and connection pool) exists for the
    // newly-discovered member.
    assert!(state.servers.contains_key(&server_address("b:27017")));
    assert!(state.servers.contains_key(&server_address("a:27017")));

    topology.shutdown().await;
    assert!(!topology.is_alive());
}

#[tokio::test]
async fn monitor_error_marks_server_unknown() {
    let topology = topology_with_disabled_monitoring("mongodb://a:27017/?replicaSet=rs0").await;
    let updater = topology.updater();

    updater
        .update(description_from_response(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "hosts": ["a:27017"],
                "maxWireVersion": 21,
            },
        ))
        .await;

    let changed = updater
        .handle_monitor_error(
            server_address("a:27017"),
            crate::error::Error::from(crate::error::ErrorKind::from(
                std::io::ErrorKind::ConnectionReset,
            )),
        )
        .await;
    assert!(changed);

    let state = topology.watch().observe_latest();
    let sd = state
        .description
        .get_server_description(&server_address("a:27017"))
        .unwrap();
    assert_eq!(sd.server_type, ServerType::Unknown);
    assert!(sd.reply.is_err());
    assert_eq!(
        state.description.topology_type,
        TopologyType::ReplicaSetNoPrimary
    );

    topology.shutdown().await;
}

#[tokio::test]
async fn server_selection_times_out_with_no_suitable_server() {
    let mut options = options_for("mongodb://a:27017/?replicaSet=rs0");
    options.test_options_mut().disable_monitoring_threads = true;
    options.server_selection_timeout = Some(Duration::from_millis(50));
    let topology = Topology::new(options).unwrap();

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let error = topology.select_server(&criteria).await.unwrap_err();
    assert!(matches!(
        *error.kind,
        crate::error::ErrorKind::ServerSelection { .. }
    ));
    assert_eq!(topology.metrics().server_selection_timeouts(), 1);

    topology.shutdown().await;
}

#[tokio::test]
async fn cluster_time_is_monotonic() {
    let topology = topology_with_disabled_monitoring("mongodb://a:27017").await;

    let older = crate::client::ClusterTime {
        cluster_time: bson::Timestamp {
            time: 100,
            increment: 1,
        },
        signature: doc! {},
    };
    let newer = crate::client::ClusterTime {
        cluster_time: bson::Timestamp {
            time: 100,
            increment: 2,
        },
        signature: doc! {},
    };

    topology.advance_cluster_time(newer.clone()).await;
    topology.advance_cluster_time(older).await;

    assert_eq!(topology.cluster_time(), Some(newer));

    topology.shutdown().await;
}
