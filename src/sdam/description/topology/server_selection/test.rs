use std::{collections::HashMap, time::Duration};

use bson::{doc, DateTime, Document};
use pretty_assertions::assert_eq;

use crate::{
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::description::{
        server::{ServerDescription, ServerType},
        topology::TopologyDescription,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

fn server_address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn tag_set(pairs: &[(&str, &str)]) -> TagSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct TestServer {
    address: &'static str,
    response: Document,
    round_trip_time: Duration,
}

impl TestServer {
    fn primary(address: &'static str, rtt_ms: u64) -> Self {
        Self {
            address,
            response: doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs0",
                "maxWireVersion": 21,
                "lastWrite": { "lastWriteDate": DateTime::now() },
            },
            round_trip_time: Duration::from_millis(rtt_ms),
        }
    }

    fn secondary(address: &'static str, rtt_ms: u64, tags: Option<Document>) -> Self {
        let mut response = doc! {
            "ok": 1,
            "secondary": true,
            "setName": "rs0",
            "maxWireVersion": 21,
            "lastWrite": { "lastWriteDate": DateTime::now() },
        };
        if let Some(tags) = tags {
            response.insert("tags", tags);
        }
        Self {
            address,
            response,
            round_trip_time: Duration::from_millis(rtt_ms),
        }
    }
}

fn topology_with(servers: Vec<TestServer>) -> TopologyDescription {
    let hosts: Vec<String> = servers.iter().map(|s| s.address.to_string()).collect();
    let uri = format!("mongodb://{}/?replicaSet=rs0", hosts.join(","));
    let options = ClientOptions::parse_without_srv_resolution(&uri).unwrap();

    let mut description = TopologyDescription::default();
    description.initialize(&options);

    for server in servers {
        let address = server_address(server.address);
        let command_response: HelloCommandResponse =
            bson::from_document(server.response.clone()).unwrap();
        let reply = HelloReply {
            server_address: address.clone(),
            command_response,
            raw_command_response: server.response,
            cluster_time: None,
        };
        description
            .update(ServerDescription::new_from_hello_reply(
                address,
                reply,
                server.round_trip_time,
            ))
            .unwrap();
    }

    description
}

fn selected_addresses(
    description: &TopologyDescription,
    read_preference: ReadPreference,
) -> Vec<ServerAddress> {
    let criteria = SelectionCriteria::ReadPreference(read_preference);
    let mut addresses: Vec<_> = description
        .suitable_servers_in_latency_window(&criteria)
        .unwrap()
        .into_iter()
        .map(|sd| sd.address.clone())
        .collect();
    addresses.sort_by_key(|a| a.to_string());
    addresses
}

#[test]
fn primary_mode_selects_only_primary() {
    let description = topology_with(vec![
        TestServer::primary("a:27017", 5),
        TestServer::secondary("b:27017", 5, None),
    ]);

    assert_eq!(
        selected_addresses(&description, ReadPreference::Primary),
        vec![server_address("a:27017")]
    );
}

#[test]
fn secondary_mode_excludes_primary() {
    let description = topology_with(vec![
        TestServer::primary("a:27017", 5),
        TestServer::secondary("b:27017", 5, None),
        TestServer::secondary("c:27017", 5, None),
    ]);

    assert_eq!(
        selected_addresses(
            &description,
            ReadPreference::Secondary {
                tag_sets: None,
                max_staleness: None
            }
        ),
        vec![server_address("b:27017"), server_address("c:27017")]
    );
}

#[test]
fn primary_preferred_falls_back_to_secondaries() {
    let description = topology_with(vec![
        TestServer::secondary("b:27017", 5, None),
        TestServer::secondary("c:27017", 5, None),
    ]);

    assert_eq!(
        selected_addresses(
            &description,
            ReadPreference::PrimaryPreferred {
                tag_sets: None,
                max_staleness: None
            }
        ),
        vec![server_address("b:27017"), server_address("c:27017")]
    );
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let description = topology_with(vec![TestServer::primary("a:27017", 5)]);

    assert_eq!(
        selected_addresses(
            &description,
            ReadPreference::SecondaryPreferred {
                tag_sets: None,
                max_staleness: None
            }
        ),
        vec![server_address("a:27017")]
    );
}

#[test]
fn nearest_includes_all_data_bearing_members() {
    let description = topology_with(vec![
        TestServer::primary("a:27017", 5),
        TestServer::secondary("b:27017", 5, None),
    ]);

    assert_eq!(
        selected_addresses(
            &description,
            ReadPreference::Nearest {
                tag_sets: None,
                max_staleness: None
            }
        ),
        vec![server_address("a:27017"), server_address("b:27017")]
    );
}

// Ordered tag sets: the first set matching any server is used; an empty set matches all.
#[test]
fn tag_sets_applied_in_order_with_empty_fallback() {
    let description = topology_with(vec![
        TestServer::secondary("s1:27017", 5, Some(doc! { "dc": "east" })),
        TestServer::secondary("s2:27017", 5, Some(doc! { "dc": "west" })),
    ]);

    let read_pref = |tag_sets| ReadPreference::Secondary {
        tag_sets: Some(tag_sets),
        max_staleness: None,
    };

    // {dc: east} matches s1, so the empty fallback set is never consulted.
    assert_eq!(
        selected_addresses(
            &description,
            read_pref(vec![tag_set(&[("dc", "east")]), tag_set(&[])])
        ),
        vec![server_address("s1:27017")]
    );

    // With s1 gone, {dc: east} matches nothing and the empty set matches everything left.
    let description = topology_with(vec![TestServer::secondary(
        "s2:27017",
        5,
        Some(doc! { "dc": "west" }),
    )]);
    assert_eq!(
        selected_addresses(
            &description,
            read_pref(vec![tag_set(&[("dc", "east")]), tag_set(&[])])
        ),
        vec![server_address("s2:27017")]
    );

    // No matching set and no fallback yields nothing.
    assert_eq!(
        selected_addresses(&description, read_pref(vec![tag_set(&[("dc", "east")])])),
        vec![]
    );
}

#[test]
fn tag_set_requires_all_pairs() {
    let description = topology_with(vec![
        TestServer::secondary("s1:27017", 5, Some(doc! { "dc": "east", "rack": "1" })),
        TestServer::secondary("s2:27017", 5, Some(doc! { "dc": "east" })),
    ]);

    let read_pref = ReadPreference::Secondary {
        tag_sets: Some(vec![tag_set(&[("dc", "east"), ("rack", "1")])]),
        max_staleness: None,
    };

    assert_eq!(
        selected_addresses(&description, read_pref),
        vec![server_address("s1:27017")]
    );
}

// The latency window: only servers within localThresholdMS of the fastest eligible server
// survive.
#[test]
fn latency_window_filters_slow_servers() {
    let mut description = topology_with(vec![
        TestServer::secondary("fast:27017", 5, None),
        TestServer::secondary("medium:27017", 10, None),
        TestServer::secondary("slow:27017", 100, None),
    ]);
    description.local_threshold = Some(Duration::from_millis(8));

    assert_eq!(
        selected_addresses(
            &description,
            ReadPreference::Secondary {
                tag_sets: None,
                max_staleness: None
            }
        ),
        vec![server_address("fast:27017"), server_address("medium:27017")]
    );

    // A zero threshold admits only the fastest server.
    description.local_threshold = Some(Duration::from_millis(0));
    assert_eq!(
        selected_addresses(
            &description,
            ReadPreference::Secondary {
                tag_sets: None,
                max_staleness: None
            }
        ),
        vec![server_address("fast:27017")]
    );
}

#[test]
fn max_staleness_below_floor_rejected() {
    let description = topology_with(vec![
        TestServer::primary("a:27017", 5),
        TestServer::secondary("b:27017", 5, None),
    ]);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        tag_sets: None,
        max_staleness: Some(Duration::from_secs(15)),
    });

    // 15s is below both the 90s floor and heartbeatFrequency + idle write period.
    assert!(description
        .suitable_servers_in_latency_window(&criteria)
        .is_err());
}

#[test]
fn max_staleness_filters_lagging_secondaries() {
    let lagging_response = doc! {
        "ok": 1,
        "secondary": true,
        "setName": "rs0",
        "maxWireVersion": 21,
        "lastWrite": {
            "lastWriteDate": DateTime::from_millis(DateTime::now().timestamp_millis() - 400_000)
        },
    };

    let mut lagging = TestServer::secondary("lagging:27017", 5, None);
    lagging.response = lagging_response;

    let description = topology_with(vec![
        TestServer::primary("a:27017", 5),
        TestServer::secondary("fresh:27017", 5, None),
        lagging,
    ]);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        tag_sets: None,
        max_staleness: Some(Duration::from_secs(120)),
    });

    let mut addresses: Vec<_> = description
        .suitable_servers_in_latency_window(&criteria)
        .unwrap()
        .into_iter()
        .map(|sd| sd.address.clone())
        .collect();
    addresses.sort_by_key(|a| a.to_string());

    assert_eq!(addresses, vec![server_address("fresh:27017")]);
}

#[test]
fn unknown_servers_are_never_suitable() {
    let options = ClientOptions::parse_without_srv_resolution(
        "mongodb://a:27017,b:27017/?replicaSet=rs0",
    )
    .unwrap();
    let mut description = TopologyDescription::default();
    description.initialize(&options);

    // No hello replies have arrived yet, so no server is eligible for any preference.
    for read_pref in [
        ReadPreference::Primary,
        ReadPreference::Nearest {
            tag_sets: None,
            max_staleness: None,
        },
    ] {
        assert!(selected_addresses(&description, read_pref).is_empty());
    }
}

#[test]
fn sharded_topology_selects_mongos_within_window() {
    let options =
        ClientOptions::parse_without_srv_resolution("mongodb://a:27017,b:27017").unwrap();
    let mut description = TopologyDescription::default();
    description.initialize(&options);

    for (address, rtt) in [("a:27017", 5u64), ("b:27017", 50u64)] {
        let response = doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid", "maxWireVersion": 21 };
        let command_response: HelloCommandResponse =
            bson::from_document(response.clone()).unwrap();
        let reply = HelloReply {
            server_address: server_address(address),
            command_response,
            raw_command_response: response,
            cluster_time: None,
        };
        description
            .update(ServerDescription::new_from_hello_reply(
                server_address(address),
                reply,
                Duration::from_millis(rtt),
            ))
            .unwrap();
    }

    assert_eq!(description.servers.len(), 2);
    assert_eq!(
        selected_addresses(&description, ReadPreference::Primary),
        vec![server_address("a:27017")]
    );
}

#[test]
fn selection_does_not_retain_references() {
    // Selected descriptions are snapshots: mutating the topology afterwards does not
    // affect a previously-computed selection result.
    let description = topology_with(vec![TestServer::primary("a:27017", 5)]);
    let selected: Vec<ServerDescription> = description
        .suitable_servers_in_latency_window(&SelectionCriteria::ReadPreference(
            ReadPreference::Primary,
        ))
        .unwrap()
        .into_iter()
        .cloned()
        .collect();

    let mut mutated = description.clone();
    mutated.servers = HashMap::new();

    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].server_type, ServerType::RsPrimary);
}
