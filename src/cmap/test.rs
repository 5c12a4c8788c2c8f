use bson::{doc, oid::ObjectId, Document};
use tokio::io::DuplexStream;

use super::{
    conn::{wire::Message, ConnectionGeneration},
    Command,
    Connection,
    PoolGeneration,
};
use crate::options::ServerAddress;

/// Reads one message from the mock server's half of the stream and writes `reply` back,
/// echoing the request id so the reply is routed correctly.
async fn respond_once(stream: &mut DuplexStream, reply: Document) {
    let request = Message::read_from(stream).await.unwrap();
    let mut response = Message::with_command(
        Command::new("reply", "admin", reply),
        Some(0),
    );
    response.response_to = request.request_id.unwrap_or(0);
    response.write_to(stream).await.unwrap();
}

fn mock_connection() -> (Connection, DuplexStream) {
    let (client, server) = tokio::io::duplex(8 * 1024);
    (
        Connection::new_mock(ServerAddress::default(), client),
        server,
    )
}

#[tokio::test]
async fn send_command_round_trip() {
    let (mut conn, mut server) = mock_connection();

    let server_task = tokio::spawn(async move {
        respond_once(&mut server, doc! { "ok": 1, "n": 5 }).await;
        server
    });

    let response = conn
        .send_command(Command::new("count", "db", doc! { "count": "coll" }))
        .await
        .unwrap();
    response.validate().unwrap();
    assert_eq!(response.body().get_i32("n").unwrap(), 5);

    server_task.await.unwrap();
}

#[tokio::test]
async fn failed_command_surfaces_error_code() {
    let (mut conn, mut server) = mock_connection();

    let server_task = tokio::spawn(async move {
        respond_once(
            &mut server,
            doc! { "ok": 0, "code": 11600, "codeName": "InterruptedAtShutdown", "errmsg": "bye" },
        )
        .await;
    });

    let response = conn
        .send_command(Command::new("ping", "admin", doc! { "ping": 1 }))
        .await
        .unwrap();
    let error = response.validate().unwrap_err();
    assert!(error.is_shutting_down());
    assert!(error.is_read_retryable());

    server_task.await.unwrap();
}

#[tokio::test]
async fn network_error_marks_connection_errored() {
    let (mut conn, server) = mock_connection();

    // Dropping the server half severs the stream mid-operation.
    drop(server);

    let result = conn
        .send_command(Command::new("ping", "admin", doc! { "ping": 1 }))
        .await;
    assert!(result.is_err());
    assert!(conn.has_errored());
}

#[tokio::test]
async fn more_to_come_enables_streaming_reads() {
    let (mut conn, mut server) = mock_connection();

    let server_task = tokio::spawn(async move {
        use super::conn::wire::MessageFlags;

        let request = Message::read_from(&mut server).await.unwrap();

        // First reply promises more.
        let mut first = Message::with_command(
            Command::new("reply", "admin", doc! { "ok": 1, "seq": 1 }),
            Some(0),
        );
        first.response_to = request.request_id.unwrap_or(0);
        first.flags |= MessageFlags::MORE_TO_COME;
        first.write_to(&mut server).await.unwrap();

        // Second reply arrives with no further request.
        let mut second = Message::with_command(
            Command::new("reply", "admin", doc! { "ok": 1, "seq": 2 }),
            Some(0),
        );
        second.response_to = request.request_id.unwrap_or(0);
        second.write_to(&mut server).await.unwrap();
    });

    let first = conn
        .send_command(Command::new("hello", "admin", doc! { "hello": 1 }))
        .await
        .unwrap();
    assert_eq!(first.body().get_i32("seq").unwrap(), 1);
    assert!(conn.is_streaming());

    let second = conn.receive_message().await.unwrap();
    assert_eq!(second.body().get_i32("seq").unwrap(), 2);
    assert!(!conn.is_streaming());

    server_task.await.unwrap();
}

// Streams carry the generation observed at creation; once the pool's generation moves past
// it, the connection is stale and must not be reused.
#[test]
fn generation_staleness() {
    let old = ConnectionGeneration::Normal(1);
    assert!(!old.is_stale(&PoolGeneration::Normal(1)));
    assert!(old.is_stale(&PoolGeneration::Normal(2)));

    // Monitoring connections are never pooled and so are exempt.
    assert!(!ConnectionGeneration::Monitoring.is_stale(&PoolGeneration::Normal(99)));
}

#[test]
fn load_balanced_generations_tracked_per_service() {
    let service_a = ObjectId::new();
    let service_b = ObjectId::new();

    let mut gen_map = std::collections::HashMap::new();
    gen_map.insert(service_a, 3u32);
    gen_map.insert(service_b, 0u32);
    let pool_gen = PoolGeneration::LoadBalanced(gen_map);

    let conn_a = ConnectionGeneration::LoadBalanced {
        generation: 2,
        service_id: Some(service_a),
    };
    let conn_b = ConnectionGeneration::LoadBalanced {
        generation: 0,
        service_id: Some(service_b),
    };

    // Only the service whose generation was bumped sees its connections go stale.
    assert!(conn_a.is_stale(&pool_gen));
    assert!(!conn_b.is_stale(&pool_gen));
}
