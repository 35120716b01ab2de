use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use bookd::engine::Engine;
use bookd::service::BookingService;
use bookd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("bookd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("bookd.wal")).unwrap());
    let service = Arc::new(BookingService::new(engine));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("bookd")
        .user("bookd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn sqlstate(e: &tokio_postgres::Error) -> String {
    e.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("not a database error: {e}"))
}

const INSERT: &str = r#"INSERT INTO reservations (resource_id, start, "end") VALUES ($1, $2, $3)"#;
const LIST: &str = "SELECT * FROM reservations WHERE resource_id = $1";
const CANCEL: &str = "DELETE FROM reservations WHERE id = $1";

async fn create(
    client: &tokio_postgres::Client,
    resource: &str,
    start: &str,
    end: &str,
) -> Result<String, tokio_postgres::Error> {
    let rows = client.query(INSERT, &[&resource, &start, &end]).await?;
    assert_eq!(rows.len(), 1);
    Ok(rows[0].get::<_, String>("id"))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_returns_reservation_row() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let rows = client
        .query(
            INSERT,
            &[&"RoomA", &"2099-01-20T10:00:00Z", &"2099-01-20T11:00:00+00:00"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    let id: String = row.get("id");
    assert!(Ulid::from_string(&id).is_ok());
    assert_eq!(row.get::<_, String>("resource_id"), "RoomA");
    assert_eq!(row.get::<_, String>("start"), "2099-01-20T10:00:00.000Z");
    assert_eq!(row.get::<_, String>("end"), "2099-01-20T11:00:00.000Z");
}

#[tokio::test]
async fn overlap_conflicts_and_other_room_is_independent() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    create(&client, "RoomA", "2099-01-20T10:00:00Z", "2099-01-20T11:00:00Z")
        .await
        .unwrap();

    let err = create(&client, "RoomA", "2099-01-20T10:30:00Z", "2099-01-20T10:45:00Z")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // Touching is not overlapping.
    create(&client, "RoomA", "2099-01-20T11:00:00Z", "2099-01-20T12:00:00Z")
        .await
        .unwrap();
    create(&client, "RoomB", "2099-01-20T10:30:00Z", "2099-01-20T10:45:00Z")
        .await
        .unwrap();

    let rows = client.query(LIST, &[&"RoomA"]).await.unwrap();
    let starts: Vec<String> = rows.iter().map(|r| r.get("start")).collect();
    assert_eq!(
        starts,
        vec!["2099-01-20T10:00:00.000Z", "2099-01-20T11:00:00.000Z"]
    );
    assert_eq!(client.query(LIST, &[&"RoomB"]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_frees_slot_and_second_cancel_is_not_found() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create(&client, "RoomA", "2099-02-01T09:00:00Z", "2099-02-01T10:00:00Z")
        .await
        .unwrap();

    assert_eq!(client.execute(CANCEL, &[&id]).await.unwrap(), 1);
    let err = client.execute(CANCEL, &[&id]).await.unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    assert!(client.query(LIST, &[&"RoomA"]).await.unwrap().is_empty());
    create(&client, "RoomA", "2099-02-01T09:00:00Z", "2099-02-01T10:00:00Z")
        .await
        .unwrap();
}

#[tokio::test]
async fn validation_errors_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let ambiguous = create(&client, "RoomA", "2099-01-20T10:00:00", "2099-01-20T11:00:00Z")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&ambiguous), "22007");

    let inverted = create(&client, "RoomA", "2099-01-20T11:00:00Z", "2099-01-20T10:00:00Z")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&inverted), "22023");

    let past = create(&client, "RoomA", "2000-01-20T10:00:00Z", "2000-01-20T11:00:00Z")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&past), "22008");

    // Nothing was stored.
    assert!(client.query(LIST, &[&"RoomA"]).await.unwrap().is_empty());
}

#[tokio::test]
async fn simple_protocol_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query(
            r#"INSERT INTO reservations (resource_id, start, "end") VALUES ('Desk7', '2099-03-01T08:00:00Z', '2099-03-01T09:00:00Z')"#,
        )
        .await
        .unwrap();

    let err = client
        .simple_query("SELECT * FROM reservations")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let rows = client
        .query("SELECT * FROM reservations WHERE resource_id = 'Desk7'", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, String>("resource_id"), "Desk7");
}

#[tokio::test]
async fn minute_precision_and_compact_offsets_are_accepted() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create(&client, "RoomC", "2099-01-20T10:00Z", "2099-01-20T12:00+0100")
        .await
        .unwrap();
    let rows = client.query(LIST, &[&"RoomC"]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, String>("id"), id);
    assert_eq!(rows[0].get::<_, String>("start"), "2099-01-20T10:00:00.000Z");
    assert_eq!(rows[0].get::<_, String>("end"), "2099-01-20T11:00:00.000Z");

    let overlapping = create(&client, "RoomC", "2099-01-20T10:30+00", "2099-01-20T10:45+00")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&overlapping), "23P01");

    let floating = create(&client, "RoomC", "2099-01-20T12:00", "2099-01-20T13:00Z")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&floating), "22007");
}
