mod common;

use common::*;

#[tokio::test]
async fn startup_handshake_and_select_one() {
    let server = spawn_server().await;
    let (mut client, startup) = RawClient::connect_and_start(server.port, "alice", "db1").await;

    // R (auth ok), S* (parameters), K (key data), Z (idle).
    assert_eq!(startup[0].tag, b'R');
    assert_eq!(startup[0].i32_at(0), 0);
    assert!(startup.iter().any(|m| m.tag == b'S'));
    let (pid, _secret) = backend_key(&startup);
    assert!(pid > 0);
    let ready = startup.last().unwrap();
    assert_eq!(ready.tag, b'Z');
    assert_eq!(ready.payload, b"I");

    client.send_query("SELECT 1;").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'C', b'Z']);

    let row_description = &messages[0];
    assert_eq!(row_description.i16_at(0), 1);
    assert_eq!(row_description.cstring_at(2), "?column?");
    // table oid (4) + column id (2) follow the name; then the type oid.
    let type_oid_offset = 2 + "?column?".len() + 1 + 4 + 2;
    assert_eq!(row_description.i32_at(type_oid_offset), 20);

    assert_eq!(
        messages[1].data_row_values(),
        vec![Some(b"1".to_vec())]
    );
    assert_eq!(messages[2].cstring_at(0), "SELECT 1");
    assert_eq!(messages[3].payload, b"I");

    client.send_terminate().await;
}

#[tokio::test]
async fn empty_query_gets_empty_response() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client.send_query("").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'I', b'Z']);

    client.send_query("   ;  ; ").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'I', b'Z']);
}

#[tokio::test]
async fn ddl_dml_and_select_tags() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
        .await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'C', b'Z']);
    assert_eq!(messages[0].cstring_at(0), "CREATE TABLE");

    client
        .send_query("INSERT INTO users (id, name) VALUES (1, 'ann'), (2, 'bob')")
        .await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].cstring_at(0), "INSERT 0 2");

    client.send_query("SELECT id, name FROM users ORDER BY id").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'D', b'C', b'Z']);
    assert_eq!(
        messages[1].data_row_values(),
        vec![Some(b"1".to_vec()), Some(b"ann".to_vec())]
    );
    assert_eq!(messages[3].cstring_at(0), "SELECT 2");

    client.send_query("UPDATE users SET name = 'al' WHERE id = 1").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].cstring_at(0), "UPDATE 1");

    client.send_query("DELETE FROM users").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].cstring_at(0), "DELETE 2");
}

#[tokio::test]
async fn zero_row_select_still_describes() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE empty_t (id INTEGER); SELECT id FROM empty_t")
        .await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'C', b'T', b'C', b'Z']);
    assert_eq!(messages[2].cstring_at(0), "SELECT 0");
}

#[tokio::test]
async fn multi_statement_batch_sends_one_ready() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1); SELECT id FROM t")
        .await;
    let messages = client.read_until_ready().await;
    assert_eq!(
        tags(&messages),
        vec![b'C', b'C', b'T', b'D', b'C', b'Z']
    );
}

#[tokio::test]
async fn error_aborts_rest_of_batch() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE t (id INTEGER); SELECT nope FROM missing; INSERT INTO t VALUES (1)")
        .await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'C', b'E', b'Z']);

    // The insert after the failing statement must not have run.
    client.send_query("SELECT count(*) FROM t").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[1].data_row_values(), vec![Some(b"0".to_vec())]);
}

#[tokio::test]
async fn session_survives_statement_error() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client.send_query("SELECT broken FROM nowhere").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'E', b'Z']);
    assert_eq!(messages[1].payload, b"I");

    client.send_query("SELECT 1").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn transaction_status_byte_follows_backend() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client.send_query("BEGIN").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].cstring_at(0), "BEGIN");
    assert_eq!(messages.last().unwrap().payload, b"T");

    client.send_query("SELECT broken FROM nowhere").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages.last().unwrap().payload, b"E");

    client.send_query("ROLLBACK").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages.last().unwrap().payload, b"I");
}

#[tokio::test]
async fn set_and_show_are_session_local() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client.send_query("SET application_name = 'my_app'").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'C', b'Z']);
    assert_eq!(messages[0].cstring_at(0), "SET");

    client.send_query("SHOW application_name").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'C', b'Z']);
    assert_eq!(
        messages[1].data_row_values(),
        vec![Some(b"my_app".to_vec())]
    );

    client.send_query("SHOW TimeZone").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[1].data_row_values(), vec![Some(b"UTC".to_vec())]);
}

#[tokio::test]
async fn unknown_show_parameter_errors() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client.send_query("SHOW no_such_parameter").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'E', b'Z']);
    assert_eq!(
        messages[0].error_field(b'C').as_deref(),
        Some("42704")
    );
}
