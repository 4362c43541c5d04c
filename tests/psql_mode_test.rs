mod common;

use common::*;

fn write_manifest(name: &str, content: &str) -> String {
    let path = std::env::temp_dir().join(format!("pgbridge_{}_{}.json", name, uuid::Uuid::new_v4()));
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn meta_command_is_translated_and_executed() {
    let manifest = write_manifest(
        "commands",
        r#"{"commands":[{
            "input_pattern": "^\\\\d (.+)$",
            "output_pattern": "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '%s'",
            "matcher_array": ["1"]
        }]}"#,
    );
    let server = spawn_server_with(|config| {
        config.psql_mode = true;
        config.command_metadata_file = Some(manifest.clone());
    })
    .await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE users (id INTEGER PRIMARY KEY)")
        .await;
    client.read_until_ready().await;

    client.send_query("\\d users").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'C', b'Z']);
    assert_eq!(
        messages[1].data_row_values(),
        vec![Some(b"users".to_vec())]
    );
}

#[tokio::test]
async fn meta_commands_off_without_psql_mode() {
    let server = spawn_server().await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    // Without psql mode the backslash command reaches the backend raw and
    // fails there.
    client.send_query("\\d users").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'E', b'Z']);
}

#[tokio::test]
async fn query_rewrites_apply_in_declared_order() {
    let rewrites = write_manifest(
        "rewrites",
        r#"[
            {"input_pattern": "\\bmagic_table\\b", "output_pattern": "users"},
            {"input_pattern": "(?i)\\bNOW\\(\\)", "output_pattern": "datetime('now')"}
        ]"#,
    );
    let server = spawn_server_with(|config| {
        config.query_rewrites_file = Some(rewrites.clone());
    })
    .await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE users (id INTEGER); INSERT INTO users VALUES (7)")
        .await;
    client.read_until_ready().await;

    client.send_query("SELECT id FROM magic_table").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'C', b'Z']);
    assert_eq!(messages[1].data_row_values(), vec![Some(b"7".to_vec())]);

    client.send_query("SELECT NOW()").await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'T', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn rewrites_also_cover_extended_statements() {
    let rewrites = write_manifest(
        "rewrites_ext",
        r#"[{"input_pattern": "\\bmagic_table\\b", "output_pattern": "users"}]"#,
    );
    let server = spawn_server_with(|config| {
        config.query_rewrites_file = Some(rewrites.clone());
    })
    .await;
    let (mut client, _) = RawClient::connect_and_start(server.port, "u", "d").await;

    client
        .send_query("CREATE TABLE users (id INTEGER); INSERT INTO users VALUES (3)")
        .await;
    client.read_until_ready().await;

    client
        .send_parse("", "SELECT id FROM magic_table WHERE id = $1::int8", &[])
        .await;
    client
        .send_bind("", "", &[], &[Some(b"3".to_vec())], &[])
        .await;
    client.send_execute("", 0).await;
    client.send_sync().await;
    let messages = client.read_until_ready().await;
    assert_eq!(tags(&messages), vec![b'1', b'2', b'D', b'C', b'Z']);
    assert_eq!(messages[2].data_row_values(), vec![Some(b"3".to_vec())]);
}

#[tokio::test]
async fn malformed_rewrites_file_fails_startup() {
    let rewrites = write_manifest("broken", "{not json");
    let mut config = pgbridge::config::Config::for_embedded(":memory:");
    config.query_rewrites_file = Some(rewrites);
    assert!(pgbridge::server::ProxyServer::new(config).is_err());
}

#[tokio::test]
async fn missing_command_manifest_is_tolerated() {
    let mut config = pgbridge::config::Config::for_embedded(":memory:");
    config.psql_mode = true;
    config.command_metadata_file = Some("/nonexistent/commands.json".to_string());
    // The original proxy warns and keeps going with an empty command set.
    assert!(pgbridge::server::ProxyServer::new(config).is_ok());
}
