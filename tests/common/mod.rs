//! Test harness: spawns a proxy over the embedded backend and drives the
//! wire protocol directly over a TCP socket.
#![allow(dead_code)]

use pgbridge::config::Config;
use pgbridge::server::ProxyServer;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_VERSION_3: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSS_ENC_REQUEST_CODE: i32 = 80877104;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

pub struct TestServer {
    pub port: u16,
    pub shutdown: CancellationToken,
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(|_| {}).await
}

pub async fn spawn_server_with<F>(mutate: F) -> TestServer
where
    F: FnOnce(&mut Config),
{
    let mut config = Config::for_embedded(":memory:");
    mutate(&mut config);
    let server = Arc::new(ProxyServer::new(config).expect("server should build"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    TestServer { port, shutdown }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn cstring_at(&self, offset: usize) -> String {
        let end = self.payload[offset..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| offset + p)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[offset..end]).into_owned()
    }

    pub fn i32_at(&self, offset: usize) -> i32 {
        i32::from_be_bytes(self.payload[offset..offset + 4].try_into().unwrap())
    }

    pub fn i16_at(&self, offset: usize) -> i16 {
        i16::from_be_bytes(self.payload[offset..offset + 2].try_into().unwrap())
    }

    /// Field value of an ErrorResponse/NoticeResponse packet.
    pub fn error_field(&self, field: u8) -> Option<String> {
        let mut i = 0;
        while i < self.payload.len() && self.payload[i] != 0 {
            let code = self.payload[i];
            let end = self.payload[i + 1..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| i + 1 + p)?;
            if code == field {
                return Some(String::from_utf8_lossy(&self.payload[i + 1..end]).into_owned());
            }
            i = end + 1;
        }
        None
    }

    /// Column values of a DataRow packet.
    pub fn data_row_values(&self) -> Vec<Option<Vec<u8>>> {
        let count = self.i16_at(0) as usize;
        let mut values = Vec::with_capacity(count);
        let mut offset = 2;
        for _ in 0..count {
            let len = self.i32_at(offset);
            offset += 4;
            if len == -1 {
                values.push(None);
            } else {
                values.push(Some(self.payload[offset..offset + len as usize].to_vec()));
                offset += len as usize;
            }
        }
        values
    }
}

pub struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    pub async fn connect(port: u16) -> RawClient {
        for _ in 0..50 {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    stream.set_nodelay(true).unwrap();
                    return RawClient { stream };
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        panic!("server did not come up on port {port}");
    }

    /// Connect and complete startup, returning the pre-ReadyForQuery
    /// message stream (auth, parameter status, key data).
    pub async fn connect_and_start(port: u16, user: &str, database: &str) -> (RawClient, Vec<WireMessage>) {
        let mut client = RawClient::connect(port).await;
        client.send_startup(user, database).await;
        let messages = client.read_until_ready().await;
        (client, messages)
    }

    pub async fn send_startup(&mut self, user: &str, database: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
        for (key, value) in [("user", user), ("database", database)] {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        self.send_raw_with_length(&body).await;
    }

    pub async fn send_special_request(&mut self, code: i32) {
        let mut body = Vec::new();
        body.extend_from_slice(&code.to_be_bytes());
        self.send_raw_with_length(&body).await;
    }

    pub async fn send_cancel_request(&mut self, process_id: i32, secret_key: i32) {
        let mut body = Vec::new();
        body.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        body.extend_from_slice(&process_id.to_be_bytes());
        body.extend_from_slice(&secret_key.to_be_bytes());
        self.send_raw_with_length(&body).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn send_raw_with_length(&mut self, body: &[u8]) {
        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        out.extend_from_slice(body);
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn send_message(&mut self, tag: u8, body: &[u8]) {
        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(tag);
        out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        out.extend_from_slice(body);
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn send_query(&mut self, sql: &str) {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.send_message(b'Q', &body).await;
    }

    pub async fn send_password(&mut self, password: &str) {
        let mut body = password.as_bytes().to_vec();
        body.push(0);
        self.send_message(b'p', &body).await;
    }

    pub async fn send_parse(&mut self, name: &str, sql: &str, param_oids: &[i32]) {
        let mut body = Vec::new();
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(sql.as_bytes());
        body.push(0);
        body.extend_from_slice(&(param_oids.len() as i16).to_be_bytes());
        for oid in param_oids {
            body.extend_from_slice(&oid.to_be_bytes());
        }
        self.send_message(b'P', &body).await;
    }

    pub async fn send_bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[i16],
        params: &[Option<Vec<u8>>],
        result_formats: &[i16],
    ) {
        let mut body = Vec::new();
        body.extend_from_slice(portal.as_bytes());
        body.push(0);
        body.extend_from_slice(statement.as_bytes());
        body.push(0);
        body.extend_from_slice(&(param_formats.len() as i16).to_be_bytes());
        for format in param_formats {
            body.extend_from_slice(&format.to_be_bytes());
        }
        body.extend_from_slice(&(params.len() as i16).to_be_bytes());
        for param in params {
            match param {
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(bytes) => {
                    body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    body.extend_from_slice(bytes);
                }
            }
        }
        body.extend_from_slice(&(result_formats.len() as i16).to_be_bytes());
        for format in result_formats {
            body.extend_from_slice(&format.to_be_bytes());
        }
        self.send_message(b'B', &body).await;
    }

    pub async fn send_describe(&mut self, typ: u8, name: &str) {
        let mut body = vec![typ];
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        self.send_message(b'D', &body).await;
    }

    pub async fn send_execute(&mut self, portal: &str, max_rows: i32) {
        let mut body = Vec::new();
        body.extend_from_slice(portal.as_bytes());
        body.push(0);
        body.extend_from_slice(&max_rows.to_be_bytes());
        self.send_message(b'E', &body).await;
    }

    pub async fn send_close(&mut self, typ: u8, name: &str) {
        let mut body = vec![typ];
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        self.send_message(b'C', &body).await;
    }

    pub async fn send_sync(&mut self) {
        self.send_message(b'S', &[]).await;
    }

    pub async fn send_terminate(&mut self) {
        self.send_message(b'X', &[]).await;
    }

    pub async fn read_message(&mut self) -> WireMessage {
        let tag = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap();
        let mut payload = vec![0u8; len as usize - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        WireMessage { tag, payload }
    }

    pub async fn read_byte(&mut self) -> u8 {
        self.stream.read_u8().await.unwrap()
    }

    /// Read messages through the next ReadyForQuery, inclusive.
    pub async fn read_until_ready(&mut self) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.read_message().await;
            let done = message.tag == b'Z';
            messages.push(message);
            if done {
                return messages;
            }
        }
    }
}

pub fn tags(messages: &[WireMessage]) -> Vec<u8> {
    messages.iter().map(|m| m.tag).collect()
}

pub fn find<'a>(messages: &'a [WireMessage], tag: u8) -> Option<&'a WireMessage> {
    messages.iter().find(|m| m.tag == tag)
}

pub fn backend_key(messages: &[WireMessage]) -> (i32, i32) {
    let key = find(messages, b'K').expect("BackendKeyData expected");
    (key.i32_at(0), key.i32_at(4))
}
