//! Line-delimited JSON-RPC 2.0 client for Electrum servers.
//!
//! A dedicated reader task owns the socket's read half and dispatches
//! responses to per-id oneshot channels; writes serialize one full JSON line
//! at a time behind a mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::{Balance, HistoryItem, Indexer, UnspentOutput};
use crate::error::WalletError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CLIENT_NAME: &str = "btc-wallet";
const PROTOCOL_VERSION: &str = "1.4";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<RpcResponse>>,
    closed: bool,
}

/// Removes the pending entry when a call completes, times out or is
/// cancelled, so the reader never delivers into a dead channel.
struct PendingGuard<'a> {
    pending: &'a StdMutex<PendingState>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.pending.lock() {
            state.waiters.remove(&self.id);
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ElectrumClient {
    url: String,
    writer: TokioMutex<BoxedWriter>,
    pending: Arc<StdMutex<PendingState>>,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl ElectrumClient {
    /// Dial an Electrum server and negotiate the protocol version.
    /// URL schemes: `ssl://host:port` (default when no scheme) or
    /// `tcp://host:port` for plaintext.
    pub async fn connect(url: &str) -> Result<Arc<Self>, WalletError> {
        let (use_tls, host, port) = parse_url(url)?;
        let addr = format!("{}:{}", host, port);

        let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| WalletError::Network(format!("connection to {} timed out", addr)))?
            .map_err(|e| {
                WalletError::Network(format!("failed to connect to Electrum server: {}", e))
            })?;

        let (reader, writer): (BoxedReader, BoxedWriter) = if use_tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));

            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| WalletError::Network(format!("invalid server name {}: {}", host, e)))?;

            let stream = timeout(DIAL_TIMEOUT, connector.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    WalletError::Network(format!("TLS handshake with {} timed out", addr))
                })?
                .map_err(|e| WalletError::Network(format!("TLS handshake failed: {}", e)))?;

            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tcp.into_split();
            (Box::new(r), Box::new(w))
        };

        let pending = Arc::new(StdMutex::new(PendingState {
            waiters: HashMap::new(),
            closed: false,
        }));

        let reader_task = tokio::spawn(read_responses(reader, Arc::clone(&pending)));

        let client = Arc::new(Self {
            url: url.to_string(),
            writer: TokioMutex::new(writer),
            pending,
            next_id: AtomicU64::new(0),
            reader_task,
        });

        if let Err(e) = client.negotiate_version().await {
            client.close();
            return Err(e);
        }

        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn negotiate_version(&self) -> Result<(), WalletError> {
        let result = self
            .call("server.version", vec![json!(CLIENT_NAME), json!(PROTOCOL_VERSION)])
            .await
            .map_err(|e| WalletError::Network(format!("version negotiation failed: {}", e)))?;

        serde_json::from_value::<Vec<String>>(result)
            .map_err(|e| WalletError::Protocol(format!("failed to parse version response: {}", e)))?;
        Ok(())
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, WalletError> {
        {
            let state = self.pending.lock().unwrap();
            if state.closed {
                return Err(WalletError::Network("client is closed".to_string()));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().unwrap().waiters.insert(id, sender);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut data = serde_json::to_vec(&request)
            .map_err(|e| WalletError::Protocol(format!("failed to encode request: {}", e)))?;
        data.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(&data)
                .await
                .map_err(|e| WalletError::Network(format!("failed to send request: {}", e)))?;
            writer
                .flush()
                .await
                .map_err(|e| WalletError::Network(format!("failed to send request: {}", e)))?;
        }

        let response = match timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(WalletError::Network("connection closed".to_string())),
            Err(_) => return Err(WalletError::Network("request timeout".to_string())),
        };

        if let Some(error) = response.error {
            return Err(WalletError::Protocol(format!(
                "electrum error {}: {}",
                error.code, error.message
            )));
        }

        Ok(response.result)
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, WalletError> {
        serde_json::from_value(value)
            .map_err(|e| WalletError::Protocol(format!("failed to parse {}: {}", what, e)))
    }
}

impl Drop for ElectrumClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl Indexer for ElectrumClient {
    async fn get_balance(&self, scripthash: &str) -> Result<Balance, WalletError> {
        let result = self
            .call("blockchain.scripthash.get_balance", vec![json!(scripthash)])
            .await?;
        Self::parse(result, "balance")
    }

    async fn list_unspent(&self, scripthash: &str) -> Result<Vec<UnspentOutput>, WalletError> {
        let result = self
            .call("blockchain.scripthash.listunspent", vec![json!(scripthash)])
            .await?;
        Self::parse(result, "unspent outputs")
    }

    async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryItem>, WalletError> {
        let result = self
            .call("blockchain.scripthash.get_history", vec![json!(scripthash)])
            .await?;
        Self::parse(result, "history")
    }

    async fn subscribe(&self, scripthash: &str) -> Result<Option<String>, WalletError> {
        let result = self
            .call("blockchain.scripthash.subscribe", vec![json!(scripthash)])
            .await?;
        // Status is null when the address has no transaction history.
        if result.is_null() {
            return Ok(None);
        }
        Self::parse(result, "subscribe status")
    }

    async fn get_transaction(&self, txid: &str) -> Result<String, WalletError> {
        let result = self
            .call("blockchain.transaction.get", vec![json!(txid)])
            .await?;
        Self::parse(result, "transaction")
    }

    async fn broadcast_transaction(&self, raw_tx: &str) -> Result<String, WalletError> {
        let result = self
            .call("blockchain.transaction.broadcast", vec![json!(raw_tx)])
            .await?;
        Self::parse(result, "broadcast result")
    }

    async fn estimate_fee(&self, blocks: u32) -> Result<f64, WalletError> {
        let result = self.call("blockchain.estimatefee", vec![json!(blocks)]).await?;
        Self::parse(result, "fee estimate")
    }

    async fn block_header(&self, height: i64) -> Result<String, WalletError> {
        let result = self.call("blockchain.block.header", vec![json!(height)]).await?;
        Self::parse(result, "block header")
    }

    async fn tip_height(&self) -> Result<i64, WalletError> {
        #[derive(Deserialize)]
        struct HeaderInfo {
            height: i64,
        }

        let result = self.call("blockchain.headers.subscribe", vec![]).await?;
        let info: HeaderInfo = Self::parse(result, "header info")?;
        Ok(info.height)
    }

    async fn ping(&self) -> Result<(), WalletError> {
        self.call("server.ping", vec![]).await.map(|_| ())
    }

    fn close(&self) {
        let mut state = self.pending.lock().unwrap();
        if !state.closed {
            state.closed = true;
            state.waiters.clear();
        }
        drop(state);
        self.reader_task.abort();
    }
}

/// Reader task: decode line-framed responses and deliver them by id. Any
/// decode failure or socket error closes every waiting channel and marks
/// the client dead.
async fn read_responses(reader: BoxedReader, pending: Arc<StdMutex<PendingState>>) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcResponse>(&line) {
                    Ok(response) => {
                        let waiter = {
                            let mut state = pending.lock().unwrap();
                            response.id.and_then(|id| state.waiters.remove(&id))
                        };
                        // Server-initiated notifications carry no id and are
                        // dropped here.
                        if let Some(sender) = waiter {
                            let _ = sender.send(response);
                        }
                    }
                    Err(e) => {
                        log::warn!("undecodable indexer response, closing client: {}", e);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("indexer read error: {}", e);
                break;
            }
        }
    }

    let mut state = pending.lock().unwrap();
    state.closed = true;
    state.waiters.clear();
}

fn parse_url(url: &str) -> Result<(bool, String, String), WalletError> {
    let (use_tls, rest) = if let Some(rest) = url.strip_prefix("ssl://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (false, rest)
    } else {
        // Default to TLS.
        (true, url)
    };

    let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
        WalletError::InvalidInput("invalid URL format: expected host:port".to_string())
    })?;

    if host.is_empty() || port.is_empty() {
        return Err(WalletError::InvalidInput(
            "invalid URL format: expected host:port".to_string(),
        ));
    }

    Ok((use_tls, host.to_string(), port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_url_schemes() {
        assert_eq!(
            parse_url("ssl://electrum.blockstream.info:50002").unwrap(),
            (
                true,
                "electrum.blockstream.info".to_string(),
                "50002".to_string()
            )
        );
        assert_eq!(
            parse_url("tcp://127.0.0.1:50001").unwrap(),
            (false, "127.0.0.1".to_string(), "50001".to_string())
        );
        // No scheme defaults to TLS.
        assert_eq!(
            parse_url("electrum.emzy.de:50002").unwrap(),
            (true, "electrum.emzy.de".to_string(), "50002".to_string())
        );
        assert!(parse_url("ssl://no-port").is_err());
    }

    #[test]
    fn test_response_decoding() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"confirmed":5}}"#).unwrap();
        assert_eq!(ok.id, Some(3));
        assert!(ok.error.is_none());

        let null_result: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert!(null_result.result.is_null());

        let error: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32600,"message":"bad request"}}"#,
        )
        .unwrap();
        assert_eq!(error.error.unwrap().code, -32600);

        // Subscription notification without an id.
        let notification: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[]}"#,
        )
        .unwrap();
        assert!(notification.id.is_none());
    }

    /// Minimal scripted Electrum server for one connection.
    async fn fake_server(listener: TcpListener, responses: Vec<(&'static str, String)>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].as_u64().unwrap();
            let method = request["method"].as_str().unwrap().to_string();

            let body = if method == "server.version" {
                r#"["ElectrumX 1.16.0","1.4"]"#.to_string()
            } else if let Some((_, response)) =
                responses.iter().find(|(m, _)| *m == method)
            {
                response.clone()
            } else {
                "null".to_string()
            };

            let reply = format!(r#"{{"jsonrpc":"2.0","id":{},"result":{}}}{}"#, id, body, "\n");
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_call_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_server(
            listener,
            vec![
                (
                    "blockchain.scripthash.get_balance",
                    r#"{"confirmed":150000,"unconfirmed":-5000}"#.to_string(),
                ),
                (
                    "blockchain.headers.subscribe",
                    r#"{"height":845001,"hex":"00"}"#.to_string(),
                ),
            ],
        ));

        let client = ElectrumClient::connect(&format!("tcp://{}", addr))
            .await
            .unwrap();

        let balance = client.get_balance("ab".repeat(32).as_str()).await.unwrap();
        assert_eq!(balance.confirmed, 150_000);
        assert_eq!(balance.unconfirmed, -5_000);

        assert_eq!(client.tip_height().await.unwrap(), 845_001);

        // null result from subscribe means no history.
        let status = client.subscribe("cd".repeat(32).as_str()).await.unwrap();
        assert!(status.is_none());

        client.close();
        let err = client.ping().await.unwrap_err();
        assert!(err.to_string().contains("client is closed"));
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].as_u64().unwrap();
                let reply = if request["method"] == "server.version" {
                    format!(
                        r#"{{"jsonrpc":"2.0","id":{},"result":["ElectrumX","1.4"]}}{}"#,
                        id, "\n"
                    )
                } else {
                    format!(
                        r#"{{"jsonrpc":"2.0","id":{},"error":{{"code":2,"message":"daemon error"}}}}{}"#,
                        id, "\n"
                    )
                };
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let client = ElectrumClient::connect(&format!("tcp://{}", addr))
            .await
            .unwrap();
        let err = client
            .broadcast_transaction("0200deadbeef")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("electrum error 2: daemon error"));
    }

    #[tokio::test]
    async fn test_connection_drop_fails_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            // Answer version negotiation, then hang up on the next request.
            if let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].as_u64().unwrap();
                let reply = format!(
                    r#"{{"jsonrpc":"2.0","id":{},"result":["ElectrumX","1.4"]}}{}"#,
                    id, "\n"
                );
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
            let _ = lines.next_line().await;
            // Dropping both halves resets the connection.
        });

        let client = ElectrumClient::connect(&format!("tcp://{}", addr))
            .await
            .unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(
            err.to_string().contains("connection closed")
                || err.to_string().contains("failed to send request"),
            "unexpected error: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_undecodable_response_kills_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();

            let mut buf = vec![0u8; 4096];
            let _ = read_half.read(&mut buf).await;
            write_half
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":[\"ElectrumX\",\"1.4\"]}\n")
                .await
                .unwrap();

            let _ = read_half.read(&mut buf).await;
            write_half.write_all(b"this is not json\n").await.unwrap();
            // Keep the socket open so only the decode failure kills the
            // client.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ElectrumClient::connect(&format!("tcp://{}", addr))
            .await
            .unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(err.to_string().contains("connection closed"));

        // The client is now dead for subsequent calls too.
        let err = client.ping().await.unwrap_err();
        assert!(err.to_string().contains("client is closed"));
    }
}
