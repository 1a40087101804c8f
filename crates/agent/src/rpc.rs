//! # RPC Façade & Server Pool
//!
//! Thin dispatch layer between the agent's control loops and the
//! control-plane servers. A call goes to the in-process handler when one
//! is configured (single-binary dev mode), otherwise to whichever server
//! the pool currently prefers. Failures are reported back to the pool so
//! it can rotate; retry policy belongs to the calling loop, never here.
//!
//! The default pool, [`HttpServerPool`], speaks JSON over HTTP: each
//! method is a POST to `http://{addr}/v1/rpc/{method}`. Server lists
//! learned from heartbeat responses are merged in behind the configured
//! primaries.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no known servers")]
    NoServers,
    /// The selected server failed the call; carries the server address so
    /// callers and logs can name it. The reason preserves the server's
    /// message verbatim (heartbeat loops match on its text).
    #[error("rpc {method} failed to server {server}: {reason}")]
    Server {
        method: String,
        server: String,
        reason: String,
    },
    /// Application-level rejection from the server (HTTP 2xx transport,
    /// error payload) or from an in-process handler.
    #[error("{0}")]
    Application(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// In-process RPC dispatch, used in dev mode when the server runs in the
/// same binary, and by tests to script server behavior.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn rpc(&self, method: &str, args: Value) -> Result<Value, RpcError>;
}

/// One known control-plane server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub addr: String,
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Rotation and health tracking over the known server set.
///
/// The agent core only selects, calls, reports failures, and feeds back
/// the server lists it learns from heartbeats; ordering policy lives in
/// the implementation.
#[async_trait]
pub trait ServerPool: Send + Sync {
    /// Adds a configured (primary) server to the front of the rotation.
    fn add_primary_server(&self, addr: &str);

    /// The server the pool currently prefers, if any.
    fn find_server(&self) -> Option<ServerEndpoint>;

    /// Reports a failed call so the pool can deprioritize the server.
    fn notify_failed_server(&self, server: &ServerEndpoint);

    /// Merges the server list from a heartbeat response.
    fn refresh_server_lists(
        &self,
        servers: &[String],
        num_nodes: u32,
        leader_rpc_addr: &str,
    ) -> Result<(), RpcError>;

    fn num_servers(&self) -> usize;

    /// Performs one call against one server. No retry, no rotation.
    async fn call(
        &self,
        server: &ServerEndpoint,
        method: &str,
        args: Value,
    ) -> Result<Value, RpcError>;
}

// ════════════════════════════════════════════════════════════════════════════
// RPC CLIENT (FAÇADE)
// ════════════════════════════════════════════════════════════════════════════

/// The façade the control loops call through.
#[derive(Clone)]
pub struct RpcClient {
    handler: Option<Arc<dyn RpcHandler>>,
    pool: Arc<dyn ServerPool>,
}

impl RpcClient {
    pub fn new(pool: Arc<dyn ServerPool>, handler: Option<Arc<dyn RpcHandler>>) -> Self {
        RpcClient { handler, pool }
    }

    pub fn pool(&self) -> &Arc<dyn ServerPool> {
        &self.pool
    }

    /// Dispatches `method`: in-process handler first if configured,
    /// otherwise one attempt against the pool's preferred server. On a
    /// server failure the pool is notified and the returned error names
    /// the server address.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let encoded = serde_json::to_value(args)?;

        if let Some(handler) = &self.handler {
            let reply = handler.rpc(method, encoded).await?;
            return Ok(serde_json::from_value(reply)?);
        }

        let server = self.pool.find_server().ok_or(RpcError::NoServers)?;
        match self.pool.call(&server, method, encoded).await {
            Ok(reply) => Ok(serde_json::from_value(reply)?),
            Err(err) => {
                self.pool.notify_failed_server(&server);
                Err(RpcError::Server {
                    method: method.to_string(),
                    server: server.addr.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP SERVER POOL
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct PoolState {
    servers: VecDeque<ServerEndpoint>,
    num_nodes: u32,
    leader_rpc_addr: Option<String>,
}

/// JSON-over-HTTP [`ServerPool`] with front-of-queue preference.
///
/// Failed servers rotate to the back; servers learned from heartbeats
/// join at the back so configured primaries stay preferred until they
/// fail.
pub struct HttpServerPool {
    client: reqwest::Client,
    state: Mutex<PoolState>,
}

impl HttpServerPool {
    /// The request itself carries no overall timeout: `Node.GetClientAllocs`
    /// long-polls and must be allowed to block until the server index moves.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        HttpServerPool {
            client,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Number of nodes in the cluster as of the last list refresh.
    #[must_use]
    pub fn num_nodes(&self) -> u32 {
        self.state.lock().num_nodes
    }

    /// Leader RPC address as of the last list refresh, if one was named.
    #[must_use]
    pub fn leader_rpc_addr(&self) -> Option<String> {
        self.state.lock().leader_rpc_addr.clone()
    }
}

impl Default for HttpServerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerPool for HttpServerPool {
    fn add_primary_server(&self, addr: &str) {
        let endpoint = ServerEndpoint {
            addr: addr.to_string(),
        };
        let mut state = self.state.lock();
        if !state.servers.contains(&endpoint) {
            state.servers.push_front(endpoint);
        }
    }

    fn find_server(&self) -> Option<ServerEndpoint> {
        self.state.lock().servers.front().cloned()
    }

    fn notify_failed_server(&self, server: &ServerEndpoint) {
        let mut state = self.state.lock();
        if state.servers.front() == Some(server) && state.servers.len() > 1 {
            if let Some(failed) = state.servers.pop_front() {
                state.servers.push_back(failed);
            }
        }
    }

    fn refresh_server_lists(
        &self,
        servers: &[String],
        num_nodes: u32,
        leader_rpc_addr: &str,
    ) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        for addr in servers {
            let endpoint = ServerEndpoint { addr: addr.clone() };
            if !state.servers.contains(&endpoint) {
                debug!(server = %endpoint, "learned server from heartbeat");
                state.servers.push_back(endpoint);
            }
        }
        state.num_nodes = num_nodes;
        state.leader_rpc_addr = if leader_rpc_addr.is_empty() {
            None
        } else {
            Some(leader_rpc_addr.to_string())
        };
        Ok(())
    }

    fn num_servers(&self) -> usize {
        self.state.lock().servers.len()
    }

    async fn call(
        &self,
        server: &ServerEndpoint,
        method: &str,
        args: Value,
    ) -> Result<Value, RpcError> {
        let url = format!("http://{}/v1/rpc/{}", server.addr, method);
        let response = self
            .client
            .post(&url)
            .json(&args)
            .send()
            .await
            .map_err(|e| RpcError::Application(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Application(e.to_string()))?;
        if !status.is_success() {
            return Err(RpcError::Application(body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(addrs: &[&str]) -> HttpServerPool {
        let pool = HttpServerPool::new();
        // add_primary_server prepends; insert in reverse to keep order.
        for addr in addrs.iter().rev() {
            pool.add_primary_server(addr);
        }
        pool
    }

    // ── 1) primaries stay ahead of learned servers ───────────────────────

    #[test]
    fn learned_servers_join_behind_primaries() {
        let pool = pool_with(&["10.0.0.1:4647"]);
        pool.refresh_server_lists(
            &["10.0.0.2:4647".to_string(), "10.0.0.1:4647".to_string()],
            3,
            "10.0.0.1:4647",
        )
        .expect("test: refresh");
        assert_eq!(pool.num_servers(), 2);
        assert_eq!(
            pool.find_server().expect("test: server").addr,
            "10.0.0.1:4647"
        );
        assert_eq!(pool.num_nodes(), 3);
        assert_eq!(pool.leader_rpc_addr().as_deref(), Some("10.0.0.1:4647"));
    }

    // ── 2) failure rotates the preferred server to the back ──────────────

    #[test]
    fn failed_server_rotates_to_back() {
        let pool = pool_with(&["a:1", "b:1"]);
        let first = pool.find_server().expect("test: server");
        assert_eq!(first.addr, "a:1");
        pool.notify_failed_server(&first);
        assert_eq!(pool.find_server().expect("test: server").addr, "b:1");
        assert_eq!(pool.num_servers(), 2);
    }

    // ── 3) sole server is never rotated out ──────────────────────────────

    #[test]
    fn sole_server_survives_failure_report() {
        let pool = pool_with(&["a:1"]);
        let only = pool.find_server().expect("test: server");
        pool.notify_failed_server(&only);
        assert_eq!(pool.find_server().expect("test: server").addr, "a:1");
    }

    // ── 4) empty leader clears the cached address ────────────────────────

    #[test]
    fn empty_leader_clears_cache() {
        let pool = pool_with(&["a:1"]);
        pool.refresh_server_lists(&[], 1, "a:1").expect("test: refresh");
        assert!(pool.leader_rpc_addr().is_some());
        pool.refresh_server_lists(&[], 1, "").expect("test: refresh");
        assert!(pool.leader_rpc_addr().is_none());
    }

    // ── 5) façade wraps pool failures with the server address ────────────

    #[tokio::test]
    async fn facade_wraps_failures_with_server_addr() {
        struct FailingPool;
        #[async_trait]
        impl ServerPool for FailingPool {
            fn add_primary_server(&self, _addr: &str) {}
            fn find_server(&self) -> Option<ServerEndpoint> {
                Some(ServerEndpoint {
                    addr: "10.9.9.9:4647".to_string(),
                })
            }
            fn notify_failed_server(&self, _server: &ServerEndpoint) {}
            fn refresh_server_lists(
                &self,
                _servers: &[String],
                _num_nodes: u32,
                _leader: &str,
            ) -> Result<(), RpcError> {
                Ok(())
            }
            fn num_servers(&self) -> usize {
                1
            }
            async fn call(
                &self,
                _server: &ServerEndpoint,
                _method: &str,
                _args: Value,
            ) -> Result<Value, RpcError> {
                Err(RpcError::Application("node not found".to_string()))
            }
        }

        let client = RpcClient::new(Arc::new(FailingPool), None);
        let err = client
            .call::<_, Value>("Node.UpdateStatus", &serde_json::json!({}))
            .await
            .expect_err("test: must fail");
        let text = err.to_string();
        assert!(text.contains("10.9.9.9:4647"));
        assert!(text.contains("node not found"));
    }

    // ── 6) no servers at all ─────────────────────────────────────────────

    #[tokio::test]
    async fn facade_without_servers_errors() {
        let client = RpcClient::new(Arc::new(HttpServerPool::new()), None);
        let err = client
            .call::<_, Value>("Node.Register", &serde_json::json!({}))
            .await
            .expect_err("test: must fail");
        assert!(matches!(err, RpcError::NoServers));
    }
}
