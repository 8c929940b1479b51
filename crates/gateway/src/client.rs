//! Pooled control-plane connection with re-registration recovery.
//!
//! `get()` hands out the current client, dialing lazily; `reset()` drops it
//! so the next call re-dials. `with_reregister` implements the
//! FailedPrecondition contract: re-register once, retry the original call.

use corral::rpc::client::{ControlClient, RpcError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How this gateway identifies itself to the control plane.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub caller: String,
    pub pid: u32,
    pub tags: Vec<String>,
    pub server: Option<String>,
}

pub struct ConnectOptions {
    pub rpc: String,
    pub token: Option<String>,
    /// Extra root CA in PEM form, for private control-plane TLS.
    pub ca_pem: Option<Vec<u8>>,
}

pub struct ClientManager {
    options: ConnectOptions,
    identity: CallerIdentity,
    client: Mutex<Option<Arc<ControlClient>>>,
}

impl ClientManager {
    pub fn new(options: ConnectOptions, identity: CallerIdentity) -> Arc<Self> {
        Arc::new(Self {
            options,
            identity,
            client: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    /// Current client, dialing if none is pooled. Safe to call concurrently
    /// with `reset()`: the next `get()` simply re-dials.
    pub async fn get(&self) -> Result<Arc<ControlClient>, RpcError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(self.dial()?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the pooled client; the next call re-dials.
    pub async fn reset(&self) {
        debug!("dropping pooled control-plane client");
        self.client.lock().await.take();
    }

    /// Register (or heartbeat) this gateway's caller.
    pub async fn register(&self) -> Result<(), RpcError> {
        let client = self.get().await?;
        let id = &self.identity;
        client
            .register(&id.caller, id.pid, &id.tags, id.server.as_deref())
            .await
    }

    pub async fn unregister(&self) {
        if let Ok(client) = self.get().await {
            if let Err(err) = client.unregister(&self.identity.caller).await {
                warn!(error = %err, "unregister failed");
            }
        }
    }

    /// Run one RPC with the standard recovery: on `FailedPrecondition`
    /// re-register once and retry; on `Unavailable` drop the pooled client
    /// so the next call redials.
    pub async fn with_reregister<T, F, Fut>(&self, op: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<ControlClient>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let client = self.get().await?;
        match op(Arc::clone(&client)).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_failed_precondition() => {
                debug!("caller expired, re-registering once");
                self.register().await?;
                op(client).await
            }
            Err(err) => {
                if err.is_unavailable() {
                    self.reset().await;
                }
                Err(err)
            }
        }
    }

    fn dial(&self) -> Result<ControlClient, RpcError> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = &self.options.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| RpcError::Transport(format!("bad ca certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(ControlClient::with_http(
            self.options.rpc.clone(),
            self.options.token.clone(),
            http,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use corral::rpc::{Code, Status};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct StubState {
        registers: AtomicU32,
        calls: AtomicU32,
    }

    /// Control-plane stub: the first tools/call answers FailedPrecondition,
    /// later ones succeed once a register has been seen.
    async fn stub_server(state: Arc<StubState>) -> String {
        async fn register(State(state): State<Arc<StubState>>) -> Json<serde_json::Value> {
            state.registers.fetch_add(1, Ordering::SeqCst);
            Json(serde_json::json!({}))
        }

        async fn call(
            State(state): State<Arc<StubState>>,
        ) -> Result<Json<serde_json::Value>, Status> {
            let n = state.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(Status::new(Code::FailedPrecondition, "caller expired"));
            }
            Ok(Json(serde_json::json!({"result": {"content": []}})))
        }

        let app = Router::new()
            .route("/v1/register", post(register))
            .route("/v1/tools/call", post(call))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn manager(rpc: String) -> Arc<ClientManager> {
        ClientManager::new(
            ConnectOptions {
                rpc,
                token: None,
                ca_pem: None,
            },
            CallerIdentity {
                caller: "ide".into(),
                pid: 4321,
                tags: vec!["git".into()],
                server: None,
            },
        )
    }

    #[tokio::test]
    async fn failed_precondition_triggers_one_reregister_and_one_retry() {
        // S6: stubbed FailedPrecondition on the first CallTool; the second
        // attempt succeeds after exactly one re-registration.
        let state = Arc::new(StubState::default());
        let rpc = stub_server(Arc::clone(&state)).await;
        let manager = manager(rpc);

        let caller = manager.identity().caller.clone();
        let result = manager
            .with_reregister(|client| {
                let caller = caller.clone();
                async move { client.call_tool(&caller, "git_status", None, "").await }
            })
            .await
            .unwrap();
        assert!(result.get("content").is_some());
        assert_eq!(state.registers.load(Ordering::SeqCst), 1);
        assert_eq!(state.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_drops_the_pooled_client() {
        // Nothing listens on this port; the transport error surfaces as
        // Unavailable and the pooled client is dropped.
        let manager = manager("http://127.0.0.1:1".into());
        let first = manager.get().await.unwrap();

        let err = manager
            .with_reregister(|client| async move { client.list_tools("ide").await })
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        let second = manager.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second), "client was re-dialed");
    }
}
