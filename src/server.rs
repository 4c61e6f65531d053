use std::collections::HashMap;
use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::proto::pb_service_client::PbServiceClient;
use crate::proto::pb_service_server::{PbService, PbServiceServer};
use crate::proto::{
    ForwardRequest, ForwardResponse, GetRequest, GetResponse, PutRequest, PutResponse,
    ShutdownRequest, ShutdownResponse, Status,
};
use crate::view::View;
use crate::viewservice::ViewClient;
use crate::{Error, Result, PING_INTERVAL};

/// The value stored by a hash-chaining Put: the FNV-1a hash of the previous
/// value concatenated with the new one, rendered as a decimal string.
pub fn hash_chain(previous: &str, value: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(previous.as_bytes());
    hasher.write(value.as_bytes());
    hasher.finish().to_string()
}

/// Everything a PB server mutates, behind one lock: the replicated data, the
/// dedup table, the view it last learned and the served-operation counter.
///
/// The dedup table is never evicted. Unbounded retention is part of this
/// design; it is what makes arbitrarily delayed retries safe.
#[derive(Debug, Default)]
struct PbState {
    store: HashMap<String, String>,
    dedup: HashMap<String, String>,
    view: View,
    ops_served: u64,
}

impl PbState {
    /// Apply a Put to the local store. Returns the reply's previous value and
    /// whether the mutation was freshly applied (false for a duplicate
    /// request id, which must not be forwarded again).
    fn apply_put(
        &mut self,
        key: &str,
        value: &str,
        chain: bool,
        request_id: &str,
    ) -> (String, bool) {
        if let Some(previous) = self.dedup.get(request_id) {
            return (previous.clone(), false);
        }

        let previous = self.store.get(key).cloned().unwrap_or_default();
        let stored = if chain {
            hash_chain(&previous, value)
        } else {
            value.to_string()
        };
        self.store.insert(key.to_string(), stored);
        self.dedup.insert(request_id.to_string(), previous.clone());
        (previous, true)
    }
}

/// A replica of the key-value store. Serves Get/Put while the view service
/// says it is primary, accepts forwarded writes while it says it is backup,
/// and pings the view service once per interval.
#[derive(Clone)]
pub struct PbServer {
    /// This server's identity: its own reachable address.
    me: String,
    addr: SocketAddr,
    vs: ViewClient,
    state: Arc<Mutex<PbState>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PbServer {
    pub fn new(addr: SocketAddr, viewservice: &str) -> Result<Self> {
        let me = addr.to_string();
        let vs = ViewClient::new(me.clone(), viewservice)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            me,
            addr,
            vs,
            state: Arc::new(Mutex::new(PbState::default())),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Serve until killed. The tick loop stops with the listener; in-flight
    /// handlers drain before the listening socket is released.
    pub async fn run(&self) -> Result<()> {
        info!(me = %self.me, "pb server listening on {}", self.addr);

        let server = self.clone();
        let mut tick_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => server.tick().await,
                    _ = tick_shutdown.changed() => break,
                }
            }
        });

        let mut shutdown = self.shutdown.subscribe();
        tonic::transport::Server::builder()
            .add_service(PbServiceServer::new(self.clone()))
            .serve_with_shutdown(self.addr, async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }

    /// Stop accepting connections and stop pinging the view service.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Direct copy of the replicated data, bypassing role checks. Test and
    /// inspection surface, not part of the client protocol.
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.state.lock().await.store.clone()
    }

    pub async fn ops_served(&self) -> u64 {
        self.state.lock().await.ops_served
    }

    /// Ping the view service and, when a new backup has just been assigned to
    /// this primary, bring it up to date with the whole store.
    async fn tick(&self) {
        let mut state = self.state.lock().await;
        let view = match self.vs.clone().ping(state.view.view_num).await {
            Ok(view) => view,
            Err(e) => {
                debug!(error = %e, "view service unreachable");
                return;
            }
        };

        let new_backup =
            view.is_primary(&self.me) && view.has_backup() && view.backup != state.view.backup;
        if view != state.view {
            debug!(%view, "learned new view");
        }
        state.view = view.clone();

        if new_backup {
            info!(backup = %view.backup, "new backup assigned, forwarding full store");
            let batch = ForwardRequest {
                entries: state.store.clone(),
                dedup: state.dedup.clone(),
            };
            if let Err(e) = forward_to(&view.backup, batch).await {
                // The backup will be caught up on a later tick or declared
                // dead by the view service; nothing to do here.
                warn!(backup = %view.backup, error = %e, "full resync failed");
            }
        }
    }
}

/// Push a batch to the backup's replication endpoint and require acceptance.
async fn forward_to(backup: &str, batch: ForwardRequest) -> Result<()> {
    let channel = tonic::transport::Endpoint::from_shared(format!("http://{backup}"))?
        .timeout(Duration::from_secs(1))
        .connect_lazy();
    let resp = PbServiceClient::new(channel)
        .forward(batch)
        .await?
        .into_inner();
    match resp.status() {
        Status::Ok => Ok(()),
        Status::WrongServer => Err(Error::ForwardFailed {
            backup: backup.to_string(),
        }),
    }
}

#[tonic::async_trait]
impl PbService for PbServer {
    async fn get(
        &self,
        req: tonic::Request<GetRequest>,
    ) -> std::result::Result<tonic::Response<GetResponse>, tonic::Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().await;

        // A fresh query, not the cached view: a demoted primary must notice
        // on the next request at the latest.
        if self.vs.clone().primary().await != self.me {
            return Ok(tonic::Response::new(GetResponse {
                status: Status::WrongServer.into(),
                value: String::new(),
            }));
        }

        let value = state.store.get(&req.key).cloned().unwrap_or_default();
        state.ops_served += 1;
        Ok(tonic::Response::new(GetResponse {
            status: Status::Ok.into(),
            value,
        }))
    }

    async fn put(
        &self,
        req: tonic::Request<PutRequest>,
    ) -> std::result::Result<tonic::Response<PutResponse>, tonic::Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().await;

        let view = match self.vs.clone().get().await {
            Ok(view) => view,
            Err(_) => {
                return Ok(tonic::Response::new(PutResponse {
                    status: Status::WrongServer.into(),
                    previous_value: String::new(),
                }))
            }
        };
        if !view.is_primary(&self.me) {
            return Ok(tonic::Response::new(PutResponse {
                status: Status::WrongServer.into(),
                previous_value: String::new(),
            }));
        }

        let (previous, fresh) =
            state.apply_put(&req.key, &req.value, req.hash_chain, &req.request_id);

        if fresh && view.has_backup() {
            // Replicate before acknowledging, while still holding the lock;
            // releasing it early would let a concurrent Put interleave with
            // this forward and reorder writes on the backup.
            let stored = state.store[&req.key].clone();
            let batch = ForwardRequest {
                entries: HashMap::from([(req.key.clone(), stored)]),
                dedup: HashMap::from([(req.request_id.clone(), previous.clone())]),
            };
            if let Err(e) = forward_to(&view.backup, batch).await {
                // Applied locally but not replicated: the client must retry,
                // and the dedup entry makes that retry safe.
                warn!(backup = %view.backup, error = %e, "forward failed");
                return Ok(tonic::Response::new(PutResponse {
                    status: Status::WrongServer.into(),
                    previous_value: String::new(),
                }));
            }
        }

        state.ops_served += 1;
        Ok(tonic::Response::new(PutResponse {
            status: Status::Ok.into(),
            previous_value: previous,
        }))
    }

    async fn forward(
        &self,
        req: tonic::Request<ForwardRequest>,
    ) -> std::result::Result<tonic::Response<ForwardResponse>, tonic::Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().await;

        // Confirm the role independently so a stale primary cannot corrupt a
        // server that has since been reassigned.
        let view = match self.vs.clone().get().await {
            Ok(view) => view,
            Err(_) => {
                return Ok(tonic::Response::new(ForwardResponse {
                    status: Status::WrongServer.into(),
                }))
            }
        };
        if !view.is_backup(&self.me) {
            return Ok(tonic::Response::new(ForwardResponse {
                status: Status::WrongServer.into(),
            }));
        }

        state.store.extend(req.entries);
        state.dedup.extend(req.dedup);
        Ok(tonic::Response::new(ForwardResponse {
            status: Status::Ok.into(),
        }))
    }

    async fn shutdown(
        &self,
        _req: tonic::Request<ShutdownRequest>,
    ) -> std::result::Result<tonic::Response<ShutdownResponse>, tonic::Status> {
        let ops_served = self.state.lock().await.ops_served;
        info!(ops_served, "shutdown requested");
        self.kill();
        Ok(tonic::Response::new(ShutdownResponse { ops_served }))
    }
}
