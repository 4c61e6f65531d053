use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use uuid::Uuid;

use crate::proto::pb_service_client::PbServiceClient;
use crate::proto::{GetRequest, PutRequest, Status};
use crate::viewservice::ViewClient;
use crate::{Result, PING_INTERVAL};

/// A client of the replicated store.
///
/// Every operation is retried against whichever server the view service
/// currently reports as primary until it succeeds. Each logical Put carries
/// one UUID request id, reused across retries, so the primary's dedup table
/// makes at-least-once delivery look exactly-once.
#[derive(Debug, Clone)]
pub struct Clerk {
    vs: ViewClient,
}

impl Clerk {
    pub fn new(name: impl Into<String>, viewservice: &str) -> Result<Self> {
        Ok(Self {
            vs: ViewClient::new(name, viewservice)?,
        })
    }

    fn connect(primary: &str) -> Result<PbServiceClient<Channel>> {
        let channel = Endpoint::from_shared(format!("http://{primary}"))?
            .timeout(Duration::from_secs(1))
            .connect_lazy();
        Ok(PbServiceClient::new(channel))
    }

    /// Fetch the value for `key`, retrying until a primary answers. An
    /// absent key reads as the empty string.
    pub async fn get(&mut self, key: &str) -> String {
        loop {
            let primary = self.vs.primary().await;
            if !primary.is_empty() {
                if let Ok(mut client) = Self::connect(&primary) {
                    match client
                        .get(GetRequest {
                            key: key.to_string(),
                        })
                        .await
                    {
                        Ok(resp) => {
                            let resp = resp.into_inner();
                            if resp.status() == Status::Ok {
                                return resp.value;
                            }
                        }
                        Err(e) => debug!(%primary, error = %e, "get failed, retrying"),
                    }
                }
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
    }

    /// Store `value` under `key`, retrying until acknowledged.
    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_ext(key, value, false).await;
    }

    /// Hash-chaining Put: the stored value becomes the hash of the old value
    /// concatenated with `value`. Returns the pre-update value.
    pub async fn put_hash(&mut self, key: &str, value: &str) -> String {
        self.put_ext(key, value, true).await
    }

    async fn put_ext(&mut self, key: &str, value: &str, hash_chain: bool) -> String {
        // One id for the whole logical Put. A reply lost on the wire leads to
        // a retry the primary recognises and answers from its dedup table.
        let request_id = Uuid::new_v4().to_string();
        loop {
            let primary = self.vs.primary().await;
            if !primary.is_empty() {
                if let Ok(mut client) = Self::connect(&primary) {
                    match client
                        .put(PutRequest {
                            key: key.to_string(),
                            value: value.to_string(),
                            hash_chain,
                            request_id: request_id.clone(),
                        })
                        .await
                    {
                        Ok(resp) => {
                            let resp = resp.into_inner();
                            if resp.status() == Status::Ok {
                                return resp.previous_value;
                            }
                        }
                        Err(e) => debug!(%primary, error = %e, "put failed, retrying"),
                    }
                }
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
    }
}
