use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::proto::view_service_client::ViewServiceClient;
use crate::proto::{GetViewRequest, PingRequest};
use crate::view::View;
use crate::Result;

/// Thin wrapper around the view service RPCs, carrying the caller's own
/// identity. PB servers ping through this on every tick; anyone may `get`.
#[derive(Debug, Clone)]
pub struct ViewClient {
    me: String,
    inner: ViewServiceClient<Channel>,
}

impl ViewClient {
    /// The connection is established lazily, so the view service does not
    /// have to be up yet when a server starts.
    pub fn new(me: impl Into<String>, viewservice: &str) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://{viewservice}"))?
            .timeout(Duration::from_secs(1))
            .connect_lazy();
        Ok(Self {
            me: me.into(),
            inner: ViewServiceClient::new(channel),
        })
    }

    /// Report liveness, acknowledge `view_num` and learn the current view.
    pub async fn ping(&mut self, view_num: u64) -> Result<View> {
        let resp = self
            .inner
            .ping(PingRequest {
                me: self.me.clone(),
                view_num,
            })
            .await?
            .into_inner();
        Ok(resp.view.unwrap_or_default().into())
    }

    /// Read the current view without touching the liveness tables.
    pub async fn get(&mut self) -> Result<View> {
        let resp = self.inner.get(GetViewRequest {}).await?.into_inner();
        Ok(resp.view.unwrap_or_default().into())
    }

    /// The current primary, or the empty string if the view service is
    /// unreachable.
    pub async fn primary(&mut self) -> String {
        self.get().await.map(|v| v.primary).unwrap_or_default()
    }
}
