use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::proto::view_service_server::{ViewService, ViewServiceServer};
use crate::proto::{GetViewRequest, GetViewResponse, PingRequest, PingResponse};
use crate::view::View;
use crate::{dead_interval, PING_INTERVAL};

/// Membership state. Mutated by Ping and by the periodic liveness sweep,
/// always under the server's single lock.
#[derive(Debug, Default)]
struct ViewState {
    /// Last time each server was heard from. Entries are refreshed on every
    /// ping and never removed; staleness is detected by comparison.
    last_ping: HashMap<String, Instant>,

    /// Highest view number each server has reported knowing. Never decreases.
    ack: HashMap<String, u64>,

    /// The view handed out to all callers.
    current: View,

    /// Pending candidate view. Only ever installed wholesale, and only once
    /// the current primary has acknowledged the current view.
    proposed: View,
}

impl ViewState {
    /// The current view may be replaced once its primary has acknowledged it.
    /// The bootstrap view has no primary and needs no acknowledgement, which
    /// the empty-identity lookup covers: an unknown server acks view 0.
    fn primary_acked(&self) -> bool {
        let acked = self
            .ack
            .get(&self.current.primary)
            .copied()
            .unwrap_or_default();
        acked == self.current.view_num
    }

    fn ping(&mut self, me: &str, view_num: u64, now: Instant) -> View {
        self.last_ping.insert(me.to_string(), now);
        let acked = self.ack.entry(me.to_string()).or_default();
        if *acked < view_num {
            *acked = view_num;
        }

        if self.current.is_primary(me) && view_num == 0 {
            // The primary's identity pinging as freshly started means it
            // crashed and restarted. Its state is gone, so it must step down
            // in favour of the backup.
            self.proposed.primary = self.current.backup.clone();
            self.proposed.backup = String::new();
            self.proposed.view_num = self.current.view_num + 1;
        } else if !self.current.has_primary() {
            self.proposed.primary = me.to_string();
            self.proposed.view_num = self.current.view_num + 1;
        } else if !self.current.is_primary(me) && !self.current.has_backup() {
            self.proposed.primary = self.current.primary.clone();
            self.proposed.backup = me.to_string();
            self.proposed.view_num = self.current.view_num + 1;
        }

        if self.primary_acked() && self.current != self.proposed {
            info!(
                view_num = self.proposed.view_num,
                primary = %self.proposed.primary,
                backup = %self.proposed.backup,
                "installing view"
            );
            self.current = self.proposed.clone();
        }

        self.current.clone()
    }

    /// Notice servers that have stopped pinging and propose their removal.
    /// This never installs the proposal itself; the commit rule lives in
    /// [`ViewState::ping`] alone.
    fn sweep(&mut self, now: Instant) {
        let cutoff = dead_interval();
        let is_dead = |last_ping: &HashMap<String, Instant>, id: &str| {
            last_ping
                .get(id)
                .map_or(true, |t| now.duration_since(*t) > cutoff)
        };

        let mut changed = false;
        if self.current.has_primary() && is_dead(&self.last_ping, &self.current.primary) {
            debug!(primary = %self.current.primary, "primary missed its pings");
            self.proposed.primary.clear();
            changed = true;
        }
        if self.current.has_backup() && is_dead(&self.last_ping, &self.current.backup) {
            debug!(backup = %self.current.backup, "backup missed its pings");
            self.proposed.backup.clear();
            changed = true;
        }

        if !self.proposed.has_primary() && self.proposed.has_backup() {
            self.proposed.primary = std::mem::take(&mut self.proposed.backup);
            changed = true;
        }

        if changed {
            self.proposed.view_num = self.current.view_num + 1;
        }
    }
}

/// The view service process. Owns the membership tables and serves the
/// Ping/Get RPCs; a background task runs the liveness sweep once per ping
/// interval.
#[derive(Clone)]
pub struct ViewServer {
    addr: SocketAddr,
    state: Arc<Mutex<ViewState>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ViewServer {
    pub fn new(addr: SocketAddr) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            addr,
            state: Arc::new(Mutex::new(ViewState::default())),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Serve until [`ViewServer::kill`] is called. In-flight handlers drain
    /// before the listener is released.
    pub async fn run(&self) -> crate::Result<()> {
        info!("view service listening on {}", self.addr);

        let state = Arc::clone(&self.state);
        let mut sweep_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => state.lock().await.sweep(Instant::now()),
                    _ = sweep_shutdown.changed() => break,
                }
            }
        });

        let mut shutdown = self.shutdown.subscribe();
        tonic::transport::Server::builder()
            .add_service(ViewServiceServer::new(self.clone()))
            .serve_with_shutdown(self.addr, async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }

    /// Stop accepting connections and wind the process down.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The view currently being told to all callers.
    pub async fn current_view(&self) -> View {
        self.state.lock().await.current.clone()
    }
}

#[tonic::async_trait]
impl ViewService for ViewServer {
    async fn ping(
        &self,
        req: tonic::Request<PingRequest>,
    ) -> Result<tonic::Response<PingResponse>, tonic::Status> {
        let req = req.into_inner();
        let view = self
            .state
            .lock()
            .await
            .ping(&req.me, req.view_num, Instant::now());
        Ok(tonic::Response::new(PingResponse {
            view: Some(view.into()),
        }))
    }

    async fn get(
        &self,
        _req: tonic::Request<GetViewRequest>,
    ) -> Result<tonic::Response<GetViewResponse>, tonic::Status> {
        let view = self.state.lock().await.current.clone();
        Ok(tonic::Response::new(GetViewResponse {
            view: Some(view.into()),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    const A: &str = "127.0.0.1:7001";
    const B: &str = "127.0.0.1:7002";
    const C: &str = "127.0.0.1:7003";

    /// Ping repeatedly with whatever view the server last reported, the way
    /// a live server's tick loop would.
    fn ping_current(vs: &mut ViewState, me: &str, now: Instant) -> View {
        let known = if vs.current.primary == me || vs.current.backup == me {
            vs.current.view_num
        } else {
            0
        };
        vs.ping(me, known, now)
    }

    /// Drive A to primary and B to acked backup at view 2.
    fn established_pair(now: Instant) -> ViewState {
        let mut vs = ViewState::default();
        assert_eq!(
            vs.ping(A, 0, now),
            View {
                view_num: 1,
                primary: A.into(),
                backup: String::new()
            }
        );
        vs.ping(A, 1, now);
        vs.ping(B, 0, now);
        let view = vs.ping(A, 1, now);
        assert_eq!(view.view_num, 2);
        assert_eq!(view.primary, A);
        assert_eq!(view.backup, B);
        vs.ping(A, 2, now);
        vs.ping(B, 2, now);
        vs
    }

    #[test]
    fn first_ping_becomes_primary() {
        let mut vs = ViewState::default();
        let view = vs.ping(A, 0, Instant::now());
        assert_eq!(view.view_num, 1);
        assert_eq!(view.primary, A);
        assert!(!view.has_backup());
    }

    #[test]
    fn backup_waits_for_primary_ack() {
        let now = Instant::now();
        let mut vs = ViewState::default();
        vs.ping(A, 0, now);

        // A has not acknowledged view 1 yet, so B's arrival may be proposed
        // but not installed.
        let view = vs.ping(B, 0, now);
        assert_eq!(view.view_num, 1);
        assert!(!view.has_backup());

        // Once A acks, the proposal commits.
        let view = vs.ping(A, 1, now);
        assert_eq!(view.view_num, 2);
        assert_eq!(view.primary, A);
        assert_eq!(view.backup, B);
    }

    #[test]
    fn idle_spare_changes_nothing() {
        let now = Instant::now();
        let mut vs = established_pair(now);
        let before = vs.current.clone();
        let view = vs.ping(C, 0, now);
        assert_eq!(view, before);
    }

    #[test]
    fn restarted_primary_is_demoted() {
        let now = Instant::now();
        let mut vs = established_pair(now);

        // A comes back with view number 0: crashed and restarted.
        let view = vs.ping(A, 0, now);
        assert_eq!(view.view_num, 3);
        assert_eq!(view.primary, B);
        assert!(!view.has_backup());

        // A's next ping folds it back in as B's backup.
        vs.ping(B, 3, now);
        let view = vs.ping(A, 0, now);
        assert_eq!(view.view_num, 4);
        assert_eq!(view.primary, B);
        assert_eq!(view.backup, A);
    }

    #[test]
    fn dead_primary_promotes_backup() {
        let t0 = Instant::now();
        let mut vs = established_pair(t0);

        // B keeps pinging, A goes silent past the cutoff.
        let later = t0 + dead_interval() + Duration::from_millis(1);
        ping_current(&mut vs, B, later);
        vs.sweep(later);

        // The sweep only proposes; B's next ping installs the view.
        assert_eq!(vs.current.view_num, 2);
        let view = ping_current(&mut vs, B, later);
        assert_eq!(view.view_num, 3);
        assert_eq!(view.primary, B);
        assert!(!view.has_backup());
    }

    #[test]
    fn dead_backup_is_dropped() {
        let t0 = Instant::now();
        let mut vs = established_pair(t0);

        let later = t0 + dead_interval() + Duration::from_millis(1);
        ping_current(&mut vs, A, later);
        vs.sweep(later);
        let view = ping_current(&mut vs, A, later);
        assert_eq!(view.view_num, 3);
        assert_eq!(view.primary, A);
        assert!(!view.has_backup());

        // A spare can then fill the empty backup slot.
        vs.ping(A, 3, later);
        vs.ping(C, 0, later);
        let view = vs.ping(A, 3, later);
        assert_eq!(view.view_num, 4);
        assert_eq!(view.backup, C);
    }

    #[test]
    fn view_cannot_advance_past_unacked_primary() {
        let t0 = Instant::now();
        let mut vs = ViewState::default();
        vs.ping(A, 0, t0);

        // A never acks view 1 and then dies. The sweep proposes clearing the
        // primary, but with no ack the view is stuck; B keeps seeing view 1.
        let later = t0 + dead_interval() + Duration::from_millis(1);
        vs.sweep(later);
        let view = vs.ping(B, 0, later);
        assert_eq!(view.view_num, 1);
        assert_eq!(view.primary, A);
    }

    #[test]
    fn view_numbers_step_by_one() {
        let now = Instant::now();
        let mut vs = ViewState::default();
        let mut seen = vec![vs.current.view_num];

        vs.ping(A, 0, now);
        seen.push(vs.current.view_num);
        vs.ping(A, 1, now);
        vs.ping(B, 0, now);
        vs.ping(A, 1, now);
        seen.push(vs.current.view_num);
        vs.ping(A, 2, now);
        vs.ping(A, 0, now);
        seen.push(vs.current.view_num);

        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
