use crate::shutdown::{ShutdownListener, ShutdownSignal};
use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Requested,
    RoleDied(&'static str),
}

impl Termination {
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Requested => 0,
            Termination::RoleDied(_) => 1,
        }
    }
}

struct Role {
    name: &'static str,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub struct Supervisor {
    roles: Vec<Role>,
    shutdown: ShutdownSignal,
    join_timeout: Duration,
    liveness_interval: Duration,
}

impl Supervisor {
    pub fn new(join_timeout: Duration, liveness_interval: Duration) -> Self {
        Self {
            roles: Vec::new(),
            shutdown: ShutdownSignal::new(),
            join_timeout,
            liveness_interval,
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        self.shutdown.listener()
    }

    pub fn add_role(&mut self, name: &'static str, handle: JoinHandle<anyhow::Result<()>>) {
        info!(role = name, "role started");
        self.roles.push(Role { name, handle });
    }

    /// Supervise until `termination` resolves or a role exits, then tear down.
    pub async fn run(self, termination: impl Future<Output = ()>) -> Termination {
        let mut liveness = tokio::time::interval(self.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(termination);

        let outcome = loop {
            tokio::select! {
                _ = &mut termination => {
                    info!("termination requested");
                    break Termination::Requested;
                }
                _ = liveness.tick() => {
                    if let Some(role) = self.roles.iter().find(|r| r.handle.is_finished()) {
                        error!(role = role.name, "role exited unexpectedly, shutting down");
                        break Termination::RoleDied(role.name);
                    }
                }
            }
        };
        self.teardown().await;
        outcome
    }

    async fn teardown(self) {
        self.shutdown.trigger();
        let join_timeout = self.join_timeout;
        let joins = self.roles.into_iter().map(|role| async move {
            let name = role.name;
            let abort = role.handle.abort_handle();
            match tokio::time::timeout(join_timeout, role.handle).await {
                Ok(Ok(Ok(()))) => info!(role = name, "role stopped"),
                Ok(Ok(Err(e))) => warn!(role = name, "role stopped with error: {e:#}"),
                Ok(Err(e)) => error!(role = name, "role panicked or was cancelled: {e}"),
                Err(_) => {
                    warn!(
                        role = name,
                        "role did not stop within {}s, abandoning it",
                        join_timeout.as_secs_f32()
                    );
                    abort.abort();
                }
            }
        });
        join_all(joins).await;
    }
}
