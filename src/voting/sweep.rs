use std::sync::Arc;

use chrono::{Duration, Utc};
use rocket::{
    fairing::{Fairing, Info, Kind},
    futures::future::{BoxFuture, FutureExt},
    tokio::sync::Mutex,
    Build, Orbit, Rocket,
};

use crate::{
    config::Config,
    scheduled_task::ScheduledTask,
    store::{SharedStore, StoreError, VotingStore},
};

/// Expire every open invitation that is past its expiry time.
pub async fn sweep_once(store: &dyn VotingStore) -> Result<u64, StoreError> {
    let expired = store.expire_overdue(Utc::now()).await?;
    if expired > 0 {
        info!("Expiry sweep expired {expired} invitations");
    } else {
        trace!("Expiry sweep had nothing to do");
    }
    Ok(expired)
}

/// The next sweep, or `None` once the sweeper has been stopped.
type Slot = Arc<Mutex<Option<ScheduledTask<()>>>>;

/// A background task that periodically expires overdue invitations.
///
/// Expiry is also applied lazily whenever a token is used, so the sweep only
/// keeps the stored statuses (and thus the queue counts) up to date.
pub struct ExpirySweeper {
    next: Slot,
}

impl ExpirySweeper {
    /// Start sweeping every `interval`, the first sweep one interval from now.
    pub async fn start(store: SharedStore, interval: Duration) -> Self {
        let next: Slot = Default::default();
        // Hold the lock while scheduling, so a sweep that fires immediately
        // cannot look at the slot before it is filled.
        let mut next_locked = next.lock().await;
        let sweep = Self::sweeper(store, interval, next.clone());
        *next_locked = Some(ScheduledTask::new(sweep, Utc::now() + interval));
        drop(next_locked);
        Self { next }
    }

    /// Run the next sweep now rather than waiting for it.
    pub async fn sweep_now(&self) {
        if let Some(task) = self.next.lock().await.as_ref() {
            task.trigger_now();
        }
    }

    /// Stop sweeping. A sweep already in progress is abandoned.
    pub async fn stop(&self) {
        let task = self.next.lock().await.take();
        if let Some(task) = task {
            task.cancel().await;
        }
    }

    /// Run one sweep, then schedule the next one.
    /// Since this is a recursive async function, we must use `BoxFuture` to
    /// avoid an infinitely-recursive state machine.
    fn sweeper(store: SharedStore, interval: Duration, next: Slot) -> BoxFuture<'static, ()> {
        async move {
            if let Err(e) = sweep_once(&*store).await {
                error!("Expiry sweep failed, will try again next time: {e}");
            }

            let mut next_locked = next.lock().await;
            if next_locked.is_none() {
                trace!("Expiry sweeper stopped; not rescheduling");
                return;
            }
            let sweep = Self::sweeper(store, interval, next.clone());
            *next_locked = Some(ScheduledTask::new(sweep, Utc::now() + interval));
        }
        .boxed()
    }
}

/// A fairing that starts the [`ExpirySweeper`] during Rocket ignition, places
/// it into managed state, and stops it at shutdown.
/// This fairing depends on the store and config being available in managed
/// state, and so must be attached after the fairings responsible for them.
pub struct ExpirySweepFairing;

#[rocket::async_trait]
impl Fairing for ExpirySweepFairing {
    fn info(&self) -> Info {
        Info {
            name: "Invitation Expiry Sweeper",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let store = match rocket.state::<SharedStore>() {
            Some(store) => store.clone(),
            None => {
                error!("Store was not available when starting the expiry sweeper");
                return Err(rocket);
            }
        };
        let interval = match rocket.state::<Config>() {
            Some(config) => config.expiry_sweep_interval(),
            None => {
                error!("Config was not available when starting the expiry sweeper");
                return Err(rocket);
            }
        };

        let sweeper = ExpirySweeper::start(store, interval).await;
        info!("Expiry sweeper running every {} seconds", interval.num_seconds());

        // Manage the state.
        rocket = rocket.manage(sweeper);
        Ok(rocket)
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(sweeper) = rocket.state::<ExpirySweeper>() {
            sweeper.stop().await;
            debug!("Expiry sweeper stopped");
        }
    }
}
