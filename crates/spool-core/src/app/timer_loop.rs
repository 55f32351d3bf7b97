//! Timer loop: fires due timers and resumes their invocations.
//!
//! Sleeps until the earliest armed deadline, capped by the poll interval so a
//! clock that jumps (or a `FixedClock` moved by a test) is noticed. Arming a
//! timer wakes the loop early.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::engine::{Engine, EngineInner};

pub(crate) fn spawn(
    engine: Weak<EngineInner>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            // The loop must not keep a dropped engine alive.
            let Some(inner) = engine.upgrade() else {
                break;
            };
            let engine = Engine::from_inner(inner);

            let pause = match engine.fire_due_timers().await {
                Ok(_) => match engine.next_timer_deadline().await {
                    Some(deadline) => (deadline - engine.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(poll),
                    None => poll,
                },
                Err(e) => {
                    warn!(error = %e, "firing due timers failed");
                    poll
                }
            };
            drop(engine);

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!("timer loop stopped");
    })
}
