//! Host-side room expiry.

use std::sync::Arc;

use draw_core::{CloseReason, ExpiryTracker, Notice, Tick};
use tokio::time::MissedTickBehavior;

use crate::session::Shared;
use crate::store::RoomStore;

/// Ticks until the room expires or the session closes. On expiry the room is
/// deleted, the host is told, and navigation follows after the grace delay.
pub(crate) async fn run_lifecycle<S: RoomStore>(shared: Arc<Shared<S>>) {
    let mut ticker = tokio::time::interval(shared.config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tracker = ExpiryTracker::new();

    loop {
        ticker.tick().await;
        let room = {
            let state = shared.state.read().await;
            if state.is_closed() {
                return;
            }
            state.room().cloned()
        };
        let Some(room) = room else {
            continue;
        };

        match tracker.observe(&room, shared.clock.now_ms()) {
            Tick::Running { .. } => {}
            Tick::ExpiringSoon { remaining_ms } => {
                shared.notify(Notice::ExpiringSoon { remaining_ms });
            }
            Tick::Expired => {
                log::info!("room {} expired, deleting", room.id);
                // Close first so our own deletion echo is not treated as news.
                shared.state.write().await.close(CloseReason::Expired);
                if let Err(err) = shared.store.delete_room(&room.id).await {
                    log::warn!("failed to delete expired room {}: {err}", room.id);
                }
                shared.notify(Notice::Expired);
                shared.navigate_home_after(shared.config.closed_grace).await;
                return;
            }
        }
    }
}
