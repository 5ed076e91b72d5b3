//! Room expiry arithmetic.
//!
//! A room lives for an hour from creation. Once drawn, the budget shrinks to
//! five minutes, still counted from `created_at` rather than from the draw.

use crate::Room;

pub const OPEN_TTL_MS: u64 = 60 * 60 * 1000;
pub const DRAWN_TTL_MS: u64 = 5 * 60 * 1000;
pub const WARNING_THRESHOLD_MS: u64 = 60 * 1000;

pub fn ttl_ms(drawn: bool) -> u64 {
    if drawn {
        DRAWN_TTL_MS
    } else {
        OPEN_TTL_MS
    }
}

/// Milliseconds left before `room` expires, floored at zero.
pub fn remaining_ms(room: &Room, now_ms: u64) -> u64 {
    let elapsed = now_ms.saturating_sub(room.created_at);
    ttl_ms(room.drawn).saturating_sub(elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running { remaining_ms: u64 },
    ExpiringSoon { remaining_ms: u64 },
    Expired,
}

/// Turns successive clock readings into one-shot warning and expiry signals.
#[derive(Debug, Default, Clone)]
pub struct ExpiryTracker {
    warned: bool,
    expired: bool,
}

impl ExpiryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, room: &Room, now_ms: u64) -> Tick {
        let remaining = remaining_ms(room, now_ms);
        if remaining == 0 {
            if self.expired {
                return Tick::Running { remaining_ms: 0 };
            }
            self.expired = true;
            return Tick::Expired;
        }
        if remaining < WARNING_THRESHOLD_MS && !self.warned {
            self.warned = true;
            return Tick::ExpiringSoon {
                remaining_ms: remaining,
            };
        }
        Tick::Running {
            remaining_ms: remaining,
        }
    }
}

/// Countdown label: `m:ss` while at least a minute is left, else `Ns`.
pub fn format_remaining(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    if minutes > 0 {
        format!("{}:{:02}", minutes, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATED: u64 = 1_700_000_000_000;

    fn room(drawn: bool) -> Room {
        Room {
            id: "r1".into(),
            host_token: "token".into(),
            created_at: CREATED,
            drawn,
        }
    }

    fn secs(s: u64) -> u64 {
        CREATED + s * 1000
    }

    #[test]
    fn open_room_expires_after_an_hour() {
        let mut tracker = ExpiryTracker::new();
        assert_eq!(tracker.observe(&room(false), secs(3601)), Tick::Expired);
    }

    #[test]
    fn drawn_room_budget_counts_from_creation() {
        let mut tracker = ExpiryTracker::new();
        assert_eq!(tracker.observe(&room(true), secs(301)), Tick::Expired);

        let mut tracker = ExpiryTracker::new();
        assert_eq!(
            tracker.observe(&room(true), secs(299)),
            Tick::ExpiringSoon {
                remaining_ms: 1000
            }
        );
    }

    #[test]
    fn drawn_late_room_expires_immediately() {
        // Drawn 20 minutes in: the 5-minute budget is already spent.
        assert_eq!(remaining_ms(&room(true), secs(20 * 60)), 0);
        assert_eq!(remaining_ms(&room(false), secs(20 * 60)), 40 * 60 * 1000);
    }

    #[test]
    fn warning_and_expiry_fire_once() {
        let mut tracker = ExpiryTracker::new();
        let r = room(false);
        assert_eq!(
            tracker.observe(&r, secs(3000)),
            Tick::Running {
                remaining_ms: 600_000
            }
        );
        assert_eq!(
            tracker.observe(&r, secs(3550)),
            Tick::ExpiringSoon {
                remaining_ms: 50_000
            }
        );
        assert_eq!(
            tracker.observe(&r, secs(3551)),
            Tick::Running {
                remaining_ms: 49_000
            }
        );
        assert_eq!(tracker.observe(&r, secs(3600)), Tick::Expired);
        assert_eq!(
            tracker.observe(&r, secs(3700)),
            Tick::Running { remaining_ms: 0 }
        );
    }

    #[test]
    fn clock_behind_creation_does_not_underflow() {
        assert_eq!(remaining_ms(&room(false), CREATED - 5_000), OPEN_TTL_MS);
    }

    #[test]
    fn countdown_labels() {
        assert_eq!(format_remaining(3_600_000), "60:00");
        assert_eq!(format_remaining(61_500), "1:01");
        assert_eq!(format_remaining(59_999), "59s");
        assert_eq!(format_remaining(0), "0s");
    }
}
