//! Rejection of replayed or badly timed server messages.

use std::collections::BTreeSet;

/// Upper bound on remembered server message IDs.
pub const STORED_MSG_IDS_MAX: usize = 2000;
/// Largest accepted distance into the future, in seconds.
pub const MAX_FUTURE_SECS: i64 = 30;
/// Largest accepted distance into the past, in seconds.
pub const MAX_PAST_SECS: i64 = 300;
/// After this many discarded messages in a row the connection is suspect.
pub const MAX_CONSECUTIVE_IGNORED: u32 = 30;

/// Why a server message was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("msg_id {0} was already received")]
    Duplicate(i64),
    #[error("msg_id {0} is lower than every stored id")]
    BelowWindow(i64),
    #[error("msg_id is {0}s in the future")]
    FromFuture(i64),
    #[error("msg_id is {0}s in the past")]
    FromPast(i64),
}

/// Remembers recent server message IDs for one session.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: BTreeSet<i64>,
    ignored_in_a_row: u32,
}

impl ReplayGuard {
    pub fn new() -> Self { Self::default() }

    /// Accept or reject `msg_id`, given its age relative to corrected server
    /// time (positive = future). Accepted IDs are remembered.
    ///
    /// Timing checks start once one message has been accepted, so the very
    /// first message can be used to synchronise the clock.
    pub fn check(&mut self, msg_id: i64, age_secs: i64) -> Result<(), Rejection> {
        let verdict = self.evaluate(msg_id, age_secs);
        match verdict {
            Ok(()) => {
                self.ignored_in_a_row = 0;
                if self.seen.len() >= STORED_MSG_IDS_MAX {
                    let drop: Vec<i64> = self.seen.iter().take(STORED_MSG_IDS_MAX / 2).copied().collect();
                    for id in drop {
                        self.seen.remove(&id);
                    }
                }
                self.seen.insert(msg_id);
            }
            Err(_) => self.ignored_in_a_row += 1,
        }
        verdict
    }

    fn evaluate(&self, msg_id: i64, age_secs: i64) -> Result<(), Rejection> {
        let Some(&lowest) = self.seen.first() else {
            return Ok(());
        };
        if msg_id < lowest {
            return Err(Rejection::BelowWindow(msg_id));
        }
        if self.seen.contains(&msg_id) {
            return Err(Rejection::Duplicate(msg_id));
        }
        if age_secs > MAX_FUTURE_SECS {
            return Err(Rejection::FromFuture(age_secs));
        }
        if age_secs < -MAX_PAST_SECS {
            return Err(Rejection::FromPast(-age_secs));
        }
        Ok(())
    }

    /// True once [`MAX_CONSECUTIVE_IGNORED`] messages were discarded in a row.
    pub fn should_restart(&self) -> bool {
        self.ignored_in_a_row >= MAX_CONSECUTIVE_IGNORED
    }

    /// Forget everything, for a new session.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.ignored_in_a_row = 0;
    }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}
