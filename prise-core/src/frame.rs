// Copyright 2026 the prise authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coalesces a session's signal-pipe wakes into redraws at a bounded rate.
//!
//! This is a pure decision function so the coalescing logic can be tested
//! without a reactor or a real PTY. The registry is what actually owns a
//! timer task and calls back into this on expiry.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    RenderNow,
    ScheduleIn(Duration),
    AlreadyScheduled,
}

/// Called on every coalesced signal-pipe wake for a session.
pub fn decide(now: Instant, last_render: Instant, timer_pending: bool, interval: Duration) -> FrameDecision {
    if timer_pending {
        return FrameDecision::AlreadyScheduled;
    }
    let delta = now.saturating_duration_since(last_render);
    if delta >= interval {
        FrameDecision::RenderNow
    } else {
        FrameDecision::ScheduleIn(interval - delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(8);

    #[test]
    fn renders_immediately_when_interval_elapsed() {
        let last = Instant::now() - Duration::from_millis(20);
        assert_eq!(decide(Instant::now(), last, false, INTERVAL), FrameDecision::RenderNow);
    }

    #[test]
    fn schedules_remaining_time_when_too_soon() {
        let now = Instant::now();
        let last = now - Duration::from_millis(3);
        match decide(now, last, false, INTERVAL) {
            FrameDecision::ScheduleIn(d) => assert!(d <= Duration::from_millis(5) && d > Duration::from_millis(0)),
            other => panic!("expected ScheduleIn, got {other:?}"),
        }
    }

    #[test]
    fn does_nothing_new_when_timer_already_pending() {
        let now = Instant::now();
        assert_eq!(decide(now, now, true, INTERVAL), FrameDecision::AlreadyScheduled);
    }
}
