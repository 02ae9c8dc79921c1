// A manually-advanced clock (§9 dependency-injection seam), so heartbeat
// staleness and await-pattern timeout checks can be unit-tested without
// real sleeps. Modeled on the source's pattern of injecting a `Clock` for
// deterministic tests (see `rt-test-utils`'s mock servers for the same
// spirit applied to sockets instead of time).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use broker_protocol::Clock;

pub struct FakeClock {
    now: Mutex<Instant>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("fake clock mutex poisoned");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("fake clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_now_forward() {
        let clock = FakeClock::new();
        let first = clock.now();
        clock.advance(Duration::from_secs(41));
        assert!(clock.now() >= first + Duration::from_secs(41));
    }
}
