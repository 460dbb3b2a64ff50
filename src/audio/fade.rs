// src/audio/fade.rs
// Linear gain fades stepped by the bookkeeping timer

/// A timed linear move of one stream-to-port gain toward a target level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fade {
    pub target: i32,
    /// Level change per tick, always at least 1.
    pub increment: i32,
    pub port: usize,
}

impl Fade {
    /// Plan a fade, or `None` when it completes immediately (zero duration or
    /// already at the target).
    pub fn new(current: i32, target: i32, duration_ms: u32, interval_ms: u32, port: usize) -> Option<Self> {
        if duration_ms == 0 || current == target {
            return None;
        }
        let distance = current.abs_diff(target) as u64;
        let increment = (distance * interval_ms as u64 / duration_ms as u64).clamp(1, distance);
        Some(Self {
            target,
            increment: increment as i32,
            port,
        })
    }

    /// Next level from `current`, and whether the target has been reached.
    pub fn step(&self, current: i32) -> (i32, bool) {
        let next = if current < self.target {
            current.saturating_add(self.increment).min(self.target)
        } else {
            current.saturating_sub(self.increment).max(self.target)
        };
        (next, next == self.target)
    }

    /// Ticks needed to get from `current` to the target.
    pub fn ticks_from(&self, current: i32) -> u32 {
        current.abs_diff(self.target).div_ceil(self.increment as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fade: &Fade, mut level: i32) -> (i32, u32) {
        let mut ticks = 0;
        loop {
            let (next, done) = fade.step(level);
            ticks += 1;
            if fade.target > level {
                assert!(next <= fade.target, "overshot upward");
            } else {
                assert!(next >= fade.target, "overshot downward");
            }
            level = next;
            if done {
                return (level, ticks);
            }
        }
    }

    #[test]
    fn test_fade_down_tick_count() {
        let fade = Fade::new(0, -1000, 100, 10, 0).unwrap();
        assert_eq!(fade.increment, 100);
        assert_eq!(run(&fade, 0), (-1000, 10));
    }

    #[test]
    fn test_fade_up_with_remainder() {
        let fade = Fade::new(-10000, -3000, 3000, 10, 1).unwrap();
        assert_eq!(fade.increment, 23);
        let expected = fade.ticks_from(-10000);
        assert_eq!(expected, 305);
        assert_eq!(run(&fade, -10000), (-3000, expected));
    }

    #[test]
    fn test_increment_never_zero() {
        let fade = Fade::new(0, -5, 60_000, 10, 0).unwrap();
        assert_eq!(fade.increment, 1);
        assert_eq!(run(&fade, 0), (-5, 5));
    }

    #[test]
    fn test_immediate_cases() {
        assert_eq!(Fade::new(0, -600, 0, 10, 0), None);
        assert_eq!(Fade::new(-600, -600, 500, 10, 0), None);
    }

    #[test]
    fn test_short_fade_single_tick() {
        let fade = Fade::new(0, -600, 5, 10, 0).unwrap();
        assert_eq!(fade.increment, 600);
        assert_eq!(fade.step(0), (-600, true));
    }
}
