use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

/// Readout statistics, with both *all-time* counters and a
/// *sliding 1 s window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of fragments
    pub n_fragments: usize,
    /// Trigger cycles that produced at least one fragment
    pub n_cycles: usize,
    pub max_per_cycle: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    fragments: VecDeque<(Instant, usize)>,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_fragments: 0,
            n_cycles: 0,
            max_per_cycle: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            fragments: VecDeque::new(),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the last second, in MB/s
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> f64 {
        let bytes: usize = self
            .fragments
            .iter()
            .rev()
            .take_while(|(ts, _)| now.duration_since(*ts) <= self.window)
            .map(|&(_, sz)| sz)
            .sum();
        let secs = self.window.as_secs_f64().max(1e-6);
        (bytes as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Record one fragment of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        self.increment_at(Instant::now(), size);
    }

    fn increment_at(&mut self, now: Instant, size: usize) {
        self.total_size += size;
        self.n_fragments += 1;

        self.fragments.push_back((now, size));
        while let Some(&(ts, _)) = self.fragments.front() {
            if now.duration_since(ts) > self.window {
                self.fragments.pop_front();
            } else {
                break;
            }
        }
    }

    /// Close a trigger cycle that produced `fragments` fragments.
    pub fn end_cycle(&mut self, fragments: usize) {
        if fragments == 0 {
            return;
        }
        self.n_cycles += 1;
        self.max_per_cycle = self.max_per_cycle.max(fragments);
    }

    /// Reset both all-time counters and the sliding window.
    pub fn reset(&mut self) {
        *self = Counter {
            window: self.window,
            ..Default::default()
        };
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fragments in {} cycles (max {}/cycle), {:.3} MB, {:.3} MB/s now, {:.3} MB/s avg",
            self.n_fragments,
            self.n_cycles,
            self.max_per_cycle,
            self.total_size as f64 / (1024.0 * 1024.0),
            self.rate(),
            self.average_rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_and_cycle_maximum() {
        let mut counter = Counter::new();
        for size in [100, 200, 300] {
            counter.increment(size);
        }
        counter.end_cycle(3);
        counter.increment(50);
        counter.end_cycle(1);
        counter.end_cycle(0);

        assert_eq!(counter.total_size, 650);
        assert_eq!(counter.n_fragments, 4);
        assert_eq!(counter.n_cycles, 2);
        assert_eq!(counter.max_per_cycle, 3);

        counter.reset();
        assert_eq!(counter.n_fragments, 0);
        assert_eq!(counter.max_per_cycle, 0);
        assert_eq!(counter.rate(), 0.0);
    }

    #[test]
    fn window_evicts_old_fragments() {
        let start = Instant::now();
        let mut counter = Counter::new();
        counter.increment_at(start, 1024 * 1024);
        counter.increment_at(start + Duration::from_millis(500), 1024 * 1024);
        assert_eq!(counter.fragments.len(), 2);

        let later = start + Duration::from_millis(1600);
        counter.increment_at(later, 1024 * 1024);
        assert_eq!(counter.fragments.len(), 1);
        assert!((counter.rate_at(later) - 1.0).abs() < 1e-9);
        assert_eq!(counter.total_size, 3 * 1024 * 1024);
    }
}
