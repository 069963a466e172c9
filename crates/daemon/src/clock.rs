//! Per-operation phase timing.
//!
//! Complex flows record several named timings: the whole request plus each
//! phase (read, write, sync). The rendered form goes to the request
//! completion log line:
//!
//! ```text
//! [request 1 ops, 0.327432 s] [read 32 ops, 0.148309 s] [write 32 ops, 0.175123 s]
//! ```

use std::fmt;
use std::time::Instant;

#[derive(Debug)]
struct Stats {
    name: &'static str,
    ops: u64,
    seconds: f64,
    started: Option<Instant>,
}

/// Accumulates named timings, preserving first-use order for display.
#[derive(Debug, Default)]
pub struct Clock {
    stats: Vec<Stats>,
}

impl Clock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already running; phases never overlap with
    /// themselves.
    pub fn start(&mut self, name: &'static str) {
        let stats = match self.stats.iter_mut().position(|s| s.name == name) {
            Some(index) => &mut self.stats[index],
            None => {
                self.stats.push(Stats {
                    name,
                    ops: 0,
                    seconds: 0.0,
                    started: None,
                });
                self.stats.last_mut().expect("just pushed")
            }
        };
        assert!(stats.started.is_none(), "stats {name:?} was already started");
        stats.started = Some(Instant::now());
        stats.ops += 1;
    }

    /// Stops timing `name`, returning the elapsed seconds of this run.
    ///
    /// # Panics
    ///
    /// Panics if `name` was not started.
    pub fn stop(&mut self, name: &'static str) -> f64 {
        let stats = self
            .stats
            .iter_mut()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no such stats {name:?}"));
        let started = stats
            .started
            .take()
            .unwrap_or_else(|| panic!("stats {name:?} was not started"));
        let elapsed = started.elapsed().as_secs_f64();
        stats.seconds += elapsed;
        elapsed
    }

    /// Runs a closure under a named timing.
    pub fn run<T>(&mut self, name: &'static str, op: impl FnOnce() -> T) -> T {
        self.start(name);
        let result = op();
        self.stop(name);
        result
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = Instant::now();
        for (index, stats) in self.stats.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }
            let seconds = match stats.started {
                Some(started) => now.duration_since(started).as_secs_f64(),
                None => stats.seconds,
            };
            write!(f, "[{} {} ops, {:.6} s]", stats.name, stats.ops, seconds)?;
        }
        Ok(())
    }
}
