//! Per-stage timing and value counters. Informational only, the physics never reads them.

use std::{
    collections::HashMap,
    fmt::Write,
    time::{Duration, Instant},
};

use crate::{floating_type_mod::FT, FluidSimulation};

#[derive(Debug, Clone)]
pub struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}

impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }

    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Counter<FT> {
    pub fn avg(&self) -> FT {
        if self.values.is_empty() {
            return 0.;
        }
        self.values.iter().cloned().sum::<FT>() / self.values.len() as FT
    }

    pub fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::MAX, FT::min)
    }

    pub fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::MIN, FT::max)
    }

    pub fn last(&self) -> Option<FT> {
        self.values.last().cloned()
    }
}

impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(self.last_start.elapsed());
    }

    pub fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::ZERO;
        }
        self.sum() / self.values.len() as u32
    }

    pub fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

#[derive(Debug, Clone)]
pub struct ValueCounters {
    counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}

impl ValueCounters {
    pub fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::new(),
            enabled,
        }
    }

    pub fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .add_value(v);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<FT>> {
        self.counters.get(id)
    }

    fn sorted(&self) -> Vec<(&String, &Counter<FT>)> {
        let mut v: Vec<_> = self.counters.iter().collect();
        v.sort_by(|x, y| x.0.cmp(y.0));
        v
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}

impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::new(),
            enabled,
        }
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    pub fn end(&mut self, id: &str) {
        if self.enabled {
            if let Some(counter) = self.counters.get_mut(id) {
                counter.end();
            }
        }
    }

    /// Records an externally measured duration.
    pub fn add_duration(&mut self, id: &str, duration: Duration) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .add_value(duration);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<Duration>> {
        self.counters.get(id)
    }

    fn sorted(&self) -> Vec<(&String, &Counter<Duration>)> {
        let mut v: Vec<_> = self.counters.iter().collect();
        v.sort_by(|x, y| x.0.cmp(y.0));
        v
    }
}

/// Plain-text table of all collected counters.
pub fn write_statistics(fluid_simulation: &FluidSimulation) -> Result<String, std::fmt::Error> {
    let mut s = String::new();
    let pcounters = fluid_simulation.performance_counters();
    let vcounters = fluid_simulation.value_counters();

    let simulation_time = pcounters
        .get("simulation-step")
        .map(|c| c.sum())
        .unwrap_or_default();
    writeln!(s, "steps: {}", fluid_simulation.step_number())?;
    writeln!(s, "particles: {}", fluid_simulation.num_particles())?;
    writeln!(s, "simulated-time: {:.3}s", fluid_simulation.time)?;
    writeln!(s, "simulation-time: {:.3}ms", simulation_time.as_secs_f64() * 1000.)?;
    writeln!(s)?;

    for (label, pcounter) in pcounters.sorted() {
        writeln!(
            s,
            "{:<24} avg:{:>9.4}ms  total:{:>10.3}ms",
            label,
            pcounter.avg().as_secs_f64() * 1000.,
            pcounter.sum().as_secs_f64() * 1000.
        )?;
    }
    writeln!(s)?;

    for (label, vcounter) in vcounters.sorted() {
        writeln!(
            s,
            "{:<24} min:{:<12} max:{:<12} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        )?;
    }

    Ok(s)
}

#[test]
fn disabled_counters_record_nothing() {
    let mut p = PerformanceCounters::new(false);
    p.begin("a");
    p.end("a");
    assert!(p.get("a").is_none());

    let mut v = ValueCounters::new(false);
    v.add_value("x", 1.);
    assert!(v.get("x").is_none());
}

#[test]
fn value_counter_min_max_avg() {
    let mut v = ValueCounters::new(true);
    for x in [3., 1., 2.] {
        v.add_value("x", x);
    }
    let c = v.get("x").unwrap();
    assert_eq!(c.len(), 3);
    assert_eq!(c.min(), 1.);
    assert_eq!(c.max(), 3.);
    assert_eq!(c.avg(), 2.);
    assert_eq!(c.last(), Some(2.));
}

#[test]
fn performance_counter_sums_durations() {
    let mut p = PerformanceCounters::new(true);
    p.add_duration("solve", Duration::from_millis(2));
    p.add_duration("solve", Duration::from_millis(4));
    p.end("never-started");
    let c = p.get("solve").unwrap();
    assert_eq!(c.sum(), Duration::from_millis(6));
    assert_eq!(c.avg(), Duration::from_millis(3));
    assert!(p.get("never-started").is_none());
}
