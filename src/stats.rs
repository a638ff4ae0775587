//! Metric objects scraped by a pull-based exporter.
//!
//! One set of metric objects exists per worker thread, lazily initialized when
//! the first connection is created. Scraping is a pull: each gauge/counter
//! carries a collect callback that iterates the connection registry on the
//! owning worker, so no synchronization happens on the data path. An exporter
//! running on another thread must marshal the scrape through the worker.

use crate::{
  constants::{METRIC_OUTBOUND_CONN_TIME, METRIC_OUTBOUND_COUNT, METRIC_OUTBOUND_IN, METRIC_OUTBOUND_OUT},
  registry,
};
use std::{
  cell::{Cell, OnceCell, RefCell},
  collections::HashMap,
  fmt::Write,
  rc::Rc,
};

/// Label names shared by all outbound metrics.
pub(crate) const OUTBOUND_LABELS: [&str; 2] = ["protocol", "peer"];

type SeriesKey = Vec<String>;

fn series_key(labels: &[&str]) -> SeriesKey {
  labels.iter().map(|s| s.to_string()).collect()
}

fn write_labels(out: &mut String, names: &[&str], values: &[String]) {
  out.push('{');
  for (i, (name, value)) in names.iter().zip(values.iter()).enumerate() {
    if i > 0 {
      out.push(',');
    }
    let _ = write!(out, "{name}=\"{value}\"");
  }
  out.push('}');
}

fn sorted_keys<V>(map: &HashMap<SeriesKey, V, ahash::RandomState>) -> Vec<SeriesKey> {
  let mut keys: Vec<SeriesKey> = map.keys().cloned().collect();
  keys.sort();
  keys
}

/* ---------------------------------------------------------- */
/// Handle to one labeled gauge series.
#[derive(Clone, Default)]
pub struct GaugeHandle(Rc<Cell<f64>>);

impl GaugeHandle {
  pub fn set(&self, value: f64) {
    self.0.set(value);
  }

  pub fn increase(&self, delta: f64) {
    self.0.set(self.0.get() + delta);
  }

  pub fn value(&self) -> f64 {
    self.0.get()
  }
}

/// Gauge with labeled series and a collect callback run on every scrape.
pub struct Gauge {
  name: &'static str,
  help: &'static str,
  label_names: &'static [&'static str],
  root: Cell<f64>,
  series: RefCell<HashMap<SeriesKey, GaugeHandle, ahash::RandomState>>,
  collector: RefCell<Option<Box<dyn Fn(&Gauge)>>>,
}

impl Gauge {
  pub fn new(name: &'static str, help: &'static str, label_names: &'static [&'static str]) -> Rc<Self> {
    Rc::new(Self {
      name,
      help,
      label_names,
      root: Cell::new(0.0),
      series: RefCell::new(HashMap::default()),
      collector: RefCell::new(None),
    })
  }

  pub(crate) fn set_collector(&self, f: impl Fn(&Gauge) + 'static) {
    *self.collector.borrow_mut() = Some(Box::new(f));
  }

  /// Handle for the series with the given label values, created on first use.
  pub fn with_labels(&self, labels: &[&str]) -> GaugeHandle {
    self
      .series
      .borrow_mut()
      .entry(series_key(labels))
      .or_default()
      .clone()
  }

  /// Reset every labeled series to zero. The default (unlabeled) value is untouched.
  pub fn zero_all(&self) {
    for handle in self.series.borrow().values() {
      handle.set(0.0);
    }
  }

  /// Set the default (unlabeled) value.
  pub fn set(&self, value: f64) {
    self.root.set(value);
  }

  pub fn value(&self) -> f64 {
    self.root.get()
  }

  /// Run the collect callback, refreshing all series.
  pub fn collect(&self) {
    let collector = self.collector.borrow();
    if let Some(f) = collector.as_ref() {
      f(self);
    }
  }

  pub fn encode(&self, out: &mut String) {
    let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
    let _ = writeln!(out, "# TYPE {} gauge", self.name);
    let _ = writeln!(out, "{} {}", self.name, self.root.get());
    let series = self.series.borrow();
    for key in sorted_keys(&series) {
      let value = series[&key].value();
      out.push_str(self.name);
      write_labels(out, self.label_names, &key);
      let _ = writeln!(out, " {value}");
    }
  }
}

/* ---------------------------------------------------------- */
/// Handle to one labeled counter series.
#[derive(Clone, Default)]
pub struct CounterHandle(Rc<Cell<u64>>);

impl CounterHandle {
  pub fn increase(&self, delta: u64) {
    self.0.set(self.0.get() + delta);
  }

  pub fn value(&self) -> u64 {
    self.0.get()
  }
}

/// Monotonic counter with labeled series and a collect callback.
pub struct Counter {
  name: &'static str,
  help: &'static str,
  label_names: &'static [&'static str],
  root: Cell<u64>,
  series: RefCell<HashMap<SeriesKey, CounterHandle, ahash::RandomState>>,
  collector: RefCell<Option<Box<dyn Fn(&Counter)>>>,
}

impl Counter {
  pub fn new(name: &'static str, help: &'static str, label_names: &'static [&'static str]) -> Rc<Self> {
    Rc::new(Self {
      name,
      help,
      label_names,
      root: Cell::new(0),
      series: RefCell::new(HashMap::default()),
      collector: RefCell::new(None),
    })
  }

  pub(crate) fn set_collector(&self, f: impl Fn(&Counter) + 'static) {
    *self.collector.borrow_mut() = Some(Box::new(f));
  }

  pub fn with_labels(&self, labels: &[&str]) -> CounterHandle {
    self
      .series
      .borrow_mut()
      .entry(series_key(labels))
      .or_default()
      .clone()
  }

  /// Bump the default (unlabeled) total.
  pub fn increase(&self, delta: u64) {
    self.root.set(self.root.get() + delta);
  }

  pub fn value(&self) -> u64 {
    self.root.get()
  }

  pub fn collect(&self) {
    let collector = self.collector.borrow();
    if let Some(f) = collector.as_ref() {
      f(self);
    }
  }

  pub fn encode(&self, out: &mut String) {
    let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
    let _ = writeln!(out, "# TYPE {} counter", self.name);
    let _ = writeln!(out, "{} {}", self.name, self.root.get());
    let series = self.series.borrow();
    for key in sorted_keys(&series) {
      let value = series[&key].value();
      out.push_str(self.name);
      write_labels(out, self.label_names, &key);
      let _ = writeln!(out, " {value}");
    }
  }
}

/* ---------------------------------------------------------- */
/// One histogram series: per-bucket counts plus sum and count.
pub struct HistogramSeries {
  bounds: Rc<[f64]>,
  counts: Box<[Cell<u64>]>,
  sum: Cell<f64>,
  count: Cell<u64>,
}

impl HistogramSeries {
  fn new(bounds: Rc<[f64]>) -> Rc<Self> {
    let counts = bounds.iter().map(|_| Cell::new(0)).collect::<Vec<_>>().into_boxed_slice();
    Rc::new(Self {
      bounds,
      counts,
      sum: Cell::new(0.0),
      count: Cell::new(0),
    })
  }

  /// Record one observation.
  pub fn observe(&self, value: f64) {
    // The last bound is +inf, so a bucket always matches.
    let idx = self
      .bounds
      .iter()
      .position(|b| value <= *b)
      .unwrap_or(self.bounds.len() - 1);
    self.counts[idx].set(self.counts[idx].get() + 1);
    self.sum.set(self.sum.get() + value);
    self.count.set(self.count.get() + 1);
  }

  pub fn count(&self) -> u64 {
    self.count.get()
  }

  pub fn sum(&self) -> f64 {
    self.sum.get()
  }

  fn encode(&self, name: &str, label_names: &[&str], label_values: Option<&[String]>, out: &mut String) {
    let mut cumulative = 0u64;
    for (bound, cell) in self.bounds.iter().zip(self.counts.iter()) {
      cumulative += cell.get();
      let _ = write!(out, "{name}_bucket");
      let le = fmt_le(*bound);
      match label_values {
        Some(values) => {
          out.push('{');
          for (n, v) in label_names.iter().zip(values.iter()) {
            let _ = write!(out, "{n}=\"{v}\",");
          }
          let _ = write!(out, "le=\"{le}\"}}");
        }
        None => {
          let _ = write!(out, "{{le=\"{le}\"}}");
        }
      }
      let _ = writeln!(out, " {cumulative}");
    }
    match label_values {
      Some(values) => {
        let _ = write!(out, "{name}_sum");
        write_labels(out, label_names, values);
        let _ = writeln!(out, " {}", self.sum.get());
        let _ = write!(out, "{name}_count");
        write_labels(out, label_names, values);
        let _ = writeln!(out, " {}", self.count.get());
      }
      None => {
        let _ = writeln!(out, "{name}_sum {}", self.sum.get());
        let _ = writeln!(out, "{name}_count {}", self.count.get());
      }
    }
  }
}

fn fmt_le(bound: f64) -> String {
  if bound.is_infinite() {
    "+Inf".to_string()
  } else {
    format!("{bound}")
  }
}

/// Histogram with labeled series sharing one bucket layout.
pub struct Histogram {
  name: &'static str,
  help: &'static str,
  label_names: &'static [&'static str],
  bounds: Rc<[f64]>,
  root: Rc<HistogramSeries>,
  series: RefCell<HashMap<SeriesKey, Rc<HistogramSeries>, ahash::RandomState>>,
}

impl Histogram {
  pub fn new(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    bounds: Vec<f64>,
  ) -> Rc<Self> {
    let bounds: Rc<[f64]> = bounds.into();
    Rc::new(Self {
      name,
      help,
      label_names,
      bounds: bounds.clone(),
      root: HistogramSeries::new(bounds),
      series: RefCell::new(HashMap::default()),
    })
  }

  pub fn with_labels(&self, labels: &[&str]) -> Rc<HistogramSeries> {
    self
      .series
      .borrow_mut()
      .entry(series_key(labels))
      .or_insert_with(|| HistogramSeries::new(self.bounds.clone()))
      .clone()
  }

  /// Record an observation on the default (unlabeled) series.
  pub fn observe(&self, value: f64) {
    self.root.observe(value);
  }

  pub fn root(&self) -> &HistogramSeries {
    &self.root
  }

  pub fn encode(&self, out: &mut String) {
    let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
    let _ = writeln!(out, "# TYPE {} histogram", self.name);
    self.root.encode(self.name, self.label_names, None, out);
    let series = self.series.borrow();
    for key in sorted_keys(&series) {
      series[&key].encode(self.name, self.label_names, Some(&key), out);
    }
  }
}

/// Connect-time bucket layout: floor(1.5^i) for i = 1..=20 plus +inf, in milliseconds.
pub(crate) fn conn_time_buckets() -> Vec<f64> {
  let mut buckets = Vec::with_capacity(21);
  let mut limit = 1.5f64;
  for _ in 0..20 {
    buckets.push(limit.floor());
    limit *= 1.5;
  }
  buckets.push(f64::INFINITY);
  buckets
}

/* ---------------------------------------------------------- */
/// The per-worker outbound metric set.
pub(crate) struct OutboundMetrics {
  pub(crate) count: Rc<Gauge>,
  pub(crate) traffic_in: Rc<Counter>,
  pub(crate) traffic_out: Rc<Counter>,
  pub(crate) conn_time: Rc<Histogram>,
}

impl OutboundMetrics {
  fn new() -> Self {
    let count = Gauge::new(
      METRIC_OUTBOUND_COUNT,
      "Number of outbound connections",
      &OUTBOUND_LABELS,
    );
    count.set_collector(|gauge| {
      gauge.zero_all();
      let mut total = 0u64;
      registry::for_each(|core| {
        let address = core.address();
        gauge.with_labels(&[core.protocol_name(), address.as_str()]).increase(1.0);
        total += 1;
      });
      gauge.set(total as f64);
    });

    let traffic_in = Counter::new(
      METRIC_OUTBOUND_IN,
      "Total inbound traffic of outbound connections in bytes",
      &OUTBOUND_LABELS,
    );
    traffic_in.set_collector(|counter| {
      registry::for_each(|core| {
        let n = core.take_traffic_in();
        if let Some(handle) = core.traffic_in_handle() {
          handle.increase(n);
        }
        counter.increase(n);
      });
    });

    let traffic_out = Counter::new(
      METRIC_OUTBOUND_OUT,
      "Total outbound traffic of outbound connections in bytes",
      &OUTBOUND_LABELS,
    );
    traffic_out.set_collector(|counter| {
      registry::for_each(|core| {
        let n = core.take_traffic_out();
        if let Some(handle) = core.traffic_out_handle() {
          handle.increase(n);
        }
        counter.increase(n);
      });
    });

    let conn_time = Histogram::new(
      METRIC_OUTBOUND_CONN_TIME,
      "Connection time of outbound connections in milliseconds",
      &OUTBOUND_LABELS,
      conn_time_buckets(),
    );

    Self {
      count,
      traffic_in,
      traffic_out,
      conn_time,
    }
  }

  fn encode(&self) -> String {
    self.count.collect();
    self.traffic_in.collect();
    self.traffic_out.collect();

    let mut out = String::with_capacity(2048);
    self.count.encode(&mut out);
    self.traffic_in.encode(&mut out);
    self.traffic_out.encode(&mut out);
    self.conn_time.encode(&mut out);
    out
  }
}

thread_local! {
  static METRICS: OnceCell<Rc<OutboundMetrics>> = const { OnceCell::new() };
}

/// The worker's outbound metric set, created on first use.
pub(crate) fn outbound_metrics() -> Rc<OutboundMetrics> {
  METRICS.with(|cell| cell.get_or_init(|| Rc::new(OutboundMetrics::new())).clone())
}

/// Scrape this worker's outbound metrics into Prometheus text exposition format.
/// Returns an empty string if no connection was ever created on this thread.
pub fn encode_prometheus() -> String {
  METRICS.with(|cell| match cell.get() {
    Some(metrics) => metrics.encode(),
    None => String::new(),
  })
}

/* ---------------------------------------------------------- */
