use std::{
    fmt,
    ops::{Add, Neg},
    time::SystemTime,
};

/// A numeric metric value.
///
/// Integer values stay integers as long as every value added to them is also an integer and the sum does not overflow,
/// which keeps counters rendering as `3` rather than `3.0` on the wire. Mixing in a floating-point value, or
/// overflowing, promotes the value to floating point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// A signed integer value.
    Integer(i64),

    /// A floating-point value.
    Float(f64),
}

impl Value {
    /// Returns the value as a 64-bit floating-point number.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Integer(v) => v as f64,
            Value::Float(v) => v,
        }
    }
}

impl Add for Value {
    type Output = Value;

    /// Integer addition that would overflow is carried out in floating point instead.
    fn add(self, other: Value) -> Self::Output {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => {
                a.checked_add(b).map_or_else(|| Value::Float(a as f64 + b as f64), Value::Integer)
            }
            (a, b) => Value::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl Neg for Value {
    type Output = Value;

    fn neg(self) -> Self::Output {
        match self {
            Value::Integer(v) => v.checked_neg().map_or(Value::Float(-(v as f64)), Value::Integer),
            Value::Float(v) => Value::Float(-v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Integer(i64::from(value))
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Value::Float(value as f64), Value::Integer)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::from(value as u64)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

/// The simple, scalar half of a metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Simple {
    value: Value,
    timestamp: SystemTime,
    relative: bool,
}

impl Simple {
    /// Returns the current value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Returns the time of the last write.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Returns `true` if the value has only ever been added to.
    ///
    /// A relative value is a delta on top of whatever came before it, and can be summed with an older value of the same
    /// metric. Once the value has been `set`, it is absolute and replaces anything older.
    pub fn is_relative(&self) -> bool {
        self.relative
    }
}

/// Running count/sum/min/max over a set of observations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aggregate {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    timestamp: Option<SystemTime>,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self { count: 0, sum: 0.0, min: f64::INFINITY, max: f64::NEG_INFINITY, timestamp: None }
    }
}

impl Aggregate {
    /// Records a single observation.
    pub fn record(&mut self, value: f64, now: SystemTime) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.timestamp = Some(now);
    }

    /// Folds another aggregate into this one.
    pub fn merge(&mut self, other: &Aggregate) {
        if other.count == 0 {
            return;
        }

        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.timestamp = match (self.timestamp, other.timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Returns the number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the sum of all observations.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the smallest observation, if any were recorded.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Returns the largest observation, if any were recorded.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Returns the mean of all observations, if any were recorded.
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Returns the time of the last observation.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Returns `true` if no observations have been recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A single named statistic.
///
/// A metric holds an optional simple value (a counter or gauge) and an extended aggregate fed by repeated observations,
/// typically timings. Either, both, or neither may be present; only the halves that hold data are serialized.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    name: String,
    simple: Option<Simple>,
    aggregate: Aggregate,
    accumulate: bool,
    extended: bool,
}

impl Metric {
    /// Creates an empty `Metric` with the given name.
    pub fn new<N>(name: N) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            simple: None,
            aggregate: Aggregate::default(),
            accumulate: false,
            extended: false,
        }
    }

    /// Returns the name of the metric, without any namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the simple half of the metric, if it has been written to.
    pub fn simple(&self) -> Option<&Simple> {
        self.simple.as_ref()
    }

    /// Returns the simple value, if it has been written to.
    pub fn simple_value(&self) -> Option<Value> {
        self.simple.map(|s| s.value)
    }

    /// Returns the time of the last simple write.
    pub fn simple_timestamp(&self) -> Option<SystemTime> {
        self.simple.map(|s| s.timestamp)
    }

    /// Returns the extended aggregate.
    pub fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    /// Returns the mean of the extended observations, if any were recorded.
    pub fn avg(&self) -> Option<f64> {
        self.aggregate.avg()
    }

    /// Returns `true` if this metric is carried forward across flushes.
    pub fn is_accumulating(&self) -> bool {
        self.accumulate
    }

    /// Returns `true` if this metric holds, or has been marked for, extended observations.
    pub fn is_extended(&self) -> bool {
        self.extended || !self.aggregate.is_empty()
    }

    /// Adds `value` to the simple value, or initializes it if it was unset.
    pub fn add<V>(&mut self, value: V)
    where
        V: Into<Value>,
    {
        self.add_at(value.into(), SystemTime::now());
    }

    pub(crate) fn add_at(&mut self, value: Value, now: SystemTime) {
        self.simple = Some(match self.simple {
            Some(current) => Simple {
                value: current.value + value,
                timestamp: now,
                relative: current.relative,
            },
            None => Simple { value, timestamp: now, relative: true },
        });
    }

    /// Increments the simple value by `amount`.
    pub fn incr<V>(&mut self, amount: V)
    where
        V: Into<Value>,
    {
        self.add(amount);
    }

    /// Decrements the simple value by `amount`.
    pub fn decr<V>(&mut self, amount: V)
    where
        V: Into<Value>,
    {
        self.add(-amount.into());
    }

    /// Replaces the simple value with `value`.
    pub fn set<V>(&mut self, value: V)
    where
        V: Into<Value>,
    {
        self.set_at(value.into(), SystemTime::now());
    }

    pub(crate) fn set_at(&mut self, value: Value, now: SystemTime) {
        self.simple = Some(Simple { value, timestamp: now, relative: false });
    }

    /// Records an extended observation.
    pub fn add_ex(&mut self, value: f64) {
        self.add_ex_at(value, SystemTime::now());
    }

    pub(crate) fn add_ex_at(&mut self, value: f64, now: SystemTime) {
        self.aggregate.record(value, now);
    }

    /// Marks the metric as carried forward across flushes.
    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate;
    }

    pub(crate) fn mark_extended(&mut self) {
        self.extended = true;
    }

    /// Folds an older copy of this metric into `self`.
    ///
    /// `self` holds the newer writes. A relative simple value is summed onto the older one, while an absolute value
    /// replaces it. Aggregates are combined and flags are kept if either side has them.
    pub(crate) fn absorb(&mut self, older: &Metric) {
        self.simple = match (older.simple, self.simple.take()) {
            (Some(old), Some(new)) if new.relative => Some(Simple {
                value: old.value + new.value,
                timestamp: new.timestamp,
                relative: old.relative,
            }),
            (old, None) => old,
            (_, new) => new,
        };
        self.aggregate.merge(&older.aggregate);
        self.accumulate |= older.accumulate;
        self.extended |= older.extended;
    }
}
