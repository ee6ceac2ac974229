use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Type;

/// Discriminant of a [`Value`] variant.
///
/// The declaration order defines the cross-type total order used by
/// [`Value::compare`]: values of different type ids order by type id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeId {
    /// Absent value.
    Null,
    /// 64-bit signed integer.
    Int,
    /// 64-bit IEEE-754 float.
    Float,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
    /// Point in time (UTC).
    Timestamp,
    /// Signed duration.
    Duration,
    /// Ordered list of values.
    List,
    /// Ordered named fields.
    Struct,
    /// Positional tuple.
    Tuple,
    /// Singleton sentinel, used as the key of keyless groups.
    Phantom,
}

/// A dynamically typed runtime value.
///
/// Values are immutable: they are created by sources or expression
/// evaluation and never mutated afterwards. Equality is structural and
/// total; see [`Value::compare`] for the exact ordering contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit IEEE-754 float.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
    /// Point in time (UTC).
    Timestamp(DateTime<Utc>),
    /// Signed duration.
    Duration(#[serde(with = "duration_serde")] chrono::Duration),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Ordered named fields.
    Struct(Vec<(String, Value)>),
    /// Positional tuple.
    Tuple(Vec<Value>),
    /// Singleton sentinel, used as the key of keyless groups.
    Phantom,
}

impl Value {
    /// Returns the variant discriminant.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Null => TypeId::Null,
            Value::Int(_) => TypeId::Int,
            Value::Float(_) => TypeId::Float,
            Value::Boolean(_) => TypeId::Boolean,
            Value::String(_) => TypeId::String,
            Value::Timestamp(_) => TypeId::Timestamp,
            Value::Duration(_) => TypeId::Duration,
            Value::List(_) => TypeId::List,
            Value::Struct(_) => TypeId::Struct,
            Value::Tuple(_) => TypeId::Tuple,
            Value::Phantom => TypeId::Phantom,
        }
    }

    /// Returns the type descriptor of this value.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Boolean(_) => Type::Boolean,
            Value::String(_) => Type::String,
            Value::Timestamp(_) => Type::Timestamp,
            Value::Duration(_) => Type::Duration,
            Value::List(items) => {
                let element = items
                    .iter()
                    .map(Value::type_of)
                    .fold(None::<Type>, |acc, t| match acc {
                        None => Some(t),
                        Some(prev) => Some(prev.unify(t)),
                    })
                    .unwrap_or(Type::Null);
                Type::List(Box::new(element))
            }
            Value::Struct(fields) => Type::Struct(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.type_of()))
                    .collect(),
            ),
            Value::Tuple(items) => Type::Tuple(items.iter().map(Value::type_of).collect()),
            Value::Phantom => Type::Phantom,
        }
    }

    /// Total order across all values.
    ///
    /// Values of different type ids order by type id. Within floats,
    /// IEEE-754 ordering applies except NaN equals NaN and is greater than
    /// every other float, which keeps the order total and hashing
    /// deterministic.
    pub fn compare(&self, other: &Value) -> Ordering {
        let tags = self.type_id().cmp(&other.type_id());
        if tags != Ordering::Equal {
            return tags;
        }
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Phantom, Value::Phantom) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => compare_floats(*a, *b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Duration(a), Value::Duration(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                compare_sequences(a, b)
            }
            (Value::Struct(a), Value::Struct(b)) => {
                for ((name_a, val_a), (name_b, val_b)) in a.iter().zip(b.iter()) {
                    let names = name_a.cmp(name_b);
                    if names != Ordering::Equal {
                        return names;
                    }
                    let values = val_a.compare(val_b);
                    if values != Ordering::Equal {
                        return values;
                    }
                }
                a.len().cmp(&b.len())
            }
            // Unreachable: type ids matched above.
            _ => Ordering::Equal,
        }
    }

    /// Deterministic 64-bit hash, stable across processes up to endianness.
    ///
    /// FNV-1a over a canonical byte encoding: NaN and negative zero are
    /// normalized first so that hash equality follows [`Value::compare`]
    /// equality.
    pub fn hash64(&self) -> u64 {
        let mut hasher = Fnv1a::new();
        self.feed(&mut hasher);
        hasher.finish()
    }

    fn feed(&self, hasher: &mut Fnv1a) {
        hasher.write_u8(self.type_id() as u8);
        match self {
            Value::Null | Value::Phantom => {}
            Value::Int(v) => hasher.write_bytes(&v.to_le_bytes()),
            Value::Float(v) => {
                let canonical = if v.is_nan() {
                    f64::NAN.to_bits()
                } else if *v == 0.0 {
                    0.0_f64.to_bits()
                } else {
                    v.to_bits()
                };
                hasher.write_bytes(&canonical.to_le_bytes());
            }
            Value::Boolean(v) => hasher.write_u8(u8::from(*v)),
            Value::String(v) => {
                hasher.write_bytes(&(v.len() as u64).to_le_bytes());
                hasher.write_bytes(v.as_bytes());
            }
            Value::Timestamp(v) => hasher.write_bytes(&v.timestamp_micros().to_le_bytes()),
            Value::Duration(v) => {
                hasher.write_bytes(&v.num_seconds().to_le_bytes());
                hasher.write_bytes(&v.subsec_nanos().to_le_bytes());
            }
            Value::List(items) | Value::Tuple(items) => {
                hasher.write_bytes(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.feed(hasher);
                }
            }
            Value::Struct(fields) => {
                hasher.write_bytes(&(fields.len() as u64).to_le_bytes());
                for (name, value) in fields {
                    hasher.write_bytes(&(name.len() as u64).to_le_bytes());
                    hasher.write_bytes(name.as_bytes());
                    value.feed(hasher);
                }
            }
        }
    }

    /// True when the value is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn compare_floats(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        // Neither side is NaN, so partial_cmp always succeeds.
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_sequences(a: &[Value], b: &[Value]) -> Ordering {
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        let ord = lhs.compare(rhs);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Duration(v) => write!(f, "{v}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Phantom => write!(f, "<phantom>"),
        }
    }
}

/// Minimal FNV-1a hasher over explicit byte feeds.
struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Fnv1a(Self::OFFSET)
    }

    fn write_u8(&mut self, byte: u8) {
        self.0 ^= u64::from(byte);
        self.0 = self.0.wrapping_mul(Self::PRIME);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write_u8(*byte);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &chrono::Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        (value.num_seconds(), value.subsec_nanos()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<chrono::Duration, D::Error> {
        let (seconds, nanos) = <(i64, i32)>::deserialize(deserializer)?;
        Ok(chrono::Duration::seconds(seconds) + chrono::Duration::nanoseconds(i64::from(nanos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cross_type_order_follows_type_ids() {
        let ordered = vec![
            Value::Null,
            Value::Int(10),
            Value::Float(1.0),
            Value::Boolean(false),
            Value::String("a".to_string()),
            Value::Timestamp(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
            Value::Phantom,
        ];
        for window in ordered.windows(2) {
            assert_eq!(window[0].compare(&window[1]), Ordering::Less);
        }
    }

    #[test]
    fn nan_equals_nan_and_exceeds_all_floats() {
        let nan = Value::Float(f64::NAN);
        assert_eq!(nan, Value::Float(f64::NAN));
        assert_eq!(nan.compare(&Value::Float(f64::INFINITY)), Ordering::Greater);
        assert_eq!(Value::Float(1.0).compare(&nan), Ordering::Less);
    }

    #[test]
    fn hash_agrees_with_equality() {
        assert_eq!(
            Value::Float(f64::NAN).hash64(),
            Value::Float(f64::NAN).hash64()
        );
        assert_eq!(Value::Float(0.0).hash64(), Value::Float(-0.0).hash64());
        assert_ne!(Value::Int(1).hash64(), Value::Float(1.0).hash64());
        let tuple = Value::Tuple(vec![Value::Int(1), Value::String("x".to_string())]);
        assert_eq!(tuple.hash64(), tuple.clone().hash64());
    }

    #[test]
    fn tuples_compare_lexicographically() {
        let short = Value::Tuple(vec![Value::Int(1)]);
        let long = Value::Tuple(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(short.compare(&long), Ordering::Less);
        assert_eq!(
            Value::Tuple(vec![Value::Int(2)]).compare(&long),
            Ordering::Greater
        );
    }
}
