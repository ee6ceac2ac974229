use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{TypeId, Value};

/// Type descriptor mirroring the [`Value`] variants, plus a union form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
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
    /// Homogeneously typed list.
    List(Box<Type>),
    /// Ordered named fields.
    Struct(Vec<(String, Type)>),
    /// Positional tuple.
    Tuple(Vec<Type>),
    /// Singleton sentinel type.
    Phantom,
    /// One of several alternatives.
    Union(Vec<Type>),
}

impl Type {
    /// A value conforms to a type when its tag is among the type's
    /// alternatives. Non-union types have exactly one alternative.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Type::Union(alternatives) => alternatives.iter().any(|t| t.accepts(value)),
            _ => self.tag() == Some(value.type_id()),
        }
    }

    fn tag(&self) -> Option<TypeId> {
        match self {
            Type::Null => Some(TypeId::Null),
            Type::Int => Some(TypeId::Int),
            Type::Float => Some(TypeId::Float),
            Type::Boolean => Some(TypeId::Boolean),
            Type::String => Some(TypeId::String),
            Type::Timestamp => Some(TypeId::Timestamp),
            Type::Duration => Some(TypeId::Duration),
            Type::List(_) => Some(TypeId::List),
            Type::Struct(_) => Some(TypeId::Struct),
            Type::Tuple(_) => Some(TypeId::Tuple),
            Type::Phantom => Some(TypeId::Phantom),
            Type::Union(_) => None,
        }
    }

    /// Smallest union covering both types. Equal types unify to themselves.
    pub fn unify(self, other: Type) -> Type {
        if self == other {
            return self;
        }
        let mut alternatives = match self {
            Type::Union(alts) => alts,
            t => vec![t],
        };
        match other {
            Type::Union(alts) => {
                for alt in alts {
                    if !alternatives.contains(&alt) {
                        alternatives.push(alt);
                    }
                }
            }
            t => {
                if !alternatives.contains(&t) {
                    alternatives.push(t);
                }
            }
        }
        Type::Union(alternatives)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Null => write!(f, "NULL"),
            Type::Int => write!(f, "Int"),
            Type::Float => write!(f, "Float"),
            Type::Boolean => write!(f, "Boolean"),
            Type::String => write!(f, "String"),
            Type::Timestamp => write!(f, "Timestamp"),
            Type::Duration => write!(f, "Duration"),
            Type::List(element) => write!(f, "[{element}]"),
            Type::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, typ)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{name}: {typ}")?;
                }
                write!(f, "}}")
            }
            Type::Tuple(items) => {
                write!(f, "(")?;
                for (i, typ) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{typ}")?;
                }
                write!(f, ")")
            }
            Type::Phantom => write!(f, "Phantom"),
            Type::Union(alternatives) => {
                write!(f, "Union<")?;
                for (i, typ) in alternatives.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{typ}")?;
                }
                write!(f, ">")
            }
        }
    }
}

/// A named, typed field of a source schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Fully qualified field name.
    pub name: String,
    /// Field type.
    pub typ: Type,
}

/// Ordered field list exposed by a source, with an optional designated
/// event-time field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Ordered fields.
    pub fields: Vec<SchemaField>,
    /// Name of the field carrying event time, when the source has one.
    pub time_field: Option<String>,
}

impl Schema {
    /// Schema without a designated event-time field.
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Schema {
            fields,
            time_field: None,
        }
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}
