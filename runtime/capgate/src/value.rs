//! Marshalled argument and return values
//!
//! Values travel between caller and server as a `Vec<Value>`. Integer values
//! are carried at full width and range-checked against the declared [`Ty`].
//! Capabilities travel in two forms: [`Value::Handle`] names an entry in the
//! sender's own handle table, [`Value::Object`] carries an owned object
//! reference. The dispatch engine converts between the two so that each side
//! only ever sees handle numbers from its own table.

use crate::object::ObjectRef;
use crate::protocol::Ty;
use crate::table::Handle;

/// One marshalled argument or return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Handle number in the sender's (or, once delivered, the receiver's) table
    Handle(Handle),
    /// Owned object reference, moved to the receiver
    Object(ObjectRef),
}

impl Value {
    /// Short type name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unsigned(_) => "unsigned",
            Value::Signed(_) => "signed",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Handle(_) => "handle",
            Value::Object(_) => "object",
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match *self {
            Value::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64> {
        match *self {
            Value::Signed(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match *self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// Check this value against a declared type
    pub fn check(&self, ty: Ty) -> Result<(), String> {
        match (ty, self) {
            (Ty::Bool, Value::Bool(_)) => Ok(()),
            (Ty::Bytes, Value::Bytes(_)) => Ok(()),
            (Ty::Handle, Value::Handle(_) | Value::Object(_)) => Ok(()),
            (ty, Value::Unsigned(v)) if !ty.is_signed() && ty.int_bits().is_some() => {
                let bits = ty.int_bits().unwrap_or(64);
                if bits == 64 || *v >> bits == 0 {
                    Ok(())
                } else {
                    Err(format!("{} does not fit {:?}", v, ty))
                }
            }
            (ty, Value::Signed(v)) if ty.is_signed() => {
                let bits = ty.int_bits().unwrap_or(64);
                let min = i64::MIN >> (64 - bits);
                let max = i64::MAX >> (64 - bits);
                if (min..=max).contains(v) {
                    Ok(())
                } else {
                    Err(format!("{} does not fit {:?}", v, ty))
                }
            }
            (ty, value) => Err(format!("expected {:?}, got {}", ty, value.kind())),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Signed(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

/// Check a value list against a declared type list
pub(crate) fn check_shape(values: &[Value], types: &[Ty]) -> Result<(), String> {
    if values.len() != types.len() {
        return Err(format!("expected {} values, got {}", types.len(), values.len()));
    }
    for (index, (value, ty)) in values.iter().zip(types).enumerate() {
        value.check(*ty).map_err(|reason| format!("value {}: {}", index, reason))?;
    }
    Ok(())
}
