//! Protocol and method identifiers, and static protocol definitions
//!
//! A protocol is a 96-bit UID plus a set of methods, each with a 32-bit id
//! scoped to that protocol. A method UID is the 128-bit concatenation of the
//! two and is the only selector a client ever invokes: every method UID is
//! its own call gate.
//!
//! ## Layout
//!
//! ```text
//!  127                             32 31              0
//! ┌────────────────────────────────┬─────────────────┐
//! │        protocol uid (96)       │  method id (32) │
//! └────────────────────────────────┴─────────────────┘
//! ```
//!
//! Protocol definitions are plain `'static` data. [`define_protocol!`] is the
//! hand-written form of what a protocol compiler would emit.

use core::fmt;

use static_assertions::{assert_eq_size, const_assert_eq};

/// Width of a protocol UID in bits
pub const PROTOCOL_UID_BITS: u32 = 96;

const PROTOCOL_UID_MASK: u128 = (1u128 << PROTOCOL_UID_BITS) - 1;

/// 96-bit protocol identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolUid(u128);

impl ProtocolUid {
    /// Create a protocol UID
    ///
    /// # Panics
    /// Panics (at compile time in const context) if `raw` is wider than 96 bits.
    pub const fn new(raw: u128) -> Self {
        assert!(raw & !PROTOCOL_UID_MASK == 0, "protocol uid wider than 96 bits");
        Self(raw)
    }

    /// Raw 96-bit value
    #[inline]
    pub const fn raw(self) -> u128 {
        self.0
    }

    /// Method UID for `method` within this protocol
    #[inline]
    pub const fn method(self, method: MethodId) -> MethodUid {
        MethodUid::new(self, method)
    }
}

impl fmt::Display for ProtocolUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:024x}", self.0)
    }
}

impl fmt::Debug for ProtocolUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolUid({})", self)
    }
}

/// 32-bit method identifier, scoped to its protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub u32);

/// 128-bit (protocol uid, method id) selector
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodUid(u128);

assert_eq_size!(MethodUid, u128);
const_assert_eq!(PROTOCOL_UID_BITS + 32, 128);

impl MethodUid {
    pub const fn new(protocol: ProtocolUid, method: MethodId) -> Self {
        Self((protocol.0 << 32) | method.0 as u128)
    }

    /// Rebuild a method UID from its 128-bit wire form
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u128 {
        self.0
    }

    /// The protocol this method belongs to
    #[inline]
    pub const fn protocol(self) -> ProtocolUid {
        ProtocolUid(self.0 >> 32)
    }

    #[inline]
    pub const fn method_id(self) -> MethodId {
        MethodId(self.0 as u32)
    }
}

impl fmt::Display for MethodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.protocol(), self.method_id().0)
    }
}

impl fmt::Debug for MethodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodUid({})", self)
    }
}

/// Argument and return types a method signature may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Bool,
    /// Arbitrary byte sequence
    Bytes,
    /// Object reference, delivered to the receiver as a handle in its own table
    Handle,
}

impl Ty {
    /// Bit width of integer types, `None` for everything else
    pub const fn int_bits(self) -> Option<u32> {
        match self {
            Ty::U8 | Ty::I8 => Some(8),
            Ty::U16 | Ty::I16 => Some(16),
            Ty::U32 | Ty::I32 => Some(32),
            Ty::U64 | Ty::I64 => Some(64),
            _ => None,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64)
    }
}

/// Named, typed parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: &'static str,
    pub ty: Ty,
}

/// One method of a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodDef {
    pub id: MethodId,
    pub name: &'static str,
    pub params: &'static [Param],
    pub returns: &'static [Ty],
}

impl MethodDef {
    /// True if both definitions describe the same argument/return shape
    pub fn same_shape(&self, other: &MethodDef) -> bool {
        self.returns == other.returns
            && self.params.len() == other.params.len()
            && self.params.iter().zip(other.params).all(|(a, b)| a.ty == b.ty)
    }
}

/// A protocol: namespace name, UID and its methods
#[derive(Debug)]
pub struct ProtocolDef {
    pub name: &'static str,
    pub uid: ProtocolUid,
    pub methods: &'static [MethodDef],
}

impl ProtocolDef {
    /// Find a method by id
    pub fn method(&self, id: MethodId) -> Option<&'static MethodDef> {
        self.methods.iter().find(|m| m.id == id)
    }

    /// Find a method by name
    pub fn method_named(&self, name: &str) -> Option<&'static MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Declare a protocol as static data.
///
/// Produces a `pub static` [`ProtocolDef`] and a module of [`MethodUid`]
/// constants, one per method, named after the method.
///
/// ```
/// capgate::define_protocol! {
///     /// Byte stream protocol.
///     pub protocol STREAM("capgate.stream", 0x5354_5245_414d, mod stream) {
///         0 => read(len: U32) -> (Bytes);
///         1 => write(data: Bytes) -> (U32);
///     }
/// }
///
/// assert_eq!(stream::read.protocol(), STREAM.uid);
/// assert_eq!(STREAM.methods.len(), 2);
/// ```
#[macro_export]
macro_rules! define_protocol {
    (
        $(#[$meta:meta])*
        $vis:vis protocol $name:ident ($ns:expr, $uid:expr, mod $consts:ident) {
            $(
                $(#[$mmeta:meta])*
                $id:literal => $method:ident ( $($pname:ident : $pty:ident),* $(,)? )
                    -> ( $($rty:ident),* $(,)? );
            )*
        }
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::protocol::ProtocolDef = $crate::protocol::ProtocolDef {
            name: $ns,
            uid: $crate::protocol::ProtocolUid::new($uid),
            methods: &[
                $(
                    $crate::protocol::MethodDef {
                        id: $crate::protocol::MethodId($id),
                        name: stringify!($method),
                        params: &[
                            $($crate::protocol::Param {
                                name: stringify!($pname),
                                ty: $crate::protocol::Ty::$pty,
                            }),*
                        ],
                        returns: &[$($crate::protocol::Ty::$rty),*],
                    }
                ),*
            ],
        };

        #[allow(non_upper_case_globals)]
        $vis mod $consts {
            $(
                $(#[$mmeta])*
                pub const $method: $crate::protocol::MethodUid = $crate::protocol::MethodUid::new(
                    $crate::protocol::ProtocolUid::new($uid),
                    $crate::protocol::MethodId($id),
                );
            )*
        }
    };
}
