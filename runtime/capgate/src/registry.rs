//! Protocol Registry
//!
//! Read-only catalogue from method UID to method signature, built once from
//! static [`ProtocolDef`]s before the kernel starts. The dispatch engine
//! consults it to reject unknown methods and to check argument and return
//! shapes.

use std::collections::HashMap;

use crate::error::{IpcError, Result};
use crate::protocol::{MethodDef, MethodId, MethodUid, ProtocolDef, ProtocolUid, Ty};
use crate::value::{check_shape, Value};

/// Registered method: its signature and the protocol it belongs to
#[derive(Debug, Clone, Copy)]
pub struct MethodEntry {
    pub protocol: &'static ProtocolDef,
    pub def: &'static MethodDef,
}

impl MethodEntry {
    pub fn param_types(&self) -> Vec<Ty> {
        self.def.params.iter().map(|p| p.ty).collect()
    }
}

/// Catalogue of known protocols and methods
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<ProtocolUid, &'static ProtocolDef>,
    methods: HashMap<MethodUid, MethodEntry>,
}

impl ProtocolRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            registry: ProtocolRegistry::default(),
        }
    }

    /// Registry holding exactly `protocols`
    pub fn with_protocols(protocols: &[&'static ProtocolDef]) -> Result<Self> {
        protocols
            .iter()
            .try_fold(Self::builder(), |b, p| b.register(*p))
            .map(RegistryBuilder::build)
    }

    /// Signature of a method, if known
    pub fn lookup(&self, method: MethodUid) -> Option<&MethodEntry> {
        self.methods.get(&method)
    }

    pub fn protocol(&self, uid: ProtocolUid) -> Option<&'static ProtocolDef> {
        self.protocols.get(&uid).copied()
    }

    pub fn is_known(&self, method: MethodUid) -> bool {
        self.methods.contains_key(&method)
    }

    /// Check call arguments against the declared parameter list
    ///
    /// # Errors
    /// `UnknownMethod` or `MalformedArguments`.
    pub fn validate_args(&self, method: MethodUid, args: &[Value]) -> Result<&MethodEntry> {
        let entry = self.lookup(method).ok_or(IpcError::UnknownMethod { method })?;
        check_shape(args, &entry.param_types())
            .map_err(|reason| IpcError::MalformedArguments { method, reason })?;
        Ok(entry)
    }

    /// Check reply values against the declared return list
    ///
    /// # Errors
    /// `UnknownMethod` or `MalformedReply`.
    pub fn validate_returns(&self, method: MethodUid, values: &[Value]) -> Result<()> {
        let entry = self.lookup(method).ok_or(IpcError::UnknownMethod { method })?;
        check_shape(values, entry.def.returns)
            .map_err(|reason| IpcError::MalformedReply { method, reason })
    }

    pub fn protocol_count(&self) -> usize {
        self.protocols.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

/// Builds a [`ProtocolRegistry`]
pub struct RegistryBuilder {
    registry: ProtocolRegistry,
}

impl RegistryBuilder {
    /// Add a protocol and all of its methods
    ///
    /// Registering an identical definition twice is accepted.
    ///
    /// # Errors
    /// `ConflictingDefinition` if a method UID is already bound to a
    /// different shape, the protocol declares a method id twice, or another
    /// protocol definition already uses this UID.
    pub fn register(mut self, protocol: &'static ProtocolDef) -> Result<Self> {
        if let Some(existing) = self.registry.protocols.get(&protocol.uid) {
            if !core::ptr::eq(*existing, protocol) {
                let method = protocol.uid.method(
                    protocol.methods.first().map_or(MethodId(0), |m| m.id),
                );
                return Err(IpcError::ConflictingDefinition { method });
            }
            return Ok(self);
        }

        for (i, def) in protocol.methods.iter().enumerate() {
            let method = protocol.uid.method(def.id);
            if protocol.methods[..i].iter().any(|m| m.id == def.id) {
                return Err(IpcError::ConflictingDefinition { method });
            }
            if let Some(entry) = self.registry.methods.get(&method) {
                if !entry.def.same_shape(def) {
                    return Err(IpcError::ConflictingDefinition { method });
                }
            }
        }

        for def in protocol.methods {
            self.registry
                .methods
                .insert(protocol.uid.method(def.id), MethodEntry { protocol, def });
        }
        self.registry.protocols.insert(protocol.uid, protocol);
        log::debug!(
            "registered protocol {} ({}) with {} methods",
            protocol.name,
            protocol.uid,
            protocol.methods.len()
        );
        Ok(self)
    }

    pub fn build(self) -> ProtocolRegistry {
        self.registry
    }
}
