//! Protocols, their methods, and name/id lookup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use framed_rpc_proto::{
    prototype, DynValue, MethodLookup, Position, Prototype, ProtocolUniqueId, ResolveError,
    UniqueIdRegistry,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{AppError, RegistryError, RequestContext};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub(crate) type ServeFn =
    Arc<dyn Fn(RequestContext, DynValue) -> BoxFuture<Result<serde_cbor::Value, AppError>> + Send + Sync>;

/// One callable method: how to decode its argument and how to run it.
#[derive(Clone)]
pub struct MethodHandler {
    name: String,
    position: Position,
    arg: Prototype,
    serve: ServeFn,
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandler")
            .field("name", &self.name)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl MethodHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub(crate) fn arg_prototype(&self) -> Prototype {
        self.arg
    }

    pub(crate) fn serve(
        &self,
        ctx: RequestContext,
        arg: DynValue,
    ) -> BoxFuture<Result<serde_cbor::Value, AppError>> {
        (self.serve)(ctx, arg)
    }
}

/// A named group of methods. Positions follow declaration order, starting at 0.
#[derive(Debug)]
pub struct Protocol {
    name: String,
    unique_id: Option<ProtocolUniqueId>,
    methods: Vec<Arc<MethodHandler>>,
    by_name: HashMap<String, usize>,
}

impl Protocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_id: None,
            methods: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Makes the protocol reachable through `[id, position]` method identities.
    pub fn with_unique_id(mut self, id: ProtocolUniqueId) -> Self {
        self.unique_id = Some(id);
        self
    }

    pub fn method<A, R, E, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<AppError> + 'static,
        F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let name = name.into();
        let serve: ServeFn = Arc::new(
            move |ctx, arg: DynValue| -> BoxFuture<Result<serde_cbor::Value, AppError>> {
                let Ok(arg) = arg.downcast::<A>() else {
                    return Box::pin(async {
                        Err(AppError::from("argument decoded into an unexpected type"))
                    });
                };
                let fut = handler(ctx, *arg);
                Box::pin(async move {
                    let value = match fut.await {
                        Ok(value) => value,
                        Err(err) => return Err(err.into()),
                    };
                    serde_cbor::value::to_value(value).map_err(|err| -> AppError { Box::new(err) })
                })
            },
        );

        let position = Position(self.methods.len() as u64);
        // A repeated name keeps its first position for lookups and is rejected by `Registry::register`.
        self.by_name.entry(name.clone()).or_insert(self.methods.len());
        self.methods.push(Arc::new(MethodHandler {
            name,
            position,
            arg: prototype::<A>(),
            serve,
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> Option<ProtocolUniqueId> {
        self.unique_id
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodHandler> {
        self.methods.iter().map(|m| m.as_ref())
    }
}

/// All protocols served on a connection.
#[derive(Debug, Default)]
pub struct Registry {
    protocols: HashMap<String, Arc<Protocol>>,
    by_id: HashMap<ProtocolUniqueId, Arc<Protocol>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `protocol`, claiming its unique id (if any) in `ids`.
    pub fn register(&mut self, protocol: Protocol, ids: &UniqueIdRegistry) -> Result<(), RegistryError> {
        if self.protocols.contains_key(&protocol.name) {
            return Err(RegistryError::AlreadyRegistered {
                protocol: protocol.name,
            });
        }
        if protocol.by_name.len() != protocol.methods.len() {
            let mut seen = std::collections::HashSet::new();
            let method = protocol
                .methods
                .iter()
                .find(|m| !seen.insert(m.name.as_str()))
                .map(|m| m.name.clone())
                .unwrap_or_default();
            return Err(RegistryError::DuplicateMethod {
                protocol: protocol.name,
                method,
            });
        }
        if let Some(id) = protocol.unique_id {
            if let Some(existing) = self.by_id.get(&id) {
                return Err(RegistryError::AlreadyRegisteredV2 {
                    protocol: protocol.name,
                    id: id.0,
                    existing: existing.name.clone(),
                });
            }
            ids.register(&protocol.name, id.0)
                .map_err(|collision| RegistryError::AlreadyRegisteredV2 {
                    protocol: protocol.name.clone(),
                    id: collision.id,
                    existing: collision.existing,
                })?;
        }

        let protocol = Arc::new(protocol);
        if let Some(id) = protocol.unique_id {
            self.by_id.insert(id, protocol.clone());
        }
        self.protocols.insert(protocol.name.clone(), protocol);
        Ok(())
    }

    pub fn protocol(&self, name: &str) -> Option<&Protocol> {
        self.protocols.get(name).map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

impl MethodLookup for Registry {
    type Handler = Arc<MethodHandler>;

    fn lookup_by_name(&self, protocol: &str, method: &str) -> Result<Arc<MethodHandler>, ResolveError> {
        let p = self
            .protocols
            .get(protocol)
            .ok_or_else(|| ResolveError::ProtocolNotFound {
                protocol: protocol.to_string(),
            })?;
        p.by_name
            .get(method)
            .and_then(|&idx| p.methods.get(idx))
            .cloned()
            .ok_or_else(|| ResolveError::MethodNotFound {
                protocol: protocol.to_string(),
                method: method.to_string(),
            })
    }

    fn lookup_by_id(
        &self,
        protocol: ProtocolUniqueId,
        position: Position,
    ) -> Result<(String, Arc<MethodHandler>), ResolveError> {
        let p = self
            .by_id
            .get(&protocol)
            .ok_or(ResolveError::ProtocolV2NotFound { id: protocol.0 })?;
        let handler = usize::try_from(position.0)
            .ok()
            .and_then(|idx| p.methods.get(idx))
            .ok_or_else(|| ResolveError::MethodV2NotFound {
                id: protocol.0,
                position: position.0,
                protocol: p.name.clone(),
            })?;
        Ok((format!("{}.{}", p.name, handler.name), handler.clone()))
    }
}
