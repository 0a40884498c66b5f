// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server ports
//!
//! A port owns the modules registered by the server's port handler and the
//! procedure table built as those modules are loaded. Procedure ids are
//! dense from 0 across every module loaded on the port, in load order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{BoxFuture, Shared};
use futures::{Future, FutureExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, RpcError};
use crate::module::{ModuleDeclaration, Procedure, ServiceModule};
use crate::protocol::ModuleProcedure;

pub type ModuleGenerator<C> =
    Arc<dyn Fn(RpcServerPort<C>) -> BoxFuture<'static, Result<ServiceModule<C>>> + Send + Sync>;

type ModuleLoad = Shared<BoxFuture<'static, Result<ModuleDeclaration>>>;

struct PortInner<C> {
    port_id: u32,
    port_name: Arc<str>,
    context: Arc<C>,
    /// registered module generators, by module name
    generators: RwLock<HashMap<String, ModuleGenerator<C>>>,
    /// memoized loads, shared by concurrent requests for the same module
    loads: Mutex<HashMap<String, ModuleLoad>>,
    procedures: RwLock<Vec<Procedure<C>>>,
    cancellation_token: CancellationToken,
    closed: AtomicBool,
}

/// A server-side port.
pub struct RpcServerPort<C> {
    inner: Arc<PortInner<C>>,
}

impl<C> Clone for RpcServerPort<C> {
    fn clone(&self) -> Self {
        RpcServerPort {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for RpcServerPort<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerPort")
            .field("port_id", &self.inner.port_id)
            .field("port_name", &self.inner.port_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C> RpcServerPort<C> {
    pub(crate) fn new(
        port_id: u32,
        port_name: &str,
        context: Arc<C>,
        cancellation_token: CancellationToken,
    ) -> Self {
        RpcServerPort {
            inner: Arc::new(PortInner {
                port_id,
                port_name: Arc::from(port_name),
                context,
                generators: RwLock::new(HashMap::new()),
                loads: Mutex::new(HashMap::new()),
                procedures: RwLock::new(Vec::new()),
                cancellation_token,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn port_id(&self) -> u32 {
        self.inner.port_id
    }

    pub fn port_name(&self) -> &str {
        &self.inner.port_name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.inner.port_name.clone()
    }

    pub fn context(&self) -> &Arc<C> {
        &self.inner.context
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation_token
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::PortClosed(self.inner.port_id));
        }
        Ok(())
    }
}

impl<C: Send + Sync + 'static> RpcServerPort<C> {
    /// Register a module generator under `name`.
    ///
    /// The generator runs once, the first time a client loads the module.
    pub fn register_module<F, Fut>(&self, name: &str, generator: F) -> Result<()>
    where
        F: Fn(RpcServerPort<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceModule<C>>> + Send + 'static,
    {
        self.check_open()?;

        let mut generators = self.inner.generators.write();
        if generators.contains_key(name) {
            return Err(RpcError::ModuleAlreadyRegistered(name.to_string()));
        }

        let generator: ModuleGenerator<C> = Arc::new(move |port| generator(port).boxed());
        generators.insert(name.to_string(), generator);

        tracing::debug!(port_id = self.inner.port_id, module = name, "module registered");
        Ok(())
    }

    /// Load `name`, instantiating it on first use.
    ///
    /// Concurrent loads of the same module share one instantiation.
    pub async fn load_module(&self, name: &str) -> Result<ModuleDeclaration> {
        self.check_open()?;

        let load = {
            let mut loads = self.inner.loads.lock();
            match loads.get(name) {
                Some(load) => load.clone(),
                None => {
                    let generator = self
                        .inner
                        .generators
                        .read()
                        .get(name)
                        .cloned()
                        .ok_or_else(|| RpcError::UnknownModule(name.to_string()))?;

                    let port = self.clone();
                    let module_name = name.to_string();
                    let load = async move {
                        let module = generator(port.clone()).await?;
                        port.install(module_name, module)
                    }
                    .boxed()
                    .shared();

                    loads.insert(name.to_string(), load.clone());
                    load
                }
            }
        };

        load.await
    }

    fn install(&self, name: String, module: ServiceModule<C>) -> Result<ModuleDeclaration> {
        self.check_open()?;

        let mut procedures = self.inner.procedures.write();
        let mut declaration = ModuleDeclaration {
            name,
            procedures: Vec::with_capacity(module.len()),
        };

        for (procedure_name, procedure) in module.into_procedures() {
            let procedure_id = procedures.len() as u32;
            procedures.push(procedure);
            declaration.procedures.push(ModuleProcedure {
                procedure_id,
                procedure_name,
            });
        }

        tracing::debug!(
            port_id = self.inner.port_id,
            module = %declaration.name,
            procedures = declaration.procedures.len(),
            "module loaded"
        );

        Ok(declaration)
    }

    pub fn procedure(&self, procedure_id: u32) -> Option<Procedure<C>> {
        self.inner
            .procedures
            .read()
            .get(procedure_id as usize)
            .cloned()
    }

    pub fn procedure_count(&self) -> usize {
        self.inner.procedures.read().len()
    }

    /// Registered module names, sorted.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.generators.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close the port: cancel in-flight handlers and drop every module and
    /// procedure. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.cancellation_token.cancel();
        self.inner.loads.lock().clear();
        self.inner.procedures.write().clear();
        self.inner.generators.write().clear();

        tracing::debug!(
            port_id = self.inner.port_id,
            port_name = %self.inner.port_name,
            "port closed"
        );
    }
}
