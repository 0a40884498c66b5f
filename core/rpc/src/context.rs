// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Per-request view handed to procedure handlers.
pub struct RequestContext<C> {
    context: Arc<C>,
    port_id: u32,
    port_name: Arc<str>,
    procedure_id: u32,
    cancellation: CancellationToken,
}

impl<C> Clone for RequestContext<C> {
    fn clone(&self) -> Self {
        RequestContext {
            context: self.context.clone(),
            port_id: self.port_id,
            port_name: self.port_name.clone(),
            procedure_id: self.procedure_id,
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<C> std::fmt::Debug for RequestContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("port_id", &self.port_id)
            .field("port_name", &self.port_name)
            .field("procedure_id", &self.procedure_id)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl<C> RequestContext<C> {
    pub(crate) fn new(
        context: Arc<C>,
        port_id: u32,
        port_name: Arc<str>,
        procedure_id: u32,
        cancellation: CancellationToken,
    ) -> Self {
        RequestContext {
            context,
            port_id,
            port_name,
            procedure_id,
            cancellation,
        }
    }

    /// The value given when the transport was attached.
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn shared_context(&self) -> Arc<C> {
        self.context.clone()
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn procedure_id(&self) -> u32 {
        self.procedure_id
    }

    /// Cancelled when the port is destroyed or the server disposed.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
