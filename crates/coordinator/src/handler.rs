//! Call correlation for application requests
//!
//! Wraps remote application calls so the global transaction travels with
//! them. The caller keeps a `CallContext` for the duration of one call and
//! passes it to the request and response hooks.

use crate::bridge::TransactionManager;
use crate::error::{Result, WsatError};
use crate::registration::RegistrationService;
use crate::registry::TransactionRegistry;
use crate::rpc::Transport;
use std::sync::Arc;
use std::time::Duration;
use wsat_common::GlobalId;
use wsat_engine::Message;
use wsat_protocol::CoordinationContext;

/// Transactions bound to one in-flight call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallContext {
    outbound: Option<GlobalId>,
    inbound: Option<GlobalId>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction the outgoing call is made under
    pub fn outbound(&self) -> Option<&GlobalId> {
        self.outbound.as_ref()
    }

    /// Transaction the incoming call is served under
    pub fn inbound(&self) -> Option<&GlobalId> {
        self.inbound.as_ref()
    }
}

pub struct TransactionHandler {
    registry: Arc<TransactionRegistry>,
    bridge: Arc<dyn TransactionManager>,
    registration: Arc<RegistrationService>,
    transport: Arc<dyn Transport>,
}

impl TransactionHandler {
    pub fn new(
        registry: Arc<TransactionRegistry>,
        bridge: Arc<dyn TransactionManager>,
        registration: Arc<RegistrationService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            bridge,
            registration,
            transport,
        }
    }

    /// Attach the active local transaction, if any, to an outgoing call
    pub async fn handle_outbound_request(
        &self,
        ctx: &mut CallContext,
        message: &mut Message,
    ) -> Result<()> {
        if !self.bridge.is_active() {
            return Ok(());
        }

        let global_id = self.bridge.export_id()?;

        if let Err(e) = self.attach_context(&global_id, message).await {
            self.bridge.unexport(&global_id);
            return Err(e);
        }

        self.bridge.suspend(&global_id);
        ctx.outbound = Some(global_id);
        Ok(())
    }

    async fn attach_context(&self, global_id: &GlobalId, message: &mut Message) -> Result<()> {
        let context = match self.registry.get(global_id) {
            // Participants pass on their own coordinator
            Some(tx) if tx.as_participant().is_some() => tx.context(),
            _ => {
                self.registration
                    .activate_as_coordinator(global_id, self.bridge.get_timeout())
                    .await?
            }
        };

        context.attach(message)?;
        Ok(())
    }

    /// Release the transaction bound to an outgoing call
    pub fn handle_outbound_response(&self, ctx: &mut CallContext, faulted: bool) {
        let Some(global_id) = ctx.outbound.take() else {
            return;
        };

        self.bridge.resume(&global_id);
        if faulted {
            tracing::debug!("Call under {} faulted, marking rollback-only", global_id);
            self.bridge.set_rollback_only(&global_id);
        }
        self.bridge.unexport(&global_id);
    }

    /// Join the transaction carried by an incoming call, if any
    pub async fn handle_inbound_request(&self, ctx: &mut CallContext, message: &Message) -> Result<()> {
        let Some(context) = CoordinationContext::from_message(message)? else {
            return Ok(());
        };

        let global_id = context.global_id.clone();
        let timeout_millis = context.remaining_millis();
        if timeout_millis < 0 {
            return Err(WsatError::ExpiredTransaction {
                global_id,
                timeout_millis,
            });
        }

        let created = self
            .bridge
            .import_id(&global_id, (timeout_millis as u64).div_ceil(1000))?;

        if created
            && !self.registry.contains(&global_id)
            && let Err(e) = self.join(&global_id, context, timeout_millis).await
        {
            self.bridge.unimport(&global_id);
            return Err(e);
        }

        ctx.inbound = Some(global_id);
        Ok(())
    }

    /// Release the transaction bound to an incoming call
    pub fn handle_inbound_response(&self, ctx: &mut CallContext) {
        if let Some(global_id) = ctx.inbound.take() {
            self.bridge.unimport(&global_id);
        }
    }

    /// Make a request under the current local transaction
    pub async fn call(
        &self,
        ctx: &mut CallContext,
        address: &str,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.handle_outbound_request(ctx, &mut message).await?;
        let result = self.transport.request(address, message, timeout).await;
        self.handle_outbound_response(ctx, result.is_err());
        result
    }

    async fn join(
        &self,
        global_id: &GlobalId,
        context: CoordinationContext,
        timeout_millis: i64,
    ) -> Result<()> {
        let tx = self
            .registration
            .activate_as_participant(global_id, context.registration, timeout_millis)?;

        if let Err(e) = self
            .registration
            .register_participant_with_coordinator(global_id, &tx)
            .await
        {
            self.registry.remove(global_id);
            return Err(e);
        }
        Ok(())
    }
}
