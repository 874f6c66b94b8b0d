//! Gateway assembly: transfer core plus user-facing receiver.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::options::Options;
use crate::receiver::Receiver;
use crate::registry::{AppInfo, Registry};
use crate::transfer::Transfer;

pub struct Gateway {
    transfer: Transfer,
    receiver: Receiver,
}

impl Gateway {
    pub fn new(app_info: AppInfo, options: Options, registry: Arc<dyn Registry>) -> Self {
        let transfer = Transfer::new(app_info, options, registry);
        let receiver = Receiver::new(&transfer);
        Gateway { transfer, receiver }
    }

    /// Startup order: transfer (executor, managers, registry, periodic
    /// tasks), then the listener.  A registry failure here aborts
    /// startup; later registry hiccups only log.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.transfer.start().await?;
        self.receiver.start().await
    }

    /// Shutdown reverses startup: stop accepting users, then wind the
    /// transfer side down.
    pub async fn stop(&self) {
        self.receiver.stop().await;
        self.transfer.stop().await;
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }
}
