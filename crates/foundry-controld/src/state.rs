use std::sync::Arc;

use foundry_invoker::Pipeline;
use foundry_relay::{ChannelSubscriber, EventRelay};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub relay: Arc<EventRelay>,
    pub channels: Arc<ChannelSubscriber>,
    pub metrics: Arc<Metrics>,
}
