//! Single entry point for outbound requests.

use color_eyre::Result;
use reqwest::Method;

use crate::cache::Dispatcher;
use crate::http::{Request, Served};
use crate::outbox::OutboxIntake;

/// Routes reads to the strategy dispatcher and everything else to the outbox
/// intake.
#[derive(Clone)]
pub struct Interceptor {
  dispatcher: Dispatcher,
  intake: OutboxIntake,
}

impl Interceptor {
  pub fn new(dispatcher: Dispatcher, intake: OutboxIntake) -> Self {
    Self { dispatcher, intake }
  }

  pub async fn handle(&self, request: &Request) -> Result<Served> {
    if request.method == Method::GET {
      self.dispatcher.handle(request).await
    } else {
      self.intake.handle(request).await
    }
  }
}
