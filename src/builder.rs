use std::sync::Arc;

use crate::backend::BackendFactory;
use crate::engine::{CacheEngine, NetworkLayer};
use crate::memory::MemoryBackendFactory;
use crate::shared::EngineShared;

/// Engine-wide caching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
  /// Standard HTTP caching semantics.
  Normal,
  /// Generation-counted keys; every response is cached and replayed.
  Playback,
  /// Same key scheme as `Playback`, with writes allowed.
  Record,
  /// The cache never stores or serves anything.
  Disable,
}

/// A builder for [`CacheEngine`] instances.
///
/// The backend is constructed lazily, on first use, through the configured
/// factory; an engine built without a factory reports `Failed` for every
/// backend-bound operation.
pub struct EngineBuilder {
  mode: CacheMode,
  enable_range_support: bool,
  websocket_over_spdy: bool,
  factory: Option<Box<dyn BackendFactory>>,
  network: Option<Arc<dyn NetworkLayer>>,
}

impl EngineBuilder {
  pub fn new() -> EngineBuilder {
    EngineBuilder {
      mode: CacheMode::Normal,
      enable_range_support: true,
      websocket_over_spdy: false,
      factory: None,
      network: None,
    }
  }

  pub fn mode(mut self, mode: CacheMode) -> EngineBuilder {
    self.mode = mode;
    self
  }

  /// Whether transactions created by this engine may resume truncated
  /// entries with byte-range requests.
  pub fn range_support(mut self, enabled: bool) -> EngineBuilder {
    self.enable_range_support = enabled;
    self
  }

  /// WebSocket-over-SPDY negotiation flag forwarded to the network layer.
  pub fn websocket_over_spdy(mut self, enabled: bool) -> EngineBuilder {
    self.websocket_over_spdy = enabled;
    self
  }

  /// Sets the factory that produces the backend on first use.
  pub fn backend_factory<F>(mut self, factory: F) -> EngineBuilder
  where
    F: BackendFactory + 'static,
  {
    self.factory = Some(Box::new(factory));
    self
  }

  /// Shorthand for an in-memory backend bounded by `max_bytes`
  /// (0 = unbounded).
  pub fn memory_backend(self, max_bytes: u64) -> EngineBuilder {
    self.backend_factory(MemoryBackendFactory::new(max_bytes))
  }

  /// Sets the network layer `close_current_connections` and `suspend`
  /// delegate to.
  pub fn network_layer(mut self, network: Arc<dyn NetworkLayer>) -> EngineBuilder {
    self.network = Some(network);
    self
  }

  pub fn build(self) -> CacheEngine {
    let shared = EngineShared::new(
      self.factory,
      self.mode,
      self.enable_range_support,
      self.websocket_over_spdy,
      self.network,
    );
    CacheEngine::from_shared(shared)
  }
}

impl Default for EngineBuilder {
  fn default() -> EngineBuilder {
    EngineBuilder::new()
  }
}
