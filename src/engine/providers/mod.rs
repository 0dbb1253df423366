// ── Membank Engine: AI Providers ───────────────────────────────────────────
// Provider implementations live here; the `AiProvider` trait they implement
// is in `atoms::traits`. The process holds one lazily-initialized provider
// singleton; first touch builds the client, later calls reuse it.

pub mod anthropic;

use std::sync::OnceLock;

use crate::atoms::traits::AiProvider;

use anthropic::AnthropicProvider;

static PROVIDER: OnceLock<AnthropicProvider> = OnceLock::new();

/// The process-wide LLM provider. Model ids are passed per call, so this
/// carries only transport state (HTTP client, endpoint).
pub fn llm() -> &'static dyn AiProvider {
    PROVIDER.get_or_init(AnthropicProvider::from_env)
}
