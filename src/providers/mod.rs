//! 上游 Provider 模块
//!
//! - 凭证来源（静态 Key / Bearer、gcloud）
//! - 直连 Live WebSocket 传输
//! - SDK 流式回退

mod credential;
mod live_direct;
mod traits;
mod vertex;

pub use credential::{build_token_source, GcloudTokenSource, StaticTokenSource};
pub use live_direct::{vertex_live_endpoint, DirectLiveTransport, API_KEY_LIVE_ENDPOINT};
pub use traits::{TokenSource, UpstreamCredential};
pub use vertex::{extract_candidate_text, resolve_sdk_model, SdkFallbackClient};
