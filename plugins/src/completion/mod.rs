mod http;
mod replay;

pub use http::HttpCompletionService;
pub use replay::ReplayCompletionService;
