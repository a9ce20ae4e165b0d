// YouTube 远端实现

pub mod client;
pub mod credential;
pub mod types;

pub use client::YoutubeClient;
pub use credential::FileTokenProvider;
