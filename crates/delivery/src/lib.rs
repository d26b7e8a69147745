//! Channel transports handed rendered content by the dispatch engine.

pub mod http;
pub mod logging;
pub mod onesignal;
pub mod resend;

pub use http::ProviderError;
pub use logging::LoggingSender;
pub use onesignal::{OneSignalClient, DEFAULT_ONESIGNAL_BASE_URL};
pub use resend::{ResendClient, DEFAULT_RESEND_BASE_URL};
