//! Notification dispatch rules: decides whether, when and how often a notification for a
//! recipient may be sent, independent of the delivery channel.

pub mod channel;
pub mod dedupe;
pub mod engine;
pub mod quiet_hours;
pub mod rate_limit;
pub mod store;
pub mod template;
pub mod types;

pub use channel::{DeliveryError, EmailSender, ProfileError, ProfileLookup, PushSender};
pub use dedupe::DedupeGuard;
pub use engine::{Clock, Collaborators, DispatchEngine, DispatchError, RateLimitPolicy};
pub use quiet_hours::{QuietHoursCalculator, QuietHoursError};
pub use rate_limit::RateLimiter;
pub use store::{ExpiringStore, Lease, MemoryStore, StoreError};
pub use template::{TemplateError, TemplateResolver};
pub use types::{
    Channel, ChannelDelivery, DeliveryStatus, DispatchOutcome, DispatchReport, EmailContent,
    NotificationIntent, PayloadData, PayloadError, PayloadValue, Priority, PushContent,
    QuietHoursSettings, RecipientProfile, TemplateContent,
};
