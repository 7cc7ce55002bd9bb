//! Engine-to-processor event plumbing.

mod channels;
mod types;

pub use channels::{
    DEFAULT_CHANNEL_BUFFER, NotificationReceiver, NotificationSender, TimerReceiver, TimerSender,
    notification_channel, timer_channel,
};
pub use types::{NotificationEvent, TimerFired, TimerKind};
