//! Channel plumbing between the engine and its processors.

use tokio::sync::mpsc;

use super::{NotificationEvent, TimerFired};

/// Bounded buffer: the engine briefly backpressures rather than dropping
/// notifications when the gateway is slow.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

pub type NotificationSender = mpsc::Sender<NotificationEvent>;
pub type NotificationReceiver = mpsc::Receiver<NotificationEvent>;

pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}

pub type TimerSender = mpsc::Sender<TimerFired>;
pub type TimerReceiver = mpsc::Receiver<TimerFired>;

pub fn timer_channel() -> (TimerSender, TimerReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
